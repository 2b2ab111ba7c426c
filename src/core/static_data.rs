//! Constant data merged into endpoint responses.
use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::models::{EndpointConfig, StaticDataConfig, StaticStrategy},
    core::{
        context::Context,
        error::{ConfigError, ProxyError},
        proxy::{
            BoxProxy, Data, EmptyMiddleware, Middleware, Proxy, ProxyResult, Request, Response,
            expect_single, join, split,
        },
    },
};

impl StaticStrategy {
    /// Whether static data applies to the given outcome.
    pub fn matches(&self, response: Option<&Response>, err: Option<&ProxyError>) -> bool {
        match self {
            StaticStrategy::Always => true,
            StaticStrategy::Success => err.is_none(),
            StaticStrategy::Errored => err.is_some(),
            StaticStrategy::Complete => err.is_none() && response.is_some_and(|r| r.is_complete),
            StaticStrategy::Incomplete => response.is_none_or(|r| !r.is_complete),
        }
    }
}

/// The static-data middleware for `endpoint`, or the identity when the
/// endpoint carries no static data.
pub fn static_data_middleware(endpoint: &EndpointConfig) -> Box<dyn Middleware> {
    match endpoint.proxy_config().static_data {
        Some(cfg) => {
            tracing::debug!(
                "Static data for {} with strategy '{}'",
                endpoint.endpoint,
                cfg.strategy
            );
            Box::new(StaticDataMiddleware::new(cfg))
        }
        None => Box::new(EmptyMiddleware),
    }
}

pub struct StaticDataMiddleware {
    data: Arc<Data>,
    strategy: StaticStrategy,
}

impl StaticDataMiddleware {
    pub fn new(cfg: StaticDataConfig) -> Self {
        Self {
            data: Arc::new(cfg.data),
            strategy: cfg.strategy,
        }
    }
}

impl Middleware for StaticDataMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        let next = expect_single("static data", next)?;
        Ok(Arc::new(StaticDataProxy {
            data: self.data.clone(),
            strategy: self.strategy,
            next,
        }))
    }
}

struct StaticDataProxy {
    data: Arc<Data>,
    strategy: StaticStrategy,
    next: BoxProxy,
}

#[async_trait]
impl Proxy for StaticDataProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let (response, err) = split(self.next.call(ctx, req).await);
        if !self.strategy.matches(response.as_ref(), err.as_ref()) {
            return join(response, err);
        }

        let mut response = response.unwrap_or_default();
        for (key, value) in self.data.iter() {
            response.data.insert(key.clone(), value.clone());
        }
        join(Some(response), err)
    }
}
