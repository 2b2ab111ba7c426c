//! Backend request construction from the url pattern template.
use std::{
    borrow::Cow,
    sync::{Arc, LazyLock},
};

use async_trait::async_trait;
use http::Method;
use regex::{Captures, Regex};

use crate::{
    config::models::BackendConfig,
    core::{
        context::Context,
        error::{ConfigError, ProxyError},
        proxy::{BoxProxy, Middleware, Proxy, ProxyResult, Request, expect_single},
    },
};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\.([^{}\s]+)\}\}").expect("invalid placeholder regex"));

/// Substitute every `{{.Name}}` in `pattern` with `params["Name"]`.
pub fn generate_path(
    pattern: &str,
    params: &std::collections::HashMap<String, String>,
) -> Result<String, ProxyError> {
    let mut missing = None;
    let path = PLACEHOLDER.replace_all(pattern, |caps: &Captures<'_>| {
        let name = &caps[1];
        match params.get(name) {
            Some(value) => Cow::Owned(value.clone()),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                Cow::Borrowed("")
            }
        }
    });
    match missing {
        Some(name) => Err(ProxyError::MissingParam(name)),
        None => Ok(path.into_owned()),
    }
}

/// Sets the backend method and templated path on a copy of the request.
pub struct RequestBuilderMiddleware {
    url_pattern: Arc<str>,
    method: Method,
}

impl RequestBuilderMiddleware {
    pub fn new(backend: &BackendConfig) -> Self {
        let method = backend.method.parse().unwrap_or_else(|_| {
            tracing::warn!(
                "Invalid method '{}' for backend {}, using GET",
                backend.method,
                backend.url_pattern
            );
            Method::GET
        });
        Self {
            url_pattern: Arc::from(backend.url_pattern.as_str()),
            method,
        }
    }
}

impl Middleware for RequestBuilderMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        let next = expect_single("request builder", next)?;
        Ok(Arc::new(RequestBuilderProxy {
            url_pattern: self.url_pattern.clone(),
            method: self.method.clone(),
            next,
        }))
    }
}

struct RequestBuilderProxy {
    url_pattern: Arc<str>,
    method: Method,
    next: BoxProxy,
}

#[async_trait]
impl Proxy for RequestBuilderProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let mut req = req;
        req.path = generate_path(&self.url_pattern, &req.params)?;
        req.method = self.method.clone();
        self.next.call(ctx, req).await
    }
}
