//! Core gateway orchestration service.
//!
//! The `GatewayService` turns the immutable configuration (`GatewayConfig`)
//! into one pipeline per endpoint and resolves incoming requests to them:
//! * Per-method route tables (`matchit`, `/users/{id}` style patterns)
//! * Captured path segments exposed as request params
//! * Endpoint enumeration for diagnostics
//!
//! Everything is built up front; lookups never allocate pipelines.
use std::{collections::HashMap, sync::Arc, time::Duration};

use http::Method;
use thiserror::Error;

use crate::{
    config::models::{EndpointConfig, GatewayConfig},
    core::{error::ConfigError, factory::Factory, proxy::BoxProxy},
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GatewayError {
    #[error("failed to build pipeline for {method} {endpoint}: {source}")]
    Pipeline {
        method: String,
        endpoint: String,
        #[source]
        source: ConfigError,
    },

    #[error("invalid method '{0}'")]
    InvalidMethod(String),

    #[error("failed to register route {method} {endpoint}: {source}")]
    Route {
        method: String,
        endpoint: String,
        #[source]
        source: matchit::InsertError,
    },
}

/// A configured endpoint together with its assembled pipeline.
pub struct Endpoint {
    pub method: Method,
    pub config: EndpointConfig,
    pub proxy: BoxProxy,
}

impl Endpoint {
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }
}

/// Result of a successful route lookup.
pub struct RouteMatch {
    pub endpoint: Arc<Endpoint>,
    pub params: HashMap<String, String>,
}

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    endpoints: Vec<Arc<Endpoint>>,
    routes: HashMap<Method, matchit::Router<usize>>,
}

impl GatewayService {
    /// Build every endpoint pipeline through `factory` and index the routes.
    pub fn new(config: Arc<GatewayConfig>, factory: &dyn Factory) -> Result<Self, GatewayError> {
        let mut endpoints = Vec::with_capacity(config.endpoints.len());
        let mut routes: HashMap<Method, matchit::Router<usize>> = HashMap::new();

        for endpoint_cfg in &config.endpoints {
            let method: Method = endpoint_cfg
                .method
                .parse()
                .map_err(|_| GatewayError::InvalidMethod(endpoint_cfg.method.clone()))?;

            let proxy = factory
                .new_proxy(endpoint_cfg)
                .map_err(|source| GatewayError::Pipeline {
                    method: endpoint_cfg.method.clone(),
                    endpoint: endpoint_cfg.endpoint.clone(),
                    source,
                })?;

            routes
                .entry(method.clone())
                .or_default()
                .insert(endpoint_cfg.endpoint.clone(), endpoints.len())
                .map_err(|source| GatewayError::Route {
                    method: endpoint_cfg.method.clone(),
                    endpoint: endpoint_cfg.endpoint.clone(),
                    source,
                })?;

            tracing::info!(
                "Registered endpoint {} {} with {} backend(s)",
                method,
                endpoint_cfg.endpoint,
                endpoint_cfg.backends.len()
            );
            endpoints.push(Arc::new(Endpoint {
                method,
                config: endpoint_cfg.clone(),
                proxy,
            }));
        }

        Ok(Self {
            config,
            endpoints,
            routes,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &[Arc<Endpoint>] {
        &self.endpoints
    }

    /// Resolve `method` + `path` to an endpoint and its captured path params.
    pub fn find_endpoint(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let router = self.routes.get(method)?;
        let matched = router.at(path).ok()?;
        let params = matched
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Some(RouteMatch {
            endpoint: self.endpoints[*matched.value].clone(),
            params,
        })
    }

    /// Whether any method is routed for `path`, used to tell 404 from 405.
    pub fn has_path(&self, path: &str) -> bool {
        self.routes.values().any(|router| router.at(path).is_ok())
    }
}
