//! Conflux - request orchestration for API gateways.
//!
//! Every configured endpoint is served by one immutable pipeline of composable
//! [`Proxy`](core::proxy::Proxy) values. Pipelines fan out to one or more
//! backends, race duplicate calls, merge partial answers under a deadline,
//! reshape backend documents, mirror traffic to shadow backends and inject
//! static data.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use conflux::{
//!     GatewayService, HttpHandler,
//!     adapters::{FixedSubscriberFactory, HttpBackendFactory},
//!     core::{DefaultFactory, ShadowFactory},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let cfg = conflux::config::loader::load_config("conflux.yaml").await?;
//! let factory = ShadowFactory::new(DefaultFactory::new(
//!     Arc::new(HttpBackendFactory::new()?),
//!     Arc::new(FixedSubscriberFactory),
//! ));
//! let gateway = Arc::new(GatewayService::new(Arc::new(cfg), &factory)?);
//! let app = HttpHandler::new(gateway).router();
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits for host discovery and backend
//! transport) from **adapters** (hyper client, axum handler, subscribers)
//! while the orchestration logic lives in `core` and never performs I/O
//! itself.
//!
//! # Error Handling
//! Request-time failures are [`ProxyError`](core::error::ProxyError) values.
//! Pipeline assembly fails fast with
//! [`ConfigError`](core::error::ConfigError). Binaries and loaders use
//! `eyre::Result<T>` with context attached through `WrapErr`.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpBackendFactory, HttpHandler},
    core::GatewayService,
    utils::GracefulShutdown,
};
