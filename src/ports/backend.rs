use std::sync::Arc;

use crate::{config::models::BackendConfig, core::proxy::BoxProxy, ports::subscriber::Subscriber};

/// BackendFactory defines the port for the transport layer: it supplies the
/// proxy that performs the actual call to one backend. The returned proxy is
/// the innermost leaf of every call stack and receives requests whose `url`
/// has already been resolved by the load balancer.
pub trait BackendFactory: Send + Sync + 'static {
    /// Create the invocation proxy for a backend
    fn new_backend(&self, backend: &BackendConfig) -> BoxProxy;
}

/// SubscriberFactory binds a backend definition to its host source
pub trait SubscriberFactory: Send + Sync + 'static {
    /// Create the subscriber for a backend
    fn new_subscriber(&self, backend: &BackendConfig) -> Arc<dyn Subscriber>;
}
