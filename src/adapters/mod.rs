pub mod http_client;
pub mod http_handler;
pub mod subscriber;

/// Re-export commonly used types from adapters
pub use http_client::HttpBackendFactory;
pub use http_handler::HttpHandler;
pub use subscriber::{DynamicSubscriber, FixedSubscriber, FixedSubscriberFactory};
