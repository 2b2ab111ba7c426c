pub mod concurrent;
pub mod context;
pub mod error;
pub mod factory;
pub mod formatter;
pub mod gateway;
pub mod load_balancer;
pub mod merge;
pub mod proxy;
pub mod request_builder;
pub mod shadow;
pub mod static_data;

pub use context::Context;
pub use error::{ConfigError, MergeError, ProxyError};
pub use factory::{DefaultFactory, Factory, ShadowFactory};
pub use gateway::{Endpoint, GatewayError, GatewayService, RouteMatch};
pub use merge::{CombinerRegistry, ResponseCombiner, combine_data};
pub use proxy::{BoxProxy, Data, Middleware, Proxy, ProxyResult, Request, Response, from_fn};
