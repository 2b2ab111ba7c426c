//! The proxy abstraction and its composition rule.
//!
//! A [`Proxy`] is a single-input/single-output asynchronous transformation
//! from a [`Request`] to a [`ProxyResult`]. A [`Middleware`] takes one or more
//! proxies and returns exactly one. Pipelines are assembled once, from the
//! innermost backend call outwards, and are immutable afterwards.
use std::{collections::HashMap, fmt, future::Future, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde_json::{Map, Value};

use crate::core::{
    context::Context,
    error::{ConfigError, ProxyError},
};

/// Decoded, order-irrelevant response document.
pub type Data = Map<String, Value>;

/// `Ok(None)` means the proxy produced neither a response nor an error.
pub type ProxyResult = Result<Option<Response>, ProxyError>;

/// Shared, type-erased proxy.
pub type BoxProxy = Arc<dyn Proxy>;

/// The request travelling through a pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Final backend URL, set by the load balancer
    pub url: Option<url::Url>,
    pub query: Vec<(String, String)>,
    pub path: String,
    pub body: Bytes,
    /// Values available to `{{.Name}}` placeholders in backend url patterns
    pub params: HashMap<String, String>,
    pub headers: HeaderMap,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: None,
            query: Vec::new(),
            path: String::new(),
            body: Bytes::new(),
            params: HashMap::new(),
            headers: HeaderMap::new(),
        }
    }
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Query parameters in `application/x-www-form-urlencoded` form.
    pub fn encoded_query(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish()
    }
}

/// Response metadata reported by the backend.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub status_code: Option<StatusCode>,
    pub headers: HeaderMap,
}

/// A (possibly partial) answer.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub data: Data,
    pub is_complete: bool,
    /// Raw payload for pass-through encodings
    pub io: Option<Bytes>,
    pub metadata: Metadata,
}

impl Response {
    /// A complete response wrapping `data`.
    pub fn complete(data: Data) -> Self {
        Self {
            data,
            is_complete: true,
            ..Self::default()
        }
    }

    /// An incomplete response wrapping `data`.
    pub fn incomplete(data: Data) -> Self {
        Self {
            data,
            is_complete: false,
            ..Self::default()
        }
    }
}

/// Unpack a result into its response and error halves.
pub fn split(result: ProxyResult) -> (Option<Response>, Option<ProxyError>) {
    match result {
        Ok(response) => (response, None),
        Err(err) => {
            let (response, err) = err.into_parts();
            (response, Some(err))
        }
    }
}

/// Inverse of [`split`].
pub fn join(response: Option<Response>, error: Option<ProxyError>) -> ProxyResult {
    match (response, error) {
        (response, None) => Ok(response),
        (None, Some(err)) => Err(err),
        (Some(response), Some(err)) => Err(ProxyError::Partial {
            response: Box::new(response),
            error: Box::new(err),
        }),
    }
}

#[async_trait]
pub trait Proxy: Send + Sync + 'static {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult;
}

/// Turns one or more proxies into exactly one.
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError>;
}

/// Returns its single input untouched. Used wherever a policy is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyMiddleware;

impl Middleware for EmptyMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        expect_single("empty", next)
    }
}

/// Arity check for middlewares that decorate exactly one proxy.
pub(crate) fn expect_single(
    middleware: &'static str,
    mut next: Vec<BoxProxy>,
) -> Result<BoxProxy, ConfigError> {
    match next.len() {
        0 => Err(ConfigError::NotEnoughProxies { middleware, got: 0 }),
        1 => Ok(next.remove(0)),
        got => Err(ConfigError::TooManyProxies { middleware, got }),
    }
}

/// Proxy backed by an async closure.
pub struct FnProxy<F>(F);

impl<F> fmt::Debug for FnProxy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnProxy")
    }
}

#[async_trait]
impl<F, Fut> Proxy for FnProxy<F>
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProxyResult> + Send + 'static,
{
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        (self.0)(ctx, req).await
    }
}

pub fn from_fn<F, Fut>(f: F) -> BoxProxy
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ProxyResult> + Send + 'static,
{
    Arc::new(FnProxy(f))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_path() -> BoxProxy {
        from_fn(|_ctx, req: Request| async move {
            let mut data = Data::new();
            data.insert("path".to_string(), json!(req.path));
            Ok(Some(Response::complete(data)))
        })
    }

    #[tokio::test]
    async fn test_empty_middleware_is_identity() {
        let proxy = EmptyMiddleware.wrap(vec![echo_path()]).unwrap();
        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res.data["path"], json!("/a"));
        assert!(res.is_complete);
    }

    #[test]
    fn test_empty_middleware_arity() {
        assert_eq!(
            EmptyMiddleware.wrap(vec![echo_path(), echo_path()]).err(),
            Some(ConfigError::TooManyProxies {
                middleware: "empty",
                got: 2
            })
        );
        assert!(EmptyMiddleware.wrap(Vec::new()).is_err());
    }

    #[test]
    fn test_split_join_partial() {
        let res = join(Some(Response::default()), Some(ProxyError::NoHosts));
        let (response, err) = split(res);
        assert!(response.is_some());
        assert!(matches!(err, Some(ProxyError::NoHosts)));

        let (response, err) = split(join(None, None));
        assert!(response.is_none());
        assert!(err.is_none());
    }

    #[test]
    fn test_encoded_query() {
        let req = Request::new(Method::GET, "/")
            .with_query("a", "1")
            .with_query("b", "x y");
        assert_eq!(req.encoded_query(), "a=1&b=x+y");
    }
}
