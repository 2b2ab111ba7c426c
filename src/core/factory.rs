//! Endpoint pipeline assembly.
//!
//! A single backend is wrapped, from the inside out, by:
//!
//! ```text
//! backend -> formatter -> load balancer -> [concurrent racer] -> request builder
//! ```
//!
//! Several backends get one such stack each, joined by the merge middleware.
//! The static-data middleware always sits on top.
use std::sync::Arc;

use crate::{
    config::models::{BackendConfig, EndpointConfig},
    core::{
        concurrent::ConcurrentMiddleware,
        error::ConfigError,
        formatter::{EntityFormatter, FormatterMiddleware},
        load_balancer::LoadBalancedMiddleware,
        merge::{CombinerRegistry, MergeMiddleware},
        proxy::{BoxProxy, Middleware},
        request_builder::RequestBuilderMiddleware,
        shadow::ShadowMiddleware,
        static_data::static_data_middleware,
    },
    ports::backend::{BackendFactory, SubscriberFactory},
};

/// Builds the proxy serving one endpoint.
pub trait Factory: Send + Sync {
    fn new_proxy(&self, endpoint: &EndpointConfig) -> Result<BoxProxy, ConfigError>;
}

pub struct DefaultFactory {
    backend_factory: Arc<dyn BackendFactory>,
    subscriber_factory: Arc<dyn SubscriberFactory>,
    combiners: Arc<CombinerRegistry>,
}

impl DefaultFactory {
    pub fn new(
        backend_factory: Arc<dyn BackendFactory>,
        subscriber_factory: Arc<dyn SubscriberFactory>,
    ) -> Self {
        Self {
            backend_factory,
            subscriber_factory,
            combiners: Arc::new(CombinerRegistry::new()),
        }
    }

    pub fn with_combiners(mut self, combiners: Arc<CombinerRegistry>) -> Self {
        self.combiners = combiners;
        self
    }

    /// The call stack of a single backend.
    pub fn new_stack(&self, backend: &BackendConfig) -> Result<BoxProxy, ConfigError> {
        let mut proxy = self.backend_factory.new_backend(backend);
        proxy = FormatterMiddleware::new(EntityFormatter::new(backend)).wrap(vec![proxy])?;

        let subscriber = self.subscriber_factory.new_subscriber(backend);
        proxy = LoadBalancedMiddleware::with_subscriber(subscriber).wrap(vec![proxy])?;

        if backend.concurrent_calls > 1 {
            tracing::debug!(
                "Racing {} concurrent calls for backend {}",
                backend.concurrent_calls,
                backend.url_pattern
            );
            proxy = ConcurrentMiddleware::new(backend)?.wrap(vec![proxy])?;
        }

        RequestBuilderMiddleware::new(backend).wrap(vec![proxy])
    }
}

impl Factory for DefaultFactory {
    fn new_proxy(&self, endpoint: &EndpointConfig) -> Result<BoxProxy, ConfigError> {
        let proxy = match endpoint.backends.as_slice() {
            [] => return Err(ConfigError::NoBackends),
            [backend] => self.new_stack(backend)?,
            backends => {
                let stacks = backends
                    .iter()
                    .map(|backend| self.new_stack(backend))
                    .collect::<Result<Vec<_>, _>>()?;
                MergeMiddleware::new(endpoint, &self.combiners)?.wrap(stacks)?
            }
        };

        static_data_middleware(endpoint).wrap(vec![proxy])
    }
}

/// Splits shadow backends off an endpoint and mirrors traffic to them.
pub struct ShadowFactory<F> {
    inner: F,
}

impl<F: Factory> ShadowFactory<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F: Factory> Factory for ShadowFactory<F> {
    fn new_proxy(&self, endpoint: &EndpointConfig) -> Result<BoxProxy, ConfigError> {
        let (shadow, regular): (Vec<_>, Vec<_>) = endpoint
            .backends
            .iter()
            .cloned()
            .partition(BackendConfig::is_shadow);

        let mut primary_cfg = endpoint.clone();
        primary_cfg.backends = regular;
        let primary = self.inner.new_proxy(&primary_cfg)?;

        if shadow.is_empty() {
            return Ok(primary);
        }

        tracing::info!(
            "Mirroring {} to {} shadow backend(s)",
            endpoint.endpoint,
            shadow.len()
        );
        let mut shadow_cfg = endpoint.clone();
        shadow_cfg.backends = shadow;
        let shadow = self.inner.new_proxy(&shadow_cfg)?;

        ShadowMiddleware.wrap(vec![primary, shadow])
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use http::Method;
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        adapters::subscriber::FixedSubscriberFactory,
        core::{
            context::Context,
            proxy::{Data, Request, Response, from_fn},
        },
    };

    /// Answers every backend with the canned data for its url pattern and
    /// records the final urls it was asked for.
    #[derive(Default)]
    struct CannedBackends {
        answers: HashMap<String, Value>,
        urls: Arc<Mutex<Vec<String>>>,
        calls: Arc<AtomicUsize>,
    }

    impl CannedBackends {
        fn answer(mut self, pattern: &str, value: Value) -> Self {
            self.answers.insert(pattern.to_string(), value);
            self
        }
    }

    impl BackendFactory for CannedBackends {
        fn new_backend(&self, backend: &BackendConfig) -> BoxProxy {
            let answer = self.answers.get(&backend.url_pattern).cloned();
            let urls = self.urls.clone();
            let calls = self.calls.clone();
            from_fn(move |_ctx, req: Request| {
                let answer = answer.clone();
                let urls = urls.clone();
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if let Some(url) = &req.url {
                        urls.lock().unwrap().push(url.to_string());
                    }
                    match answer {
                        Some(Value::Object(data)) => Ok(Some(Response::complete(data))),
                        _ => Ok(None),
                    }
                }
            })
        }
    }

    fn factory(backends: CannedBackends) -> DefaultFactory {
        DefaultFactory::new(Arc::new(backends), Arc::new(FixedSubscriberFactory))
    }

    fn backend(pattern: &str) -> BackendConfig {
        BackendConfig::new(pattern)
            .with_host("http://backend.local")
            .with_timeout(Duration::from_millis(500))
    }

    async fn call(proxy: &BoxProxy, req: Request) -> Response {
        proxy
            .call(Context::background(), req)
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_no_backends_fails() {
        let err = factory(CannedBackends::default())
            .new_proxy(&EndpointConfig::new("/empty"))
            .err();
        assert_eq!(err, Some(ConfigError::NoBackends));
    }

    #[tokio::test]
    async fn test_single_backend_stack() {
        let backends = CannedBackends::default().answer(
            "/users/{{.id}}",
            json!({"user": {"id": 1, "secret": "x"}}),
        );
        let urls = backends.urls.clone();

        let mut user = backend("/users/{{.id}}");
        user.allow_list = vec!["user.id".to_string()];
        let endpoint = EndpointConfig::new("/u/{id}").with_backend(user);
        let proxy = factory(backends).new_proxy(&endpoint).unwrap();

        let res = call(
            &proxy,
            Request::new(Method::GET, "/u/1")
                .with_param("id", "1")
                .with_query("verbose", "1"),
        )
        .await;
        assert!(res.is_complete);
        assert_eq!(Value::Object(res.data), json!({"user": {"id": 1}}));
        assert_eq!(
            urls.lock().unwrap().as_slice(),
            ["http://backend.local/users/1?verbose=1"]
        );
    }

    #[tokio::test]
    async fn test_multiple_backends_are_merged_and_grouped() {
        let backends = CannedBackends::default()
            .answer("/a", json!({"id": 1}))
            .answer("/b", json!({"name": "x"}));
        let endpoint = EndpointConfig::new("/both")
            .with_timeout(Duration::from_millis(500))
            .with_backend(backend("/a"))
            .with_backend(backend("/b").with_group("profile"));
        let proxy = factory(backends).new_proxy(&endpoint).unwrap();

        let res = call(&proxy, Request::new(Method::GET, "/both")).await;
        assert!(res.is_complete);
        assert_eq!(
            Value::Object(res.data),
            json!({"id": 1, "profile": {"name": "x"}})
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_raced() {
        let backends = CannedBackends::default().answer("/a", json!({"ok": true}));
        let calls = backends.calls.clone();
        let endpoint =
            EndpointConfig::new("/race").with_backend(backend("/a").with_concurrent_calls(3));
        let proxy = factory(backends).new_proxy(&endpoint).unwrap();

        let res = call(&proxy, Request::new(Method::GET, "/race")).await;
        assert_eq!(res.data["ok"], json!(true));
        assert!(calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_static_data_is_applied_on_top() {
        let backends = CannedBackends::default().answer("/a", json!({"id": 1}));
        let endpoint = EndpointConfig::new("/s")
            .with_backend(backend("/a"))
            .with_proxy_config(json!({"static": {"strategy": "complete", "data": {"v": 2}}}));
        let proxy = factory(backends).new_proxy(&endpoint).unwrap();

        let res = call(&proxy, Request::new(Method::GET, "/s")).await;
        assert_eq!(Value::Object(res.data), json!({"id": 1, "v": 2}));
    }

    #[tokio::test]
    async fn test_shadow_factory_partitions_backends() {
        let shadow_hits = Arc::new(AtomicUsize::new(0));

        struct Mirrored {
            shadow_hits: Arc<AtomicUsize>,
        }

        impl BackendFactory for Mirrored {
            fn new_backend(&self, backend: &BackendConfig) -> BoxProxy {
                let is_shadow = backend.is_shadow();
                let hits = self.shadow_hits.clone();
                from_fn(move |_ctx, _req| {
                    if is_shadow {
                        hits.fetch_add(1, Ordering::SeqCst);
                    }
                    async move {
                        let mut data = Data::new();
                        data.insert("shadow".to_string(), json!(is_shadow));
                        Ok(Some(Response::complete(data)))
                    }
                })
            }
        }

        let endpoint = EndpointConfig::new("/mirrored")
            .with_backend(backend("/live"))
            .with_backend(backend("/canary").with_proxy_config(json!({"shadow": true})));
        let factory = ShadowFactory::new(DefaultFactory::new(
            Arc::new(Mirrored {
                shadow_hits: shadow_hits.clone(),
            }),
            Arc::new(FixedSubscriberFactory),
        ));
        let proxy = factory.new_proxy(&endpoint).unwrap();

        let res = call(&proxy, Request::new(Method::GET, "/mirrored")).await;
        assert_eq!(Value::Object(res.data), json!({"shadow": false}));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shadow_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shadow_factory_without_shadow_backends() {
        let factory = ShadowFactory::new(factory(CannedBackends::default()));
        let endpoint = EndpointConfig::new("/plain").with_backend(backend("/a"));
        assert!(factory.new_proxy(&endpoint).is_ok());
    }
}
