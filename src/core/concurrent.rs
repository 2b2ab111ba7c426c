//! Duplicate-call racing against a single backend.
//!
//! The same request is fired `concurrent_calls` times under one shared
//! deadline (75% of the backend timeout). The first complete response wins
//! and every other call is cancelled.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::models::BackendConfig,
    core::{
        context::Context,
        error::{ConfigError, ProxyError},
        proxy::{BoxProxy, Middleware, Proxy, ProxyResult, Request, Response, expect_single, join, split},
    },
};

/// Share of the backend timeout granted to the whole race
const RACE_BUDGET_PERCENT: u32 = 75;

pub struct ConcurrentMiddleware {
    calls: usize,
    timeout: Duration,
}

impl ConcurrentMiddleware {
    /// Fails for fewer than two calls: a single call has nothing to race.
    pub fn new(backend: &BackendConfig) -> Result<Self, ConfigError> {
        if backend.concurrent_calls <= 1 {
            return Err(ConfigError::InvalidConcurrency(backend.concurrent_calls));
        }
        Ok(Self {
            calls: backend.concurrent_calls,
            timeout: backend.timeout() * RACE_BUDGET_PERCENT / 100,
        })
    }
}

impl Middleware for ConcurrentMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        let next = expect_single("concurrent", next)?;
        Ok(Arc::new(ConcurrentProxy {
            calls: self.calls,
            timeout: self.timeout,
            next,
        }))
    }
}

struct ConcurrentProxy {
    calls: usize,
    timeout: Duration,
    next: BoxProxy,
}

#[async_trait]
impl Proxy for ConcurrentProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let local = ctx.with_timeout(self.timeout);
        let _cancel = local.cancel_on_drop();

        let (tx, mut rx) = mpsc::channel(self.calls);
        for _ in 0..self.calls {
            let call_ctx = local.with_cancel();
            let next = self.next.clone();
            let req = req.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _cancel = call_ctx.cancel_on_drop();
                let outcome = call_ctx.run(next.call(call_ctx.clone(), req)).await;
                // The collector may already be gone once a winner is picked.
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut last_response: Option<Response> = None;
        let mut last_error: Option<ProxyError> = None;

        for _ in 0..self.calls {
            let outcome = tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
                _ = ctx.done() => {
                    tracing::debug!("Caller context done while racing duplicate calls");
                    break;
                }
            };

            let (response, err) = split(outcome);
            match (response, err) {
                (Some(response), None) if response.is_complete => {
                    tracing::trace!("Duplicate call won the race");
                    return Ok(Some(response));
                }
                (None, None) => last_error = Some(ProxyError::InvalidResponse),
                (response, err) => {
                    if response.is_some() {
                        last_response = response;
                    }
                    if err.is_some() {
                        last_error = err;
                    }
                }
            }
        }

        if last_response.is_none() && last_error.is_none() {
            last_error = ctx.err();
        }
        join(last_response, last_error)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use http::Method;
    use serde_json::json;

    use super::*;
    use crate::core::proxy::{Data, from_fn};

    fn backend(calls: usize, timeout: Duration) -> BackendConfig {
        BackendConfig::new("/")
            .with_concurrent_calls(calls)
            .with_timeout(timeout)
    }

    fn doc(key: &str, value: serde_json::Value) -> Data {
        let mut data = Data::new();
        data.insert(key.to_string(), value);
        data
    }

    #[test]
    fn test_single_call_is_rejected() {
        assert!(matches!(
            ConcurrentMiddleware::new(&backend(1, Duration::from_secs(1))),
            Err(ConfigError::InvalidConcurrency(1))
        ));
    }

    #[tokio::test]
    async fn test_one_complete_call_wins() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_inner = counter.clone();
        let inner = from_fn(move |_ctx, _req| {
            let attempt = counter_inner.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Some(Response::complete(doc("winner", json!(attempt)))))
                } else {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(Some(Response::complete(doc("late", json!(attempt)))))
                }
            }
        });

        let timeout = Duration::from_millis(400);
        let proxy = ConcurrentMiddleware::new(&backend(3, timeout))
            .unwrap()
            .wrap(vec![inner])
            .unwrap();

        let start = Instant::now();
        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/"))
            .await
            .unwrap()
            .unwrap();

        assert!(res.is_complete);
        assert_eq!(res.data["winner"], json!(1));
        assert!(start.elapsed() < timeout * 3 / 4 + Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_incomplete_answers_return_last_seen() {
        let inner = from_fn(|_ctx, _req| async {
            Ok(Some(Response::incomplete(doc("partial", json!(true)))))
        });
        let proxy = ConcurrentMiddleware::new(&backend(2, Duration::from_millis(200)))
            .unwrap()
            .wrap(vec![inner])
            .unwrap();

        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/"))
            .await
            .unwrap()
            .unwrap();
        assert!(!res.is_complete);
        assert_eq!(res.data["partial"], json!(true));
    }

    #[tokio::test]
    async fn test_all_failures_return_last_error() {
        let inner = from_fn(|_ctx, _req| async { Err(ProxyError::Connection("refused".into())) });
        let proxy = ConcurrentMiddleware::new(&backend(3, Duration::from_millis(200)))
            .unwrap()
            .wrap(vec![inner])
            .unwrap();

        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/"))
            .await;
        assert!(matches!(res, Err(ProxyError::Connection(_))));
    }

    #[tokio::test]
    async fn test_null_result_is_invalid_response() {
        let inner = from_fn(|_ctx, _req| async { Ok(None) });
        let proxy = ConcurrentMiddleware::new(&backend(2, Duration::from_millis(200)))
            .unwrap()
            .wrap(vec![inner])
            .unwrap();

        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/"))
            .await;
        assert!(matches!(res, Err(ProxyError::InvalidResponse)));
    }

    #[tokio::test]
    async fn test_slow_calls_hit_the_race_deadline() {
        let inner = from_fn(|_ctx, _req| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Some(Response::default()))
        });
        let proxy = ConcurrentMiddleware::new(&backend(2, Duration::from_millis(100)))
            .unwrap()
            .wrap(vec![inner])
            .unwrap();

        let start = Instant::now();
        let res = proxy
            .call(Context::background(), Request::new(Method::GET, "/"))
            .await;
        assert!(matches!(res, Err(ProxyError::DeadlineExceeded)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
