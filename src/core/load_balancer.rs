//! Host selection over a subscriber's host list, and the middleware that
//! points each request at the selected host.
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use async_trait::async_trait;
use rand::Rng;

use crate::{
    core::{
        context::Context,
        error::{ConfigError, ProxyError},
        proxy::{BoxProxy, Middleware, Proxy, ProxyResult, Request, expect_single},
    },
    ports::subscriber::Subscriber,
};

/// Trait defining the interface for load balancing strategies
pub trait Balancer: Send + Sync + 'static {
    /// Pick one host for the next request
    fn host(&self) -> Result<String, ProxyError>;
}

fn current_hosts(subscriber: &dyn Subscriber) -> Result<Vec<String>, ProxyError> {
    let hosts = subscriber.hosts()?;
    if hosts.is_empty() {
        return Err(ProxyError::NoHosts);
    }
    Ok(hosts)
}

/// Round-robin load balancing strategy
pub struct RoundRobinBalancer {
    subscriber: Arc<dyn Subscriber>,
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self {
            subscriber,
            counter: AtomicUsize::new(0),
        }
    }
}

impl Balancer for RoundRobinBalancer {
    fn host(&self) -> Result<String, ProxyError> {
        let mut hosts = current_hosts(self.subscriber.as_ref())?;
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(hosts.swap_remove(count % hosts.len()))
    }
}

/// Random selection load balancing strategy
pub struct RandomBalancer {
    subscriber: Arc<dyn Subscriber>,
}

impl RandomBalancer {
    pub fn new(subscriber: Arc<dyn Subscriber>) -> Self {
        Self { subscriber }
    }
}

impl Balancer for RandomBalancer {
    fn host(&self) -> Result<String, ProxyError> {
        let mut hosts = current_hosts(self.subscriber.as_ref())?;
        let index = rand::rng().random_range(0..hosts.len());
        Ok(hosts.swap_remove(index))
    }
}

/// Always returns the same host
pub struct NopBalancer(String);

impl Balancer for NopBalancer {
    fn host(&self) -> Result<String, ProxyError> {
        Ok(self.0.clone())
    }
}

/// Pick a strategy for a subscriber.
///
/// A fixed single host short-circuits to [`NopBalancer`]. Otherwise a runtime
/// with a single worker gets the round-robin counter and anything larger the
/// uniform random pick.
pub fn new_balancer(subscriber: Arc<dyn Subscriber>) -> Arc<dyn Balancer> {
    if let Some([host]) = subscriber.fixed_hosts() {
        return Arc::new(NopBalancer(host.clone()));
    }
    let workers = thread::available_parallelism().map_or(1, |n| n.get());
    if workers == 1 {
        new_round_robin_balancer(subscriber)
    } else {
        new_random_balancer(subscriber)
    }
}

pub fn new_round_robin_balancer(subscriber: Arc<dyn Subscriber>) -> Arc<dyn Balancer> {
    Arc::new(RoundRobinBalancer::new(subscriber))
}

pub fn new_random_balancer(subscriber: Arc<dyn Subscriber>) -> Arc<dyn Balancer> {
    Arc::new(RandomBalancer::new(subscriber))
}

/// Rewrites the request URL to `host + path (+ query)` before delegating.
pub struct LoadBalancedMiddleware {
    balancer: Arc<dyn Balancer>,
}

impl LoadBalancedMiddleware {
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self { balancer }
    }

    pub fn with_subscriber(subscriber: Arc<dyn Subscriber>) -> Self {
        Self::new(new_balancer(subscriber))
    }
}

impl Middleware for LoadBalancedMiddleware {
    fn wrap(&self, next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        let next = expect_single("load balancer", next)?;
        Ok(Arc::new(LoadBalancedProxy {
            balancer: self.balancer.clone(),
            next,
        }))
    }
}

struct LoadBalancedProxy {
    balancer: Arc<dyn Balancer>,
    next: BoxProxy,
}

#[async_trait]
impl Proxy for LoadBalancedProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let mut req = req;
        let host = self.balancer.host()?;

        let raw = format!("{host}{}", req.path);
        let mut url = url::Url::parse(&raw).map_err(|source| ProxyError::InvalidUrl {
            url: raw.clone(),
            source,
        })?;
        if !req.query.is_empty() {
            let encoded = req.encoded_query();
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{encoded}"),
                _ => encoded,
            };
            url.set_query(Some(&query));
        }
        tracing::trace!(backend.url = %url, "Balanced request");
        req.url = Some(url);

        self.next.call(ctx, req).await
    }
}
