//! Multi-backend fan-out and response merging.
//!
//! Branches either run in parallel, folded into the result in arrival order,
//! or sequentially, where every branch can template its url with the data of
//! the branches before it (`{{.Resp0_user.id}}`). Both strategies share one
//! deadline of 85% of the endpoint timeout and never abort on a branch error:
//! errors are collected, the result is marked incomplete and whatever data
//! arrived is kept.
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    config::models::EndpointConfig,
    core::{
        context::Context,
        error::{ConfigError, MergeError, ProxyError},
        proxy::{BoxProxy, Data, Middleware, Proxy, ProxyResult, Request, Response, join, split},
    },
};

/// Share of the endpoint timeout granted to the whole merge
const MERGE_BUDGET_PERCENT: u32 = 85;

/// Name under which [`combine_data`] is always available
pub const DEFAULT_COMBINER: &str = "default";

/// Folds `parts` out of `total` expected responses into one.
pub type ResponseCombiner = Arc<dyn Fn(usize, Vec<Response>) -> Response + Send + Sync>;

/// Union of all parts, later parts overwriting earlier keys. Complete only if
/// every expected part arrived and each of them was complete.
pub fn combine_data(total: usize, parts: Vec<Response>) -> Response {
    let mut is_complete = parts.len() == total;
    let mut merged: Option<Response> = None;

    for part in parts {
        is_complete = is_complete && part.is_complete;
        match merged.as_mut() {
            None => merged = Some(part),
            Some(acc) => acc.data.extend(part.data),
        }
    }

    let mut merged = merged.unwrap_or_default();
    merged.is_complete = is_complete;
    merged
}

/// Named response combiners. Built at startup and shared read-only afterwards.
#[derive(Clone, Default)]
pub struct CombinerRegistry {
    combiners: HashMap<String, ResponseCombiner>,
}

impl fmt::Debug for CombinerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CombinerRegistry")
            .field("combiners", &self.combiners.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CombinerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, combiner: F)
    where
        F: Fn(usize, Vec<Response>) -> Response + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!("Registering response combiner '{}'", name);
        self.combiners.insert(name, Arc::new(combiner));
    }

    pub fn contains(&self, name: &str) -> bool {
        name == DEFAULT_COMBINER || self.combiners.contains_key(name)
    }

    /// Look a combiner up by name, falling back to [`combine_data`].
    pub fn get(&self, name: Option<&str>) -> ResponseCombiner {
        match name.and_then(|name| self.combiners.get(name)) {
            Some(combiner) => combiner.clone(),
            None => {
                if let Some(name) = name.filter(|name| *name != DEFAULT_COMBINER) {
                    tracing::warn!("Unknown response combiner '{}', using default", name);
                }
                Arc::new(combine_data)
            }
        }
    }
}

/// Folds branch reports one at a time.
struct MergeAccumulator {
    pending: usize,
    data: Option<Response>,
    combiner: ResponseCombiner,
    errors: Vec<ProxyError>,
}

impl MergeAccumulator {
    fn new(total: usize, combiner: ResponseCombiner) -> Self {
        Self {
            pending: total,
            data: None,
            combiner,
            errors: Vec::new(),
        }
    }

    fn merge(&mut self, response: Option<Response>, err: Option<ProxyError>) {
        self.pending = self.pending.saturating_sub(1);
        match err {
            Some(err) => self.errors.push(err),
            None if response.is_none() => self.errors.push(ProxyError::InvalidResponse),
            None => {}
        }

        let Some(response) = response else {
            return;
        };
        self.data = Some(match self.data.take() {
            None => response,
            Some(acc) => (self.combiner)(2, vec![acc, response]),
        });
    }

    /// Record why the merge stopped waiting for the pending branches.
    fn abort(&mut self, err: Option<ProxyError>) {
        if let Some(err) = err {
            self.errors.push(err);
        }
    }

    fn result(self) -> ProxyResult {
        let err = MergeError::from_errors(self.errors).map(ProxyError::Merge);
        let degraded = self.pending != 0 || err.is_some();
        let response = self.data.map(|mut response| {
            if degraded {
                response.is_complete = false;
            }
            response
        });
        join(response, err)
    }
}

/// Merges the responses of one proxy per backend.
pub struct MergeMiddleware {
    backends: usize,
    timeout: Duration,
    sequential: bool,
    combiner: ResponseCombiner,
}

impl MergeMiddleware {
    pub fn new(endpoint: &EndpointConfig, registry: &CombinerRegistry) -> Result<Self, ConfigError> {
        if endpoint.backends.is_empty() {
            return Err(ConfigError::NoBackends);
        }
        let cfg = endpoint.proxy_config();
        Ok(Self {
            backends: endpoint.backends.len(),
            timeout: endpoint.timeout() * MERGE_BUDGET_PERCENT / 100,
            sequential: cfg.sequential,
            combiner: registry.get(cfg.combiner.as_deref()),
        })
    }
}

impl Middleware for MergeMiddleware {
    fn wrap(&self, mut next: Vec<BoxProxy>) -> Result<BoxProxy, ConfigError> {
        if next.len() != self.backends {
            return Err(ConfigError::MergeArity {
                expected: self.backends,
                got: next.len(),
            });
        }
        if self.backends == 1 {
            return Ok(next.remove(0));
        }
        if self.sequential {
            Ok(Arc::new(SequentialMergeProxy {
                next,
                timeout: self.timeout,
                combiner: self.combiner.clone(),
            }))
        } else {
            Ok(Arc::new(ParallelMergeProxy {
                next,
                timeout: self.timeout,
                combiner: self.combiner.clone(),
            }))
        }
    }
}

struct ParallelMergeProxy {
    next: Vec<BoxProxy>,
    timeout: Duration,
    combiner: ResponseCombiner,
}

#[async_trait]
impl Proxy for ParallelMergeProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let local = ctx.with_timeout(self.timeout);
        let _cancel = local.cancel_on_drop();

        let total = self.next.len();
        let (tx, mut rx) = mpsc::channel(total);
        for next in &self.next {
            let branch_ctx = local.with_cancel();
            let next = next.clone();
            let req = req.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _cancel = branch_ctx.cancel_on_drop();
                let outcome = branch_ctx.run(next.call(branch_ctx.clone(), req)).await;
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        let mut acc = MergeAccumulator::new(total, self.combiner.clone());
        for _ in 0..total {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(outcome) => {
                        let (response, err) = split(outcome);
                        acc.merge(response, err);
                    }
                    None => break,
                },
                _ = ctx.done() => {
                    tracing::debug!("Caller context done with {} branch(es) pending", acc.pending);
                    acc.abort(ctx.err());
                    break;
                }
            }
        }

        let result = acc.result();
        if let Err(err) = &result {
            tracing::debug!("Degraded merge: {}", err);
        }
        result
    }
}

struct SequentialMergeProxy {
    next: Vec<BoxProxy>,
    timeout: Duration,
    combiner: ResponseCombiner,
}

#[async_trait]
impl Proxy for SequentialMergeProxy {
    async fn call(&self, ctx: Context, req: Request) -> ProxyResult {
        let local = ctx.with_timeout(self.timeout);
        let _cancel = local.cancel_on_drop();

        let mut req = req;
        let mut acc = MergeAccumulator::new(self.next.len(), self.combiner.clone());

        for (i, next) in self.next.iter().enumerate() {
            let outcome = local.run(next.call(local.clone(), req.clone())).await;
            let (response, err) = split(outcome);

            if let Some(err) = err {
                if i == 0 {
                    return join(response, Some(err));
                }
                acc.merge(response, Some(err));
                break;
            }
            let Some(response) = response else {
                if i == 0 {
                    return Err(ProxyError::InvalidResponse);
                }
                acc.merge(None, None);
                break;
            };

            let complete = response.is_complete;
            expose_response_params(i, &response.data, &mut req.params);
            acc.merge(Some(response), None);
            if !complete {
                break;
            }
        }

        acc.result()
    }
}

/// Publish a branch's data as `Resp<index>_<dotted path>` request params.
/// Arrays and nulls are skipped.
pub fn expose_response_params(index: usize, data: &Data, params: &mut HashMap<String, String>) {
    for (key, value) in data {
        insert_param(params, format!("Resp{index}_{key}"), value);
    }
}

fn insert_param(params: &mut HashMap<String, String>, key: String, value: &Value) {
    match value {
        Value::Object(nested) => {
            for (child, value) in nested {
                insert_param(params, format!("{key}.{child}"), value);
            }
        }
        Value::String(s) => {
            params.insert(key, s.clone());
        }
        Value::Number(n) => {
            params.insert(key, n.to_string());
        }
        Value::Bool(b) => {
            params.insert(key, b.to_string());
        }
        Value::Null | Value::Array(_) => {}
    }
}
