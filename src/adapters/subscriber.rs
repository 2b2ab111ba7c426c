//! Host sources for the load balancer.
//!
//! * [`FixedSubscriber`] serves the hosts listed in the backend configuration.
//! * [`DynamicSubscriber`] holds a host list that a discovery task can swap at
//!   any time; readers never block on writers.
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{
    config::models::BackendConfig,
    ports::{
        backend::SubscriberFactory,
        subscriber::{Subscriber, SubscriberResult},
    },
};

/// Static host list.
#[derive(Debug, Clone, Default)]
pub struct FixedSubscriber {
    hosts: Vec<String>,
}

impl FixedSubscriber {
    pub fn new(hosts: Vec<String>) -> Self {
        Self { hosts }
    }
}

impl Subscriber for FixedSubscriber {
    fn hosts(&self) -> SubscriberResult<Vec<String>> {
        Ok(self.hosts.clone())
    }

    fn fixed_hosts(&self) -> Option<&[String]> {
        Some(&self.hosts)
    }
}

/// Host list that can be replaced at runtime.
#[derive(Debug)]
pub struct DynamicSubscriber {
    hosts: ArcSwap<Vec<String>>,
}

impl DynamicSubscriber {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts: ArcSwap::from_pointee(hosts),
        }
    }

    /// Replace the host list; in-flight lookups keep the previous snapshot.
    pub fn update(&self, hosts: Vec<String>) {
        tracing::debug!("Updating subscriber host list: {:?}", hosts);
        self.hosts.store(Arc::new(hosts));
    }
}

impl Subscriber for DynamicSubscriber {
    fn hosts(&self) -> SubscriberResult<Vec<String>> {
        Ok(self.hosts.load().as_ref().clone())
    }
}

/// Binds every backend to a [`FixedSubscriber`] over its configured hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedSubscriberFactory;

impl SubscriberFactory for FixedSubscriberFactory {
    fn new_subscriber(&self, backend: &BackendConfig) -> Arc<dyn Subscriber> {
        Arc::new(FixedSubscriber::new(backend.hosts.clone()))
    }
}
