//! Configuration data structures for Conflux.
//!
//! These types map directly to YAML / JSON / TOML configuration files. They are
//! serde‑friendly and include defaults so that minimal configs remain concise.
//! The free-form `extra_config` bags are decoded once, at pipeline assembly
//! time, into the typed [`ProxyExtraConfig`].
use std::{collections::BTreeMap, fmt, time::Duration};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Namespace inside `extra_config` read by the proxy pipeline
pub const PROXY_NAMESPACE: &str = "proxy";

/// Fallback timeout when neither the backend, endpoint nor gateway set one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Free-form, namespaced configuration bag
pub type ExtraConfig = Map<String, Value>;

fn default_method() -> String {
    "GET".to_string()
}

fn default_concurrent_calls() -> usize {
    1
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

/// Humantime (de)serialization for durations ("150ms", "3s", "1m").
mod humantime_duration {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

mod humantime_duration_opt {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Default endpoint timeout
    #[serde(default = "default_timeout", with = "humantime_duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout: DEFAULT_TIMEOUT,
            endpoints: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Propagate timeouts downwards: gateway → endpoint → backend.
    pub fn normalize(&mut self) {
        for endpoint in &mut self.endpoints {
            if endpoint.timeout.is_none() {
                endpoint.timeout = Some(self.timeout);
            }
            endpoint.normalize();
        }
    }
}

/// Builder for GatewayConfig to allow for cleaner configuration creation
#[derive(Default)]
pub struct GatewayConfigBuilder {
    listen_addr: Option<String>,
    timeout: Option<Duration>,
    endpoints: Vec<EndpointConfig>,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = Some(addr.into());
        self
    }

    /// Set the default endpoint timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add an endpoint
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Build the final, normalized GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.endpoints.is_empty() {
            return Err("At least one endpoint must be configured".to_string());
        }

        let mut config = GatewayConfig {
            listen_addr: self.listen_addr.unwrap_or_else(default_listen_addr),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            endpoints: self.endpoints,
        };
        config.normalize();
        Ok(config)
    }
}

/// A public endpoint and the backends it fans out to.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EndpointConfig {
    /// Route pattern, e.g. `/users/{id}`
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub extra_config: ExtraConfig,
}

impl EndpointConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: default_method(),
            timeout: None,
            backends: Vec::new(),
            extra_config: ExtraConfig::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backends.push(backend);
        self
    }

    /// Set the `proxy` namespace of the extra config
    pub fn with_proxy_config(mut self, value: Value) -> Self {
        self.extra_config.insert(PROXY_NAMESPACE.to_string(), value);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Backends without their own timeout inherit the endpoint's.
    pub fn normalize(&mut self) {
        let timeout = self.timeout();
        for backend in &mut self.backends {
            if backend.timeout.is_none() {
                backend.timeout = Some(timeout);
            }
        }
    }

    pub fn proxy_config(&self) -> ProxyExtraConfig {
        ProxyExtraConfig::from_extra(&self.extra_config)
    }
}

/// How the transport layer decodes a backend payload.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Encoding {
    #[default]
    Json,
    /// Pass the raw body through untouched
    NoOp,
}

/// One upstream service called by an endpoint.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BackendConfig {
    /// Path template, e.g. `/users/{{.id}}`
    pub url_pattern: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default, with = "humantime_duration_opt")]
    pub timeout: Option<Duration>,
    #[serde(default = "default_concurrent_calls")]
    pub concurrent_calls: usize,
    /// Dotted path of the nested object to unwrap
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub deny_list: Vec<String>,
    /// Field renames, old key → new key
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    /// Wrap the whole document under this key
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default)]
    pub extra_config: ExtraConfig,
}

impl BackendConfig {
    pub fn new(url_pattern: impl Into<String>) -> Self {
        Self {
            url_pattern: url_pattern.into(),
            method: default_method(),
            hosts: Vec::new(),
            timeout: None,
            concurrent_calls: default_concurrent_calls(),
            target: None,
            allow_list: Vec::new(),
            deny_list: Vec::new(),
            mapping: BTreeMap::new(),
            group: None,
            encoding: Encoding::default(),
            extra_config: ExtraConfig::new(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_concurrent_calls(mut self, calls: usize) -> Self {
        self.concurrent_calls = calls;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the `proxy` namespace of the extra config
    pub fn with_proxy_config(mut self, value: Value) -> Self {
        self.extra_config.insert(PROXY_NAMESPACE.to_string(), value);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    pub fn proxy_config(&self) -> ProxyExtraConfig {
        ProxyExtraConfig::from_extra(&self.extra_config)
    }

    pub fn is_shadow(&self) -> bool {
        self.proxy_config().shadow
    }
}

/// Condition under which static data is merged into a response.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StaticStrategy {
    #[default]
    Always,
    Success,
    Errored,
    Complete,
    Incomplete,
}

impl fmt::Display for StaticStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StaticStrategy::Always => "always",
            StaticStrategy::Success => "success",
            StaticStrategy::Errored => "errored",
            StaticStrategy::Complete => "complete",
            StaticStrategy::Incomplete => "incomplete",
        };
        f.write_str(name)
    }
}

/// Constant data injected into endpoint responses.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct StaticDataConfig {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub strategy: StaticStrategy,
}

/// Typed view of the `proxy` namespace of an extra-config bag.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ProxyExtraConfig {
    /// Name of a registered response combiner
    pub combiner: Option<String>,
    /// Chain backends instead of calling them in parallel
    pub sequential: bool,
    /// Backend-level: mirror traffic without using the answer
    pub shadow: bool,
    #[serde(rename = "static")]
    pub static_data: Option<StaticDataConfig>,
}

impl ProxyExtraConfig {
    /// Decode the `proxy` namespace. Missing or malformed content degrades to
    /// the defaults, which disable every optional middleware.
    pub fn from_extra(extra: &ExtraConfig) -> Self {
        let Some(raw) = extra.get(PROXY_NAMESPACE) else {
            return Self::default();
        };
        match serde_json::from_value(raw.clone()) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("Ignoring invalid '{}' extra config: {}", PROXY_NAMESPACE, e);
                Self::default()
            }
        }
    }
}
