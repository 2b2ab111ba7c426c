#![allow(clippy::collapsible_if)]

use std::{collections::HashSet, net::SocketAddr, sync::LazyLock};

use eyre::Result;
use regex::Regex;

use crate::config::models::{
    BackendConfig, EndpointConfig, ExtraConfig, GatewayConfig, PROXY_NAMESPACE, ProxyExtraConfig,
};

static METHOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z]+$").expect("invalid method regex"));

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Endpoint conflict detected: {message}")]
    EndpointConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        if config.endpoints.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "endpoints".to_string(),
            });
        } else {
            for endpoint in &config.endpoints {
                if let Err(mut endpoint_errors) = Self::validate_endpoint(endpoint) {
                    errors.append(&mut endpoint_errors);
                }
            }
        }

        if let Err(conflict_error_list) = Self::check_endpoint_conflicts(&config.endpoints) {
            errors.extend(conflict_error_list);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    /// Validate a single endpoint and all of its backends
    fn validate_endpoint(endpoint: &EndpointConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let path = endpoint.endpoint.as_str();

        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoint: {path}"),
                message: "Endpoint paths must start with '/'".to_string(),
            });
        }

        if let Err(e) = Self::validate_method(&endpoint.method, &format!("endpoint '{path}' method"))
        {
            errors.push(e);
        }

        if let Some(timeout) = endpoint.timeout {
            if timeout.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: format!("endpoint '{path}' timeout"),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        if let Err(e) = Self::validate_extra_config(
            &endpoint.extra_config,
            &format!("endpoint '{path}' extra_config"),
        ) {
            errors.push(e);
        }

        if endpoint.backends.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("endpoint '{path}' backends"),
                message: "Endpoints must have at least one backend".to_string(),
            });
        }

        for (i, backend) in endpoint.backends.iter().enumerate() {
            let context = format!("endpoint '{path}' backend {}", i + 1);
            if let Err(mut backend_errors) = Self::validate_backend(backend, &context) {
                errors.append(&mut backend_errors);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_backend(backend: &BackendConfig, context: &str) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if !backend.url_pattern.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} url_pattern"),
                message: "URL patterns must start with '/'".to_string(),
            });
        }

        if let Err(e) = Self::validate_method(&backend.method, &format!("{context} method")) {
            errors.push(e);
        }

        if backend.hosts.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} hosts"),
                message: "Backends must have at least one host".to_string(),
            });
        }

        for (i, host) in backend.hosts.iter().enumerate() {
            if let Err(e) = Self::validate_url(host, &format!("{context} host {}", i + 1)) {
                errors.push(e);
            }
        }

        if backend.concurrent_calls == 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} concurrent_calls"),
                message: "Concurrent calls must be at least 1".to_string(),
            });
        }

        if let Some(timeout) = backend.timeout {
            if timeout.is_zero() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} timeout"),
                    message: "Timeout must be greater than 0".to_string(),
                });
            }
        }

        if !backend.allow_list.is_empty() && !backend.deny_list.is_empty() {
            tracing::warn!(
                "{}: both allow_list and deny_list are set, deny_list is ignored",
                context
            );
        }

        if let Err(e) =
            Self::validate_extra_config(&backend.extra_config, &format!("{context} extra_config"))
        {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate URL format
    fn validate_url(url_str: &str, context: &str) -> ValidationResult<()> {
        match url::Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: format!(
                            "URL scheme must be 'http' or 'https', got '{}'",
                            url.scheme()
                        ),
                    });
                }

                if url.host().is_none() {
                    return Err(ValidationError::InvalidField {
                        field: context.to_string(),
                        message: "URL must have a valid host".to_string(),
                    });
                }

                Ok(())
            }
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid URL format: {e}"),
            }),
        }
    }

    fn validate_method(method: &str, context: &str) -> ValidationResult<()> {
        if !METHOD.is_match(method) || method.parse::<http::Method>().is_err() {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid HTTP method: '{method}'"),
            });
        }
        Ok(())
    }

    /// The proxy namespace must decode; at runtime a malformed one is ignored.
    fn validate_extra_config(extra: &ExtraConfig, context: &str) -> ValidationResult<()> {
        if let Some(raw) = extra.get(PROXY_NAMESPACE) {
            if let Err(e) = serde_json::from_value::<ProxyExtraConfig>(raw.clone()) {
                return Err(ValidationError::InvalidField {
                    field: format!("{context}.{PROXY_NAMESPACE}"),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Two endpoints conflict when they share method and path
    fn check_endpoint_conflicts(endpoints: &[EndpointConfig]) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for endpoint in endpoints {
            let key = (endpoint.method.to_uppercase(), endpoint.endpoint.as_str());
            if !seen.insert(key) {
                errors.push(ValidationError::EndpointConflict {
                    message: format!(
                        "Duplicate endpoint configuration for {} '{}'",
                        endpoint.method, endpoint.endpoint
                    ),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.is_empty() {
            return "No errors".to_string();
        }

        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
