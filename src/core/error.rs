//! Error types shared by every stage of the proxy pipeline.
//!
//! Two families live here:
//! * [`ProxyError`] is returned at request time by a [`Proxy`](super::Proxy).
//! * [`ConfigError`] is returned while a pipeline is being assembled. These
//!   indicate wiring mistakes and never surface during traffic.
use std::fmt;

use thiserror::Error;

use crate::{core::proxy::Response, ports::subscriber::SubscriberError};

/// Request-time failures produced or propagated by proxies.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    /// The subscriber returned an empty host list
    #[error("no hosts available")]
    NoHosts,

    /// A proxy returned neither a response nor an error
    #[error("invalid response")]
    InvalidResponse,

    /// The request context was cancelled
    #[error("context canceled")]
    Cancelled,

    /// The request context ran past its deadline
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// Host lookup failed inside the service discovery collaborator
    #[error(transparent)]
    Subscriber(#[from] SubscriberError),

    /// The balanced host and path did not form a valid URL
    #[error("invalid backend url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A `{{.Name}}` placeholder had no matching request parameter
    #[error("missing parameter '{0}' for the backend url pattern")]
    MissingParam(String),

    /// Errors collected from several branches of a merge or a race
    #[error(transparent)]
    Merge(#[from] MergeError),

    /// An error that still carries the response assembled so far
    #[error("{error}")]
    Partial {
        response: Box<Response>,
        error: Box<ProxyError>,
    },

    /// The backend answered with a non-success status
    #[error("backend returned error status: {status}, url: {url}")]
    Backend { url: String, status: u16 },

    /// The backend could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// The backend payload could not be decoded
    #[error("decoding error: {0}")]
    Decode(String),
}

impl ProxyError {
    /// True for the two context-driven failures.
    pub fn is_context_error(&self) -> bool {
        match self {
            ProxyError::Cancelled | ProxyError::DeadlineExceeded => true,
            ProxyError::Partial { error, .. } => error.is_context_error(),
            ProxyError::Merge(merged) => merged.context_error().is_some(),
            _ => false,
        }
    }

    /// Split off a carried response, if any.
    pub fn into_parts(self) -> (Option<Response>, ProxyError) {
        match self {
            ProxyError::Partial { response, error } => (Some(*response), *error),
            other => (None, other),
        }
    }
}

/// Aggregate of branch errors. Renders as the newline-joined messages.
#[derive(Debug, Default)]
pub struct MergeError {
    errors: Vec<ProxyError>,
}

impl MergeError {
    /// Returns `None` when there is nothing to report.
    pub fn from_errors(errors: Vec<ProxyError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self { errors })
        }
    }

    /// The context error behind the aggregate when every branch failed on
    /// its context. A deadline wins over a cancellation.
    pub fn context_error(&self) -> Option<&ProxyError> {
        if self.errors.is_empty() || !self.errors.iter().all(ProxyError::is_context_error) {
            return None;
        }
        self.errors
            .iter()
            .find(|err| matches!(err, ProxyError::DeadlineExceeded))
            .or_else(|| self.errors.first())
    }

    pub fn errors(&self) -> &[ProxyError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeError {}

/// Pipeline assembly failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("no backends defined for the endpoint")]
    NoBackends,

    #[error("not enough proxies for the {middleware} middleware: got {got}")]
    NotEnoughProxies { middleware: &'static str, got: usize },

    #[error("too many proxies for the {middleware} middleware: got {got}")]
    TooManyProxies { middleware: &'static str, got: usize },

    #[error("merge middleware expects {expected} proxies, got {got}")]
    MergeArity { expected: usize, got: usize },

    #[error("concurrent calls must be greater than 1, got {0}")]
    InvalidConcurrency(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_error_joins_messages() {
        let err = MergeError::from_errors(vec![
            ProxyError::NoHosts,
            ProxyError::Connection("refused".to_string()),
            ProxyError::InvalidResponse,
        ])
        .unwrap();
        assert_eq!(
            err.to_string(),
            "no hosts available\nconnection error: refused\ninvalid response"
        );
        assert_eq!(err.len(), 3);
    }

    #[test]
    fn test_merge_error_empty_is_none() {
        assert!(MergeError::from_errors(Vec::new()).is_none());
    }

    #[test]
    fn test_merge_error_context_error() {
        let timed_out = MergeError::from_errors(vec![
            ProxyError::Cancelled,
            ProxyError::DeadlineExceeded,
        ])
        .unwrap();
        assert!(matches!(
            timed_out.context_error(),
            Some(ProxyError::DeadlineExceeded)
        ));
        assert!(ProxyError::Merge(timed_out).is_context_error());

        let mixed = MergeError::from_errors(vec![
            ProxyError::DeadlineExceeded,
            ProxyError::Connection("refused".to_string()),
        ])
        .unwrap();
        assert!(mixed.context_error().is_none());
        assert!(!ProxyError::Merge(mixed).is_context_error());
    }

    #[test]
    fn test_partial_renders_inner_error() {
        let err = ProxyError::Partial {
            response: Box::new(Response::default()),
            error: Box::new(ProxyError::DeadlineExceeded),
        };
        assert_eq!(err.to_string(), "context deadline exceeded");
        assert!(err.is_context_error());

        let (response, inner) = err.into_parts();
        assert!(response.is_some());
        assert!(matches!(inner, ProxyError::DeadlineExceeded));
    }
}
