use thiserror::Error;

/// Error type for host discovery
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SubscriberError {
    /// The discovery backend could not be queried
    #[error("service discovery error: {0}")]
    Discovery(String),
}

/// Result type alias for host discovery
pub type SubscriberResult<T> = Result<T, SubscriberError>;

/// Subscriber defines the port (interface) for looking up the current hosts
/// of one backend. Implementations own and synchronize their host list.
pub trait Subscriber: Send + Sync + 'static {
    /// Return the current host list
    ///
    /// # Returns
    /// The hosts (scheme and authority, e.g. `http://10.0.0.1:8080`) or an error
    fn hosts(&self) -> SubscriberResult<Vec<String>>;

    /// The host list if it can never change, used to pick a zero-cost balancer
    fn fixed_hosts(&self) -> Option<&[String]> {
        None
    }
}
