//! Error types

use std::time::Duration;

use crate::tenant::TenantId;

/// Boxed error returned by the operations being throttled
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a submission that did not produce a value
///
/// Every variant is delivered through the [`ResultHandle`](crate::ResultHandle)
/// returned by `submit`; nothing is raised synchronously.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Tenant quota denied admission
    #[error("rate limit exceeded for tenant {tenant}")]
    RateLimited { tenant: TenantId },

    /// Buffer is at capacity
    #[error("buffer is full (capacity {capacity})")]
    BufferFull { capacity: usize },

    /// Budget elapsed while the item was still buffered; never executed
    #[error("item expired after waiting {waited:?} in the buffer")]
    Expired { waited: Duration },

    /// Item was dispatched but did not complete within its remaining budget
    #[error("execution timed out after {budget:?}")]
    Timeout { budget: Duration },

    /// Operation completed with an error before its deadline
    #[error("execution failed: {0}")]
    ExecutionFailed(#[source] BoxError),

    /// Dispatcher is stopped or was dropped before the item completed
    #[error("dispatcher is shut down")]
    Shutdown,
}

impl DispatchError {
    /// Check whether the caller should back off before resubmitting
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::BufferFull { .. })
    }
}

/// Invalid configuration
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A setting has a value that cannot work
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// An environment variable could not be parsed
    #[error("cannot parse environment variable {var}={value:?}")]
    Env { var: String, value: String },

    /// A rate limit spec could not be parsed
    #[error("invalid rate limit spec {spec:?}: {reason}")]
    RateLimitSpec { spec: String, reason: String },
}

/// Dispatcher lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    /// Dispatcher already started
    #[error("dispatcher is already running")]
    AlreadyRunning,

    /// Dispatcher was stopped and cannot be restarted
    #[error("dispatcher has been stopped")]
    Terminated,

    /// In-flight executions did not finish in time
    #[error("graceful shutdown timed out with {in_flight} executions in flight")]
    ShutdownTimeout { in_flight: usize },

    /// Configuration rejected at construction
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backpressure_classification() {
        assert!(DispatchError::RateLimited {
            tenant: TenantId::random()
        }
        .is_backpressure());
        assert!(DispatchError::BufferFull { capacity: 1 }.is_backpressure());
        assert!(!DispatchError::Timeout {
            budget: Duration::from_secs(1)
        }
        .is_backpressure());
        assert!(!DispatchError::Shutdown.is_backpressure());
    }

    #[test]
    fn test_execution_failed_keeps_source() {
        use std::error::Error as _;

        let err = DispatchError::ExecutionFailed("connection reset".into());
        assert_eq!(err.to_string(), "execution failed: connection reset");
        assert_eq!(err.source().unwrap().to_string(), "connection reset");
    }
}
