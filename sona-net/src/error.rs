//! Error types shared across the crate.

use thiserror::Error;

/// Errors raised by versioned store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Create on a key that is already present.
    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Update on a key that is absent.
    #[error("{kind} {id} does not exist")]
    NotFound { kind: &'static str, id: String },

    /// The compute function refused the change.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn already_exists(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            id: id.into(),
        }
    }
}

/// Errors returned to callers of the administrative facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// A required field was empty.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Removal refused because dependents still exist.
    #[error("{kind} {id} still in use")]
    InUse { kind: &'static str, id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-item failure while computing or applying dataplane state.
///
/// These never stop a reconciler; the affected item is logged and skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// A referenced entity is absent at programming time.
    #[error("{kind} {id} not found")]
    MissingDependency { kind: &'static str, id: String },

    /// The network type cannot be programmed by this reconciler.
    #[error("unsupported network type {network_type} for network {network_id}")]
    UnsupportedNetworkType {
        network_id: String,
        network_type: String,
    },

    #[error(transparent)]
    Flow(#[from] FlowError),
}

impl ReconcileError {
    pub fn missing(kind: &'static str, id: impl Into<String>) -> Self {
        ReconcileError::MissingDependency {
            kind,
            id: id.into(),
        }
    }
}

/// Failure reported by a [`crate::flow::FlowProgram`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("flow rejected by {device_id}: {reason}")]
    Rejected { device_id: String, reason: String },
}

/// Configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid SNAT port range [{min}, {max})")]
    PortRange { min: u16, max: u16 },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("failed to parse config: {0}")]
    Parse(String),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::already_exists("network", "n1");
        assert_eq!(err.to_string(), "network n1 already exists");

        let err = StoreError::not_found("subnet", "s1");
        assert_eq!(err.to_string(), "subnet s1 does not exist");
    }

    #[test]
    fn test_service_error_wraps_store_error() {
        let err: ServiceError = StoreError::not_found("port", "p1").into();
        assert_eq!(err.to_string(), "port p1 does not exist");
        assert!(matches!(err, ServiceError::Store(StoreError::NotFound { .. })));
    }
}
