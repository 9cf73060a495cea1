//! Error types for the Steward reconciliation engine

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The remote object does not exist
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    /// Serialization error while converting between typed and dynamic objects
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// A descriptor produced an invalid desired object or identity
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// A lifecycle hook returned an error
    #[error("{hook} hook failed: {message}")]
    HookError { hook: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The reconcile request was cancelled before a remote call was issued
    #[error("Reconcile cancelled")]
    Cancelled,
}

impl Error {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn hook(hook: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::HookError {
            hook: hook.into(),
            message: message.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    /// True for a missing object, whether reported by the store or by the API server
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            _ => false,
        }
    }

    /// Check if the error is retriable without operator intervention
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(e)) => {
                e.code >= 500 || e.code == 409 || e.code == 429
            }
            Error::KubeError(_) | Error::Cancelled | Error::NotFound { .. } => true,
            Error::SerializationError(_)
            | Error::ValidationError(_)
            | Error::HookError { .. }
            | Error::ConfigError(_) => false,
        }
    }

    /// Low-cardinality label used for the error counter
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::NotFound { .. } => "not_found",
            Error::SerializationError(_) => "serialization",
            Error::ValidationError(_) => "validation",
            Error::HookError { .. } => "hook",
            Error::ConfigError(_) => "config",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_matches_store_and_api() {
        assert!(Error::not_found("ConfigMap", "default/app").is_not_found());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(!Error::validation("bad").is_not_found());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(api_error(503).is_retriable());
        assert!(api_error(409).is_retriable());
        assert!(!api_error(422).is_retriable());
        assert!(!Error::hook("after", "status write failed").is_retriable());
    }

    #[test]
    fn test_hook_error_message() {
        let err = Error::hook("on-create", "condition missing");
        assert_eq!(err.to_string(), "on-create hook failed: condition missing");
        assert_eq!(err.metric_label(), "hook");
    }
}
