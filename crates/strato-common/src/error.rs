//! Error types for the Strato control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant includes contextual information like model names and
//! underlying causes.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Strato operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for Model specs or configuration values
    #[error("validation error for {model}: {message}")]
    Validation {
        /// Name of the model with invalid configuration
        model: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.resourceProfile")
        field: Option<String>,
    },

    /// Invalid system configuration; fatal at startup
    #[error("config error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "autoscaler", "resolver")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without model context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            model: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with model context
    pub fn validation_for(model: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            model: model.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with model context and field path
    pub fn validation_for_field(
        model: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            model: model.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a config error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, config, and serialization errors are not retryable
    /// (require a spec or config fix). Kubernetes errors depend on the
    /// status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout, conflict).
                // Don't retry on other 4xx errors (validation, not found, etc.)
                match source {
                    kube::Error::Api(ae) if ae.code == 409 => true,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) => false,
                    _ => true,
                }
            }
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the model name if this error is associated with a specific model
    pub fn model(&self) -> Option<&str> {
        match self {
            Error::Validation { model, .. } => Some(model),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: spec validation catches misconfigurations before any pods exist
    ///
    /// When a user creates a Model with an invalid resource profile, the
    /// reconciler surfaces a clear error instead of creating broken pods.
    #[test]
    fn story_validation_prevents_invalid_model() {
        let err = Error::validation_for("llama-3-8b", "minReplicas must be <= maxReplicas");
        assert!(err.to_string().contains("validation error"));
        assert!(err.to_string().contains("llama-3-8b"));
        assert_eq!(err.model(), Some("llama-3-8b"));
        assert!(!err.is_retryable());

        let err = Error::validation_for_field(
            "llama-3-8b",
            "spec.resourceProfile",
            "should match <name>:<multiplier>",
        );
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.resourceProfile"));
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: invalid config refuses to run
    #[test]
    fn story_config_errors_are_fatal() {
        let err = Error::config("autoscaling interval must be positive");
        assert!(err.to_string().contains("config error"));
        assert!(!err.is_retryable());
    }

    /// Story: serialization errors carry the resource kind
    #[test]
    fn story_serialization_errors_carry_kind() {
        let err = Error::serialization_for_kind("ConfigMap", "entry is not valid JSON");
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("ConfigMap")),
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
    }

    /// Story: internal errors are retried by the controller machinery
    #[test]
    fn story_internal_errors_are_retryable() {
        let err = Error::internal_with_context("reconciler", "pod plan raced with informer");
        assert!(err.is_retryable());
        assert_eq!(err.context(), Some("reconciler"));
        assert!(err.to_string().contains("[reconciler]"));
    }

    #[test]
    fn internal_default_context() {
        let err = Error::internal("unexpected state");
        assert_eq!(err.context(), Some(UNKNOWN_CONTEXT));
        assert!(err.to_string().contains("[unknown]"));
    }

    #[test]
    fn error_construction_ergonomics() {
        let name = "whisper-large";
        let err = Error::validation(format!("model {} not found in profile map", name));
        assert!(err.to_string().contains("whisper-large"));

        let err = Error::internal("static message");
        assert!(err.to_string().contains("static message"));
    }
}
