//! Error types for plinth
//!
//! Errors are structured with fields to aid debugging in production.
//! Feature-level failures carry the feature name and the failing stage so the
//! outer control loop can tell "a dependency is not ready yet" apart from
//! "a feature was wired wrong".

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Step of a feature's lifecycle an error originated from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Gating checks run before anything is applied
    PreConditions,
    /// Rendering and applying the feature's manifests
    ApplyManifests,
    /// Resource producers creating non-templated objects
    ResourceCreation,
    /// Verification checks run after resources are applied
    PostConditions,
    /// Cleanup of a feature
    Delete,
    /// Reading or writing the feature's tracker record
    Tracking,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreConditions => write!(f, "PreConditions"),
            Self::ApplyManifests => write!(f, "ApplyManifests"),
            Self::ResourceCreation => write!(f, "ResourceCreation"),
            Self::PostConditions => write!(f, "PostConditions"),
            Self::Delete => write!(f, "Delete"),
            Self::Tracking => write!(f, "Tracking"),
        }
    }
}

/// Stage of an apply pass; the only stages recorded on a FeatureTracker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApplyStage {
    /// Gating checks run before anything is applied
    PreConditions,
    /// Rendering and applying the feature's manifests
    ApplyManifests,
    /// Resource producers creating non-templated objects
    ResourceCreation,
    /// Verification checks run after resources are applied
    PostConditions,
}

impl From<ApplyStage> for Stage {
    fn from(stage: ApplyStage) -> Self {
        match stage {
            ApplyStage::PreConditions => Self::PreConditions,
            ApplyStage::ApplyManifests => Self::ApplyManifests,
            ApplyStage::ResourceCreation => Self::ResourceCreation,
            ApplyStage::PostConditions => Self::PostConditions,
        }
    }
}

impl fmt::Display for ApplyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Stage::from(*self).fmt(f)
    }
}

/// Main error type for plinth operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Object store operation failed
    #[error("store error during {operation} of {kind} {name}: {message}")]
    Store {
        /// Operation that failed (get, create, apply, ...)
        operation: String,
        /// Resource kind
        kind: String,
        /// Resource name (namespace-qualified when namespaced)
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Create was attempted on an object that already exists
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// An object required by the operation does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Invalid feature or owner configuration
    #[error("validation error for {feature}: {message}")]
    Validation {
        /// Name of the feature (or owner) with invalid configuration
        feature: String,
        /// Description of what's invalid
        message: String,
    },

    /// One or more features could not be registered
    #[error("feature registration failed: {}", violations.join("; "))]
    Registration {
        /// Every violation found in the batch
        violations: Vec<String>,
    },

    /// A feature asked for a data key nobody populated
    #[error("data '{key}' not found in feature '{feature}'")]
    DataNotFound {
        /// Feature doing the lookup
        feature: String,
        /// Key that was requested
        key: String,
    },

    /// A feature failed at a specific stage
    #[error("feature '{feature}' failed at {stage}: {source}")]
    Feature {
        /// Name of the failing feature
        feature: String,
        /// Stage the failure happened in
        stage: Stage,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// A readiness poll ran out of time
    #[error("timed out after {timeout:?} waiting for {what}")]
    Timeout {
        /// What was being waited on
        what: String,
        /// The configured bound
        timeout: Duration,
    },

    /// The caller's cancellation token fired
    #[error("operation cancelled [{context}]")]
    Cancelled {
        /// Where cancellation was observed
        context: String,
    },

    /// A manifest could not be loaded or parsed
    #[error("manifest error [{path}]: {message}")]
    Manifest {
        /// File or include path
        path: String,
        /// Description of what failed
        message: String,
    },

    /// Template rendering failed
    #[error("template error: {0}")]
    Template(String),

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
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error without feature context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            feature: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error for a named feature
    pub fn validation_for(feature: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            feature: feature.into(),
            message: msg.into(),
        }
    }

    /// Create a store error
    pub fn store(
        operation: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Store {
            operation: operation.into(),
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a data-not-found error
    pub fn data_not_found(feature: impl Into<String>, key: impl Into<String>) -> Self {
        Self::DataNotFound {
            feature: feature.into(),
            key: key.into(),
        }
    }

    /// Wrap an error with the feature and stage it happened in
    ///
    /// An error that is already attributed to a feature is kept as is.
    pub fn in_feature(self, feature: impl Into<String>, stage: Stage) -> Self {
        match self {
            already @ Self::Feature { .. } => already,
            other => Self::Feature {
                feature: feature.into(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            timeout,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
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

    /// Create an internal error without specific context
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

    /// Check if this error is worth another reconciliation pass
    ///
    /// Wiring defects (missing data, invalid or duplicate features, bad
    /// serialization) reproduce on every pass and are not retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::Feature { source, .. } => source.is_retryable(),
            Error::Validation { .. }
            | Error::Registration { .. }
            | Error::DataNotFound { .. }
            | Error::Serialization { .. }
            | Error::Template(_)
            | Error::Manifest { .. } => false,
            Error::Store { .. }
            | Error::AlreadyExists { .. }
            | Error::NotFound { .. }
            | Error::Timeout { .. }
            | Error::Cancelled { .. }
            | Error::Internal { .. } => true,
        }
    }

    /// True when this error (or the error it wraps) is a missing data key
    pub fn is_data_not_found(&self) -> bool {
        match self {
            Error::DataNotFound { .. } => true,
            Error::Feature { source, .. } => source.is_data_not_found(),
            _ => false,
        }
    }

    /// True when this error (or the error it wraps) is a poll timeout
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout { .. } => true,
            Error::Feature { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// True when this error reports a missing object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Stage the error is attributed to, if it went through a feature
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Feature { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Feature the error is attributed to, if any
    pub fn feature(&self) -> Option<&str> {
        match self {
            Error::Feature { feature, .. } => Some(feature),
            Error::DataNotFound { feature, .. } => Some(feature),
            Error::Validation { feature, .. } => Some(feature),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a missing data key is a wiring defect, even when wrapped
    #[test]
    fn story_data_not_found_survives_feature_wrapping() {
        let err = Error::data_not_found("mesh-shared-configmap", "control_plane")
            .in_feature("mesh-shared-configmap", Stage::ResourceCreation);

        assert!(err.is_data_not_found());
        assert!(!err.is_retryable());
        assert_eq!(err.stage(), Some(Stage::ResourceCreation));
        assert!(err.to_string().contains("control_plane"));
        assert!(err.to_string().contains("ResourceCreation"));
    }

    /// Story: a readiness timeout is retryable by the next pass
    #[test]
    fn story_timeout_is_retryable() {
        let err = Error::timeout("pods in istio-system", Duration::from_secs(300))
            .in_feature("mesh-control-plane-creation", Stage::PostConditions);

        assert!(err.is_timeout());
        assert!(err.is_retryable());
        assert!(!err.is_data_not_found());
    }

    #[test]
    fn test_in_feature_does_not_double_wrap() {
        let err = Error::internal("boom")
            .in_feature("inner", Stage::PreConditions)
            .in_feature("outer", Stage::PostConditions);

        assert_eq!(err.feature(), Some("inner"));
        assert_eq!(err.stage(), Some(Stage::PreConditions));
    }

    #[test]
    fn test_registration_lists_every_violation() {
        let err = Error::Registration {
            violations: vec!["first".to_string(), "second".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("first"));
        assert!(msg.contains("second"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_not_found_classification() {
        let err = Error::NotFound {
            kind: "ConfigMap".to_string(),
            name: "ns/refs".to_string(),
        };
        assert!(err.is_not_found());
        assert!(!Error::internal("x").is_not_found());
    }
}
