//! Error types for the DLRN promoter.

use thiserror::Error;

use crate::records::Backend;

/// Errors raised by promoter components.
#[derive(Error, Debug)]
pub enum PromoterError {
    /// Missing required setting or invalid layered configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed build identity
    #[error("Invalid hash: {0}")]
    InvalidHash(String),

    /// DLRN API answered with an error status
    #[error("DLRN API error (HTTP {status}): {message}")]
    Upstream { status: u16, message: String },

    /// Expected file, symlink or container absent
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),

    /// A backend refused or failed partway
    #[error("Promotion failed: {0}")]
    Promotion(String),

    /// An external actor promoted a hash since the run started
    #[error("Named hash for '{label}' changed since promotion start: was {stored}, now {fetched}")]
    HashChanged {
        label: String,
        stored: String,
        fetched: String,
    },

    /// The hash is already the current promotee of the target
    #[error("Hash {hash} is already promoted to {target}")]
    AlreadyPromoted { hash: String, target: String },

    /// HTTP transport failure, no status available
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PromoterError {
    /// Errors that end the whole run instead of a single candidate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PromoterError::Config(_) | PromoterError::HashChanged { .. }
        )
    }

    /// Stable short name, used in attempt reports.
    pub fn kind(&self) -> &'static str {
        match self {
            PromoterError::Config(_) => "config_error",
            PromoterError::InvalidHash(_) => "invalid_hash",
            PromoterError::Upstream { .. } | PromoterError::Http(_) => "upstream_error",
            PromoterError::MissingArtifact(_) => "missing_artifact",
            PromoterError::Promotion(_) => "promotion_error",
            PromoterError::HashChanged { .. } => "hash_changed",
            PromoterError::AlreadyPromoted { .. } => "already_promoted",
            PromoterError::Io(_) | PromoterError::Yaml(_) | PromoterError::Json(_) => {
                "promotion_error"
            }
        }
    }
}

/// Result type for promoter operations
pub type PromoterResult<T> = std::result::Result<T, PromoterError>;

/// A failure bound to the attempt that produced it.
#[derive(Error, Debug)]
#[error("target '{target}', candidate {short_hash}, backend {backend}: {source}")]
pub struct AttemptError {
    pub target: String,
    pub short_hash: String,
    pub backend: Backend,
    #[source]
    pub source: PromoterError,
}

impl AttemptError {
    pub fn new(target: &str, short_hash: &str, backend: Backend, source: PromoterError) -> Self {
        Self {
            target: target.to_string(),
            short_hash: short_hash.to_string(),
            backend,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(PromoterError::Config("x".into()).is_fatal());
        assert!(PromoterError::HashChanged {
            label: "current-tripleo".into(),
            stored: "a".into(),
            fetched: "b".into()
        }
        .is_fatal());
        assert!(!PromoterError::Promotion("x".into()).is_fatal());
        assert!(!PromoterError::Upstream {
            status: 500,
            message: "boom".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_attempt_error_names_target_hash_and_backend() {
        let err = AttemptError::new(
            "current-tripleo",
            "90633a37_d68290fe",
            Backend::Qcow,
            PromoterError::MissingArtifact("no images dir".into()),
        );
        let message = err.to_string();
        assert!(message.contains("current-tripleo"));
        assert!(message.contains("90633a37_d68290fe"));
        assert!(message.contains("qcow_client"));
        assert!(message.contains("no images dir"));
    }
}
