//! Error types for the storage operator
//!
//! Errors carry enough context to tell the failure categories apart:
//! misconfiguration (requires an operator fix), transient cluster
//! unavailability (retried by re-arming the trigger), authorization denials
//! (tolerated during teardown) and everything else, which is fatal for the
//! current trigger.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for storage operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither transient nor an authorization failure
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Data is present but invalid
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field (e.g., "cloud-sa")
        field: Option<String>,
    },

    /// No usable cloud credentials; the message is user-facing
    #[error("{message}")]
    Credentials {
        /// Status message shown to the operator
        message: String,
    },

    /// The cluster API could not be reached or answered with a server-side failure
    #[error("cluster API unavailable [{context}]: {message}")]
    ClientUnavailable {
        /// Operation that failed (e.g., "apply", "delete")
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The cluster API denied the request
    #[error("unauthorized [{context}]: {message}")]
    Unauthorized {
        /// Operation that failed
        context: String,
        /// Description of what failed
        message: String,
    },

    /// The requested object does not exist
    #[error("not found: {kind}/{name}")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Filesystem error
    #[error("io error at {path}: {source}")]
    Io {
        /// Path involved in the failed operation
        path: String,
        /// The underlying io error
        source: std::io::Error,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "metadata", "trust")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a user-facing credentials error
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials {
            message: msg.into(),
        }
    }

    /// Create a client-unavailable error for the given operation
    pub fn unavailable(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClientUnavailable {
            context: context.into(),
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

    /// Create an io error for the given path
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
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

    /// Classify a kube-rs error raised while performing `context`.
    ///
    /// - 401/403 become [`Error::Unauthorized`]
    /// - 404 becomes [`Error::NotFound`]
    /// - 429, 5xx and transport failures become [`Error::ClientUnavailable`]
    /// - everything else stays a plain [`Error::Kube`]
    pub fn from_kube(context: &str, kind: &str, name: &str, source: kube::Error) -> Self {
        match &source {
            kube::Error::Api(ae) if ae.code == 401 || ae.code == 403 => Self::Unauthorized {
                context: context.to_string(),
                message: format!("{}/{}: {}", kind, name, ae.message),
            },
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 429 || ae.code >= 500 => Self::ClientUnavailable {
                context: context.to_string(),
                message: format!("{}/{}: {}", kind, name, ae.message),
            },
            kube::Error::Api(_) | kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => {
                Self::Kube { source }
            }
            _ => Self::ClientUnavailable {
                context: context.to_string(),
                message: format!("{}/{}: {}", kind, name, source),
            },
        }
    }

    /// Whether the failure is expected to clear without operator action
    ///
    /// Only cluster unavailability is transient; the trigger that hit it is
    /// re-armed instead of surfacing a blocked status.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ClientUnavailable { .. })
    }

    /// Whether the cluster API denied the request
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }

    /// Whether the object did not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::ClientUnavailable { context, .. } => Some(context),
            Error::Unauthorized { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
