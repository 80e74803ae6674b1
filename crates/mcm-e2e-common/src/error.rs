//! Error types shared by the harness crates
//!
//! Errors carry the resource or file they relate to so a failed suite run
//! can be diagnosed from the summary alone.

use std::path::PathBuf;

use thiserror::Error;

/// Error type for Kubernetes-facing harness operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A manifest could not be read, parsed or applied
    #[error("manifest error [{}]: {message}", path.display())]
    Manifest {
        /// File the manifest was read from
        path: PathBuf,
        /// Description of what failed
        message: String,
    },

    /// Optimistic-concurrency conflicts did not resolve within the retry budget
    #[error("update of {resource} still conflicting after {attempts} attempts")]
    Conflict {
        /// Resource that was being updated (kind/name)
        resource: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// YAML parsing error
    #[error("yaml error: {0}")]
    Yaml(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Operation where the error occurred (e.g., "create_client", "poll_until")
        context: String,
    },
}

impl Error {
    /// Create a manifest error for the given file
    pub fn manifest(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with operation context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn api_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// Whether this is an optimistic-concurrency conflict (HTTP 409 on update)
    pub fn is_conflict(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Whether the referenced object does not exist (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }
}
