//! Error types for the harness

use std::path::PathBuf;

use crate::orphan::ResourceKind;

/// Harness Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Harness errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Common(#[from] mcm_e2e_common::Error),

    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A supervised process could not be started
    #[error("failed to start {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The supervisor was already cancelled; it cannot start new processes
    #[error("supervisor is cancelled, refusing to start {name}")]
    SupervisorCancelled { name: String },

    /// Another supervised process already writes to this log file
    #[error("log file {} is already owned by {owner}", path.display())]
    DuplicateLogPath { path: PathBuf, owner: String },

    /// A cloud provider query failed; the scan is aborted
    #[error("{kind} query failed: {message}")]
    ProviderQuery { kind: ResourceKind, message: String },

    /// An observed metric did not reach its target in time
    #[error(
        "timed out waiting for {description}: expected {expected}, last observed {}",
        .last_observed.map_or_else(|| "nothing".to_string(), |v| v.to_string())
    )]
    ConvergenceTimeout {
        description: String,
        expected: u32,
        /// `None` if every sample failed
        last_observed: Option<u32>,
    },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("assertion failed: {message}")]
    Assertion { message: String },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion {
            message: message.into(),
        }
    }

    pub fn provider_query(kind: ResourceKind, message: impl Into<String>) -> Self {
        Error::ProviderQuery {
            kind,
            message: message.into(),
        }
    }

    /// Whether the referenced Kubernetes object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Common(e) => e.is_not_found(),
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}
