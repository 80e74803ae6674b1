//! Common plumbing for the machine-controller-manager e2e harness:
//! errors, retry with backoff, YAML parsing and kube-rs helpers.

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the machine-controller-manager resources
pub const MACHINE_API_GROUP: &str = "machine.sapcloud.io";

/// API version of the machine-controller-manager resources
pub const MACHINE_API_VERSION: &str = "v1alpha1";

/// Namespace the test machine resources are created in
pub const DEFAULT_NAMESPACE: &str = "default";

/// Field manager used for every write made by the harness
pub const FIELD_MANAGER: &str = "mcm-e2e";
