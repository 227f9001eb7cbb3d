//! Custom Resource Definitions for the secret CSI plugin
//!
//! The node plugin only reads these; installing them is left to the
//! deployment manifests (`secret-csi --crd` prints the YAML).

mod secret_class;
mod types;

pub use secret_class::{
    AutoTlsBackendSpec, AutoTlsCaSpec, K8sSearchBackendSpec, SearchNamespace, SecretClass,
    SecretClassBackend, SecretClassSpec, DEFAULT_CERT_LIFETIME,
};
pub use types::{parse_duration, SecretRef};
