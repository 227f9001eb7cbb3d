//! secret-csi - CSI node plugin that materializes cluster-managed secrets
//!
//! Kubelet asks the plugin to publish an inline volume at a target path.
//! The plugin resolves the volume's SecretClass, asks the class's backend for
//! secret material (TLS key pairs, credentials), mounts a hardened tmpfs at the
//! target and writes the material into it. The soonest expiry across all of a
//! Pod's secret volumes is recorded on the Pod so a rotation controller can
//! restart it in time.
//!
//! # Modules
//!
//! - [`csi`] - CSI Identity and Node gRPC services
//! - [`volume`] - Volume context parsing into a typed selector
//! - [`pod_info`] - Workload identity and scope addresses
//! - [`backend`] - Secret backends (k8sSearch, autoTls)
//! - [`mount`] - tmpfs mount lifecycle
//! - [`writer`] - Writing secret files into the mount
//! - [`expiration`] - Pod expiry annotation reconciliation
//! - [`kube_client`] - Mockable Kubernetes access
//! - [`crd`] - SecretClass Custom Resource Definition
//! - [`pki`] - Certificate authority for the autoTls backend
//! - [`config`] - Command line and environment configuration
//! - [`telemetry`] - Logging and trace export
//! - [`proto`] - Generated CSI protobuf code
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod backend;
pub mod config;
pub mod crd;
pub mod csi;
pub mod error;
pub mod expiration;
pub mod kube_client;
pub mod mount;
pub mod pki;
pub mod pod_info;
pub mod proto;
pub mod telemetry;
pub mod volume;
pub mod writer;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
