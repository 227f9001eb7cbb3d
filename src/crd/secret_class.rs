//! SecretClass CRD
//!
//! A SecretClass names a backend and its parameters. Volumes select a class
//! through the `secret-csi.dev/class` volume attribute; the node plugin looks
//! the class up (cluster-scoped, no namespace) on every publish.

use std::time::Duration;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{parse_duration, SecretRef};

/// Default lifetime of certificates issued by the autoTls backend
pub const DEFAULT_CERT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// SecretClass selects how secret material for a volume is produced.
///
/// Example:
/// ```yaml
/// apiVersion: secret-csi.dev/v1alpha1
/// kind: SecretClass
/// metadata:
///   name: tls
/// spec:
///   backend:
///     autoTls:
///       ca:
///         secret:
///           name: secret-csi-ca
///           namespace: secret-csi
///         autoGenerate: true
///       maxCertificateLifetime: 360h
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "secret-csi.dev",
    version = "v1alpha1",
    kind = "SecretClass",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SecretClassSpec {
    /// Backend producing the secret material
    pub backend: SecretClassBackend,
}

/// Exactly one backend per class
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SecretClassBackend {
    /// Look up an existing Secret by labels
    K8sSearch(K8sSearchBackendSpec),
    /// Issue a TLS certificate signed by a cluster CA
    AutoTls(AutoTlsBackendSpec),
}

impl SecretClassBackend {
    /// Short name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            SecretClassBackend::K8sSearch(_) => "k8sSearch",
            SecretClassBackend::AutoTls(_) => "autoTls",
        }
    }
}

/// Parameters for the k8sSearch backend
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct K8sSearchBackendSpec {
    /// Namespace to search for candidate Secrets
    pub search_namespace: SearchNamespace,
}

/// Where the k8sSearch backend looks for Secrets
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum SearchNamespace {
    /// The namespace of the Pod mounting the volume
    Pod {},
    /// A fixed namespace
    Name(String),
}

/// Parameters for the autoTls backend
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoTlsBackendSpec {
    /// Certificate authority used to sign workload certificates
    pub ca: AutoTlsCaSpec,

    /// Upper bound on issued certificate lifetime (e.g. "24h", "7d")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_certificate_lifetime: Option<String>,
}

/// Certificate authority location for autoTls
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoTlsCaSpec {
    /// Secret holding `ca.crt` and `ca.key`
    pub secret: SecretRef,

    /// Create a self-signed CA in the Secret if it does not exist
    #[serde(default)]
    pub auto_generate: bool,
}

impl AutoTlsBackendSpec {
    /// Maximum lifetime for issued certificates, defaulting to 24h
    pub fn max_lifetime(&self) -> Result<Duration, crate::Error> {
        match &self.max_certificate_lifetime {
            None => Ok(DEFAULT_CERT_LIFETIME),
            Some(raw) => parse_duration(raw).ok_or_else(|| {
                crate::Error::invalid_argument(format!(
                    "invalid maxCertificateLifetime '{}'",
                    raw
                ))
            }),
        }
    }
}

impl SecretClassSpec {
    /// Validate the class configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match &self.backend {
            SecretClassBackend::K8sSearch(spec) => {
                if let SearchNamespace::Name(ns) = &spec.search_namespace {
                    if ns.is_empty() {
                        return Err(crate::Error::invalid_argument(
                            "k8sSearch searchNamespace.name must not be empty",
                        ));
                    }
                }
            }
            SecretClassBackend::AutoTls(spec) => {
                if spec.ca.secret.name.is_empty() || spec.ca.secret.namespace.is_empty() {
                    return Err(crate::Error::invalid_argument(
                        "autoTls ca.secret requires name and namespace",
                    ));
                }
                spec.max_lifetime()?;
            }
        }
        Ok(())
    }
}
