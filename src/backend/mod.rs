//! Secret backends
//!
//! A backend turns (workload identity, SecretClass) into the files that end
//! up in the volume plus an optional expiry. Backends are stateless between
//! calls and shared across concurrent publishes.

mod auto_tls;
mod k8s_search;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::crd::{SecretClass, SecretClassBackend};
use crate::kube_client::KubeClient;
use crate::pod_info::PodInfo;
use crate::{Error, Result};

pub use auto_tls::{AutoTlsBackend, CA_CERT_FILE, CA_KEY_FILE, TLS_CERT_FILE, TLS_KEY_FILE};
pub use k8s_search::{K8sSearchBackend, NODE_LABEL, POD_LABEL, SERVICE_LABEL};

/// Material produced for one volume
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretContent {
    /// File name to file body
    pub files: BTreeMap<String, Vec<u8>>,
    /// Epoch seconds after which the material is stale, if known
    pub expires_at: Option<i64>,
}

/// Produces secret material for a workload
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Fetch or generate the material for `pod` as configured by `class`
    async fn fetch(&self, pod: &PodInfo, class: &SecretClass) -> Result<SecretContent>;
}

/// Routes each SecretClass to the backend its spec names
#[derive(Clone)]
pub struct BackendRegistry {
    k8s_search: Arc<dyn SecretBackend>,
    auto_tls: Arc<dyn SecretBackend>,
}

impl BackendRegistry {
    /// Registry with the built-in backends talking to `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self::with_backends(
            Arc::new(K8sSearchBackend::new(kube.clone())),
            Arc::new(AutoTlsBackend::new(kube)),
        )
    }

    /// Registry with explicit backend implementations
    pub fn with_backends(
        k8s_search: Arc<dyn SecretBackend>,
        auto_tls: Arc<dyn SecretBackend>,
    ) -> Self {
        Self {
            k8s_search,
            auto_tls,
        }
    }

    fn backend_for(&self, class: &SecretClass) -> &Arc<dyn SecretBackend> {
        match class.spec.backend {
            SecretClassBackend::K8sSearch(_) => &self.k8s_search,
            SecretClassBackend::AutoTls(_) => &self.auto_tls,
        }
    }
}

#[async_trait]
impl SecretBackend for BackendRegistry {
    async fn fetch(&self, pod: &PodInfo, class: &SecretClass) -> Result<SecretContent> {
        let name = class.name_any();
        class
            .spec
            .validate()
            .map_err(|e| Error::backend(&name, e.to_string()))?;

        debug!(class = %name, backend = class.spec.backend.kind(), "dispatching to backend");
        self.backend_for(class).fetch(pod, class).await
    }
}

/// Read an entry from a Secret, preferring `data` over `stringData`
pub(crate) fn secret_entry(
    secret: &k8s_openapi::api::core::v1::Secret,
    key: &str,
) -> Option<Vec<u8>> {
    if let Some(bytes) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return Some(bytes.0.clone());
    }
    secret
        .string_data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|s| s.as_bytes().to_vec())
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use crate::crd::{
        AutoTlsBackendSpec, AutoTlsCaSpec, K8sSearchBackendSpec, SearchNamespace, SecretClassSpec,
        SecretRef,
    };
    use crate::volume::{Scope, VolumeSelector};
    use k8s_openapi::api::core::v1::{Pod, PodIP, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub fn search_class(name: &str, namespace: SearchNamespace) -> SecretClass {
        SecretClass::new(
            name,
            SecretClassSpec {
                backend: SecretClassBackend::K8sSearch(K8sSearchBackendSpec {
                    search_namespace: namespace,
                }),
            },
        )
    }

    pub fn tls_class(name: &str, auto_generate: bool, max: Option<&str>) -> SecretClass {
        SecretClass::new(
            name,
            SecretClassSpec {
                backend: SecretClassBackend::AutoTls(AutoTlsBackendSpec {
                    ca: AutoTlsCaSpec {
                        secret: SecretRef {
                            name: "secret-csi-ca".to_string(),
                            namespace: "secret-csi".to_string(),
                        },
                        auto_generate,
                    },
                    max_certificate_lifetime: max.map(str::to_string),
                }),
            },
        )
    }

    pub fn pod_info(class: &str, scopes: Vec<Scope>) -> PodInfo {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("web-0".to_string()),
                namespace: Some("shop".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-3".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                pod_ips: Some(vec![PodIP {
                    ip: "10.0.0.7".to_string(),
                }]),
                ..Default::default()
            }),
        };
        let selector = VolumeSelector {
            class: class.to_string(),
            pod: "web-0".to_string(),
            pod_namespace: "shop".to_string(),
            scopes,
            format: Default::default(),
            cert_lifetime: None,
        };
        PodInfo::new(pod, selector)
    }
}
