//! k8sSearch backend: serve an existing Secret selected by labels

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, warn};

use super::{secret_entry, SecretBackend, SecretContent};
use crate::crd::{SearchNamespace, SecretClass, SecretClassBackend};
use crate::kube_client::{label_selector, KubeClient};
use crate::pod_info::PodInfo;
use crate::volume::{Scope, CLASS_KEY, EXPIRES_AT_ANNOTATION};
use crate::{Error, Result};

/// Label matched against the pod name for the `pod` scope
pub const POD_LABEL: &str = "secret-csi.dev/pod";
/// Label matched against the node name for the `node` scope
pub const NODE_LABEL: &str = "secret-csi.dev/node";
/// Label matched against the service name for the `service=<name>` scope
pub const SERVICE_LABEL: &str = "secret-csi.dev/service";

/// Looks up exactly one labelled Secret and copies its entries
pub struct K8sSearchBackend {
    kube: Arc<dyn KubeClient>,
}

impl K8sSearchBackend {
    /// Create a backend reading Secrets through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }
}

/// Labels a candidate Secret must carry for this pod and class
fn search_labels(class: &str, pod: &PodInfo) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::from([(CLASS_KEY.to_string(), class.to_string())]);
    let mut service_seen = false;

    for scope in &pod.selector().scopes {
        match scope {
            Scope::Pod => {
                labels.insert(POD_LABEL.to_string(), pod.name());
            }
            Scope::Node => {
                let node = pod.node_name().ok_or_else(|| {
                    Error::backend(class, "node scope requested but pod is not scheduled")
                })?;
                labels.insert(NODE_LABEL.to_string(), node);
            }
            Scope::Service(name) => {
                if service_seen {
                    return Err(Error::backend(
                        class,
                        "k8sSearch supports at most one service scope",
                    ));
                }
                service_seen = true;
                labels.insert(SERVICE_LABEL.to_string(), name.clone());
            }
        }
    }
    Ok(labels)
}

fn secret_content(secret: &Secret) -> SecretContent {
    let mut keys: Vec<&String> = secret.data.iter().flat_map(|d| d.keys()).collect();
    keys.extend(secret.string_data.iter().flat_map(|d| d.keys()));

    let mut files = BTreeMap::new();
    for key in keys {
        if files.contains_key(key) {
            continue;
        }
        if let Some(value) = secret_entry(secret, key) {
            files.insert(key.clone(), value);
        }
    }

    let expires_at = match secret.annotations().get(EXPIRES_AT_ANNOTATION) {
        None => None,
        Some(raw) => match raw.parse::<i64>() {
            Ok(t) => Some(t),
            Err(_) => {
                warn!(
                    secret = %secret.name_any(),
                    value = %raw,
                    "ignoring non-numeric expiration annotation"
                );
                None
            }
        },
    };

    SecretContent { files, expires_at }
}

#[async_trait]
impl SecretBackend for K8sSearchBackend {
    async fn fetch(&self, pod: &PodInfo, class: &SecretClass) -> Result<SecretContent> {
        let class_name = class.name_any();
        let SecretClassBackend::K8sSearch(spec) = &class.spec.backend else {
            return Err(Error::backend(&class_name, "class is not a k8sSearch class"));
        };

        let namespace = match &spec.search_namespace {
            SearchNamespace::Pod {} => pod.namespace(),
            SearchNamespace::Name(ns) => ns.clone(),
        };
        let labels = search_labels(&class_name, pod)?;

        let mut secrets = self.kube.list_secrets(&namespace, &labels).await?;
        let secret = match secrets.len() {
            1 => secrets.remove(0),
            0 => {
                return Err(Error::backend(
                    &class_name,
                    format!(
                        "no Secret in namespace {} matches {}",
                        namespace,
                        label_selector(&labels)
                    ),
                ))
            }
            n => {
                return Err(Error::backend(
                    &class_name,
                    format!(
                        "{} Secrets in namespace {} match {}, expected exactly one",
                        n,
                        namespace,
                        label_selector(&labels)
                    ),
                ))
            }
        };

        debug!(
            class = %class_name,
            secret = %secret.name_any(),
            namespace = %namespace,
            "matched secret"
        );
        Ok(secret_content(&secret))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::*;
    use crate::kube_client::MockKubeClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn secret(name: &str, expires_at: Option<&str>) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                annotations: expires_at.map(|v| {
                    BTreeMap::from([(EXPIRES_AT_ANNOTATION.to_string(), v.to_string())])
                }),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                ("username".to_string(), ByteString(b"admin".to_vec())),
                ("password".to_string(), ByteString(b"hunter2".to_vec())),
            ])),
            ..Default::default()
        }
    }

    fn backend_returning(secrets: Vec<Secret>, expect_ns: &'static str) -> K8sSearchBackend {
        let mut mock = MockKubeClient::new();
        mock.expect_list_secrets()
            .times(1)
            .returning(move |ns, _| {
                assert_eq!(ns, expect_ns);
                Ok(secrets.clone())
            });
        K8sSearchBackend::new(Arc::new(mock))
    }

    #[test]
    fn labels_follow_scopes() {
        let pod = pod_info(
            "creds",
            vec![Scope::Pod, Scope::Node, Scope::Service("web".to_string())],
        );
        let labels = search_labels("creds", &pod).unwrap();
        assert_eq!(
            label_selector(&labels),
            "secret-csi.dev/class=creds,secret-csi.dev/node=worker-3,\
             secret-csi.dev/pod=web-0,secret-csi.dev/service=web"
        );
    }

    #[test]
    fn two_service_scopes_cannot_be_searched() {
        let pod = pod_info(
            "creds",
            vec![
                Scope::Service("a".to_string()),
                Scope::Service("b".to_string()),
            ],
        );
        assert!(search_labels("creds", &pod).is_err());
    }

    #[tokio::test]
    async fn single_match_yields_files_and_expiry() {
        let backend = backend_returning(vec![secret("db", Some("1700000000"))], "shop");
        let content = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Pod {}),
            )
            .await
            .unwrap();

        assert_eq!(content.files["username"], b"admin");
        assert_eq!(content.files["password"], b"hunter2");
        assert_eq!(content.expires_at, Some(1_700_000_000));
    }

    #[tokio::test]
    async fn binary_entries_are_copied_verbatim() {
        let mut binary = secret("keystore", None);
        let raw = vec![0x30, 0x82, 0xff, 0x00, 0xfe];
        binary
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert("store.p12".to_string(), ByteString(raw.clone()));
        let backend = backend_returning(vec![binary], "shop");
        let content = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Pod {}),
            )
            .await
            .unwrap();
        assert_eq!(content.files["store.p12"], raw);
    }

    #[tokio::test]
    async fn fixed_namespace_is_searched() {
        let backend = backend_returning(vec![secret("db", None)], "vault");
        let content = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Name("vault".to_string())),
            )
            .await
            .unwrap();
        assert_eq!(content.expires_at, None);
    }

    #[tokio::test]
    async fn non_numeric_secret_expiry_is_ignored() {
        let backend = backend_returning(vec![secret("db", Some("tomorrow"))], "shop");
        let content = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Pod {}),
            )
            .await
            .unwrap();
        assert_eq!(content.expires_at, None);
    }

    #[tokio::test]
    async fn zero_matches_is_backend_error() {
        let backend = backend_returning(vec![], "shop");
        let err = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Pod {}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.to_string().contains("no Secret"));
    }

    #[tokio::test]
    async fn ambiguous_matches_is_backend_error() {
        let backend = backend_returning(vec![secret("a", None), secret("b", None)], "shop");
        let err = backend
            .fetch(
                &pod_info("creds", vec![]),
                &search_class("creds", SearchNamespace::Pod {}),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[tokio::test]
    async fn wrong_class_kind_is_rejected() {
        let mut mock = MockKubeClient::new();
        mock.expect_list_secrets().never();
        let backend = K8sSearchBackend::new(Arc::new(mock));
        let err = backend
            .fetch(&pod_info("tls", vec![]), &tls_class("tls", true, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a k8sSearch class"));
    }
}
