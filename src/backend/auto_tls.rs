//! autoTls backend: issue a workload certificate signed by a cluster CA

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::{debug, info};

use super::{secret_entry, SecretBackend, SecretContent};
use crate::crd::{AutoTlsBackendSpec, SecretClass, SecretClassBackend};
use crate::error::is_conflict;
use crate::kube_client::KubeClient;
use crate::pki::{CertificateAuthority, LeafRequest};
use crate::pod_info::PodInfo;
use crate::volume::SecretFormat;
use crate::{Error, Result};

/// CA certificate entry in the CA Secret and in the volume
pub const CA_CERT_FILE: &str = "ca.crt";
/// CA private key entry in the CA Secret
pub const CA_KEY_FILE: &str = "ca.key";
/// Leaf certificate file in the volume
pub const TLS_CERT_FILE: &str = "tls.crt";
/// Leaf private key file in the volume
pub const TLS_KEY_FILE: &str = "tls.key";
/// PKCS#12 bundle of leaf, key and CA for the `tls-pkcs12` format
pub const KEYSTORE_FILE: &str = "keystore.p12";

/// Issues short-lived certificates for workloads
pub struct AutoTlsBackend {
    kube: Arc<dyn KubeClient>,
}

impl AutoTlsBackend {
    /// Create a backend reading and storing the CA through `kube`
    pub fn new(kube: Arc<dyn KubeClient>) -> Self {
        Self { kube }
    }

    fn parse_ca(class: &str, secret: &Secret) -> Result<CertificateAuthority> {
        let entry = |key: &str| -> Result<String> {
            let bytes = secret_entry(secret, key).ok_or_else(|| {
                Error::backend(
                    class,
                    format!("CA Secret {} has no {}", secret.name_any(), key),
                )
            })?;
            String::from_utf8(bytes).map_err(|_| {
                Error::backend(
                    class,
                    format!("CA Secret {} key {} is not UTF-8", secret.name_any(), key),
                )
            })
        };
        let cert = entry(CA_CERT_FILE)?;
        let key = entry(CA_KEY_FILE)?;
        CertificateAuthority::from_pem(&cert, &key).map_err(|e| Error::backend(class, e.to_string()))
    }

    /// Load the CA, generating and storing one if allowed
    async fn load_ca(
        &self,
        class: &str,
        spec: &AutoTlsBackendSpec,
    ) -> Result<CertificateAuthority> {
        let secret_ref = &spec.ca.secret;
        if let Some(secret) = self
            .kube
            .get_secret(&secret_ref.name, &secret_ref.namespace)
            .await?
        {
            return Self::parse_ca(class, &secret);
        }

        if !spec.ca.auto_generate {
            return Err(Error::backend(
                class,
                format!(
                    "CA Secret {} does not exist and autoGenerate is off",
                    secret_ref.key()
                ),
            ));
        }

        let ca = CertificateAuthority::generate(&format!("secret-csi {} CA", class))
            .map_err(|e| Error::backend(class, e.to_string()))?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_ref.name.clone()),
                namespace: Some(secret_ref.namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    CA_CERT_FILE.to_string(),
                    ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
                ),
                (
                    CA_KEY_FILE.to_string(),
                    ByteString(ca.ca_key_pem().as_bytes().to_vec()),
                ),
            ])),
            ..Default::default()
        };

        match self.kube.create_secret(&secret).await {
            Ok(()) => {
                info!(class = %class, secret = %secret_ref.key(), "generated CA");
                Ok(ca)
            }
            Err(Error::Kube { source }) if is_conflict(&source) => {
                debug!(secret = %secret_ref.key(), "CA created concurrently, re-reading");
                let secret = self
                    .kube
                    .get_secret(&secret_ref.name, &secret_ref.namespace)
                    .await?
                    .ok_or_else(|| {
                        Error::backend(class, format!("CA Secret {} vanished", secret_ref.key()))
                    })?;
                Self::parse_ca(class, &secret)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl SecretBackend for AutoTlsBackend {
    async fn fetch(&self, pod: &PodInfo, class: &SecretClass) -> Result<SecretContent> {
        let class_name = class.name_any();
        let SecretClassBackend::AutoTls(spec) = &class.spec.backend else {
            return Err(Error::backend(&class_name, "class is not an autoTls class"));
        };

        let max = spec
            .max_lifetime()
            .map_err(|e| Error::backend(&class_name, e.to_string()))?;
        let lifetime = pod
            .selector()
            .cert_lifetime
            .map_or(max, |requested| requested.min(max));

        let ca = self.load_ca(&class_name, spec).await?;

        let addresses = pod.scope_addresses();
        let common_name = addresses
            .dns_names
            .first()
            .cloned()
            .unwrap_or_else(|| pod.name());
        let issued = ca
            .issue(&LeafRequest {
                common_name,
                dns_names: addresses.dns_names,
                ips: addresses.ips,
                lifetime,
            })
            .map_err(|e| Error::backend(&class_name, e.to_string()))?;

        debug!(
            class = %class_name,
            pod = %pod.selector().pod_key(),
            expires_at = issued.not_after,
            "issued certificate"
        );

        let ca_cert = ca.ca_cert_pem().as_bytes().to_vec();
        let files = match &pod.selector().format {
            SecretFormat::TlsPem => BTreeMap::from([
                (TLS_CERT_FILE.to_string(), issued.cert_pem.into_bytes()),
                (TLS_KEY_FILE.to_string(), issued.key_pem.into_bytes()),
                (CA_CERT_FILE.to_string(), ca_cert),
            ]),
            SecretFormat::TlsPkcs12 { password } => {
                let keystore = issued
                    .to_pkcs12(ca.ca_cert_pem(), password)
                    .map_err(|e| Error::backend(&class_name, e.to_string()))?;
                BTreeMap::from([
                    (KEYSTORE_FILE.to_string(), keystore),
                    (CA_CERT_FILE.to_string(), ca_cert),
                ])
            }
        };

        Ok(SecretContent {
            files,
            expires_at: Some(issued.not_after),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::*;
    use crate::kube_client::MockKubeClient;
    use crate::volume::Scope;
    use std::sync::Mutex;
    use std::time::Duration;

    fn stored(ca: &CertificateAuthority) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("secret-csi-ca".to_string()),
                namespace: Some("secret-csi".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    CA_CERT_FILE.to_string(),
                    ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
                ),
                (
                    CA_KEY_FILE.to_string(),
                    ByteString(ca.ca_key_pem().as_bytes().to_vec()),
                ),
            ])),
            ..Default::default()
        }
    }

    fn now() -> i64 {
        time::OffsetDateTime::now_utc().unix_timestamp()
    }

    fn conflict() -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: "already exists".to_string(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            }),
        }
    }

    #[tokio::test]
    async fn existing_ca_signs_certificate() {
        let ca = CertificateAuthority::generate("test CA").unwrap();
        let secret = stored(&ca);
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        mock.expect_create_secret().never();
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let content = backend
            .fetch(
                &pod_info("tls", vec![Scope::Service("web".to_string())]),
                &tls_class("tls", false, None),
            )
            .await
            .unwrap();

        assert_eq!(
            content.files.keys().cloned().collect::<Vec<_>>(),
            vec!["ca.crt", "tls.crt", "tls.key"]
        );
        assert_eq!(content.files["ca.crt"], ca.ca_cert_pem().as_bytes());
        let expires = content.expires_at.expect("expiry");
        let day = 24 * 60 * 60;
        assert!(expires > now() + day - 60 && expires <= now() + day);
    }

    #[tokio::test]
    async fn pkcs12_format_writes_keystore_instead_of_pem_pair() {
        let ca = CertificateAuthority::generate("test CA").unwrap();
        let secret = stored(&ca);
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let pod = pod_info("tls", vec![Scope::Pod]);
        let mut selector = pod.selector().clone();
        selector.format = SecretFormat::TlsPkcs12 {
            password: "changeit".to_string(),
        };
        let pod = PodInfo::new(pod.pod().clone(), selector);

        let content = backend
            .fetch(&pod, &tls_class("tls", false, None))
            .await
            .unwrap();

        assert_eq!(
            content.files.keys().cloned().collect::<Vec<_>>(),
            vec!["ca.crt", "keystore.p12"]
        );
        let pfx = p12::PFX::parse(&content.files[KEYSTORE_FILE]).unwrap();
        assert!(pfx.verify_mac("changeit"));
        assert_eq!(pfx.key_bags("changeit").unwrap().len(), 1);
        assert!(content.expires_at.is_some());
    }

    #[tokio::test]
    async fn requested_lifetime_is_capped_by_class() {
        let ca = CertificateAuthority::generate("test CA").unwrap();
        let secret = stored(&ca);
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret()
            .returning(move |_, _| Ok(Some(secret.clone())));
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let mut pod = pod_info("tls", vec![Scope::Pod]);
        let mut selector = pod.selector().clone();
        selector.cert_lifetime = Some(Duration::from_secs(48 * 3600));
        pod = PodInfo::new(pod.pod().clone(), selector);

        let content = backend
            .fetch(&pod, &tls_class("tls", false, Some("1h")))
            .await
            .unwrap();
        let expires = content.expires_at.expect("expiry");
        assert!(expires <= now() + 3600);
    }

    #[tokio::test]
    async fn missing_ca_without_autogenerate_fails() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().returning(|_, _| Ok(None));
        mock.expect_create_secret().never();
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let err = backend
            .fetch(&pod_info("tls", vec![]), &tls_class("tls", false, None))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
        assert!(err.to_string().contains("autoGenerate"));
    }

    #[tokio::test]
    async fn missing_ca_is_generated_and_stored() {
        let created = Arc::new(Mutex::new(None::<Secret>));
        let sink = created.clone();
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().times(1).returning(|_, _| Ok(None));
        mock.expect_create_secret().times(1).returning(move |s| {
            *sink.lock().unwrap() = Some(s.clone());
            Ok(())
        });
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let content = backend
            .fetch(&pod_info("tls", vec![]), &tls_class("tls", true, None))
            .await
            .unwrap();

        let secret = created.lock().unwrap().clone().expect("CA stored");
        assert_eq!(secret.namespace().as_deref(), Some("secret-csi"));
        let stored_ca = secret_entry(&secret, CA_CERT_FILE).unwrap();
        assert_eq!(content.files["ca.crt"], stored_ca);
    }

    #[tokio::test]
    async fn concurrent_ca_creation_uses_winner() {
        let winner = CertificateAuthority::generate("winner").unwrap();
        let winner_secret = stored(&winner);
        let mut calls = 0;
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().times(2).returning(move |_, _| {
            calls += 1;
            if calls == 1 {
                Ok(None)
            } else {
                Ok(Some(winner_secret.clone()))
            }
        });
        mock.expect_create_secret()
            .times(1)
            .returning(|_| Err(conflict()));
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let content = backend
            .fetch(&pod_info("tls", vec![]), &tls_class("tls", true, None))
            .await
            .unwrap();
        assert_eq!(content.files["ca.crt"], winner.ca_cert_pem().as_bytes());
    }

    #[tokio::test]
    async fn corrupt_ca_secret_is_backend_error() {
        let mut mock = MockKubeClient::new();
        mock.expect_get_secret().returning(|_, _| {
            Ok(Some(Secret {
                data: Some(BTreeMap::from([(
                    CA_CERT_FILE.to_string(),
                    ByteString(b"junk".to_vec()),
                )])),
                ..Default::default()
            }))
        });
        let backend = AutoTlsBackend::new(Arc::new(mock));

        let err = backend
            .fetch(&pod_info("tls", vec![]), &tls_class("tls", true, None))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(CA_KEY_FILE));
    }
}
