//! Kubernetes access for the node plugin
//!
//! Everything the publish pipeline and the backends read from or write to the
//! API server goes through [`KubeClient`], so tests can run the whole pipeline
//! against a mock while production uses a shared `kube::Client`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::SecretClass;
use crate::error::is_not_found;
use crate::Error;

/// Trait abstracting the Kubernetes operations the plugin performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a cluster-scoped SecretClass by name
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    async fn get_secret_class(&self, name: &str) -> Result<SecretClass, Error>;

    /// Get a Pod by name and namespace
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, Error>;

    /// Apply a JSON merge patch to a Pod
    ///
    /// When the patch carries `metadata.resourceVersion` the API server
    /// rejects it with a conflict if the Pod changed since it was read.
    async fn patch_pod(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// List Secrets in a namespace matching all of the given labels
    async fn list_secrets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error>;

    /// Get a Secret by name and namespace, `None` if it does not exist
    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error>;

    /// Create a Secret; fails with a kube 409 if it already exists
    async fn create_secret(&self, secret: &Secret) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Render labels as a `k=v,k2=v2` selector
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_secret_class(&self, name: &str) -> Result<SecretClass, Error> {
        let api: Api<SecretClass> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(class) => Ok(class),
            Err(e) if is_not_found(&e) => Err(Error::not_found("SecretClass", name)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, name: &str, namespace: &str) -> Result<Pod, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(pod) => Ok(pod),
            Err(e) if is_not_found(&e) => {
                Err(Error::not_found("Pod", format!("{}/{}", namespace, name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_pod(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        debug!(pod = %name, namespace = %namespace, "pod patched");
        Ok(())
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    async fn get_secret(&self, name: &str, namespace: &str) -> Result<Option<Secret>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_secret(&self, secret: &Secret) -> Result<(), Error> {
        let namespace = secret
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| Error::internal_with_context("kube", "secret has no namespace"))?;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), secret).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_selector_joins_sorted_pairs() {
        let labels = BTreeMap::from([
            ("secret-csi.dev/pod".to_string(), "web-0".to_string()),
            ("secret-csi.dev/class".to_string(), "creds".to_string()),
        ]);
        assert_eq!(
            label_selector(&labels),
            "secret-csi.dev/class=creds,secret-csi.dev/pod=web-0"
        );
    }

    #[test]
    fn empty_labels_render_empty_selector() {
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }
}
