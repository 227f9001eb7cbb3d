//! CSI Node service: the volume publish/unpublish lifecycle
//!
//! Publish runs a fixed pipeline and stops at the first error:
//! validate the request, parse the volume context, resolve the SecretClass
//! and the Pod, ask the backend for content, mount a tmpfs, write the files,
//! then fold the content's expiry into the Pod annotation. Nothing touches
//! the filesystem until the backend has produced content, so lookup and
//! backend failures leave no trace.
//!
//! Unpublish is two-phase: an advisory unmount and an authoritative
//! recursive removal of the target path.
//!
//! Mount syscalls and file writes run on the blocking pool. A deadline that
//! fires while such a step is running stops the pipeline but not the step.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tonic::{Code, Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use super::request_deadline;
use crate::backend::SecretBackend;
use crate::config::NodeConfig;
use crate::expiration::ExpirationReconciler;
use crate::kube_client::KubeClient;
use crate::mount::{MountManager, Mounter};
use crate::pod_info::PodInfo;
use crate::proto::node_server::Node;
use crate::proto::volume_capability::access_mode::Mode;
use crate::proto::volume_capability::AccessType;
use crate::proto::{
    node_service_capability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
    NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
    NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest,
    NodeUnpublishVolumeResponse, NodeUnstageVolumeRequest, NodeUnstageVolumeResponse,
    VolumeCapability,
};
use crate::volume::VolumeSelector;
use crate::writer::write_files;
use crate::Error;

/// Check that a capability asks for a single-writer filesystem mount
pub fn validate_capability(capability: Option<&VolumeCapability>) -> Result<(), Error> {
    let capability = capability
        .ok_or_else(|| Error::invalid_argument("Volume capability missing in request"))?;

    match capability.access_type {
        Some(AccessType::Mount(_)) => {}
        Some(AccessType::Block(_)) => {
            return Err(Error::invalid_argument("block volumes are not supported"))
        }
        None => return Err(Error::invalid_argument("Volume access type missing in request")),
    }

    if let Some(access_mode) = &capability.access_mode {
        match Mode::try_from(access_mode.mode) {
            Ok(Mode::MultiNodeMultiWriter) | Ok(Mode::SingleNodeMultiWriter) => {
                return Err(Error::invalid_argument(
                    "multi-writer access modes are not supported",
                ))
            }
            Ok(_) => {}
            Err(_) => {
                return Err(Error::invalid_argument(format!(
                    "unknown access mode {}",
                    access_mode.mode
                )))
            }
        }
    }
    Ok(())
}

fn validate_publish(request: &NodePublishVolumeRequest) -> Result<(), Error> {
    if request.volume_id.is_empty() {
        return Err(Error::invalid_argument("Volume ID missing in request"));
    }
    if request.target_path.is_empty() {
        return Err(Error::invalid_argument("Target path missing in request"));
    }
    if !Path::new(&request.target_path).is_absolute() {
        return Err(Error::invalid_argument(format!(
            "Target path {} is not absolute",
            request.target_path
        )));
    }
    validate_capability(request.volume_capability.as_ref())?;
    if request.volume_context.is_empty() {
        return Err(Error::invalid_argument("Volume context missing in request"));
    }
    Ok(())
}

/// Run mount or filesystem work on the blocking pool
async fn run_blocking<T, F>(operation: &'static str, work: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::internal_with_context(operation, e.to_string()))?
}

/// Logs the target path if a publish stops between mount and completion
struct MountedTarget<'a> {
    target: &'a Path,
    done: bool,
}

impl<'a> MountedTarget<'a> {
    fn new(target: &'a Path) -> Self {
        Self {
            target,
            done: false,
        }
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for MountedTarget<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!(
                target = %self.target.display(),
                "publish stopped after mount, target left for unpublish"
            );
        }
    }
}

/// CSI Node service
pub struct NodeService {
    config: NodeConfig,
    kube: Arc<dyn KubeClient>,
    backend: Arc<dyn SecretBackend>,
    mounts: MountManager,
    expiration: ExpirationReconciler,
}

impl NodeService {
    /// Create the service
    pub fn new(
        config: NodeConfig,
        kube: Arc<dyn KubeClient>,
        backend: Arc<dyn SecretBackend>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        Self {
            config,
            expiration: ExpirationReconciler::new(kube.clone()),
            kube,
            backend,
            mounts: MountManager::new(mounter),
        }
    }

    async fn publish(&self, request: &NodePublishVolumeRequest) -> Result<(), Error> {
        validate_publish(request)?;
        let target = Path::new(&request.target_path);

        let selector = VolumeSelector::from_context(&request.volume_context)?;
        let class = self.kube.get_secret_class(&selector.class).await?;
        let pod = self
            .kube
            .get_pod(&selector.pod, &selector.pod_namespace)
            .await?;
        let original = pod.clone();

        let class_name = selector.class.clone();
        let pod_info = PodInfo::new(pod, selector);
        let content = self
            .backend
            .fetch(&pod_info, &class)
            .await
            .map_err(|e| match e.code() {
                Code::Internal => e,
                _ => Error::backend(&class_name, e.to_string()),
            })?;
        debug!(
            class = %class_name,
            files = content.files.len(),
            expires_at = ?content.expires_at,
            "secret content fetched"
        );

        let mounts = self.mounts.clone();
        let owned = target.to_path_buf();
        run_blocking("mount", move || mounts.mount(&owned)).await?;
        let mounted = MountedTarget::new(target);

        let expires_at = content.expires_at;
        let owned = target.to_path_buf();
        let files = content.files;
        run_blocking("write", move || write_files(&owned, &files)).await?;
        self.expiration.reconcile(&original, expires_at).await?;

        mounted.complete();
        Ok(())
    }

    async fn unpublish(&self, request: &NodeUnpublishVolumeRequest) -> Result<(), Error> {
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("Volume ID missing in request"));
        }
        if request.target_path.is_empty() {
            return Err(Error::invalid_argument("Target path missing in request"));
        }
        let target = PathBuf::from(&request.target_path);
        if !target.is_absolute() {
            return Err(Error::invalid_argument(format!(
                "Target path {} is not absolute",
                request.target_path
            )));
        }
        let mounts = self.mounts.clone();
        run_blocking("unpublish", move || mounts.teardown(&target)).await
    }
}

fn status(method: &str, err: Error) -> Status {
    match err.code() {
        Code::InvalidArgument | Code::NotFound => {
            debug!(method, error = %err, "request rejected")
        }
        _ => warn!(method, error = %err, "request failed"),
    }
    err.into()
}

#[tonic::async_trait]
impl Node for NodeService {
    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("Volume ID missing in request").into());
        }
        if request.staging_target_path.is_empty() {
            return Err(Error::invalid_argument("Staging target path missing in request").into());
        }
        validate_capability(request.volume_capability.as_ref())?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    #[instrument(skip_all, fields(volume_id = %request.get_ref().volume_id))]
    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let request = request.into_inner();
        if request.volume_id.is_empty() {
            return Err(Error::invalid_argument("Volume ID missing in request").into());
        }
        if request.staging_target_path.is_empty() {
            return Err(Error::invalid_argument("Staging target path missing in request").into());
        }
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    #[instrument(
        skip_all,
        fields(
            volume_id = %request.get_ref().volume_id,
            target = %request.get_ref().target_path,
        )
    )]
    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let deadline = request_deadline(request.metadata(), self.config.default_timeout);
        let request = request.into_inner();

        match tokio::time::timeout(deadline, self.publish(&request)).await {
            Ok(Ok(())) => {
                info!("volume published");
                Ok(Response::new(NodePublishVolumeResponse {}))
            }
            Ok(Err(e)) => Err(status("NodePublishVolume", e)),
            Err(_) => Err(status(
                "NodePublishVolume",
                Error::deadline_exceeded("NodePublishVolume"),
            )),
        }
    }

    #[instrument(
        skip_all,
        fields(
            volume_id = %request.get_ref().volume_id,
            target = %request.get_ref().target_path,
        )
    )]
    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let request = request.into_inner();
        self.unpublish(&request)
            .await
            .map_err(|e| status("NodeUnpublishVolume", e))?;
        info!("volume unpublished");
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        Err(Error::unimplemented("NodeGetVolumeStats").into())
    }

    async fn node_expand_volume(
        &self,
        _request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        Err(Error::unimplemented("NodeExpandVolume").into())
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let rpc = |kind: node_service_capability::rpc::Type| NodeServiceCapability {
            r#type: Some(node_service_capability::Type::Rpc(
                node_service_capability::Rpc { r#type: kind as i32 },
            )),
        };

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![rpc(node_service_capability::rpc::Type::StageUnstageVolume)],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}
