//! CSI Identity service

use tonic::{Request, Response, Status};
use tracing::debug;

use crate::config::NodeConfig;
use crate::proto::identity_server::Identity;
use crate::proto::{
    GetPluginCapabilitiesRequest, GetPluginCapabilitiesResponse, GetPluginInfoRequest,
    GetPluginInfoResponse, ProbeRequest, ProbeResponse,
};

/// Reports plugin name, version and readiness
#[derive(Clone, Debug)]
pub struct IdentityService {
    config: NodeConfig,
}

impl IdentityService {
    /// Create the service from shared node settings
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }
}

#[tonic::async_trait]
impl Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        Ok(Response::new(GetPluginInfoResponse {
            name: self.config.driver_name.clone(),
            vendor_version: self.config.version.clone(),
            manifest: Default::default(),
        }))
    }

    // Node-only plugin: no controller service, no topology
    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<ProbeRequest>,
    ) -> Result<Response<ProbeResponse>, Status> {
        debug!("probe");
        Ok(Response::new(ProbeResponse { ready: Some(true) }))
    }
}
