//! Process configuration
//!
//! Everything is taken from flags with environment fallbacks so the DaemonSet
//! manifest can use either. [`Cli`] is the raw clap surface; [`NodeConfig`] is
//! the validated value the services are built from.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::telemetry::{LogFormat, TelemetryConfig};
use crate::Error;

/// Default CSI endpoint kubelet's registrar expects
pub const DEFAULT_ENDPOINT: &str = "unix:///csi/csi.sock";

/// Default driver name registered with kubelet
pub const DEFAULT_DRIVER_NAME: &str = "secrets.secret-csi.dev";

/// Plugin version reported over GetPluginInfo
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// secret-csi - CSI node plugin that mounts cluster-managed secrets
#[derive(Parser, Debug, Clone)]
#[command(name = "secret-csi", version, about, long_about = None)]
pub struct Cli {
    /// Print the SecretClass CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    /// CSI endpoint (`unix:///path` or `tcp://host:port`)
    #[arg(long, env = "CSI_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Node ID reported to kubelet, normally the node name
    #[arg(long, env = "NODE_NAME", required_unless_present = "crd")]
    pub node_id: Option<String>,

    /// Driver name reported to kubelet
    #[arg(long, env = "CSI_DRIVER_NAME", default_value = DEFAULT_DRIVER_NAME)]
    pub driver_name: String,

    /// Per-request timeout when the caller sends no deadline
    #[arg(long, env = "CSI_REQUEST_TIMEOUT_SECS", default_value = "60")]
    pub request_timeout_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: CliLogFormat,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

/// `--log-format` values
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CliLogFormat {
    /// One JSON object per line
    Json,
    /// Human readable
    Text,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Json => LogFormat::Json,
            CliLogFormat::Text => LogFormat::Text,
        }
    }
}

/// Where the gRPC server listens
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix domain socket path
    Unix(PathBuf),
    /// TCP address
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Parse `unix://<path>`, a bare absolute path, or `tcp://host:port`
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::internal_with_context(
                    "config",
                    format!("endpoint {:?} has an empty socket path", raw),
                ));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(raw)));
        }
        if let Some(addr) = raw.strip_prefix("tcp://") {
            return addr.parse().map(Endpoint::Tcp).map_err(|e| {
                Error::internal_with_context(
                    "config",
                    format!("invalid tcp endpoint {:?}: {}", raw, e),
                )
            });
        }
        Err(Error::internal_with_context(
            "config",
            format!("unsupported endpoint {:?}, expected unix:// or tcp://", raw),
        ))
    }
}

/// Settings shared by the Identity and Node services
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    /// Node ID returned from NodeGetInfo
    pub node_id: String,
    /// Driver name returned from GetPluginInfo
    pub driver_name: String,
    /// Version returned from GetPluginInfo
    pub version: String,
    /// Deadline applied when the request carries none
    pub default_timeout: Duration,
}

impl NodeConfig {
    /// Config with the default driver name and timeout
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            version: VERSION.to_string(),
            default_timeout: Duration::from_secs(60),
        }
    }
}

impl Cli {
    /// Validated listener endpoint
    pub fn endpoint(&self) -> Result<Endpoint, Error> {
        Endpoint::parse(&self.endpoint)
    }

    /// Validated service settings
    pub fn node_config(&self) -> Result<NodeConfig, Error> {
        let node_id = self
            .node_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::internal_with_context("config", "node id is required"))?;
        if self.driver_name.is_empty() {
            return Err(Error::internal_with_context("config", "driver name is empty"));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::internal_with_context(
                "config",
                "request timeout must be positive",
            ));
        }

        Ok(NodeConfig {
            node_id,
            driver_name: self.driver_name.clone(),
            version: VERSION.to_string(),
            default_timeout: Duration::from_secs(self.request_timeout_secs),
        })
    }

    /// Telemetry settings
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: "secret-csi".to_string(),
            otlp_endpoint: self.otlp_endpoint.clone(),
            log_format: self.log_format.into(),
        }
    }
}
