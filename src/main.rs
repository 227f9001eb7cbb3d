//! secret-csi node plugin entry point

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use kube::{Client, CustomResourceExt};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use secret_csi::backend::BackendRegistry;
use secret_csi::config::{Cli, Endpoint};
use secret_csi::crd::SecretClass;
use secret_csi::csi::{IdentityService, NodeService};
use secret_csi::kube_client::{KubeClient, KubeClientImpl};
use secret_csi::mount::SysMounter;
use secret_csi::proto::identity_server::IdentityServer;
use secret_csi::proto::node_server::NodeServer;
use secret_csi::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's TLS stack needs a process-wide provider before the first connection
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SecretClass::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let tracer_provider = init_telemetry(cli.telemetry())?;
    let config = cli.node_config()?;
    let endpoint = cli.endpoint()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let kube: Arc<dyn KubeClient> = Arc::new(KubeClientImpl::new(client));

    let identity = IdentityService::new(config.clone());
    let node = NodeService::new(
        config.clone(),
        kube.clone(),
        Arc::new(BackendRegistry::new(kube)),
        Arc::new(SysMounter),
    );

    info!(
        node_id = %config.node_id,
        driver = %config.driver_name,
        version = %config.version,
        endpoint = ?endpoint,
        "Starting CSI node plugin"
    );

    let router = Server::builder()
        .add_service(IdentityServer::new(identity))
        .add_service(NodeServer::new(node));

    match endpoint {
        Endpoint::Unix(path) => {
            prepare_socket(&path)?;
            let listener = UnixListener::bind(&path)
                .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", path.display(), e))?;
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown_signal())
                .await?;
        }
        Endpoint::Tcp(addr) => {
            router.serve_with_shutdown(addr, shutdown_signal()).await?;
        }
    }

    if let Some(provider) = tracer_provider {
        if let Err(e) = provider.shutdown() {
            warn!(error = %e, "Failed to flush traces");
        }
    }
    info!("CSI node plugin stopped");
    Ok(())
}

/// Remove a stale socket left by a previous run and make sure the directory exists
fn prepare_socket(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => info!(socket = %path.display(), "Removed stale socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(anyhow::anyhow!("Failed to remove {}: {}", path.display(), e)),
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

async fn shutdown_signal() {
    let (mut sigterm, mut sigint) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(t), Ok(i)) => (t, i),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Failed to register signal handlers, running until killed");
            std::future::pending::<()>().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
