//! MultiCRI - Kubernetes Container Runtime Interface binary.
//!
//! Serves CRI RuntimeService and ImageService over a Unix domain socket,
//! running pods as Slurm jobs or forwarding them to other CRI runtimes.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use multicri_cri::{CriServer, CriService, RemoteRouter, ServiceConfig};
use multicri_runtime::{AdapterKind, StreamingServer};

/// MultiCRI Runtime
#[derive(Parser, Debug)]
#[command(name = "multicri", about = "MultiCRI Runtime")]
struct Args {
    /// Execution adapter serving local pods (slurm or fake).
    #[arg(long, default_value = "slurm")]
    adapter_name: AdapterKind,

    /// Path to the Unix domain socket for CRI communication.
    #[arg(long, default_value = "/var/run/multicri.sock")]
    socket_path: PathBuf,

    /// Address the streaming server binds to.
    #[arg(long, default_value = "0.0.0.0")]
    stream_addr: IpAddr,

    #[arg(long, default_value = "10010")]
    stream_port: u16,

    /// Directory for record caches and pulled images.
    #[arg(long, default_value = "~/.multicri/")]
    resources_cache_path: String,

    /// Persist sandbox and container records across restarts.
    #[arg(long)]
    enable_pod_persistence: bool,

    /// Remote CRI runtimes as `name:endpoint[,name:endpoint...]`.
    #[arg(long, default_value = "")]
    remote_runtime_endpoints: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Resolve cache directory (expand ~)
    let cache_path = if args.resources_cache_path.starts_with('~') {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(
            args.resources_cache_path
                .strip_prefix("~/")
                .unwrap_or(&args.resources_cache_path),
        )
    } else {
        PathBuf::from(&args.resources_cache_path)
    };

    tracing::info!(
        socket = %args.socket_path.display(),
        adapter = ?args.adapter_name,
        cache = %cache_path.display(),
        "Starting MultiCRI Runtime"
    );

    let streaming = StreamingServer::new(SocketAddr::new(args.stream_addr, args.stream_port));
    let adapter = args
        .adapter_name
        .build(streaming.handle())
        .map_err(|e| format!("Failed to initialize adapter: {}", e))?;

    let router = RemoteRouter::from_config(&args.remote_runtime_endpoints)?;
    let service = CriService::new(
        &ServiceConfig {
            cache_path,
            enable_pod_persistence: args.enable_pod_persistence,
        },
        adapter.clone(),
        router,
        streaming.handle(),
    )?;

    let stream_runtime = adapter.new_stream_runtime(service.container_store());
    tokio::spawn(async move {
        if let Err(e) = streaming.serve(stream_runtime).await {
            tracing::error!(error = %e, "Streaming server stopped");
        }
    });

    let server = CriServer::new(args.socket_path, Arc::new(service));
    server.serve().await?;

    Ok(())
}
