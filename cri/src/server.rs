//! gRPC server setup for CRI services.
//!
//! Listens on a Unix domain socket for CRI RuntimeService and ImageService RPCs.
//! Both services share one [`CriService`].

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;

use multicri_core::api::image_service_server::ImageServiceServer;
use multicri_core::api::runtime_service_server::RuntimeServiceServer;

use crate::service::CriService;

/// CRI gRPC server.
pub struct CriServer {
    /// Path to the Unix domain socket.
    socket_path: PathBuf,
    service: Arc<CriService>,
}

impl CriServer {
    pub fn new(socket_path: PathBuf, service: Arc<CriService>) -> Self {
        Self {
            socket_path,
            service,
        }
    }

    /// Start serving CRI RPCs on the Unix socket.
    pub async fn serve(&self) -> Result<(), Box<dyn std::error::Error>> {
        // Remove existing socket file if present
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let uds = UnixListener::bind(&self.socket_path)?;
        let uds_stream = UnixListenerStream::new(uds);

        tracing::info!(
            socket = %self.socket_path.display(),
            "CRI server listening"
        );

        Server::builder()
            .add_service(RuntimeServiceServer::from_arc(self.service.clone()))
            .add_service(ImageServiceServer::from_arc(self.service.clone()))
            .serve_with_incoming(uds_stream)
            .await?;

        Ok(())
    }
}
