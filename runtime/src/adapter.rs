//! Adapter capability contract.
//!
//! An adapter maps CRI lifecycle calls onto an execution substrate. Every
//! method receives the current metadata record and writes its results
//! (paths, state fields, sizes) directly onto it; the caller persists the
//! record afterwards. Adapters never keep records between calls.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use multicri_core::api::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, ExecSyncResponse,
    ImageFsInfoResponse, LinuxContainerResources, VersionResponse,
};
use multicri_core::error::{CriError, Result};
use multicri_core::{ContainerMetadata, ImageMetadata, SandboxMetadata, SlurmConfig};
use serde::{Deserialize, Serialize};

use crate::fake::FakeAdapter;
use crate::slurm::SlurmAdapter;
use crate::streaming::StreamingHandle;

/// Output of a one-shot command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl From<ExecOutput> for ExecSyncResponse {
    fn from(output: ExecOutput) -> Self {
        ExecSyncResponse {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        }
    }
}

/// Read access to container records for streaming sessions.
pub trait ContainerLookup: Send + Sync {
    fn lookup(&self, id: &str) -> Result<ContainerMetadata>;
}

/// Serves the data side of exec, attach and port-forward sessions.
#[async_trait]
pub trait StreamRuntime: Send + Sync {
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Current output of the container.
    async fn attach(&self, container_id: &str) -> Result<Vec<u8>>;

    async fn port_forward(&self, sandbox_id: &str, port: i32) -> Result<()>;
}

/// Local execution strategy behind the dispatcher.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn version(&self) -> VersionResponse;

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(&self, sandbox: &mut SandboxMetadata) -> Result<()>;
    async fn stop_pod_sandbox(&self, sandbox: &mut SandboxMetadata) -> Result<()>;
    async fn remove_pod_sandbox(&self, sandbox: &mut SandboxMetadata) -> Result<()>;
    async fn pod_sandbox_status(&self, sandbox: &mut SandboxMetadata) -> Result<()>;

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(&self, container: &mut ContainerMetadata) -> Result<()>;
    async fn start_container(&self, container: &mut ContainerMetadata) -> Result<()>;
    async fn stop_container(&self, container: &mut ContainerMetadata) -> Result<()>;
    async fn container_status(&self, container: &mut ContainerMetadata) -> Result<()>;
    async fn reopen_container_log(&self, container: &mut ContainerMetadata) -> Result<()>;
    async fn update_container_resources(
        &self,
        container: &mut ContainerMetadata,
        resources: Option<&LinuxContainerResources>,
    ) -> Result<()>;

    // ── Image ────────────────────────────────────────────────────────

    async fn pull_image(&self, image: &mut ImageMetadata) -> Result<()>;
    async fn list_images(&self, images: &mut Vec<ImageMetadata>) -> Result<()>;
    async fn image_status(&self, image: &mut ImageMetadata) -> Result<()>;
    async fn remove_image(&self, image: &mut ImageMetadata) -> Result<()>;
    async fn image_fs_info(&self, images: &[ImageMetadata]) -> Result<ImageFsInfoResponse>;

    // ── Streaming ────────────────────────────────────────────────────

    async fn exec_sync(
        &self,
        container: &mut ContainerMetadata,
        cmd: &[String],
        timeout_secs: i64,
    ) -> Result<ExecSyncResponse>;
    async fn exec(
        &self,
        container: &mut ContainerMetadata,
        request: &ExecRequest,
    ) -> Result<ExecResponse>;
    async fn attach(
        &self,
        container: &mut ContainerMetadata,
        request: &AttachRequest,
    ) -> Result<AttachResponse>;

    /// Runtime serving streaming sessions against the given container records.
    fn new_stream_runtime(&self, containers: Arc<dyn ContainerLookup>) -> Arc<dyn StreamRuntime>;
}

/// Adapter selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Slurm batch jobs running Singularity images, reached over SSH.
    Slurm,
    /// No-op adapter that accepts every call.
    Fake,
}

impl FromStr for AdapterKind {
    type Err = CriError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(AdapterKind::Slurm),
            "fake" => Ok(AdapterKind::Fake),
            other => Err(CriError::Config(format!("unknown adapter: {}", other))),
        }
    }
}

impl AdapterKind {
    /// Construct the adapter, reading its configuration from the environment.
    pub fn build(self, streaming: StreamingHandle) -> Result<Arc<dyn Adapter>> {
        match self {
            AdapterKind::Slurm => {
                let config = SlurmConfig::from_env();
                tracing::info!(
                    mount_path = %config.mount_path,
                    image_remote_mount = %config.image_remote_mount,
                    build_in_cluster = config.build_in_cluster,
                    "Loading Slurm adapter"
                );
                Ok(Arc::new(SlurmAdapter::new(config, streaming)?))
            }
            AdapterKind::Fake => Ok(Arc::new(FakeAdapter::new(streaming))),
        }
    }
}
