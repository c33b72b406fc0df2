//! Adapter that accepts every call without touching any substrate.
//!
//! Used to exercise the dispatcher end to end on a machine without a cluster.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use multicri_core::api::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, ExecSyncResponse,
    FilesystemIdentifier, FilesystemUsage, ImageFsInfoResponse, LinuxContainerResources,
    UInt64Value, VersionResponse,
};
use multicri_core::error::{CriError, Result};
use multicri_core::metadata::now_nanos;
use multicri_core::{ContainerMetadata, ContainerState, ImageMetadata, SandboxMetadata, CRI_API_VERSION};

use crate::adapter::{Adapter, ContainerLookup, ExecOutput, StreamRuntime};
use crate::streaming::{SessionKind, StreamingHandle, StreamingSession};

pub const RUNTIME_NAME: &str = "fake";

pub struct FakeAdapter {
    streaming: StreamingHandle,
    fail_start: AtomicBool,
}

impl FakeAdapter {
    pub fn new(streaming: StreamingHandle) -> Self {
        Self {
            streaming,
            fail_start: AtomicBool::new(false),
        }
    }

    /// Make subsequent container starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }
}

fn echo(cmd: &[String]) -> ExecOutput {
    ExecOutput {
        stdout: cmd.join(" ").into_bytes(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

#[async_trait]
impl Adapter for FakeAdapter {
    fn version(&self) -> VersionResponse {
        VersionResponse {
            version: crate::VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: crate::VERSION.to_string(),
            runtime_api_version: CRI_API_VERSION.to_string(),
        }
    }

    async fn run_pod_sandbox(&self, _sandbox: &mut SandboxMetadata) -> Result<()> {
        Ok(())
    }

    async fn stop_pod_sandbox(&self, _sandbox: &mut SandboxMetadata) -> Result<()> {
        Ok(())
    }

    async fn remove_pod_sandbox(&self, _sandbox: &mut SandboxMetadata) -> Result<()> {
        Ok(())
    }

    async fn pod_sandbox_status(&self, _sandbox: &mut SandboxMetadata) -> Result<()> {
        Ok(())
    }

    async fn create_container(&self, _container: &mut ContainerMetadata) -> Result<()> {
        Ok(())
    }

    async fn start_container(&self, container: &mut ContainerMetadata) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(CriError::transport("start", "start failure injected"));
        }
        container.pid = 1;
        Ok(())
    }

    async fn stop_container(&self, _container: &mut ContainerMetadata) -> Result<()> {
        Ok(())
    }

    async fn container_status(&self, _container: &mut ContainerMetadata) -> Result<()> {
        Ok(())
    }

    async fn reopen_container_log(&self, _container: &mut ContainerMetadata) -> Result<()> {
        Ok(())
    }

    async fn update_container_resources(
        &self,
        _container: &mut ContainerMetadata,
        _resources: Option<&LinuxContainerResources>,
    ) -> Result<()> {
        Ok(())
    }

    async fn pull_image(&self, image: &mut ImageMetadata) -> Result<()> {
        image.local_path = std::env::temp_dir().to_string_lossy().into_owned();
        image.size = 1;
        Ok(())
    }

    async fn list_images(&self, _images: &mut Vec<ImageMetadata>) -> Result<()> {
        Ok(())
    }

    async fn image_status(&self, _image: &mut ImageMetadata) -> Result<()> {
        Ok(())
    }

    async fn remove_image(&self, _image: &mut ImageMetadata) -> Result<()> {
        Ok(())
    }

    async fn image_fs_info(&self, images: &[ImageMetadata]) -> Result<ImageFsInfoResponse> {
        Ok(ImageFsInfoResponse {
            image_filesystems: vec![FilesystemUsage {
                timestamp: now_nanos(),
                fs_id: Some(FilesystemIdentifier {
                    mountpoint: std::env::temp_dir().to_string_lossy().into_owned(),
                }),
                used_bytes: Some(UInt64Value {
                    value: images.iter().map(|image| image.size).sum(),
                }),
                inodes_used: Some(UInt64Value {
                    value: images.len() as u64,
                }),
            }],
        })
    }

    async fn exec_sync(
        &self,
        _container: &mut ContainerMetadata,
        cmd: &[String],
        _timeout_secs: i64,
    ) -> Result<ExecSyncResponse> {
        Ok(echo(cmd).into())
    }

    async fn exec(
        &self,
        container: &mut ContainerMetadata,
        request: &ExecRequest,
    ) -> Result<ExecResponse> {
        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Exec,
                container_id: container.id.clone(),
                cmd: request.cmd.clone(),
                tty: request.tty,
                stdin: request.stdin,
                ..Default::default()
            })
            .await;
        Ok(ExecResponse { url })
    }

    async fn attach(
        &self,
        container: &mut ContainerMetadata,
        request: &AttachRequest,
    ) -> Result<AttachResponse> {
        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::Attach,
                container_id: container.id.clone(),
                tty: request.tty,
                stdin: request.stdin,
                ..Default::default()
            })
            .await;
        Ok(AttachResponse { url })
    }

    fn new_stream_runtime(&self, containers: Arc<dyn ContainerLookup>) -> Arc<dyn StreamRuntime> {
        Arc::new(FakeStreamRuntime { containers })
    }
}

struct FakeStreamRuntime {
    containers: Arc<dyn ContainerLookup>,
}

#[async_trait]
impl StreamRuntime for FakeStreamRuntime {
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let container = self.containers.lookup(container_id)?;
        if container.state != ContainerState::Running {
            return Err(CriError::Conflict(format!(
                "container {} is not running",
                container_id
            )));
        }
        Ok(echo(cmd))
    }

    async fn attach(&self, container_id: &str) -> Result<Vec<u8>> {
        self.containers.lookup(container_id)?;
        Ok(Vec::new())
    }

    async fn port_forward(&self, _sandbox_id: &str, _port: i32) -> Result<()> {
        Ok(())
    }
}
