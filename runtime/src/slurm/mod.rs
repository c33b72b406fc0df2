//! Slurm/Singularity execution adapter.
//!
//! Each container becomes one batch job on a Slurm cluster reached over SSH.
//! The job runs the container's image with `singularity exec` from a
//! per-container job directory below the configured mount folder:
//!
//! ```text
//! $HOME/<mount_path>[/<volume>]/<sandbox id>/<container id>/
//!     run.sh  prerun.sh  batch.sh  image.sh  stdout.out  sterr.out
//! ```
//!
//! Sandboxes are bookkeeping only; the cluster has no pod concept.

pub mod client;
pub mod container;
pub mod image;
pub mod job;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multicri_core::api::{
    AttachRequest, AttachResponse, ExecRequest, ExecResponse, ExecSyncResponse,
    FilesystemIdentifier, FilesystemUsage, ImageFsInfoResponse, LinuxContainerResources,
    UInt64Value, VersionResponse,
};
use multicri_core::error::{CriError, Result};
use multicri_core::metadata::now_nanos;
use multicri_core::{
    ContainerMetadata, ContainerState, ImageMetadata, RepoType, SandboxMetadata, SlurmConfig,
    CRI_API_VERSION,
};

use crate::adapter::{Adapter, ContainerLookup, ExecOutput, StreamRuntime};
use crate::log::ContainerLogger;
use crate::streaming::{SessionKind, StreamingHandle, StreamingSession};
use crate::transport::{ClusterCredentials, ShellConnector, SshConnector};

pub use client::SlurmClient;
pub use image::{BuildMode, ImageBuilder};

pub const ADAPTER_VERSION: &str = "0.1.0";
pub const RUNTIME_NAME: &str = "slurm";

/// Container path of the volume that holds job directories.
pub const VOLUME_CONTAINER_PATH: &str = "/multicri";

/// Pre-run script content for jobs and image pulls.
pub const ENV_CLUSTER_CONFIG: &str = "CLUSTER_CONFIG";

/// Host path of the job volume.
pub const EXTRA_VOLUME_PATH: &str = "volume_path";
/// Host path of the container's results directory inside the volume.
pub const EXTRA_LOCAL_PATH: &str = "local_path";
/// Volume folder relative to `$HOME` on the cluster.
pub const EXTRA_CLUSTER_VOLUME_PATH: &str = "cluster_volume_path";
/// Job directory relative to `$HOME` on the cluster.
pub const EXTRA_JOB_DIR: &str = "job_dir";
/// Image file as seen by jobs on the cluster.
pub const EXTRA_IMAGE_PATH: &str = "cluster_image_path";

pub struct SlurmAdapter {
    config: SlurmConfig,
    builder: ImageBuilder,
    connector: Arc<dyn ShellConnector>,
    streaming: StreamingHandle,
}

impl SlurmAdapter {
    /// Adapter talking to the cluster over SSH.
    pub fn new(config: SlurmConfig, streaming: StreamingHandle) -> Result<Self> {
        let builder = ImageBuilder::from_config(&config)?;
        Ok(Self::with_parts(
            config,
            builder,
            Arc::new(SshConnector),
            streaming,
        ))
    }

    pub fn with_parts(
        config: SlurmConfig,
        builder: ImageBuilder,
        connector: Arc<dyn ShellConnector>,
        streaming: StreamingHandle,
    ) -> Self {
        Self {
            config,
            builder,
            connector,
            streaming,
        }
    }

    /// Scheduler client for the container's credentials and log.
    fn client(&self, container: &ContainerMetadata) -> Result<SlurmClient> {
        client_for(self.connector.as_ref(), container)
    }
}

fn client_for(connector: &dyn ShellConnector, container: &ContainerMetadata) -> Result<SlurmClient> {
    let credentials = ClusterCredentials::from_environment(&container.environment)?;
    Ok(SlurmClient::new(
        connector.connect(&credentials),
        ContainerLogger::new(&container.log_path),
    ))
}

/// Run `cmd` inside the container's job directory.
async fn run_in_job_dir(
    connector: &dyn ShellConnector,
    container: &ContainerMetadata,
    cmd: &[String],
) -> Result<ExecOutput> {
    if cmd.is_empty() {
        return Err(CriError::InvalidArgument("empty command".to_string()));
    }
    let client = client_for(connector, container)?;
    let command = format!("cd {} && {}", container.extra(EXTRA_JOB_DIR), cmd.join(" "));
    let output = client.shell().run(&command).await?;
    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_status,
    })
}

#[async_trait]
impl Adapter for SlurmAdapter {
    fn version(&self) -> VersionResponse {
        VersionResponse {
            version: ADAPTER_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: ADAPTER_VERSION.to_string(),
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

    async fn create_container(&self, container: &mut ContainerMetadata) -> Result<()> {
        self.create(container).await
    }

    async fn start_container(&self, container: &mut ContainerMetadata) -> Result<()> {
        self.start(container).await
    }

    async fn stop_container(&self, container: &mut ContainerMetadata) -> Result<()> {
        self.stop(container).await
    }

    async fn container_status(&self, container: &mut ContainerMetadata) -> Result<()> {
        self.status(container).await
    }

    async fn reopen_container_log(&self, _container: &mut ContainerMetadata) -> Result<()> {
        // The log sink opens the file on every write.
        Ok(())
    }

    async fn update_container_resources(
        &self,
        _container: &mut ContainerMetadata,
        _resources: Option<&LinuxContainerResources>,
    ) -> Result<()> {
        Err(CriError::Unsupported(
            "container resources are fixed at job submission".to_string(),
        ))
    }

    async fn pull_image(&self, image: &mut ImageMetadata) -> Result<()> {
        if image.repo_type == RepoType::Unknown {
            return Err(CriError::Unsupported(format!(
                "image repository type not supported: {}",
                image.reference
            )));
        }
        self.builder.pull_image(image).await
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
        let mountpoint = if self.config.image_remote_mount.is_empty() {
            self.config.mount_path.clone()
        } else {
            self.config.image_remote_mount.clone()
        };
        Ok(ImageFsInfoResponse {
            image_filesystems: vec![FilesystemUsage {
                timestamp: now_nanos(),
                fs_id: Some(FilesystemIdentifier { mountpoint }),
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
        container: &mut ContainerMetadata,
        cmd: &[String],
        timeout_secs: i64,
    ) -> Result<ExecSyncResponse> {
        let run = run_in_job_dir(self.connector.as_ref(), container, cmd);
        let output = if timeout_secs > 0 {
            tokio::time::timeout(Duration::from_secs(timeout_secs as u64), run)
                .await
                .map_err(|_| {
                    CriError::transport(
                        cmd.join(" "),
                        format!("timed out after {}s", timeout_secs),
                    )
                })??
        } else {
            run.await?
        };
        Ok(output.into())
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
                sandbox_id: container.sandbox_id().to_string(),
                cmd: request.cmd.clone(),
                tty: request.tty,
                stdin: request.stdin,
                ports: vec![],
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
                sandbox_id: container.sandbox_id().to_string(),
                tty: request.tty,
                stdin: request.stdin,
                ..Default::default()
            })
            .await;
        Ok(AttachResponse { url })
    }

    fn new_stream_runtime(&self, containers: Arc<dyn ContainerLookup>) -> Arc<dyn StreamRuntime> {
        Arc::new(SlurmStreamRuntime {
            containers,
            connector: self.connector.clone(),
        })
    }
}

/// Streaming data path: exec runs on the cluster, attach replays job output.
struct SlurmStreamRuntime {
    containers: Arc<dyn ContainerLookup>,
    connector: Arc<dyn ShellConnector>,
}

impl SlurmStreamRuntime {
    fn running_container(&self, container_id: &str) -> Result<ContainerMetadata> {
        let container = self.containers.lookup(container_id)?;
        if container.state != ContainerState::Running {
            return Err(CriError::Conflict(format!(
                "container {} is not running",
                container_id
            )));
        }
        Ok(container)
    }
}

#[async_trait]
impl StreamRuntime for SlurmStreamRuntime {
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let container = self.running_container(container_id)?;
        run_in_job_dir(self.connector.as_ref(), &container, cmd).await
    }

    async fn attach(&self, container_id: &str) -> Result<Vec<u8>> {
        let container = self.containers.lookup(container_id)?;
        let client = client_for(self.connector.as_ref(), &container)?;
        let output = client
            .query(&format!(
                "cat {}/{}",
                container.extra(EXTRA_JOB_DIR),
                job::STDOUT_FILE
            ))
            .await?;
        Ok(output.stdout)
    }

    async fn port_forward(&self, _sandbox_id: &str, _port: i32) -> Result<()> {
        Err(CriError::Unsupported(
            "port forwarding into batch jobs".to_string(),
        ))
    }
}
