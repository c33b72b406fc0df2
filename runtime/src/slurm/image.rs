//! Image acquisition for Slurm jobs.
//!
//! An image is first "pulled" for the CRI node (recorded in the image store)
//! and then made reachable from the cluster when a container is created. Two
//! strategies exist: pull on the CRI node with the local Singularity CLI and
//! copy into the shared volume, or defer the pull to a script on the cluster.

use std::path::Path;

use multicri_core::error::{CriError, Result};
use multicri_core::reference::image_file_name;
use multicri_core::{ContainerMetadata, ImageMetadata, SlurmConfig};

use super::client::SlurmClient;
use super::job::IMAGE_SCRIPT;
use super::{EXTRA_IMAGE_PATH, EXTRA_JOB_DIR, EXTRA_VOLUME_PATH};
use crate::singularity::{auth_environment, auth_prefix, SingularityCli};

const IMAGES_DIR: &str = ".images";
const FILE_SIZE_MARKER: &str = "FileSize:";

/// Where image pulls happen.
#[derive(Debug, Clone)]
pub enum BuildMode {
    /// On the cluster, from a script run by the job's user.
    InCluster,
    /// On the CRI node through the local CLI.
    InCri(SingularityCli),
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    mount_path: String,
    image_remote_mount: String,
    mode: BuildMode,
}

impl ImageBuilder {
    pub fn new(config: &SlurmConfig, mode: BuildMode) -> Self {
        Self {
            mount_path: config.mount_path.clone(),
            image_remote_mount: config.image_remote_mount.clone(),
            mode,
        }
    }

    /// Builder for the given configuration; the local CLI must be installed
    /// unless images are built in the cluster.
    pub fn from_config(config: &SlurmConfig) -> Result<Self> {
        let mode = if config.build_in_cluster {
            BuildMode::InCluster
        } else {
            BuildMode::InCri(SingularityCli::locate()?)
        };
        Ok(Self::new(config, mode))
    }

    pub fn mode(&self) -> &BuildMode {
        &self.mode
    }

    /// Acquire the image for the CRI node, setting its local path and size.
    pub async fn pull_image(&self, image: &mut ImageMetadata) -> Result<()> {
        if image.repo_type.is_local() {
            image.local_path = image.remote_path.clone();
            image.size = tokio::fs::metadata(&image.local_path).await?.len();
            return Ok(());
        }

        match &self.mode {
            BuildMode::InCluster => {
                // Size is unknown until the cluster pulls; kubelet rejects zero.
                image.size = 1;
                if !self.image_remote_mount.is_empty() {
                    image.local_path = self.image_remote_mount.clone();
                }
                Ok(())
            }
            BuildMode::InCri(cli) => {
                let folder = if self.image_remote_mount.is_empty() {
                    image.local_path.clone()
                } else {
                    self.image_remote_mount.clone()
                };
                let path = join_image_path(&folder, &image_file_name(&image.remote_path));
                if let Some(parent) = Path::new(&path).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }

                if tokio::fs::try_exists(&path).await? {
                    tracing::info!(path = %path, "Image already present, skipping pull");
                } else {
                    cli.pull(Path::new(&path), &image.remote_path, &auth_environment(image))
                        .await?;
                }
                image.size = tokio::fs::metadata(&path).await?.len();
                image.local_path = path;
                Ok(())
            }
        }
    }

    /// Make the container's image reachable from the cluster. The image's
    /// `local_path` keeps pointing at the CRI node; the cluster-side path is
    /// recorded in the container's extras.
    pub async fn pull_image_in_cluster(
        &self,
        client: &SlurmClient,
        container: &mut ContainerMetadata,
    ) -> Result<()> {
        let volume_path = container.extra(EXTRA_VOLUME_PATH).to_string();
        let job_dir = container.extra(EXTRA_JOB_DIR).to_string();
        let cluster_path = self.cluster_image_path(container);
        container
            .extra
            .insert(EXTRA_IMAGE_PATH.to_string(), cluster_path.clone());
        let prerun = container_prerun(&container.environment);
        let image = container.image.as_mut().ok_or_else(|| {
            CriError::InvalidArgument("container has no resolved image".to_string())
        })?;

        if image.repo_type.is_local() {
            let destination = self.mount_image_path(&volume_path, image)?;
            return copy_image(&image.local_path, &destination).await;
        }

        match &self.mode {
            BuildMode::InCluster => {
                let script = image_script(&cluster_path, image, &prerun);
                let output = client
                    .run_script(script, &format!("{}/{}", job_dir, IMAGE_SCRIPT))
                    .await?;
                image.size = parse_file_size(&output)?;
                tracing::info!(path = %cluster_path, size = image.size, "Image available in cluster");
                Ok(())
            }
            BuildMode::InCri(_) => {
                if !self.image_remote_mount.is_empty() {
                    return Ok(());
                }
                let destination = self.mount_image_path(&volume_path, image)?;
                copy_image(&image.local_path, &destination).await
            }
        }
    }

    /// Image path as seen by jobs on the cluster.
    pub fn cluster_image_path(&self, container: &ContainerMetadata) -> String {
        let file = container
            .image
            .as_ref()
            .map(|image| image_file_name(&image.remote_path))
            .unwrap_or_default();
        let volume_path = container.extra(EXTRA_VOLUME_PATH);
        let folder = if !self.image_remote_mount.is_empty() || volume_path.is_empty() {
            self.mount_path.clone()
        } else {
            format!("{}/{}", self.mount_path, basename(volume_path))
        };
        format!("$HOME/{}/{}/{}", folder, IMAGES_DIR, file)
    }

    /// Path on the CRI node that the cluster sees as the image folder.
    fn mount_image_path(&self, volume_path: &str, image: &ImageMetadata) -> Result<String> {
        let file = image_file_name(&image.remote_path);
        if !self.image_remote_mount.is_empty() {
            return Ok(join_image_path(&self.image_remote_mount, &file));
        }
        if volume_path.is_empty() {
            return Err(CriError::Config(format!(
                "no shared volume to place image {} for the cluster",
                image.reference
            )));
        }
        Ok(format!("{}/{}/{}", volume_path, IMAGES_DIR, file))
    }
}

/// Script pulling the image on the cluster unless it is already there, then
/// printing its size.
fn image_script(path: &str, image: &ImageMetadata, prerun: &str) -> String {
    let dir = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(path);
    let mut script = String::from("#!/bin/bash\n");
    script.push_str(&format!("mkdir -p {}\n", dir));
    if !prerun.trim().is_empty() {
        script.push_str(prerun.trim_end());
        script.push('\n');
    }
    script.push_str(&format!(
        "if [ ! -f {path} ]; then {auth}singularity pull {path} {remote}; fi\n",
        path = path,
        auth = auth_prefix(image),
        remote = image.remote_path
    ));
    script.push_str(&format!("stat --print='{}%s' {}\n", FILE_SIZE_MARKER, path));
    script
}

fn container_prerun(environment: &std::collections::HashMap<String, String>) -> String {
    environment
        .get(super::ENV_CLUSTER_CONFIG)
        .cloned()
        .unwrap_or_default()
}

/// `folder/file`, unless `folder` already names the file.
fn join_image_path(folder: &str, file: &str) -> String {
    if folder.ends_with(file) {
        folder.to_string()
    } else {
        format!("{}/{}", folder.trim_end_matches('/'), file)
    }
}

fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

async fn copy_image(source: &str, destination: &str) -> Result<()> {
    if source == destination || tokio::fs::try_exists(destination).await? {
        return Ok(());
    }
    if let Some(parent) = Path::new(destination).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tracing::info!(source = %source, destination = %destination, "Copying image to shared volume");
    tokio::fs::copy(source, destination).await?;
    Ok(())
}

/// Size reported by the image script's `stat --print='FileSize:%s'`.
pub fn parse_file_size(output: &str) -> Result<u64> {
    let start = output
        .rfind(FILE_SIZE_MARKER)
        .ok_or_else(|| CriError::Parse(format!("no image size in: {}", output.trim())))?;
    let digits: String = output[start + FILE_SIZE_MARKER.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits
        .parse()
        .map_err(|_| CriError::Parse(format!("invalid image size in: {}", output.trim())))
}
