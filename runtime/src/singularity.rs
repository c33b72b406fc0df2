//! Local Singularity CLI, used when images are pulled on the CRI node.

use std::path::{Path, PathBuf};

use multicri_core::error::{CriError, Result};
use multicri_core::{ImageMetadata, RepoType};
use tokio::process::Command;

pub const ENV_DOCKER_USERNAME: &str = "SINGULARITY_DOCKER_USERNAME";
pub const ENV_DOCKER_PASSWORD: &str = "SINGULARITY_DOCKER_PASSWORD";

/// Registry credentials as Singularity environment variables.
///
/// Only Docker registries take credentials; Singularity hub authentication is
/// not available and is reported with a warning.
pub fn auth_environment(image: &ImageMetadata) -> Vec<(String, String)> {
    match image.repo_type {
        RepoType::Docker if !image.auth.username.is_empty() && !image.auth.password.is_empty() => {
            vec![
                (ENV_DOCKER_USERNAME.to_string(), image.auth.username.clone()),
                (ENV_DOCKER_PASSWORD.to_string(), image.auth.password.clone()),
            ]
        }
        RepoType::Singularity => {
            tracing::warn!(image = %image.reference, "Authentication for Singularity hub is not implemented");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

/// Shell prefix exporting the same credentials inline, for cluster scripts.
pub fn auth_prefix(image: &ImageMetadata) -> String {
    auth_environment(image)
        .into_iter()
        .map(|(key, value)| format!("{}={} ", key, crate::transport::double_quote(&value)))
        .collect()
}

/// Handle on the `singularity` binary found on this node.
#[derive(Debug, Clone)]
pub struct SingularityCli {
    binary: PathBuf,
}

impl SingularityCli {
    /// Find `singularity` on `PATH`.
    pub fn locate() -> Result<Self> {
        let path = std::env::var_os("PATH").unwrap_or_default();
        std::env::split_paths(&path)
            .map(|dir| dir.join("singularity"))
            .find(|candidate| candidate.is_file())
            .map(Self::with_binary)
            .ok_or_else(|| {
                CriError::Config("must have Singularity 3.0 installed: not found in PATH".to_string())
            })
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// `singularity pull <destination> <remote>`.
    pub async fn pull(
        &self,
        destination: &Path,
        remote: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        tracing::debug!(
            destination = %destination.display(),
            remote = %remote,
            "singularity: pulling image"
        );
        let output = Command::new(&self.binary)
            .arg("pull")
            .arg(destination)
            .arg(remote)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .await?;

        if !output.status.success() {
            let command = format!(
                "{} pull {} {}",
                self.binary.display(),
                destination.display(),
                remote
            );
            tracing::warn!(command = %command, status = %output.status, "singularity: pull failed");
            return Err(CriError::transport(
                command,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multicri_core::ImageAuth;

    fn docker_image(username: &str, password: &str) -> ImageMetadata {
        ImageMetadata {
            repo_type: RepoType::Docker,
            auth: ImageAuth {
                username: username.to_string(),
                password: password.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_docker_auth_environment() {
        let env = auth_environment(&docker_image("bob", "pw"));
        assert_eq!(
            env,
            vec![
                (ENV_DOCKER_USERNAME.to_string(), "bob".to_string()),
                (ENV_DOCKER_PASSWORD.to_string(), "pw".to_string()),
            ]
        );
        assert_eq!(
            auth_prefix(&docker_image("bob", "pw")),
            "SINGULARITY_DOCKER_USERNAME=\"bob\" SINGULARITY_DOCKER_PASSWORD=\"pw\" "
        );
    }

    #[test]
    fn test_partial_credentials_are_ignored() {
        assert!(auth_environment(&docker_image("bob", "")).is_empty());
        assert_eq!(auth_prefix(&docker_image("", "")), "");
    }

    #[test]
    fn test_singularity_hub_has_no_auth() {
        let image = ImageMetadata {
            repo_type: RepoType::Singularity,
            ..Default::default()
        };
        assert!(auth_environment(&image).is_empty());
    }

    #[tokio::test]
    async fn test_pull_failure_is_transport_error() {
        // `false` ignores its arguments and exits 1.
        let cli = SingularityCli::with_binary("false");
        let err = cli
            .pull(Path::new("/tmp/x.sif"), "docker://alpine", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CriError::Transport { .. }));
    }
}
