//! Image reference scheme.
//!
//! Image references carry a reserved prefix that selects the repository
//! type and the URL scheme used by the image runtime on the cluster:
//!
//! | prefix                    | repository             | scheme      |
//! |---------------------------|------------------------|-------------|
//! | `docker-repository.`      | Docker registry        | `docker://` |
//! | `singularity-repository.` | Singularity hub        | `shub://`   |
//! | `local-image.`            | local image file       | (none)      |
//! | `local-def-file.`         | local definition file  | (none)      |

use serde::{Deserialize, Serialize};

use crate::error::{CriError, Result};

/// Repository type derived from the image reference prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepoType {
    Docker,
    Singularity,
    LocalImage,
    LocalDefinitionFile,
    #[default]
    Unknown,
}

const PREFIXES: [(&str, RepoType); 4] = [
    ("singularity-repository.", RepoType::Singularity),
    ("docker-repository.", RepoType::Docker),
    ("local-image.", RepoType::LocalImage),
    ("local-def-file.", RepoType::LocalDefinitionFile),
];

impl RepoType {
    /// URL scheme the image runtime expects for this repository.
    pub fn scheme(&self) -> &'static str {
        match self {
            RepoType::Docker => "docker://",
            RepoType::Singularity => "shub://",
            RepoType::LocalImage | RepoType::LocalDefinitionFile | RepoType::Unknown => "",
        }
    }

    /// Whether the image is acquired by a filesystem copy.
    pub fn is_local(&self) -> bool {
        matches!(self, RepoType::LocalImage | RepoType::LocalDefinitionFile)
    }
}

/// A parsed, prefixed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository type selected by the prefix.
    pub repo_type: RepoType,
    /// Logical image name: last path segment without the tag.
    pub name: String,
    /// Canonical remote reference (`scheme` + remainder).
    pub remote_path: String,
}

impl ImageReference {
    /// Parse a prefixed reference such as `docker-repository.alpine:latest`.
    pub fn parse(reference: &str) -> Result<Self> {
        let (repo_type, remainder) = PREFIXES
            .iter()
            .find_map(|(prefix, repo_type)| {
                reference
                    .strip_prefix(prefix)
                    .map(|remainder| (*repo_type, remainder))
            })
            .ok_or_else(|| {
                CriError::Unsupported(format!(
                    "image repository is not supported: {}",
                    reference
                ))
            })?;

        if remainder.is_empty() {
            return Err(CriError::InvalidArgument(format!(
                "image reference {} has no image after the repository prefix",
                reference
            )));
        }

        Ok(Self {
            repo_type,
            name: logical_name(remainder),
            remote_path: format!("{}{}", repo_type.scheme(), remainder),
        })
    }
}

/// Last path segment of a reference, without its tag.
fn logical_name(remainder: &str) -> String {
    let last = remainder.rsplit('/').next().unwrap_or(remainder);
    last.split(':').next().unwrap_or(last).to_string()
}

/// Filesystem-safe file name for an image, derived from its canonical reference.
pub fn image_file_name(remote_path: &str) -> String {
    remote_path.replace([':', '/'], ".")
}
