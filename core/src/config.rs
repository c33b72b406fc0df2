use serde::{Deserialize, Serialize};

/// Environment variable naming the scheduler-visible mount folder.
pub const ENV_MOUNT_PATH: &str = "CRI_SLURM_MOUNT_PATH";
/// Environment variable naming a shared image folder on the cluster.
pub const ENV_IMAGE_REMOTE_MOUNT: &str = "CRI_SLURM_IMAGE_REMOTE_MOUNT";
/// Environment variable selecting in-cluster image builds.
pub const ENV_BUILD_IN_CLUSTER: &str = "CRI_SLURM_BUILD_IN_CLUSTER";

/// Default mount folder, relative to the cluster user's home.
pub const DEFAULT_MOUNT_PATH: &str = "multicri";

/// Slurm adapter configuration, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmConfig {
    /// Folder (relative to `$HOME` on the cluster) holding job directories.
    pub mount_path: String,
    /// Shared image folder; empty when images live next to the job volume.
    pub image_remote_mount: String,
    /// Pull images on the cluster instead of through the local image CLI.
    pub build_in_cluster: bool,
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            mount_path: DEFAULT_MOUNT_PATH.to_string(),
            image_remote_mount: String::new(),
            build_in_cluster: false,
        }
    }
}

impl SlurmConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            mount_path: lookup(ENV_MOUNT_PATH)
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.mount_path),
            image_remote_mount: lookup(ENV_IMAGE_REMOTE_MOUNT).unwrap_or_default(),
            build_in_cluster: lookup(ENV_BUILD_IN_CLUSTER)
                .map(|v| parse_bool(&v))
                .unwrap_or(defaults.build_in_cluster),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_when_unset() {
        let config = SlurmConfig::from_lookup(|_| None);
        assert_eq!(config, SlurmConfig::default());
        assert_eq!(config.mount_path, "multicri");
    }

    #[test]
    fn test_values_from_lookup() {
        let env = HashMap::from([
            (ENV_MOUNT_PATH, "jobs"),
            (ENV_IMAGE_REMOTE_MOUNT, "/shared/images"),
            (ENV_BUILD_IN_CLUSTER, "True"),
        ]);
        let config = SlurmConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.mount_path, "jobs");
        assert_eq!(config.image_remote_mount, "/shared/images");
        assert!(config.build_in_cluster);
    }

    #[test]
    fn test_empty_mount_path_falls_back() {
        let config = SlurmConfig::from_lookup(|k| (k == ENV_MOUNT_PATH).then(String::new));
        assert_eq!(config.mount_path, DEFAULT_MOUNT_PATH);
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool(" yes "));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }
}
