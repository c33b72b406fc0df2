//! Metadata records for sandboxes, containers and images.
//!
//! These are the authoritative local records kept by the metadata store and
//! handed (mutably) to the execution adapter for every call. Conversions to
//! the CRI wire types live here so every listing renders records the same way.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::api;
use crate::error::Result;
use crate::reference::{ImageReference, RepoType};

/// Label kubelet sets to the owning pod's UID.
pub const POD_UID_LABEL: &str = "io.kubernetes.pod.uid";

/// Default parent directory for pod log directories.
pub const DEFAULT_POD_LOG_ROOT: &str = "/var/log/pods";

/// Exit reason of a container whose start failed.
pub const REASON_CANNOT_RUN: &str = "ContainerCannotRun";

/// Current wall-clock time in nanoseconds since the epoch.
pub fn now_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// Pod sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SandboxState {
    /// Sandbox is running and networking is set up.
    Ready,
    /// Sandbox is created or stopped.
    #[default]
    NotReady,
}

impl SandboxState {
    pub fn to_cri(self) -> api::PodSandboxState {
        match self {
            SandboxState::Ready => api::PodSandboxState::SandboxReady,
            SandboxState::NotReady => api::PodSandboxState::SandboxNotready,
        }
    }

    pub fn from_cri(value: i32) -> Option<Self> {
        match api::PodSandboxState::try_from(value).ok()? {
            api::PodSandboxState::SandboxReady => Some(SandboxState::Ready),
            api::PodSandboxState::SandboxNotready => Some(SandboxState::NotReady),
        }
    }
}

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContainerState {
    /// Container has been created but not started.
    #[default]
    Created,
    /// Container is running.
    Running,
    /// Container has exited.
    Exited,
}

impl ContainerState {
    pub fn to_cri(self) -> api::ContainerState {
        match self {
            ContainerState::Created => api::ContainerState::ContainerCreated,
            ContainerState::Running => api::ContainerState::ContainerRunning,
            ContainerState::Exited => api::ContainerState::ContainerExited,
        }
    }

    pub fn from_cri(value: i32) -> Option<Self> {
        match api::ContainerState::try_from(value).ok()? {
            api::ContainerState::ContainerCreated => Some(ContainerState::Created),
            api::ContainerState::ContainerRunning => Some(ContainerState::Running),
            api::ContainerState::ContainerExited => Some(ContainerState::Exited),
            api::ContainerState::ContainerUnknown => None,
        }
    }
}

/// A pod sandbox record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// Unique sandbox identifier.
    pub id: String,
    /// Current state.
    pub state: SandboxState,
    /// CRI configuration the sandbox was created with.
    pub config: api::PodSandboxConfig,
    /// IDs of containers created in this sandbox, in creation order.
    pub containers: Vec<String>,
    /// Pod log directory.
    pub log_path: String,
    /// Network namespace path (empty for host networking).
    pub netns_path: String,
    /// Assigned IP (empty until network setup completes).
    pub ip: String,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Runtime handler the sandbox was created under.
    pub runtime_handler: String,
}

impl SandboxMetadata {
    /// Build a NOTREADY record for a freshly requested sandbox.
    pub fn new(id: String, config: api::PodSandboxConfig, runtime_handler: String) -> Self {
        let log_path = if config.log_directory.is_empty() {
            format!("{}/{}", DEFAULT_POD_LOG_ROOT, id)
        } else {
            config.log_directory.clone()
        };
        Self {
            id,
            state: SandboxState::NotReady,
            config,
            containers: Vec::new(),
            log_path,
            netns_path: String::new(),
            ip: String::new(),
            created_at: now_nanos(),
            runtime_handler,
        }
    }

    pub fn name(&self) -> &str {
        self.config
            .metadata
            .as_ref()
            .map(|m| m.name.as_str())
            .unwrap_or("")
    }

    pub fn pod_uid(&self) -> &str {
        self.config
            .metadata
            .as_ref()
            .map(|m| m.uid.as_str())
            .unwrap_or("")
    }

    /// Whether the pod shares the node's network namespace.
    pub fn host_network(&self) -> bool {
        self.namespace_options()
            .map(|ns| ns.network == api::NamespaceMode::Node as i32)
            .unwrap_or(false)
    }

    fn namespace_options(&self) -> Option<&api::NamespaceOption> {
        self.config
            .linux
            .as_ref()?
            .security_context
            .as_ref()?
            .namespace_options
            .as_ref()
    }

    /// Whether this record satisfies a CRI label selector.
    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector.iter().all(|(key, value)| {
            if key == POD_UID_LABEL {
                value == &self.id || value == self.pod_uid()
            } else {
                self.config.labels.get(key) == Some(value)
            }
        })
    }

    pub fn to_pod_sandbox(&self) -> api::PodSandbox {
        api::PodSandbox {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state.to_cri() as i32,
            created_at: self.created_at,
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }

    /// Render the sandbox status, reporting `ip` as the pod address.
    pub fn to_status(&self, ip: &str) -> api::PodSandboxStatus {
        api::PodSandboxStatus {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state.to_cri() as i32,
            created_at: self.created_at,
            network: Some(api::PodSandboxNetworkStatus { ip: ip.to_string() }),
            linux: Some(api::LinuxPodSandboxStatus {
                namespaces: Some(api::Namespace {
                    options: self.namespace_options().cloned(),
                }),
            }),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            runtime_handler: self.runtime_handler.clone(),
        }
    }
}

/// A container record.
///
/// The owning sandbox is a snapshot taken at creation, not a live reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Unique container identifier.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Current state.
    pub state: ContainerState,
    /// Snapshot of the owning sandbox.
    pub sandbox: SandboxMetadata,
    /// CRI configuration the container was created with.
    pub config: api::ContainerConfig,
    /// Entrypoint.
    pub command: Vec<String>,
    /// Arguments to the entrypoint.
    pub args: Vec<String>,
    /// Declared environment.
    pub environment: HashMap<String, String>,
    /// Resolved image (absent for records shadowing a remote backend).
    pub image: Option<ImageMetadata>,
    /// Creation timestamp in nanoseconds.
    pub created_at: i64,
    /// Start timestamp in nanoseconds (0 if not started).
    pub started_at: i64,
    /// Finish timestamp in nanoseconds (0 if not finished).
    pub finished_at: i64,
    /// Exit code (0 if not exited).
    pub exit_code: i32,
    /// Machine-stable reason for the current state.
    pub reason: String,
    /// Host path of the container log.
    pub log_path: String,
    /// Process or job identifier assigned on start.
    pub pid: u64,
    /// Adapter-private values (execution paths and the like).
    pub extra: HashMap<String, String>,
}

impl ContainerMetadata {
    pub fn new(
        id: String,
        sandbox: SandboxMetadata,
        config: api::ContainerConfig,
        image: Option<ImageMetadata>,
    ) -> Self {
        let name = config
            .metadata
            .as_ref()
            .map(|m| m.name.clone())
            .unwrap_or_default();
        let environment = config
            .envs
            .iter()
            .map(|kv| (kv.key.clone(), kv.value.clone()))
            .collect();
        let log_file = if config.log_path.is_empty() {
            format!("{}.log", id)
        } else {
            config.log_path.clone()
        };
        let log_path = Path::new(&sandbox.log_path)
            .join(log_file)
            .to_string_lossy()
            .into_owned();

        Self {
            name,
            command: config.command.clone(),
            args: config.args.clone(),
            environment,
            image,
            created_at: now_nanos(),
            log_path,
            sandbox,
            config,
            id,
            ..Default::default()
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox.id
    }

    /// Containers route by their sandbox's handler.
    pub fn runtime_handler(&self) -> &str {
        &self.sandbox.runtime_handler
    }

    /// Value stashed in the adapter bag, or empty.
    pub fn extra(&self, key: &str) -> &str {
        self.extra.get(key).map(String::as_str).unwrap_or("")
    }

    /// Move the container to EXITED.
    pub fn mark_exited(&mut self, exit_code: i32, reason: impl Into<String>, finished_at: i64) {
        self.state = ContainerState::Exited;
        self.exit_code = exit_code;
        self.reason = reason.into();
        self.finished_at = finished_at;
    }

    pub fn matches_labels(&self, selector: &HashMap<String, String>) -> bool {
        selector.iter().all(|(key, value)| {
            if key == POD_UID_LABEL {
                value == self.sandbox_id() || value == self.sandbox.pod_uid()
            } else {
                self.config.labels.get(key) == Some(value)
            }
        })
    }

    fn image_ref(&self) -> String {
        self.image
            .as_ref()
            .map(|image| image.remote_path.clone())
            .unwrap_or_default()
    }

    pub fn to_container(&self) -> api::Container {
        api::Container {
            id: self.id.clone(),
            pod_sandbox_id: self.sandbox.id.clone(),
            metadata: self.config.metadata.clone(),
            image: self.config.image.clone(),
            image_ref: self.image_ref(),
            state: self.state.to_cri() as i32,
            created_at: self.created_at,
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
        }
    }

    pub fn to_status(&self) -> api::ContainerStatus {
        api::ContainerStatus {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            state: self.state.to_cri() as i32,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            image: self.config.image.clone(),
            image_ref: self.image_ref(),
            reason: self.reason.clone(),
            message: String::new(),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
            mounts: self.config.mounts.clone(),
            log_path: self.log_path.clone(),
        }
    }

    pub fn attributes(&self) -> api::ContainerAttributes {
        api::ContainerAttributes {
            id: self.id.clone(),
            metadata: self.config.metadata.clone(),
            labels: self.config.labels.clone(),
            annotations: self.config.annotations.clone(),
        }
    }
}

/// Registry credentials supplied with a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAuth {
    pub username: String,
    pub password: String,
    pub auth: String,
    pub server_address: String,
    pub identity_token: String,
    pub registry_token: String,
}

impl From<&api::AuthConfig> for ImageAuth {
    fn from(auth: &api::AuthConfig) -> Self {
        Self {
            username: auth.username.clone(),
            password: auth.password.clone(),
            auth: auth.auth.clone(),
            server_address: auth.server_address.clone(),
            identity_token: auth.identity_token.clone(),
            registry_token: auth.registry_token.clone(),
        }
    }
}

/// An image record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Unique, generated identifier.
    pub id: String,
    /// Logical image name.
    pub name: String,
    /// Reference exactly as requested, including its repository prefix.
    pub reference: String,
    /// Local filesystem path assigned by the adapter.
    pub local_path: String,
    /// Canonical remote reference.
    pub remote_path: String,
    /// Repository type.
    pub repo_type: RepoType,
    /// Size in bytes.
    pub size: u64,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    /// Registry credentials.
    pub auth: ImageAuth,
}

impl ImageMetadata {
    /// Build an unresolved record for a pull request.
    pub fn new(id: String, reference: String, local_path: String, auth: ImageAuth) -> Self {
        Self {
            id,
            reference,
            local_path,
            auth,
            ..Default::default()
        }
    }

    /// Resolve repository type, name and canonical reference from the
    /// requested reference.
    pub fn resolve_reference(&mut self) -> Result<()> {
        let parsed = ImageReference::parse(&self.reference)?;
        self.repo_type = parsed.repo_type;
        self.name = parsed.name;
        self.repo_tags = vec![parsed.remote_path.clone()];
        self.repo_digests = vec![parsed.remote_path.clone()];
        self.remote_path = parsed.remote_path;
        Ok(())
    }

    /// Whether `query` identifies this image by name, ID, tag, digest or
    /// requested reference.
    pub fn matches(&self, query: &str) -> bool {
        if query.is_empty() {
            return false;
        }
        self.id.contains(query)
            || self.name == query
            || self.reference == query
            || self.repo_tags.iter().any(|t| t == query)
            || self.repo_digests.iter().any(|d| d == query)
    }

    pub fn to_image(&self) -> api::Image {
        api::Image {
            id: self.remote_path.clone(),
            repo_tags: self.repo_tags.clone(),
            repo_digests: self.repo_digests.clone(),
            size: self.size,
            uid: None,
            username: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_sandbox(id: &str) -> SandboxMetadata {
        let config = api::PodSandboxConfig {
            metadata: Some(api::PodSandboxMetadata {
                name: format!("pod-{}", id),
                uid: format!("uid-{}", id),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            ..Default::default()
        };
        SandboxMetadata::new(id.to_string(), config, String::new())
    }

    #[test]
    fn test_sandbox_default_log_dir() {
        let sb = test_sandbox("sb1");
        assert_eq!(sb.log_path, "/var/log/pods/sb1");
        assert_eq!(sb.state, SandboxState::NotReady);
        assert!(sb.created_at > 0);
    }

    #[test]
    fn test_sandbox_label_selector_pod_uid() {
        let sb = test_sandbox("sb1");
        let by_id = HashMap::from([(POD_UID_LABEL.to_string(), "sb1".to_string())]);
        let by_uid = HashMap::from([(POD_UID_LABEL.to_string(), "uid-sb1".to_string())]);
        let other = HashMap::from([(POD_UID_LABEL.to_string(), "sb2".to_string())]);
        assert!(sb.matches_labels(&by_id));
        assert!(sb.matches_labels(&by_uid));
        assert!(!sb.matches_labels(&other));
    }

    #[test]
    fn test_sandbox_host_network() {
        let mut sb = test_sandbox("sb1");
        assert!(!sb.host_network());
        sb.config.linux = Some(api::LinuxPodSandboxConfig {
            security_context: Some(api::LinuxSandboxSecurityContext {
                namespace_options: Some(api::NamespaceOption {
                    network: api::NamespaceMode::Node as i32,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(sb.host_network());
    }

    #[test]
    fn test_container_log_path_and_env() {
        let config = api::ContainerConfig {
            metadata: Some(api::ContainerMetadata {
                name: "app".to_string(),
                attempt: 0,
            }),
            envs: vec![api::KeyValue {
                key: "JOB_QUEUE".to_string(),
                value: "debug".to_string(),
            }],
            log_path: "app/0.log".to_string(),
            ..Default::default()
        };
        let cm = ContainerMetadata::new("c1".to_string(), test_sandbox("sb1"), config, None);
        assert_eq!(cm.name, "app");
        assert_eq!(cm.log_path, "/var/log/pods/sb1/app/0.log");
        assert_eq!(cm.environment.get("JOB_QUEUE").unwrap(), "debug");
        assert_eq!(cm.state, ContainerState::Created);
        assert_eq!(cm.started_at, 0);
    }

    #[test]
    fn test_container_default_log_path() {
        let cm = ContainerMetadata::new(
            "c1".to_string(),
            test_sandbox("sb1"),
            api::ContainerConfig::default(),
            None,
        );
        assert_eq!(cm.log_path, "/var/log/pods/sb1/c1.log");
    }

    #[test]
    fn test_mark_exited() {
        let mut cm = ContainerMetadata::default();
        cm.mark_exited(1, "ContainerCannotRun", 42);
        assert_eq!(cm.state, ContainerState::Exited);
        assert_eq!(cm.exit_code, 1);
        assert_eq!(cm.reason, "ContainerCannotRun");
        assert_eq!(cm.to_status().state, api::ContainerState::ContainerExited as i32);
    }

    #[test]
    fn test_image_resolve_and_match() {
        let mut image = ImageMetadata::new(
            "0123abcd".to_string(),
            "docker-repository.alpine:latest".to_string(),
            "/cache/.images".to_string(),
            ImageAuth::default(),
        );
        image.resolve_reference().unwrap();
        assert_eq!(image.remote_path, "docker://alpine:latest");
        assert_eq!(image.repo_tags, vec!["docker://alpine:latest"]);
        assert_eq!(image.repo_digests, vec!["docker://alpine:latest"]);

        assert!(image.matches("0123abcd"));
        assert!(image.matches("23ab"));
        assert!(image.matches("alpine"));
        assert!(image.matches("docker://alpine:latest"));
        assert!(image.matches("docker-repository.alpine:latest"));
        assert!(!image.matches("busybox"));
        assert!(!image.matches(""));
    }

    #[test]
    fn test_state_round_trip_through_wire_enum() {
        for state in [
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Exited,
        ] {
            assert_eq!(ContainerState::from_cri(state.to_cri() as i32), Some(state));
        }
        assert_eq!(
            ContainerState::from_cri(api::ContainerState::ContainerUnknown as i32),
            None
        );
        assert_eq!(
            SandboxState::from_cri(SandboxState::Ready.to_cri() as i32),
            Some(SandboxState::Ready)
        );
    }
}
