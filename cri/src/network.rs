//! Pod network setup seam.
//!
//! The dispatcher calls a [`NetworkPlugin`] around the sandbox lifecycle when
//! one is configured. Without a plugin, pods share the host network and
//! report the loopback address.

use async_trait::async_trait;
use multicri_core::error::Result;
use multicri_core::SandboxMetadata;

/// Address reported for pods when no plugin assigned one.
pub const LOOPBACK_IP: &str = "127.0.0.1";

/// Network attachment produced by a plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodNetwork {
    /// Path of the pod's network namespace (empty for host networking).
    pub netns_path: String,
    /// Pod IP address.
    pub ip: String,
}

/// Sets up and tears down pod networking.
#[async_trait]
pub trait NetworkPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn setup(&self, sandbox: &SandboxMetadata) -> Result<PodNetwork>;

    async fn teardown(&self, sandbox: &SandboxMetadata) -> Result<()>;

    /// Fails when the plugin cannot serve new pods.
    async fn status(&self) -> Result<()>;
}
