//! Shared state of the CRI dispatcher.
//!
//! One [`CriService`] backs both the RuntimeService and the ImageService.
//! Every call first asks the [`RemoteRouter`] where it belongs; only calls
//! that resolve locally touch the metadata store and the adapter.

use std::path::PathBuf;
use std::sync::Arc;

use multicri_core::error::{CriError, Result};
use multicri_core::{
    ContainerMetadata, ContainerState, ImageMetadata, SandboxMetadata, SandboxState,
};
use multicri_runtime::{Adapter, StreamingHandle};

use crate::network::NetworkPlugin;
use crate::remote::{RemoteCri, RemoteRouter, Route};
use crate::store::{ContainerStore, ImageStore, JsonFileStore, SandboxStore};

/// Where a call addressed by record ID is served.
pub(crate) enum Target<'a, T> {
    Local(T),
    Remote(&'a RemoteCri),
}

/// Dispatcher options.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory holding the record caches and pulled images.
    pub cache_path: PathBuf,
    /// Persist sandbox and container records (images are always persisted).
    pub enable_pod_persistence: bool,
}

/// The CRI dispatcher.
pub struct CriService {
    pub(crate) sandboxes: SandboxStore,
    pub(crate) containers: Arc<ContainerStore>,
    pub(crate) images: ImageStore,
    pub(crate) adapter: Arc<dyn Adapter>,
    pub(crate) router: RemoteRouter,
    pub(crate) network: Option<Arc<dyn NetworkPlugin>>,
    pub(crate) streaming: StreamingHandle,
}

impl CriService {
    /// Build the dispatcher, loading persisted records from the cache directory.
    pub fn new(
        config: &ServiceConfig,
        adapter: Arc<dyn Adapter>,
        router: RemoteRouter,
        streaming: StreamingHandle,
    ) -> Result<Self> {
        let cache = config.cache_path.as_path();
        std::fs::create_dir_all(cache.join(crate::store::image::IMAGES_DIR))?;

        let images = ImageStore::load(
            cache,
            Box::new(JsonFileStore::<ImageMetadata>::in_cache(cache, "images")),
        )?;
        let (sandboxes, containers) = if config.enable_pod_persistence {
            (
                SandboxStore::load(Box::new(JsonFileStore::<SandboxMetadata>::in_cache(
                    cache,
                    "sandboxes",
                )))?,
                ContainerStore::load(Box::new(JsonFileStore::<ContainerMetadata>::in_cache(
                    cache,
                    "containers",
                )))?,
            )
        } else {
            (SandboxStore::new(), ContainerStore::new())
        };

        tracing::info!(
            cache = %cache.display(),
            pod_persistence = config.enable_pod_persistence,
            remotes = router.remotes().count(),
            "CRI dispatcher initialized"
        );

        Ok(Self {
            sandboxes,
            containers: Arc::new(containers),
            images,
            adapter,
            router,
            network: None,
            streaming,
        })
    }

    /// Use `plugin` for pod networking.
    pub fn with_network(mut self, plugin: Arc<dyn NetworkPlugin>) -> Self {
        self.network = Some(plugin);
        self
    }

    /// Container records, for the streaming runtime.
    pub fn container_store(&self) -> Arc<ContainerStore> {
        self.containers.clone()
    }

    /// Resolve a sandbox by ID. A sandbox with no record goes to the
    /// `default` remote when there is one.
    pub(crate) fn sandbox_target(&self, id: &str) -> Result<Target<'_, SandboxMetadata>> {
        match self.sandboxes.get(id) {
            Ok(sandbox) => match self.router.resolve(&sandbox.runtime_handler)? {
                Route::Local => Ok(Target::Local(sandbox)),
                Route::Remote(remote) => Ok(Target::Remote(remote)),
            },
            Err(err) => self.unknown_record(err),
        }
    }

    /// Resolve a container by ID, routing by its sandbox's handler.
    pub(crate) fn container_target(&self, id: &str) -> Result<Target<'_, ContainerMetadata>> {
        match self.containers.get(id) {
            Ok(container) => match self.router.resolve(container.runtime_handler())? {
                Route::Local => Ok(Target::Local(container)),
                Route::Remote(remote) => Ok(Target::Remote(remote)),
            },
            Err(err) => self.unknown_record(err),
        }
    }

    fn unknown_record<T>(&self, not_found: CriError) -> Result<Target<'_, T>> {
        match self.router.default_remote() {
            Some(remote) => Ok(Target::Remote(remote)),
            None => Err(not_found),
        }
    }

    /// Local container that must be running for streaming calls.
    pub(crate) fn require_running(container: &ContainerMetadata) -> Result<()> {
        if container.state != ContainerState::Running {
            return Err(CriError::Conflict(format!(
                "container {} is not started",
                container.id
            )));
        }
        Ok(())
    }

    /// Keep a record of a sandbox created on a remote backend so later calls
    /// by ID reach the same backend.
    pub(crate) fn shadow_sandbox(
        &self,
        id: &str,
        remote: &RemoteCri,
        config: multicri_core::api::PodSandboxConfig,
    ) {
        let mut shadow = SandboxMetadata::new(id.to_string(), config, remote.name().to_string());
        shadow.state = SandboxState::Ready;
        self.sandboxes.add(shadow);
    }

    /// Shadow record for a container created on a remote backend.
    pub(crate) fn shadow_container(
        &self,
        id: &str,
        sandbox_id: &str,
        remote: &RemoteCri,
        config: multicri_core::api::ContainerConfig,
    ) {
        let sandbox = match self.sandboxes.get(sandbox_id) {
            Ok(sandbox) => sandbox,
            Err(_) => {
                let mut sandbox = SandboxMetadata::new(
                    sandbox_id.to_string(),
                    Default::default(),
                    remote.name().to_string(),
                );
                sandbox.log_path = String::new();
                sandbox
            }
        };
        self.containers
            .add(ContainerMetadata::new(id.to_string(), sandbox, config, None));
    }
}
