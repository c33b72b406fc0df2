//! CRI RuntimeService implementation.
//!
//! Each call resolves its target first: a registered remote backend gets the
//! request verbatim, otherwise the metadata store and the adapter serve it.
//! Local calls follow store write, adapter call, store write, and never hold a
//! store lock across the adapter call.

use std::collections::HashMap;

use futures::future::try_join_all;
use tonic::{Request, Response, Status};

use multicri_core::api::runtime_service_server::RuntimeService;
use multicri_core::api::*;
use multicri_core::metadata::{now_nanos, REASON_CANNOT_RUN};
use multicri_core::{ContainerMetadata, ContainerState, SandboxMetadata, SandboxState};
use multicri_runtime::{SessionKind, StreamingSession};

use crate::error::cri_error_to_status;
use crate::network::LOOPBACK_IP;
use crate::remote::Route;
use crate::service::{CriService, Target};
use crate::store::container::container_stats;

/// Condition types reported by Status.
const RUNTIME_READY: &str = "RuntimeReady";
const NETWORK_READY: &str = "NetworkReady";

fn condition(kind: &str, ready: bool, message: String) -> RuntimeCondition {
    RuntimeCondition {
        r#type: kind.to_string(),
        status: ready,
        reason: if ready {
            String::new()
        } else {
            format!("{}NotReady", kind)
        },
        message,
    }
}

impl CriService {
    /// Tear down networking for a sandbox if it has any.
    async fn teardown_network(&self, sandbox: &SandboxMetadata) -> Result<(), Status> {
        if sandbox.netns_path.is_empty() {
            return Ok(());
        }
        if let Some(network) = &self.network {
            network
                .teardown(sandbox)
                .await
                .map_err(cri_error_to_status)?;
        }
        Ok(())
    }

    /// Stop every running container of a local sandbox.
    async fn stop_sandbox_containers(&self, sandbox_id: &str) -> Result<(), Status> {
        for mut container in self.containers.by_sandbox(sandbox_id) {
            if container.state != ContainerState::Running {
                continue;
            }
            self.adapter
                .stop_container(&mut container)
                .await
                .map_err(cri_error_to_status)?;
            container.state = ContainerState::Exited;
            container.finished_at = now_nanos();
            self.containers.update(container);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl RuntimeService for CriService {
    // ── Version ──────────────────────────────────────────────────────

    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        Ok(Response::new(self.adapter.version()))
    }

    // ── Pod Sandbox ──────────────────────────────────────────────────

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let config = req
            .config
            .clone()
            .ok_or_else(|| Status::invalid_argument("sandbox config required"))?;
        let metadata = config
            .metadata
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("sandbox metadata required"))?;

        tracing::info!(
            name = %metadata.name,
            namespace = %metadata.namespace,
            handler = %req.runtime_handler,
            "CRI RunPodSandbox"
        );

        let route = self
            .router
            .resolve(&req.runtime_handler)
            .map_err(cri_error_to_status)?;
        if let Route::Remote(remote) = route {
            let response = remote.runtime().run_pod_sandbox(req).await?.into_inner();
            self.shadow_sandbox(&response.pod_sandbox_id, remote, config);
            return Ok(Response::new(response));
        }

        let sandbox_id = if metadata.uid.is_empty() {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            metadata.uid.clone()
        };
        let handler = self.router.local_handler(&req.runtime_handler);
        let mut sandbox = SandboxMetadata::new(sandbox_id.clone(), config, handler);

        if let Err(e) = std::fs::create_dir_all(&sandbox.log_path) {
            tracing::warn!(
                sandbox_id = %sandbox_id,
                path = %sandbox.log_path,
                error = %e,
                "Failed to create sandbox log directory"
            );
        }
        self.sandboxes.add(sandbox.clone());

        if let Some(network) = &self.network {
            if !sandbox.host_network() {
                match network.setup(&sandbox).await {
                    Ok(pod_network) => {
                        sandbox.netns_path = pod_network.netns_path;
                        sandbox.ip = pod_network.ip;
                    }
                    Err(e) => {
                        self.sandboxes.remove(&sandbox_id);
                        return Err(cri_error_to_status(e));
                    }
                }
            }
        }

        if let Err(e) = self.adapter.run_pod_sandbox(&mut sandbox).await {
            if let Err(teardown) = self.teardown_network(&sandbox).await {
                tracing::warn!(sandbox_id = %sandbox_id, error = %teardown, "Network teardown failed during rollback");
            }
            self.sandboxes.remove(&sandbox_id);
            return Err(cri_error_to_status(e));
        }

        sandbox.state = SandboxState::Ready;
        self.sandboxes.update(sandbox);

        Ok(Response::new(RunPodSandboxResponse {
            pod_sandbox_id: sandbox_id,
        }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();

        tracing::info!(sandbox_id = %sandbox_id, "CRI StopPodSandbox");

        let mut sandbox = match self
            .sandbox_target(&sandbox_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => {
                let response = remote.runtime().stop_pod_sandbox(req).await?;
                if let Ok(mut shadow) = self.sandboxes.get(&sandbox_id) {
                    shadow.state = SandboxState::NotReady;
                    self.sandboxes.update(shadow);
                }
                return Ok(response);
            }
            Target::Local(sandbox) => sandbox,
        };

        self.stop_sandbox_containers(&sandbox_id).await?;
        self.teardown_network(&sandbox).await?;
        self.adapter
            .stop_pod_sandbox(&mut sandbox)
            .await
            .map_err(cri_error_to_status)?;

        sandbox.state = SandboxState::NotReady;
        sandbox.ip = String::new();
        self.sandboxes.update(sandbox);

        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();

        tracing::info!(sandbox_id = %sandbox_id, "CRI RemovePodSandbox");

        let mut sandbox = match self
            .sandbox_target(&sandbox_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => {
                let response = remote.runtime().remove_pod_sandbox(req).await?;
                self.sandboxes.remove(&sandbox_id);
                self.containers.remove_by_sandbox(&sandbox_id);
                return Ok(response);
            }
            Target::Local(sandbox) => sandbox,
        };

        if sandbox.state == SandboxState::Ready {
            return Err(Status::failed_precondition(format!(
                "sandbox {} is busy: stop it before removing",
                sandbox_id
            )));
        }

        self.adapter
            .remove_pod_sandbox(&mut sandbox)
            .await
            .map_err(cri_error_to_status)?;

        let removed = self.containers.remove_by_sandbox(&sandbox_id);
        tracing::debug!(sandbox_id = %sandbox_id, containers = removed.len(), "Removed sandbox containers");
        self.sandboxes.remove(&sandbox_id);

        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();

        let mut sandbox = match self
            .sandbox_target(&sandbox_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().pod_sandbox_status(req).await,
            Target::Local(sandbox) => sandbox,
        };

        self.adapter
            .pod_sandbox_status(&mut sandbox)
            .await
            .map_err(cri_error_to_status)?;

        let mut ip = sandbox.ip.clone();
        if ip.is_empty() && self.network.is_none() {
            ip = LOOPBACK_IP.to_string();
        }
        self.sandboxes.update(sandbox.clone());

        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(sandbox.to_status(&ip)),
            info: HashMap::new(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let req = request.into_inner();

        let mut items = self
            .sandboxes
            .list_k8s(req.filter.as_ref(), |handler| self.router.is_local(handler));
        let remote = try_join_all(self.router.remotes().map(|remote| {
            let req = req.clone();
            async move { remote.runtime().list_pod_sandbox(req).await }
        }))
        .await?;
        items.extend(remote.into_iter().flat_map(|r| r.into_inner().items));

        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    // ── Container ────────────────────────────────────────────────────

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();
        let config = req
            .config
            .clone()
            .ok_or_else(|| Status::invalid_argument("container config required"))?;

        tracing::info!(
            sandbox_id = %sandbox_id,
            name = %config.metadata.as_ref().map(|m| m.name.as_str()).unwrap_or(""),
            "CRI CreateContainer"
        );

        let sandbox = match self
            .sandbox_target(&sandbox_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => {
                let response = remote.runtime().create_container(req).await?.into_inner();
                self.shadow_container(&response.container_id, &sandbox_id, remote, config);
                return Ok(Response::new(response));
            }
            Target::Local(sandbox) => sandbox,
        };

        let image_ref = config
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or("");
        let (_, image_ref) = self.router.resolve_image(image_ref);
        let image = self.images.get(image_ref).map_err(cri_error_to_status)?;

        let container_id = uuid::Uuid::new_v4().simple().to_string();
        let mut container =
            ContainerMetadata::new(container_id.clone(), sandbox, config, Some(image));
        self.containers.add(container.clone());

        self.adapter
            .create_container(&mut container)
            .await
            .map_err(cri_error_to_status)?;

        if let Some(image) = &container.image {
            self.images.update(image.clone());
        }
        self.containers.update(container);
        self.sandboxes
            .add_container(&sandbox_id, &container_id)
            .map_err(cri_error_to_status)?;

        Ok(Response::new(CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, "CRI StartContainer");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().start_container(req).await,
            Target::Local(container) => container,
        };

        match container.state {
            ContainerState::Created => {}
            ContainerState::Running => {
                return Err(Status::failed_precondition(format!(
                    "container {} is already started",
                    container_id
                )))
            }
            _ => {
                return Err(Status::failed_precondition(format!(
                    "container {} is a failed container",
                    container_id
                )))
            }
        }

        if let Err(e) = self.adapter.start_container(&mut container).await {
            tracing::warn!(container_id = %container_id, error = %e, "Container failed to start");
            container.mark_exited(1, REASON_CANNOT_RUN, now_nanos());
            self.containers.update(container);
            return Err(cri_error_to_status(e));
        }

        container.state = ContainerState::Running;
        container.started_at = now_nanos();
        self.containers.update(container);

        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, timeout = req.timeout, "CRI StopContainer");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().stop_container(req).await,
            Target::Local(container) => container,
        };

        if container.state != ContainerState::Running {
            return Ok(Response::new(StopContainerResponse {}));
        }

        self.adapter
            .stop_container(&mut container)
            .await
            .map_err(cri_error_to_status)?;

        container.state = ContainerState::Exited;
        container.finished_at = now_nanos();
        self.containers.update(container);

        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, "CRI RemoveContainer");

        let container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => {
                let response = remote.runtime().remove_container(req).await?;
                self.containers.remove(&container_id);
                return Ok(response);
            }
            Target::Local(container) => container,
        };

        if container.state == ContainerState::Running {
            return Err(Status::failed_precondition(format!(
                "container {} is running: stop it before removing",
                container_id
            )));
        }

        self.containers.remove(&container_id);
        self.sandboxes
            .remove_container(container.sandbox_id(), &container_id)
            .map_err(cri_error_to_status)?;

        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let req = request.into_inner();

        let mut containers = self
            .containers
            .list_k8s(req.filter.as_ref(), |handler| self.router.is_local(handler));
        let remote = try_join_all(self.router.remotes().map(|remote| {
            let req = req.clone();
            async move { remote.runtime().list_containers(req).await }
        }))
        .await?;
        containers.extend(remote.into_iter().flat_map(|r| r.into_inner().containers));

        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().container_status(req).await,
            Target::Local(container) => container,
        };

        if container.state != ContainerState::Exited {
            if let Err(e) = self.adapter.container_status(&mut container).await {
                tracing::warn!(container_id = %container_id, error = %e, "Container status failed, marking exited");
                container.mark_exited(1, e.to_string(), now_nanos());
            }
            self.containers.update(container.clone());
        }

        Ok(Response::new(ContainerStatusResponse {
            status: Some(container.to_status()),
            info: HashMap::new(),
        }))
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, "CRI UpdateContainerResources");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => {
                return remote.runtime().update_container_resources(req).await
            }
            Target::Local(container) => container,
        };

        self.adapter
            .update_container_resources(&mut container, req.linux.as_ref())
            .await
            .map_err(cri_error_to_status)?;
        self.containers.update(container);

        Ok(Response::new(UpdateContainerResourcesResponse {}))
    }

    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().reopen_container_log(req).await,
            Target::Local(container) => container,
        };

        self.adapter
            .reopen_container_log(&mut container)
            .await
            .map_err(cri_error_to_status)?;

        Ok(Response::new(ReopenContainerLogResponse {}))
    }

    // ── Streaming ────────────────────────────────────────────────────

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, cmd = ?req.cmd, "CRI ExecSync");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().exec_sync(req).await,
            Target::Local(container) => container,
        };
        CriService::require_running(&container).map_err(cri_error_to_status)?;

        let response = self
            .adapter
            .exec_sync(&mut container, &req.cmd, req.timeout)
            .await
            .map_err(cri_error_to_status)?;

        Ok(Response::new(response))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, cmd = ?req.cmd, "CRI Exec");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().exec(req).await,
            Target::Local(container) => container,
        };
        CriService::require_running(&container).map_err(cri_error_to_status)?;

        let response = self
            .adapter
            .exec(&mut container, &req)
            .await
            .map_err(cri_error_to_status)?;

        Ok(Response::new(response))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let req = request.into_inner();
        let container_id = req.container_id.clone();

        tracing::info!(container_id = %container_id, "CRI Attach");

        let mut container = match self
            .container_target(&container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().attach(req).await,
            Target::Local(container) => container,
        };
        CriService::require_running(&container).map_err(cri_error_to_status)?;

        let response = self
            .adapter
            .attach(&mut container, &req)
            .await
            .map_err(cri_error_to_status)?;

        Ok(Response::new(response))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = req.pod_sandbox_id.clone();

        tracing::info!(sandbox_id = %sandbox_id, ports = ?req.port, "CRI PortForward");

        match self
            .sandbox_target(&sandbox_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().port_forward(req).await,
            Target::Local(_) => {}
        }

        let url = self
            .streaming
            .register(StreamingSession {
                kind: SessionKind::PortForward,
                sandbox_id,
                ports: req.port,
                ..Default::default()
            })
            .await;

        Ok(Response::new(PortForwardResponse { url }))
    }

    // ── Stats ────────────────────────────────────────────────────────

    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        let req = request.into_inner();

        let container = match self
            .container_target(&req.container_id)
            .map_err(cri_error_to_status)?
        {
            Target::Remote(remote) => return remote.runtime().container_stats(req).await,
            Target::Local(container) => container,
        };

        Ok(Response::new(ContainerStatsResponse {
            stats: Some(container_stats(&container)),
        }))
    }

    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        let req = request.into_inner();

        let mut stats = self
            .containers
            .list_stats(req.filter.as_ref(), |handler| self.router.is_local(handler));
        let remote = try_join_all(self.router.remotes().map(|remote| {
            let req = req.clone();
            async move { remote.runtime().list_container_stats(req).await }
        }))
        .await?;
        stats.extend(remote.into_iter().flat_map(|r| r.into_inner().stats));

        Ok(Response::new(ListContainerStatsResponse { stats }))
    }

    // ── Runtime ──────────────────────────────────────────────────────

    async fn update_runtime_config(
        &self,
        _request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let network = match &self.network {
            Some(plugin) => match plugin.status().await {
                Ok(()) => condition(NETWORK_READY, true, String::new()),
                Err(e) => condition(
                    NETWORK_READY,
                    false,
                    format!("network plugin {} is not ready: {}", plugin.name(), e),
                ),
            },
            None => condition(NETWORK_READY, true, String::new()),
        };

        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![condition(RUNTIME_READY, true, String::new()), network],
            }),
            info: HashMap::new(),
        }))
    }
}
