//! Pod, container and image lifecycles through the CRI services.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tonic::{Code, Request};

use multicri_core::api::image_service_server::{ImageService, ImageServiceServer};
use multicri_core::api::runtime_service_server::{RuntimeService, RuntimeServiceServer};
use multicri_core::api::*;
use multicri_core::error::{CriError, Result};
use multicri_core::SandboxMetadata;
use multicri_cri::{CriService, NetworkPlugin, PodNetwork, RemoteCri, RemoteRouter, ServiceConfig};
use multicri_runtime::{FakeAdapter, StreamingServer};

const ALPINE: &str = "docker-repository.alpine:latest";

struct Harness {
    service: CriService,
    adapter: Arc<FakeAdapter>,
    _cache: tempfile::TempDir,
}

fn harness(router: RemoteRouter) -> Harness {
    let cache = tempfile::tempdir().unwrap();
    let streaming = StreamingServer::new("127.0.0.1:0".parse().unwrap());
    let adapter = Arc::new(FakeAdapter::new(streaming.handle()));
    let service = CriService::new(
        &ServiceConfig {
            cache_path: cache.path().to_path_buf(),
            enable_pod_persistence: true,
        },
        adapter.clone(),
        router,
        streaming.handle(),
    )
    .unwrap();
    Harness {
        service,
        adapter,
        _cache: cache,
    }
}

fn sandbox_config(name: &str, log_dir: &Path) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: format!("{}-uid", name),
            namespace: "default".to_string(),
            attempt: 0,
        }),
        log_directory: log_dir.join(name).to_string_lossy().into_owned(),
        ..Default::default()
    }
}

fn container_config(name: &str, image: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        }),
        image: Some(ImageSpec {
            image: image.to_string(),
            ..Default::default()
        }),
        command: vec!["sleep".to_string()],
        args: vec!["60".to_string()],
        ..Default::default()
    }
}

fn image_spec(image: &str) -> Option<ImageSpec> {
    Some(ImageSpec {
        image: image.to_string(),
        ..Default::default()
    })
}

async fn run_sandbox(service: &CriService, name: &str, log_dir: &Path) -> String {
    service
        .run_pod_sandbox(Request::new(RunPodSandboxRequest {
            config: Some(sandbox_config(name, log_dir)),
            runtime_handler: String::new(),
        }))
        .await
        .unwrap()
        .into_inner()
        .pod_sandbox_id
}

async fn pull(service: &CriService, image: &str) -> String {
    service
        .pull_image(Request::new(PullImageRequest {
            image: image_spec(image),
            auth: None,
            sandbox_config: None,
        }))
        .await
        .unwrap()
        .into_inner()
        .image_ref
}

async fn create_container(service: &CriService, sandbox_id: &str, log_dir: &Path) -> String {
    service
        .create_container(Request::new(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.to_string(),
            config: Some(container_config("app", ALPINE)),
            sandbox_config: Some(sandbox_config("pod1", log_dir)),
        }))
        .await
        .unwrap()
        .into_inner()
        .container_id
}

async fn container_status(
    service: &CriService,
    id: &str,
) -> std::result::Result<ContainerStatus, tonic::Status> {
    service
        .container_status(Request::new(ContainerStatusRequest {
            container_id: id.to_string(),
            verbose: false,
        }))
        .await
        .map(|r| r.into_inner().status.unwrap())
}

async fn start(service: &CriService, id: &str) -> std::result::Result<(), tonic::Status> {
    service
        .start_container(Request::new(StartContainerRequest {
            container_id: id.to_string(),
        }))
        .await
        .map(|_| ())
}

async fn stop_container(service: &CriService, id: &str) {
    service
        .stop_container(Request::new(StopContainerRequest {
            container_id: id.to_string(),
            timeout: 10,
        }))
        .await
        .unwrap();
}

async fn remove_container(service: &CriService, id: &str) -> std::result::Result<(), tonic::Status> {
    service
        .remove_container(Request::new(RemoveContainerRequest {
            container_id: id.to_string(),
        }))
        .await
        .map(|_| ())
}

async fn stop_sandbox(service: &CriService, id: &str) -> std::result::Result<(), tonic::Status> {
    service
        .stop_pod_sandbox(Request::new(StopPodSandboxRequest {
            pod_sandbox_id: id.to_string(),
        }))
        .await
        .map(|_| ())
}

async fn remove_sandbox(service: &CriService, id: &str) -> std::result::Result<(), tonic::Status> {
    service
        .remove_pod_sandbox(Request::new(RemovePodSandboxRequest {
            pod_sandbox_id: id.to_string(),
        }))
        .await
        .map(|_| ())
}

async fn list_sandboxes(service: &CriService) -> Vec<PodSandbox> {
    service
        .list_pod_sandbox(Request::new(ListPodSandboxRequest { filter: None }))
        .await
        .unwrap()
        .into_inner()
        .items
}

#[tokio::test]
async fn test_container_lifecycle() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();

    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    assert_eq!(sandbox_id, "pod1-uid");
    assert_eq!(pull(&h.service, ALPINE).await, "docker://alpine:latest");

    let id = create_container(&h.service, &sandbox_id, logs.path()).await;
    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerCreated as i32);

    start(&h.service, &id).await.unwrap();
    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerRunning as i32);
    assert!(status.started_at > 0);

    stop_container(&h.service, &id).await;
    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerExited as i32);
    assert!(status.finished_at >= status.started_at);

    remove_container(&h.service, &id).await.unwrap();
    let err = container_status(&h.service, &id).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_start_running_container_conflicts() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    pull(&h.service, ALPINE).await;
    let id = create_container(&h.service, &sandbox_id, logs.path()).await;
    start(&h.service, &id).await.unwrap();

    let err = start(&h.service, &id).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("already started"));

    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerRunning as i32);
}

#[tokio::test]
async fn test_failed_start_marks_container_exited() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    pull(&h.service, ALPINE).await;
    let id = create_container(&h.service, &sandbox_id, logs.path()).await;

    h.adapter.set_fail_start(true);
    assert!(start(&h.service, &id).await.is_err());

    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerExited as i32);
    assert_eq!(status.exit_code, 1);
    assert_eq!(status.reason, "ContainerCannotRun");

    let err = start(&h.service, &id).await.unwrap_err();
    assert!(err.message().contains("failed container"));
}

#[tokio::test]
async fn test_unsupported_image_prefix_is_rejected() {
    let h = harness(RemoteRouter::new());

    let err = h
        .service
        .pull_image(Request::new(PullImageRequest {
            image: image_spec("foo.bar:latest"),
            auth: None,
            sandbox_config: None,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let images = h
        .service
        .list_images(Request::new(ListImagesRequest { filter: None }))
        .await
        .unwrap()
        .into_inner()
        .images;
    assert!(images.is_empty());
}

#[tokio::test]
async fn test_image_status_and_remove() {
    let h = harness(RemoteRouter::new());
    pull(&h.service, ALPINE).await;

    let status = h
        .service
        .image_status(Request::new(ImageStatusRequest {
            image: image_spec(ALPINE),
            verbose: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.image.unwrap().id, "docker://alpine:latest");

    h.service
        .remove_image(Request::new(RemoveImageRequest {
            image: image_spec(ALPINE),
        }))
        .await
        .unwrap();

    let status = h
        .service
        .image_status(Request::new(ImageStatusRequest {
            image: image_spec(ALPINE),
            verbose: false,
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(status.image.is_none());

    let err = h
        .service
        .remove_image(Request::new(RemoveImageRequest {
            image: image_spec(ALPINE),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_remove_is_not_idempotent() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    pull(&h.service, ALPINE).await;
    let id = create_container(&h.service, &sandbox_id, logs.path()).await;

    remove_container(&h.service, &id).await.unwrap();
    let err = remove_container(&h.service, &id).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    stop_sandbox(&h.service, &sandbox_id).await.unwrap();
    remove_sandbox(&h.service, &sandbox_id).await.unwrap();
    let err = remove_sandbox(&h.service, &sandbox_id).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_ready_sandbox_is_busy() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;

    let err = remove_sandbox(&h.service, &sandbox_id).await.unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    assert!(err.message().contains("busy"));
    assert_eq!(list_sandboxes(&h.service).await.len(), 1);
}

#[tokio::test]
async fn test_stop_sandbox_stops_containers() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    pull(&h.service, ALPINE).await;
    let id = create_container(&h.service, &sandbox_id, logs.path()).await;
    start(&h.service, &id).await.unwrap();

    stop_sandbox(&h.service, &sandbox_id).await.unwrap();
    let status = container_status(&h.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerExited as i32);

    let sandboxes = list_sandboxes(&h.service).await;
    assert_eq!(sandboxes[0].state, PodSandboxState::SandboxNotready as i32);

    remove_sandbox(&h.service, &sandbox_id).await.unwrap();
    let err = container_status(&h.service, &id).await.unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn test_sandbox_status_reports_loopback() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;

    let status = h
        .service
        .pod_sandbox_status(Request::new(PodSandboxStatusRequest {
            pod_sandbox_id: sandbox_id,
            verbose: false,
        }))
        .await
        .unwrap()
        .into_inner()
        .status
        .unwrap();
    assert_eq!(status.network.unwrap().ip, "127.0.0.1");
    assert_eq!(status.state, PodSandboxState::SandboxReady as i32);
}

#[tokio::test]
async fn test_exec_sync_requires_running_container() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;
    pull(&h.service, ALPINE).await;
    let id = create_container(&h.service, &sandbox_id, logs.path()).await;

    let request = || ExecSyncRequest {
        container_id: id.clone(),
        cmd: vec!["echo".to_string(), "hi".to_string()],
        timeout: 0,
    };
    let err = h.service.exec_sync(Request::new(request())).await.unwrap_err();
    assert!(err.message().contains("is not started"));

    start(&h.service, &id).await.unwrap();
    let response = h
        .service
        .exec_sync(Request::new(request()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(response.stdout, b"echo hi");
    assert_eq!(response.exit_code, 0);
}

#[tokio::test]
async fn test_port_forward_returns_url() {
    let h = harness(RemoteRouter::new());
    let logs = tempfile::tempdir().unwrap();
    let sandbox_id = run_sandbox(&h.service, "pod1", logs.path()).await;

    let url = h
        .service
        .port_forward(Request::new(PortForwardRequest {
            pod_sandbox_id: sandbox_id,
            port: vec![8080],
        }))
        .await
        .unwrap()
        .into_inner()
        .url;
    assert!(url.contains("/portforward/"));
}

#[tokio::test]
async fn test_records_survive_restart() {
    let cache = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let config = ServiceConfig {
        cache_path: cache.path().to_path_buf(),
        enable_pod_persistence: true,
    };
    let build = || {
        let streaming = StreamingServer::new("127.0.0.1:0".parse().unwrap());
        CriService::new(
            &config,
            Arc::new(FakeAdapter::new(streaming.handle())),
            RemoteRouter::new(),
            streaming.handle(),
        )
        .unwrap()
    };

    let service = build();
    let sandbox_id = run_sandbox(&service, "pod1", logs.path()).await;
    pull(&service, ALPINE).await;
    let id = create_container(&service, &sandbox_id, logs.path()).await;
    drop(service);

    let service = build();
    assert_eq!(list_sandboxes(&service).await.len(), 1);
    let status = container_status(&service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerCreated as i32);
}

// ── Network ──────────────────────────────────────────────────────────

struct FailingNetwork;

#[async_trait]
impl NetworkPlugin for FailingNetwork {
    fn name(&self) -> &str {
        "failing"
    }

    async fn setup(&self, _sandbox: &SandboxMetadata) -> Result<PodNetwork> {
        Err(CriError::Other("no addresses left".to_string()))
    }

    async fn teardown(&self, _sandbox: &SandboxMetadata) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<()> {
        Err(CriError::Other("plugin not initialized".to_string()))
    }
}

#[tokio::test]
async fn test_network_failure_rolls_back_sandbox() {
    let h = harness(RemoteRouter::new());
    let service = h.service.with_network(Arc::new(FailingNetwork));
    let logs = tempfile::tempdir().unwrap();

    let err = service
        .run_pod_sandbox(Request::new(RunPodSandboxRequest {
            config: Some(sandbox_config("pod1", logs.path())),
            runtime_handler: String::new(),
        }))
        .await
        .unwrap_err();
    assert!(err.message().contains("no addresses left"));
    assert!(list_sandboxes(&service).await.is_empty());

    let status = service
        .status(Request::new(StatusRequest { verbose: false }))
        .await
        .unwrap()
        .into_inner()
        .status
        .unwrap();
    let network = status
        .conditions
        .iter()
        .find(|c| c.r#type == "NetworkReady")
        .unwrap();
    assert!(!network.status);
    assert!(network.message.contains("failing"));
}

// ── Remote delegation ────────────────────────────────────────────────

/// Serve a fake-backed runtime on a Unix socket and return its endpoint.
fn spawn_backend(dir: &Path) -> String {
    let Harness { service, _cache, .. } = harness(RemoteRouter::new());
    let service = Arc::new(service);
    let socket = dir.join("backend.sock");
    let listener = UnixListener::bind(&socket).unwrap();

    tokio::spawn(async move {
        let _cache = _cache;
        Server::builder()
            .add_service(RuntimeServiceServer::from_arc(service.clone()))
            .add_service(ImageServiceServer::from_arc(service))
            .serve_with_incoming(UnixListenerStream::new(listener))
            .await
            .unwrap();
    });

    format!("unix://{}", socket.display())
}

fn remote_router(endpoint: &str) -> RemoteRouter {
    let mut router = RemoteRouter::new();
    router.register(RemoteCri::connect("default", endpoint).unwrap());
    router
}

#[tokio::test]
async fn test_default_handler_delegates_to_remote() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = spawn_backend(dir.path());
    let front = harness(remote_router(&endpoint));
    let logs = tempfile::tempdir().unwrap();

    let sandbox_id = run_sandbox(&front.service, "pod1", logs.path()).await;
    let sandboxes = list_sandboxes(&front.service).await;
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].id, sandbox_id);

    pull(&front.service, ALPINE).await;
    let id = create_container(&front.service, &sandbox_id, logs.path()).await;
    start(&front.service, &id).await.unwrap();
    let status = container_status(&front.service, &id).await.unwrap();
    assert_eq!(status.state, ContainerState::ContainerRunning as i32);

    stop_container(&front.service, &id).await;
    remove_container(&front.service, &id).await.unwrap();
    stop_sandbox(&front.service, &sandbox_id).await.unwrap();
    remove_sandbox(&front.service, &sandbox_id).await.unwrap();
    assert!(list_sandboxes(&front.service).await.is_empty());
}

#[tokio::test]
async fn test_local_handler_bypasses_remote() {
    let dir = tempfile::tempdir().unwrap();
    let endpoint = spawn_backend(dir.path());
    let front = harness(remote_router(&endpoint));
    let logs = tempfile::tempdir().unwrap();

    let response = front
        .service
        .run_pod_sandbox(Request::new(RunPodSandboxRequest {
            config: Some(sandbox_config("pod1", logs.path())),
            runtime_handler: "multicri".to_string(),
        }))
        .await
        .unwrap()
        .into_inner();

    let local = list_sandboxes(&front.service).await;
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, response.pod_sandbox_id);
    assert_eq!(local[0].runtime_handler, "multicri");

    let err = front
        .service
        .run_pod_sandbox(Request::new(RunPodSandboxRequest {
            config: Some(sandbox_config("pod2", logs.path())),
            runtime_handler: "tpu".to_string(),
        }))
        .await
        .unwrap_err();
    assert!(err.message().contains("remote runtime not found"));

    let labels: HashMap<String, String> = HashMap::new();
    let filtered = front
        .service
        .list_pod_sandbox(Request::new(ListPodSandboxRequest {
            filter: Some(PodSandboxFilter {
                id: response.pod_sandbox_id.clone(),
                state: None,
                label_selector: labels,
            }),
        }))
        .await
        .unwrap()
        .into_inner()
        .items;
    assert_eq!(filtered.len(), 1);
}
