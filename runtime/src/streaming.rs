//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP
//!
//! Sessions are one-shot: the token is consumed by the first connection.
//! Batch jobs have no interactive terminal, so exec runs the command to
//! completion and attach returns the output captured so far.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;

use crate::adapter::StreamRuntime;

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone, Default)]
pub struct StreamingSession {
    /// Type of streaming operation.
    pub kind: SessionKind,
    /// Container ID (exec and attach).
    pub container_id: String,
    /// Sandbox ID (port-forward).
    pub sandbox_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    /// Whether to allocate a TTY.
    pub tty: bool,
    /// Whether stdin is requested.
    pub stdin: bool,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
}

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKind {
    #[default]
    Exec,
    Attach,
    PortForward,
}

impl SessionKind {
    fn path(&self) -> &'static str {
        match self {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        }
    }
}

type Sessions = Arc<RwLock<HashMap<String, StreamingSession>>>;

/// CRI streaming server that handles HTTP connections from kubelet.
pub struct StreamingServer {
    addr: SocketAddr,
    sessions: Sessions,
}

impl StreamingServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a handle for registering sessions.
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Serve sessions against `runtime` until the listener fails.
    pub async fn serve(
        self,
        runtime: Arc<dyn StreamRuntime>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "CRI streaming server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let sessions = self.sessions.clone();
            let runtime = runtime.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, sessions, runtime).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Handle for registering streaming sessions from the CRI gRPC service.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: Sessions,
}

impl StreamingHandle {
    /// Register a streaming session and return the URL for kubelet to connect to.
    pub async fn register(&self, session: StreamingSession) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let kind = session.kind.path();
        self.sessions.write().await.insert(token.clone(), session);
        format!("http://{}/{}/{}", self.addr, kind, token)
    }

    /// Number of sessions not yet consumed.
    pub async fn pending(&self) -> usize {
        self.sessions.read().await.len()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: Sessions,
    runtime: Arc<dyn StreamRuntime>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(&mut stream, 400, "text/plain", b"Bad Request").await;
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    if segments.len() != 2 {
        return send_response(&mut stream, 404, "text/plain", b"Not Found").await;
    }
    let (kind, token) = (segments[0], segments[1]);

    let removed = sessions.write().await.remove(token);
    let session = match removed {
        Some(s) if s.kind.path() == kind => s,
        _ => {
            return send_response(
                &mut stream,
                404,
                "text/plain",
                b"Session not found or expired",
            )
            .await
        }
    };

    tracing::info!(
        peer = %peer,
        kind = %kind,
        container_id = %session.container_id,
        sandbox_id = %session.sandbox_id,
        "Streaming session started"
    );

    match session.kind {
        SessionKind::Exec => match runtime.exec(&session.container_id, &session.cmd).await {
            Ok(output) => {
                let engine = base64::engine::general_purpose::STANDARD;
                let body = serde_json::json!({
                    "exitCode": output.exit_code,
                    "stdout": engine.encode(&output.stdout),
                    "stderr": engine.encode(&output.stderr),
                });
                send_response(&mut stream, 200, "application/json", body.to_string().as_bytes())
                    .await
            }
            Err(e) => send_error(&mut stream, &e).await,
        },
        SessionKind::Attach => match runtime.attach(&session.container_id).await {
            Ok(output) => send_response(&mut stream, 200, "text/plain", &output).await,
            Err(e) => send_error(&mut stream, &e).await,
        },
        SessionKind::PortForward => {
            for port in &session.ports {
                if let Err(e) = runtime.port_forward(&session.sandbox_id, *port).await {
                    return send_error(&mut stream, &e).await;
                }
            }
            send_response(&mut stream, 200, "text/plain", b"").await
        }
    }
}

async fn send_error(
    stream: &mut TcpStream,
    err: &multicri_core::CriError,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use multicri_core::CriError;

    let status = match err {
        CriError::NotFound { .. } => 404,
        CriError::Conflict(_) => 409,
        CriError::Unsupported(_) => 501,
        _ => 500,
    };
    send_response(stream, status, "text/plain", err.to_string().as_bytes()).await
}

async fn send_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        501 => "Not Implemented",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(body).await?;
    Ok(())
}
