//! SSH implementation of [`RemoteShell`] on top of libssh2.
//!
//! libssh2 is blocking, so every operation runs on the blocking thread pool
//! with its own session.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use multicri_core::error::{CriError, Result};
use ssh2::Session;

use super::{
    ClusterAuth, ClusterCredentials, CommandOutput, OutputSink, RemoteShell, RemoteTask,
    ShellConnector,
};

/// Connection and handshake timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const READ_CHUNK: usize = 16 * 1024;

/// Opens [`SshClient`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl ShellConnector for SshConnector {
    fn connect(&self, credentials: &ClusterCredentials) -> Arc<dyn RemoteShell> {
        Arc::new(SshClient::new(credentials.clone()))
    }
}

/// SSH shell bound to one set of cluster credentials.
///
/// The host key is not verified.
#[derive(Debug, Clone)]
pub struct SshClient {
    credentials: ClusterCredentials,
}

impl SshClient {
    pub fn new(credentials: ClusterCredentials) -> Self {
        Self { credentials }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.credentials.host, self.credentials.port)
    }
}

fn open_session(credentials: &ClusterCredentials, context: &str) -> Result<Session> {
    let fail = |e: &dyn std::fmt::Display| CriError::transport(context, e);
    let address = format!("{}:{}", credentials.host, credentials.port);

    let socket_addr = address
        .to_socket_addrs()
        .map_err(|e| fail(&e))?
        .next()
        .ok_or_else(|| fail(&format!("cannot resolve {}", address)))?;
    let tcp = TcpStream::connect_timeout(&socket_addr, CONNECT_TIMEOUT).map_err(|e| fail(&e))?;

    let mut session = Session::new().map_err(|e| fail(&e))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
    session.handshake().map_err(|e| fail(&e))?;

    match &credentials.auth {
        ClusterAuth::Key(key) => session.userauth_pubkey_memory(&credentials.user, None, key, None),
        ClusterAuth::Password(password) => session.userauth_password(&credentials.user, password),
    }
    .map_err(|e| fail(&e))?;
    if !session.authenticated() {
        return Err(fail(&format!(
            "authentication failed for {}@{}",
            credentials.user, address
        )));
    }

    // Image pulls and job submissions can outlast the handshake timeout.
    session.set_timeout(0);
    Ok(session)
}

fn run_blocking(credentials: &ClusterCredentials, command: &str) -> Result<CommandOutput> {
    let session = open_session(credentials, command)?;
    let fail = |e: &dyn std::fmt::Display| CriError::transport(command, e);

    let mut channel = session.channel_session().map_err(|e| fail(&e))?;
    channel.exec(command).map_err(|e| fail(&e))?;

    let mut stdout = Vec::new();
    channel.read_to_end(&mut stdout).map_err(|e| fail(&e))?;
    let mut stderr = Vec::new();
    {
        let mut err_stream = channel.stderr();
        err_stream.read_to_end(&mut stderr).map_err(|e| fail(&e))?;
    }

    channel.wait_close().map_err(|e| fail(&e))?;
    let exit_status = channel.exit_status().map_err(|e| fail(&e))?;

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_status,
    })
}

fn stream_blocking(
    credentials: &ClusterCredentials,
    command: &str,
    mut stdout: OutputSink,
    mut stderr: OutputSink,
) -> Result<i32> {
    let session = open_session(credentials, command)?;
    let fail = |e: &dyn std::fmt::Display| CriError::transport(command, e);

    let mut channel = session.channel_session().map_err(|e| fail(&e))?;
    channel.exec(command).map_err(|e| fail(&e))?;

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = channel.read(&mut buf).map_err(|e| fail(&e))?;
        if n == 0 {
            break;
        }
        stdout.write_all(&buf[..n]).map_err(|e| fail(&e))?;
    }
    {
        let mut err_stream = channel.stderr();
        loop {
            let n = err_stream.read(&mut buf).map_err(|e| fail(&e))?;
            if n == 0 {
                break;
            }
            stderr.write_all(&buf[..n]).map_err(|e| fail(&e))?;
        }
    }
    stdout.flush().map_err(|e| fail(&e))?;
    stderr.flush().map_err(|e| fail(&e))?;

    channel.wait_close().map_err(|e| fail(&e))?;
    channel.exit_status().map_err(|e| fail(&e))
}

fn upload_blocking(
    credentials: &ClusterCredentials,
    contents: &[u8],
    destination: &str,
    mode: i32,
) -> Result<()> {
    let context = format!("scp -t {}", destination);
    let session = open_session(credentials, &context)?;
    let fail = |e: &dyn std::fmt::Display| CriError::transport(&context, e);

    let mut remote = session
        .scp_send(Path::new(destination), mode, contents.len() as u64, None)
        .map_err(|e| fail(&e))?;
    remote.write_all(contents).map_err(|e| fail(&e))?;
    remote.send_eof().map_err(|e| fail(&e))?;
    remote.wait_eof().map_err(|e| fail(&e))?;
    remote.close().map_err(|e| fail(&e))?;
    remote.wait_close().map_err(|e| fail(&e))?;
    Ok(())
}

fn download_blocking(
    credentials: &ClusterCredentials,
    source: &str,
    destination: &Path,
) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let context = format!("scp -f {}", source);
    let session = open_session(credentials, &context)?;
    let fail = |e: &dyn std::fmt::Display| CriError::transport(&context, e);

    let (mut remote, stat) = session.scp_recv(Path::new(source)).map_err(|e| fail(&e))?;
    let mut contents = Vec::with_capacity(stat.size() as usize);
    remote.read_to_end(&mut contents).map_err(|e| fail(&e))?;
    remote.send_eof().map_err(|e| fail(&e))?;
    remote.wait_eof().map_err(|e| fail(&e))?;
    remote.close().map_err(|e| fail(&e))?;
    remote.wait_close().map_err(|e| fail(&e))?;

    std::fs::write(destination, &contents)?;
    let mode = (stat.mode() as u32) & 0o777;
    std::fs::set_permissions(destination, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

async fn blocking<T, F>(context: String, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CriError::transport(context, e))?
}

#[async_trait]
impl RemoteShell for SshClient {
    async fn run(&self, command: &str) -> Result<CommandOutput> {
        tracing::debug!(address = %self.address(), command = %command, "Running remote command");
        let credentials = self.credentials.clone();
        let command = command.to_string();
        blocking(command.clone(), move || run_blocking(&credentials, &command)).await
    }

    async fn run_async(
        &self,
        command: &str,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<RemoteTask> {
        tracing::debug!(address = %self.address(), command = %command, "Starting remote command");
        let credentials = self.credentials.clone();
        let command = command.to_string();
        Ok(tokio::task::spawn_blocking(move || {
            stream_blocking(&credentials, &command, stdout, stderr)
        }))
    }

    async fn upload(&self, contents: Vec<u8>, destination: &str, mode: i32) -> Result<()> {
        tracing::debug!(address = %self.address(), destination = %destination, "Uploading file");
        let credentials = self.credentials.clone();
        let destination = destination.to_string();
        blocking(destination.clone(), move || {
            upload_blocking(&credentials, &contents, &destination, mode)
        })
        .await
    }

    async fn copy_from(&self, source: &str, destination: &Path) -> Result<()> {
        tracing::debug!(address = %self.address(), source = %source, "Downloading file");
        let credentials = self.credentials.clone();
        let source = source.to_string();
        let destination: PathBuf = destination.to_path_buf();
        blocking(source.clone(), move || {
            download_blocking(&credentials, &source, &destination)
        })
        .await
    }
}
