//! Remote transport client.
//!
//! Commands and file copies against the execution cluster go through the
//! [`RemoteShell`] trait. Sessions are opened per operation; nothing is pooled.

pub mod ssh;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use multicri_core::error::{CriError, Result};
use tokio::task::JoinHandle;

pub use ssh::{SshClient, SshConnector};

pub const ENV_CLUSTER_USERNAME: &str = "CLUSTER_USERNAME";
pub const ENV_CLUSTER_HOST: &str = "CLUSTER_HOST";
pub const ENV_CLUSTER_PORT: &str = "CLUSTER_PORT";
pub const ENV_CLUSTER_PASSWORD: &str = "CLUSTER_PASSWORD";
pub const ENV_CLUSTER_KEY: &str = "CLUSTER_KEYVALUE";

const DEFAULT_SSH_PORT: u16 = 22;

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Authentication for the cluster login node.
#[derive(Clone, PartialEq, Eq)]
pub enum ClusterAuth {
    /// Private key material (PEM).
    Key(String),
    Password(String),
}

impl fmt::Debug for ClusterAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterAuth::Key(_) => f.write_str("Key(<redacted>)"),
            ClusterAuth::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Per-container cluster credentials taken from the container's declared
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCredentials {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub auth: ClusterAuth,
}

impl ClusterCredentials {
    pub fn from_environment(env: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| env.get(key).filter(|v| !v.is_empty()).cloned();

        let auth = match (get(ENV_CLUSTER_KEY), get(ENV_CLUSTER_PASSWORD)) {
            (Some(key), _) => ClusterAuth::Key(key),
            (None, Some(password)) => ClusterAuth::Password(password),
            (None, None) => {
                return Err(CriError::Config(format!(
                    "{} or {} must be set",
                    ENV_CLUSTER_KEY, ENV_CLUSTER_PASSWORD
                )))
            }
        };
        let user = get(ENV_CLUSTER_USERNAME)
            .ok_or_else(|| CriError::Config(format!("{} must be set", ENV_CLUSTER_USERNAME)))?;
        let host = get(ENV_CLUSTER_HOST)
            .ok_or_else(|| CriError::Config(format!("{} must be set", ENV_CLUSTER_HOST)))?;
        let port = match get(ENV_CLUSTER_PORT) {
            Some(port) => port.parse().map_err(|_| {
                CriError::Config(format!("invalid {}: {}", ENV_CLUSTER_PORT, port))
            })?,
            None => DEFAULT_SSH_PORT,
        };

        Ok(Self {
            user,
            host,
            port,
            auth,
        })
    }
}

/// Destination for streamed command output.
pub type OutputSink = Box<dyn std::io::Write + Send>;

/// A command running in the background; resolves to its exit status.
pub type RemoteTask = JoinHandle<Result<i32>>;

/// Shell access to a remote host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit status is reported in the output, not as an error.
    async fn run(&self, command: &str) -> Result<CommandOutput>;

    /// Start a command whose output is streamed into the given sinks.
    async fn run_async(
        &self,
        command: &str,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<RemoteTask>;

    /// Write `contents` to `destination` with the given permission bits.
    async fn upload(&self, contents: Vec<u8>, destination: &str, mode: i32) -> Result<()>;

    /// Copy a local file to the remote host, keeping its permission bits.
    async fn copy_to(&self, source: &Path, destination: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let contents = tokio::fs::read(source).await?;
        let mode = tokio::fs::metadata(source).await?.permissions().mode() & 0o777;
        self.upload(contents, destination, mode as i32).await
    }

    /// Copy a remote file to the local filesystem, keeping its permission bits.
    async fn copy_from(&self, source: &str, destination: &Path) -> Result<()>;
}

/// Opens shells for a given set of credentials.
pub trait ShellConnector: Send + Sync {
    fn connect(&self, credentials: &ClusterCredentials) -> Arc<dyn RemoteShell>;
}

/// Quote a string for a POSIX shell double-quoted context.
pub fn double_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_credentials_with_key() {
        let creds = ClusterCredentials::from_environment(&env(&[
            (ENV_CLUSTER_USERNAME, "alice"),
            (ENV_CLUSTER_HOST, "login.hpc"),
            (ENV_CLUSTER_KEY, "-----BEGIN KEY-----"),
            (ENV_CLUSTER_PASSWORD, "secret"),
        ]))
        .unwrap();
        assert_eq!(creds.port, 22);
        assert!(matches!(creds.auth, ClusterAuth::Key(_)));
    }

    #[test]
    fn test_credentials_with_password_and_port() {
        let creds = ClusterCredentials::from_environment(&env(&[
            (ENV_CLUSTER_USERNAME, "alice"),
            (ENV_CLUSTER_HOST, "login.hpc"),
            (ENV_CLUSTER_PORT, "2222"),
            (ENV_CLUSTER_PASSWORD, "secret"),
        ]))
        .unwrap();
        assert_eq!(creds.port, 2222);
        assert_eq!(creds.auth, ClusterAuth::Password("secret".to_string()));
    }

    #[test]
    fn test_credentials_without_auth() {
        let err = ClusterCredentials::from_environment(&env(&[
            (ENV_CLUSTER_USERNAME, "alice"),
            (ENV_CLUSTER_HOST, "login.hpc"),
        ]))
        .unwrap_err();
        assert!(matches!(err, CriError::Config(_)));
    }

    #[test]
    fn test_credentials_bad_port() {
        let err = ClusterCredentials::from_environment(&env(&[
            (ENV_CLUSTER_USERNAME, "alice"),
            (ENV_CLUSTER_HOST, "login.hpc"),
            (ENV_CLUSTER_PORT, "ssh"),
            (ENV_CLUSTER_PASSWORD, "secret"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("CLUSTER_PORT"));
    }

    #[test]
    fn test_auth_debug_is_redacted() {
        let auth = ClusterAuth::Password("hunter2".to_string());
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }

    #[test]
    fn test_double_quote() {
        assert_eq!(double_quote("plain"), "\"plain\"");
        assert_eq!(double_quote("a \"b\" $HOME"), "\"a \\\"b\\\" \\$HOME\"");
    }
}
