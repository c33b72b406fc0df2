//! MultiCRI Runtime - execution adapters behind the CRI dispatcher.
//!
//! This crate provides the adapter contract, the Slurm/Singularity adapter
//! with its SSH transport, the container log sink, and the streaming server
//! for exec and attach sessions.

#![allow(clippy::result_large_err)]

pub mod adapter;
pub mod fake;
pub mod log;
pub mod singularity;
pub mod slurm;
pub mod streaming;
pub mod transport;

// Re-export common types
pub use adapter::{Adapter, AdapterKind, ContainerLookup, ExecOutput, StreamRuntime};
pub use fake::FakeAdapter;
pub use log::{ContainerLogger, LogStream};
pub use singularity::SingularityCli;
pub use slurm::{ImageBuilder, SlurmAdapter, SlurmClient};
pub use streaming::{SessionKind, StreamingHandle, StreamingServer, StreamingSession};
pub use transport::{ClusterCredentials, RemoteShell, ShellConnector, SshClient, SshConnector};

/// MultiCRI Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
