//! MultiCRI CRI - one Container Runtime Interface socket over many backends.
//!
//! Sandboxes and containers either run through a local execution adapter
//! (Slurm jobs over SSH) or are delegated verbatim to a remote CRI runtime
//! selected by runtime handler:
//! - Handler `multicri` → local adapter
//! - Registered handler → that remote backend
//! - Empty handler → the `default` remote backend

pub mod error;
pub mod image_service;
pub mod network;
pub mod remote;
pub mod runtime_service;
pub mod server;
pub mod service;
pub mod store;

pub use network::{NetworkPlugin, PodNetwork};
pub use remote::{RemoteCri, RemoteRouter};
pub use server::CriServer;
pub use service::{CriService, ServiceConfig};
