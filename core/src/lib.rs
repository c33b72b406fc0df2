//! MultiCRI Core - CRI types, metadata records and error taxonomy.
//!
//! Shared by the execution adapters (`multicri-runtime`) and the CRI
//! dispatcher (`multicri-cri`).

pub mod config;
pub mod error;
pub mod metadata;
pub mod reference;

/// Generated CRI v1alpha2 protobuf types.
pub mod api {
    tonic::include_proto!("runtime.v1alpha2");
}

// Re-export commonly used types
pub use config::SlurmConfig;
pub use error::{CriError, Result};
pub use metadata::{
    ContainerMetadata, ContainerState, ImageAuth, ImageMetadata, SandboxMetadata, SandboxState,
};
pub use reference::{ImageReference, RepoType};

/// Handler name that always means "serve locally".
pub const LOCAL_RUNTIME_HANDLER: &str = "multicri";

/// CRI API version implemented.
pub const CRI_API_VERSION: &str = "v1alpha2";

/// MultiCRI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
