//! Remote CRI backends keyed by runtime handler.
//!
//! Backends are configured once at startup from `name:endpoint[,name:endpoint...]`.
//! Sandbox and container calls resolve by handler name; image calls resolve by
//! a `<handler>/` prefix on the image reference.

use std::collections::BTreeMap;
use std::time::Duration;

use multicri_core::api::image_service_client::ImageServiceClient;
use multicri_core::api::runtime_service_client::RuntimeServiceClient;
use multicri_core::error::{CriError, Result};
use multicri_core::LOCAL_RUNTIME_HANDLER;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Handler an empty request handler normalizes to.
pub const DEFAULT_HANDLER: &str = "default";

/// Time allowed to establish a connection to a remote backend.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Largest message accepted from or sent to a remote backend.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

const UNIX_SCHEME: &str = "unix://";

/// Runtime and image clients for one remote CRI backend.
#[derive(Clone, Debug)]
pub struct RemoteCri {
    name: String,
    runtime: RuntimeServiceClient<Channel>,
    image: ImageServiceClient<Channel>,
}

impl RemoteCri {
    /// Wrap an established channel.
    pub fn new(name: impl Into<String>, channel: Channel) -> Self {
        Self {
            name: name.into(),
            runtime: RuntimeServiceClient::new(channel.clone())
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
            image: ImageServiceClient::new(channel)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        }
    }

    /// Create a backend for `endpoint`. The connection is made on first use.
    ///
    /// `unix://<path>` and absolute paths dial a Unix socket; anything else is
    /// dialed as `http://<endpoint>`.
    pub fn connect(name: &str, endpoint: &str) -> Result<Self> {
        tracing::info!(handler = %name, endpoint = %endpoint, "Registering remote runtime");

        let socket_path = endpoint
            .strip_prefix(UNIX_SCHEME)
            .or_else(|| endpoint.starts_with('/').then_some(endpoint));

        let channel = match socket_path {
            Some(path) => {
                let path = path.to_string();
                // The URI is ignored by the connector.
                Endpoint::from_static("http://[::]:50051")
                    .connect_timeout(CONNECT_TIMEOUT)
                    .connect_with_connector_lazy(service_fn(move |_: Uri| {
                        UnixStream::connect(path.clone())
                    }))
            }
            None => Endpoint::from_shared(format!("http://{}", endpoint))
                .map_err(|e| {
                    CriError::Config(format!("invalid remote runtime endpoint {}: {}", endpoint, e))
                })?
                .connect_timeout(CONNECT_TIMEOUT)
                .connect_lazy(),
        };

        Ok(Self::new(name, channel))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runtime(&self) -> RuntimeServiceClient<Channel> {
        self.runtime.clone()
    }

    pub fn image(&self) -> ImageServiceClient<Channel> {
        self.image.clone()
    }
}

/// Where a call is served.
#[derive(Debug, Clone, Copy)]
pub enum Route<'a> {
    Local,
    Remote(&'a RemoteCri),
}

/// Split `name:endpoint,...` into pairs. Only the first `:` separates.
pub fn parse_endpoints(config: &str) -> Result<Vec<(String, String)>> {
    config
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, endpoint)) if !name.is_empty() && !endpoint.is_empty() => {
                Ok((name.to_string(), endpoint.to_string()))
            }
            _ => Err(CriError::Config(format!(
                "bad format for remote runtime: {}",
                entry
            ))),
        })
        .collect()
}

/// Registered remote backends.
#[derive(Debug, Clone, Default)]
pub struct RemoteRouter {
    remotes: BTreeMap<String, RemoteCri>,
}

impl RemoteRouter {
    /// Router with no remote backends: every call is local.
    pub fn new() -> Self {
        Self::default()
    }

    /// Router for a `name:endpoint` list.
    pub fn from_config(config: &str) -> Result<Self> {
        let mut router = Self::new();
        for (name, endpoint) in parse_endpoints(config)? {
            router.register(RemoteCri::connect(&name, &endpoint)?);
        }
        Ok(router)
    }

    /// Register a backend. The local handler name is never registered.
    pub fn register(&mut self, remote: RemoteCri) {
        if remote.name() == LOCAL_RUNTIME_HANDLER {
            tracing::warn!(
                handler = %remote.name(),
                "Ignoring remote runtime using the local handler name"
            );
            return;
        }
        self.remotes.insert(remote.name().to_string(), remote);
    }

    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    pub fn remotes(&self) -> impl Iterator<Item = &RemoteCri> {
        self.remotes.values()
    }

    pub fn default_remote(&self) -> Option<&RemoteCri> {
        self.remotes.get(DEFAULT_HANDLER)
    }

    /// Resolve a runtime handler.
    pub fn resolve(&self, handler: &str) -> Result<Route<'_>> {
        if handler == LOCAL_RUNTIME_HANDLER || self.remotes.is_empty() {
            return Ok(Route::Local);
        }
        let handler = if handler.is_empty() {
            DEFAULT_HANDLER
        } else {
            handler
        };
        self.remotes
            .get(handler)
            .map(Route::Remote)
            .ok_or_else(|| {
                CriError::Unsupported(format!("remote runtime not found: {}", handler))
            })
    }

    /// Whether records created under `handler` are served locally.
    pub fn is_local(&self, handler: &str) -> bool {
        matches!(self.resolve(handler), Ok(Route::Local))
    }

    /// Handler recorded on sandboxes created locally.
    pub fn local_handler(&self, requested: &str) -> String {
        if self.remotes.is_empty() {
            requested.to_string()
        } else {
            LOCAL_RUNTIME_HANDLER.to_string()
        }
    }

    /// Resolve an image reference, returning the route and the reference with
    /// any routing prefix stripped.
    ///
    /// A handler only claims references that start with `<handler>/`. Image
    /// names are free text, so a bare name prefix would send `gpuless/busybox`
    /// to a `gpu` backend. References without a matching prefix go to the
    /// default backend, or stay local when there is none.
    pub fn resolve_image<'a>(&self, image: &'a str) -> (Route<'_>, &'a str) {
        let local_prefix = format!("{}/", LOCAL_RUNTIME_HANDLER);
        if let Some(stripped) = image.strip_prefix(&local_prefix) {
            return (Route::Local, stripped);
        }
        for (name, remote) in &self.remotes {
            if let Some(stripped) = image
                .strip_prefix(name.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
            {
                return (Route::Remote(remote), stripped);
            }
        }
        match self.default_remote() {
            Some(remote) => (Route::Remote(remote), image),
            None => (Route::Local, image),
        }
    }
}
