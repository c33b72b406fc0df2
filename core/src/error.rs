use thiserror::Error;

/// MultiCRI error types
#[derive(Error, Debug)]
pub enum CriError {
    /// Sandbox, container or image is absent
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// Requested transition is not valid for the current state
    #[error("{0}")]
    Conflict(String),

    /// Unknown image repository or unregistered remote runtime
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Remote session or command failure
    #[error("Error running the command {command} : {message}")]
    Transport { command: String, message: String },

    /// Scheduler output did not match an expected format
    #[error("Parse error: {0}")]
    Parse(String),

    /// Malformed CRI request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// gRPC error returned by a remote backend
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CriError {
    pub fn sandbox_not_found(id: impl Into<String>) -> Self {
        CriError::NotFound {
            kind: "sandbox",
            id: id.into(),
        }
    }

    pub fn container_not_found(id: impl Into<String>) -> Self {
        CriError::NotFound {
            kind: "container",
            id: id.into(),
        }
    }

    pub fn image_not_found(id: impl Into<String>) -> Self {
        CriError::NotFound {
            kind: "image",
            id: id.into(),
        }
    }

    /// Wrap a failed remote command with the literal command text.
    pub fn transport(command: impl Into<String>, message: impl ToString) -> Self {
        CriError::Transport {
            command: command.into(),
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for CriError {
    fn from(err: serde_json::Error) -> Self {
        CriError::Serialization(err.to_string())
    }
}

/// Result type alias for MultiCRI operations
pub type Result<T> = std::result::Result<T, CriError>;
