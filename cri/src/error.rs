//! CRI-specific error conversions.

use multicri_core::error::CriError;
use tonic::Status;

/// Convert a CriError to a gRPC Status.
pub fn cri_error_to_status(err: CriError) -> Status {
    match err {
        err @ CriError::NotFound { .. } => Status::not_found(err.to_string()),
        CriError::Conflict(msg) => Status::failed_precondition(msg),
        err @ (CriError::Unsupported(_) | CriError::InvalidArgument(_) | CriError::Config(_)) => {
            Status::invalid_argument(err.to_string())
        }
        err @ CriError::Transport { .. } => Status::unavailable(err.to_string()),
        CriError::Grpc(status) => status,
        other => Status::internal(other.to_string()),
    }
}
