//! Error taxonomy shared by every vmshim component.

use thiserror::Error;

/// Result alias used throughout vmshim.
pub type VmshimResult<T> = Result<T, VmshimError>;

/// Errors produced by the host runtime.
///
/// Variants follow the failure classes of the VM lifecycle:
/// configuration problems are caught before anything is allocated,
/// provisioning problems abort VM creation, engine problems are fatal to
/// boot, and portal problems are what remains after dial retries ran out.
#[derive(Debug, Error)]
pub enum VmshimError {
    /// Malformed options (zero vCPUs, zero memory, missing build paths).
    #[error("configuration error: {0}")]
    Config(String),

    /// OCI spec could not be turned into devices and guest mounts.
    #[error("provisioning error: {0}")]
    Provision(String),

    /// Feature or platform not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Hypervisor failure: creation, boot, or the VM entering its error state.
    #[error("engine error: {0}")]
    Engine(String),

    /// Guest transport failure (vsock dial, proxy setup).
    #[error("portal error: {0}")]
    Portal(String),

    /// Control-channel RPC returned a non-OK status.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Network attachment failure.
    #[error("network error: {0}")]
    Network(String),

    /// Working directory or metadata file failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Operation not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Caller supplied a bad argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The caller's cancellation signal fired.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Unexpected internal failure (including panics caught at task boundaries).
    #[error("internal error: {0}")]
    Internal(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmshimError {
    /// Whether this error came from a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, VmshimError::Cancelled(_))
    }

    /// Whether this error came from an elapsed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, VmshimError::Timeout(_))
    }
}

impl From<tonic::Status> for VmshimError {
    fn from(status: tonic::Status) -> Self {
        VmshimError::Rpc(format!("{:?}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for VmshimError {
    fn from(err: tonic::transport::Error) -> Self {
        VmshimError::Portal(format!("transport: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_maps_to_rpc() {
        let err: VmshimError = tonic::Status::unavailable("guest gone").into();
        assert!(matches!(err, VmshimError::Rpc(_)));
        assert!(err.to_string().contains("guest gone"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: VmshimError = io.into();
        assert!(matches!(err, VmshimError::Io(_)));
    }

    #[test]
    fn test_predicates() {
        assert!(VmshimError::Cancelled("x".into()).is_cancelled());
        assert!(VmshimError::Timeout("x".into()).is_timeout());
        assert!(!VmshimError::Engine("x".into()).is_timeout());
    }
}
