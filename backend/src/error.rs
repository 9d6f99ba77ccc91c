use std::sync::Arc;

/// Data-plane error taxonomy.
///
/// Every variant carries a stable code (see [`Error::code`]) so callers can
/// branch without parsing messages.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The pool hit `max_replicas` or `max_global_vms`. Transient — callers
    /// may retry with backoff.
    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// The CID or guest-IP pool is empty.
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),

    /// Firecracker spawn, socket wait, or a configure-phase API call failed.
    #[error("backend boot failed: {0}")]
    BootFailed(String),

    /// Snapshot load failed. Recovered internally by wiping the snapshot set
    /// and cold-booting; surfaces only if the fallback itself fails.
    #[error("snapshot load failed: {0}")]
    SnapshotLoad(String),

    /// The guest agent could not be dialed or rejected the handshake.
    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    /// Framing or JSON parse error on the vsock connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The caller-provided invocation timeout elapsed. The VM may still be
    /// healthy; guest-side work is not cancelled.
    #[error("invocation timed out after {0}s")]
    InvocationTimeout(u64),

    /// The agent returned a `Resp` with a non-empty error. The VM is healthy.
    #[error("invocation error: {0}")]
    Invocation(String),

    /// Missing rootfs, mkfs failure, bridge setup failure. Not retried.
    #[error("fatal setup error: {0}")]
    FatalSetup(String),

    /// An error observed by several callers through a singleflight.
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CapacityExhausted(_) => "capacity_exhausted",
            Self::ResourceAllocation(_) => "resource_allocation_failed",
            Self::BootFailed(_) => "backend_boot_failed",
            Self::SnapshotLoad(_) => "snapshot_load_failed",
            Self::AgentUnreachable(_) => "agent_unreachable",
            Self::Protocol(_) => "protocol_violation",
            Self::InvocationTimeout(_) => "invocation_timeout",
            Self::Invocation(_) => "invocation_error",
            Self::FatalSetup(_) => "fatal_setup",
            Self::Shared(inner) => inner.code(),
        }
    }

    /// Whether a caller may reasonably retry after backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CapacityExhausted(_) | Self::InvocationTimeout(_) => true,
            Self::Shared(inner) => inner.is_transient(),
            _ => false,
        }
    }
}

impl From<Arc<Error>> for Error {
    fn from(inner: Arc<Error>) -> Self {
        Self::Shared(inner)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::CapacityExhausted(String::new()).code(), "capacity_exhausted");
        assert_eq!(
            Error::ResourceAllocation(String::new()).code(),
            "resource_allocation_failed"
        );
        assert_eq!(Error::BootFailed(String::new()).code(), "backend_boot_failed");
        assert_eq!(Error::SnapshotLoad(String::new()).code(), "snapshot_load_failed");
        assert_eq!(Error::AgentUnreachable(String::new()).code(), "agent_unreachable");
        assert_eq!(Error::Protocol(String::new()).code(), "protocol_violation");
        assert_eq!(Error::InvocationTimeout(5).code(), "invocation_timeout");
        assert_eq!(Error::Invocation(String::new()).code(), "invocation_error");
        assert_eq!(Error::FatalSetup(String::new()).code(), "fatal_setup");
    }

    #[test]
    fn shared_delegates_code_and_transience() {
        let shared = Error::Shared(Arc::new(Error::CapacityExhausted("full".into())));
        assert_eq!(shared.code(), "capacity_exhausted");
        assert!(shared.is_transient());

        let shared = Error::Shared(Arc::new(Error::FatalSetup("no rootfs".into())));
        assert_eq!(shared.code(), "fatal_setup");
        assert!(!shared.is_transient());
    }

    #[test]
    fn transient_kinds() {
        assert!(Error::CapacityExhausted("x".into()).is_transient());
        assert!(Error::InvocationTimeout(3).is_transient());
        assert!(!Error::BootFailed("x".into()).is_transient());
        assert!(!Error::Invocation("x".into()).is_transient());
    }
}
