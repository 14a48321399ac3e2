//! Error types for the runtime.

use std::time::Duration;

/// Errors surfaced by the runtime and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend could not start an isolated context.
    #[error("failed to spawn backend: {0}")]
    Spawn(String),

    /// A command could not be delivered to the isolated context.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend failed or could not become ready.
    #[error(transparent)]
    Backend(#[from] BackendFailure),

    /// The request was dropped without running: it was replaced, cleared, or
    /// discarded after an earlier request in its cohort failed.
    #[error("execution request '{0}' was discarded")]
    Discarded(String),

    /// The runtime service has shut down.
    #[error("runtime service has shut down")]
    ServiceClosed,

    /// An asset archive could not provide an entry or blob.
    #[error("asset error: {0}")]
    Asset(String),
}

/// Why a backend stopped being usable.
///
/// This is the rejection type of a readiness gate, so it is cheap to clone
/// and shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendFailure {
    /// The isolated context could not be started.
    #[error("failed to spawn backend: {0}")]
    Spawn(String),

    /// The isolated context crashed or became unreachable.
    #[error("backend transport failed: {0}")]
    Transport(String),

    /// The boot and sync handshake did not finish in time.
    #[error("backend handshake did not complete within {0:?}")]
    HandshakeTimeout(Duration),

    /// An execution did not produce a result in time.
    #[error("execution did not complete within {0:?}")]
    ExecutionTimeout(Duration),

    /// The runtime service shut down.
    #[error("runtime service shut down")]
    Shutdown,
}
