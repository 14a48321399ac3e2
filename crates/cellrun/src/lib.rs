//! # cellrun
//!
//! Dispatches notebook cells to an isolated execution sandbox and routes the
//! results back, while the sandbox may start, restart, or fail on its own.
//!
//! - **Ordered, deduplicated queue** - one request in flight at a time,
//!   resubmitting an id replaces the earlier request, and an error discards
//!   the rest of the cohort
//! - **Explicit backend lifecycle** - boot and asset sync handshake behind a
//!   shared readiness gate, with crash recovery and liveness deadlines
//! - **Pluggable backends** - a worker thread or a child process, both
//!   speaking the tagged protocol from [`cellrun_sandbox::protocol`]
//!
//! ## Quick Start
//!
//! ```rust
//! use cellrun::{RuntimeService, WorkerBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), cellrun::Error> {
//!     let service = RuntimeService::new(WorkerBackend::new());
//!
//!     let result = service.request_execution("c1", "1+1").await?;
//!     assert_eq!(result.value, Some(serde_json::json!(2)));
//!
//!     service.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod assets;
mod config;
mod error;
pub mod lifecycle;
pub mod queue;
mod service;
pub mod transport;

pub use assets::{AssetArchive, AssetDescriptor, AssetSyncCollector, MemoryArchive};
pub use config::RuntimeConfig;
pub use error::{BackendFailure, Error};
pub use lifecycle::{BackendLifecycle, BackendState, ReadinessGate};
pub use queue::{
    ExecutionCallback, ExecutionHandle, ExecutionQueue, ExecutionRequest, ExecutionResult,
};
pub use service::{RuntimeService, RuntimeServiceBuilder, RuntimeStatus};
pub use transport::{Backend, ProcessBackend, SandboxTransport, TransportEvents, WorkerBackend};

// Re-export the wire types callers see in results.
pub use cellrun_sandbox::{AssetEntry, ErrorKind, ExecutionError};
