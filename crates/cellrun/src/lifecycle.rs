//! Backend lifecycle: boot, sync, ready, and recovery.
//!
//! ```text
//! Initial --ensure-ready--> Booting --alive--> Syncing --sync_ack--> Ready
//!    ^                                            ^                    |
//!    |                                            +---- dispatch --- Running
//!    +------------- failure / deadline (any state)          assets changed
//! ```
//!
//! The [`ReadinessGate`] is the shared completion every caller waits on: it
//! resolves once the backend reaches [`BackendState::Ready`] and is rejected
//! if the backend fails first.

use std::fmt;
use std::future::IntoFuture;
use std::sync::Arc;

use cellrun_sandbox::{AssetEntry, SandboxCommand};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, oneshot};

use crate::error::BackendFailure;
use crate::transport::{Backend, BackendEvent, SandboxTransport, TransportEvents};

/// Lifecycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    /// No isolated context exists.
    Initial,
    /// A context was spawned; waiting for `alive`.
    Booting,
    /// Assets were sent; waiting for `sync_ack`.
    Syncing,
    /// Accepting executions.
    Ready,
    /// Alive, but the asset set changed, so the next dispatch syncs first.
    Running,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initial => "initial",
            Self::Booting => "booting",
            Self::Syncing => "syncing",
            Self::Ready => "ready",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

type GateFuture = Shared<BoxFuture<'static, Result<(), BackendFailure>>>;

/// Shared completion signalling that the backend accepts executions.
///
/// Cloning is cheap; every clone resolves the same way. Await it directly.
#[derive(Clone)]
pub struct ReadinessGate {
    inner: GateFuture,
}

impl ReadinessGate {
    fn pending() -> (GateResolver, Self) {
        let (tx, rx) = oneshot::channel();
        let inner = rx
            .map(|outcome| outcome.unwrap_or(Err(BackendFailure::Shutdown)))
            .boxed()
            .shared();
        (GateResolver(tx), Self { inner })
    }

    /// A gate that is already open.
    pub(crate) fn open() -> Self {
        let inner = futures::future::ready(Ok::<(), BackendFailure>(())).boxed().shared();
        // Settle it now so `peek` reports the outcome.
        let _ = inner.clone().now_or_never();
        Self { inner }
    }

    /// The outcome, if the gate has settled.
    #[must_use]
    pub fn peek(&self) -> Option<Result<(), BackendFailure>> {
        self.inner.peek().cloned()
    }
}

impl fmt::Debug for ReadinessGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessGate")
            .field("outcome", &self.peek())
            .finish()
    }
}

impl IntoFuture for ReadinessGate {
    type Output = Result<(), BackendFailure>;
    type IntoFuture = GateFuture;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

/// Settles a pending [`ReadinessGate`].
struct GateResolver(oneshot::Sender<Result<(), BackendFailure>>);

impl GateResolver {
    fn settle(self, outcome: Result<(), BackendFailure>) {
        // Nobody waiting is fine.
        let _ = self.0.send(outcome);
    }
}

/// What a `sync_ack` led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SyncOutcome {
    /// The backend is ready.
    Ready,
    /// Assets changed while syncing; sync again.
    Resync,
}

/// Explicit lifecycle state of one backend: its state, its transport, and
/// the pending readiness gate.
pub struct BackendLifecycle {
    backend: Arc<dyn Backend>,
    state: BackendState,
    transport: Option<Box<dyn SandboxTransport>>,
    gate: Option<(GateResolver, ReadinessGate)>,
    generation: u64,
    boots: u64,
    resync_requested: bool,
}

impl fmt::Debug for BackendLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendLifecycle")
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("boots", &self.boots)
            .finish_non_exhaustive()
    }
}

impl BackendLifecycle {
    /// Create a lifecycle for the given backend, in [`BackendState::Initial`].
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: BackendState::Initial,
            transport: None,
            gate: None,
            generation: 0,
            boots: 0,
            resync_requested: false,
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Generation of the current (or last) transport.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of contexts spawned so far.
    #[must_use]
    pub fn boots(&self) -> u64 {
        self.boots
    }

    /// Name of the backend.
    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// The gate callers should wait on. Open when ready; otherwise the one
    /// pending gate, created on first use.
    pub(crate) fn gate(&mut self) -> ReadinessGate {
        if self.state == BackendState::Ready {
            return ReadinessGate::open();
        }
        self.pending_gate()
    }

    fn pending_gate(&mut self) -> ReadinessGate {
        let (_, gate) = self.gate.get_or_insert_with(ReadinessGate::pending);
        gate.clone()
    }

    /// `Initial -> Booting`: spawn a new context.
    pub(crate) fn boot(
        &mut self,
        sink: &mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<(), BackendFailure> {
        debug_assert_eq!(self.state, BackendState::Initial);
        self.generation += 1;
        self.pending_gate();

        let events = TransportEvents::new(self.generation, sink.clone());
        let transport = self
            .backend
            .spawn(events)
            .map_err(|e| BackendFailure::Spawn(e.to_string()))?;

        self.transport = Some(transport);
        self.boots += 1;
        self.transition(BackendState::Booting);
        Ok(())
    }

    /// `Booting | Running | Syncing -> Syncing`: send the collected assets.
    pub(crate) fn begin_sync(&mut self, assets: Vec<AssetEntry>) -> Result<(), BackendFailure> {
        self.pending_gate();
        self.resync_requested = false;
        self.send(SandboxCommand::Sync(assets))?;
        self.transition(BackendState::Syncing);
        Ok(())
    }

    /// Handle `sync_ack` while syncing.
    pub(crate) fn sync_acknowledged(&mut self) -> SyncOutcome {
        if self.resync_requested {
            return SyncOutcome::Resync;
        }
        self.transition(BackendState::Ready);
        if let Some((resolver, _)) = self.gate.take() {
            resolver.settle(Ok(()));
        }
        SyncOutcome::Ready
    }

    /// The asset set changed; make sure the backend syncs again before the
    /// next dispatch.
    pub(crate) fn assets_changed(&mut self) {
        match self.state {
            BackendState::Ready => {
                self.transition(BackendState::Running);
                self.pending_gate();
            }
            BackendState::Syncing => self.resync_requested = true,
            // Booting collects assets after `alive`; Initial has nothing to refresh.
            BackendState::Initial | BackendState::Booting | BackendState::Running => {}
        }
    }

    /// Send a command over the current transport.
    pub(crate) fn send(&mut self, command: SandboxCommand) -> Result<(), BackendFailure> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| BackendFailure::Transport("no backend is running".to_string()))?;
        transport
            .send(command)
            .map_err(|e| BackendFailure::Transport(e.to_string()))
    }

    /// Advisory cancellation of an in-flight execution.
    pub(crate) fn cancel(&mut self, id: &str) -> bool {
        self.transport
            .as_mut()
            .is_some_and(|transport| transport.cancel(id))
    }

    /// `any -> Initial`: terminate the transport and reject the pending gate.
    pub(crate) fn reset(&mut self, failure: BackendFailure) {
        if let Some(mut transport) = self.transport.take() {
            transport.terminate();
        }
        if let Some((resolver, _)) = self.gate.take() {
            resolver.settle(Err(failure));
        }
        self.resync_requested = false;
        self.transition(BackendState::Initial);
    }

    fn transition(&mut self, to: BackendState) {
        if self.state != to {
            tracing::debug!(
                backend = self.backend.name(),
                generation = self.generation,
                from = %self.state,
                %to,
                "Backend state transition"
            );
            self.state = to;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<SandboxCommand>>,
        terminated: Mutex<bool>,
    }

    struct RecordingBackend {
        recorder: Arc<Recorder>,
        fail: bool,
    }

    struct RecordingTransport(Arc<Recorder>);

    impl SandboxTransport for RecordingTransport {
        fn send(&mut self, command: SandboxCommand) -> Result<(), Error> {
            self.0.sent.lock().unwrap().push(command);
            Ok(())
        }

        fn terminate(&mut self) {
            *self.0.terminated.lock().unwrap() = true;
        }
    }

    impl Backend for RecordingBackend {
        fn name(&self) -> &str {
            "recording"
        }

        fn spawn(&self, _events: TransportEvents) -> Result<Box<dyn SandboxTransport>, Error> {
            if self.fail {
                return Err(Error::Spawn("refused".into()));
            }
            Ok(Box::new(RecordingTransport(self.recorder.clone())))
        }
    }

    fn lifecycle(
        fail: bool,
    ) -> (BackendLifecycle, Arc<Recorder>, mpsc::UnboundedSender<BackendEvent>) {
        let recorder = Arc::new(Recorder::default());
        let backend = RecordingBackend {
            recorder: recorder.clone(),
            fail,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        (BackendLifecycle::new(Arc::new(backend)), recorder, tx)
    }

    #[tokio::test]
    async fn test_handshake_resolves_gate() {
        let (mut lifecycle, recorder, sink) = lifecycle(false);
        let gate = lifecycle.gate();
        assert_eq!(gate.peek(), None);

        lifecycle.boot(&sink).unwrap();
        assert_eq!(lifecycle.state(), BackendState::Booting);
        assert_eq!(lifecycle.generation(), 1);

        lifecycle.begin_sync(vec![]).unwrap();
        assert_eq!(lifecycle.state(), BackendState::Syncing);
        assert_eq!(gate.peek(), None);

        assert_eq!(lifecycle.sync_acknowledged(), SyncOutcome::Ready);
        assert_eq!(lifecycle.state(), BackendState::Ready);
        gate.await.unwrap();
        assert_eq!(lifecycle.gate().peek(), Some(Ok(())));
        assert_eq!(*recorder.sent.lock().unwrap(), vec![SandboxCommand::Sync(vec![])]);
    }

    #[tokio::test]
    async fn test_gate_is_shared_until_ready() {
        let (mut lifecycle, _, sink) = lifecycle(false);
        let first = lifecycle.gate();
        lifecycle.boot(&sink).unwrap();
        let second = lifecycle.gate();
        lifecycle.begin_sync(vec![]).unwrap();
        lifecycle.sync_acknowledged();
        assert_eq!(first.await, Ok(()));
        assert_eq!(second.await, Ok(()));
        assert_eq!(lifecycle.boots(), 1);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (mut lifecycle, _, sink) = lifecycle(true);
        let gate = lifecycle.gate();
        let failure = lifecycle.boot(&sink).unwrap_err();
        assert!(matches!(failure, BackendFailure::Spawn(_)));
        lifecycle.reset(failure.clone());
        assert_eq!(gate.await, Err(failure));
        assert_eq!(lifecycle.state(), BackendState::Initial);
        assert_eq!(lifecycle.boots(), 0);
    }

    #[tokio::test]
    async fn test_reset_rejects_gate_and_terminates() {
        let (mut lifecycle, recorder, sink) = lifecycle(false);
        lifecycle.boot(&sink).unwrap();
        let gate = lifecycle.gate();
        lifecycle.reset(BackendFailure::Transport("gone".into()));
        assert_eq!(gate.await, Err(BackendFailure::Transport("gone".into())));
        assert!(*recorder.terminated.lock().unwrap());
        assert!(lifecycle.send(SandboxCommand::Sync(vec![])).is_err());
    }

    #[tokio::test]
    async fn test_assets_changed_when_ready_requires_resync() {
        let (mut lifecycle, _, sink) = lifecycle(false);
        lifecycle.boot(&sink).unwrap();
        lifecycle.begin_sync(vec![]).unwrap();
        lifecycle.sync_acknowledged();

        lifecycle.assets_changed();
        assert_eq!(lifecycle.state(), BackendState::Running);
        let gate = lifecycle.gate();
        assert_eq!(gate.peek(), None);

        lifecycle.begin_sync(vec![]).unwrap();
        lifecycle.sync_acknowledged();
        assert_eq!(gate.await, Ok(()));
    }

    #[test]
    fn test_assets_changed_while_syncing_resyncs() {
        let (mut lifecycle, _, sink) = lifecycle(false);
        lifecycle.boot(&sink).unwrap();
        lifecycle.begin_sync(vec![]).unwrap();
        lifecycle.assets_changed();
        assert_eq!(lifecycle.sync_acknowledged(), SyncOutcome::Resync);
        assert_eq!(lifecycle.state(), BackendState::Syncing);

        lifecycle.begin_sync(vec![]).unwrap();
        assert_eq!(lifecycle.sync_acknowledged(), SyncOutcome::Ready);
    }
}
