//! The runtime service: composition root and the only external contract.
//!
//! A [`RuntimeService`] is a cheap, cloneable handle to one control task.
//! The control task owns the [`ExecutionQueue`] and [`BackendLifecycle`] and
//! reacts to serialized events: caller commands, transport messages and
//! failures, and liveness deadlines. Nothing else mutates them, so no locks
//! are involved.

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use cellrun_sandbox::{SandboxCommand, SandboxMessage};
use tokio::sync::{mpsc, oneshot};

use crate::assets::{AssetArchive, AssetSyncCollector};
use crate::config::RuntimeConfig;
use crate::error::{BackendFailure, Error};
use crate::lifecycle::{BackendLifecycle, BackendState, ReadinessGate, SyncOutcome};
use crate::queue::{Completion, ExecutionHandle, ExecutionQueue, ExecutionResult, Responder};
use crate::transport::{Backend, BackendEvent, TransportEvent};

/// Snapshot of a service's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeStatus {
    /// Backend lifecycle state.
    pub state: BackendState,
    /// Requests waiting to be dispatched.
    pub pending: usize,
    /// Id of the request currently being evaluated.
    pub in_flight: Option<String>,
    /// Number of isolated contexts spawned so far.
    pub boots: u64,
    /// Generation of the current (or last) transport.
    pub generation: u64,
}

enum Control {
    Execute {
        id: String,
        source: String,
        responder: Responder,
    },
    Cohort {
        cells: Vec<(String, String, Responder)>,
    },
    ClearQueue,
    EnsureReady {
        reply: oneshot::Sender<ReadinessGate>,
    },
    AssetsChanged,
    Status {
        reply: oneshot::Sender<RuntimeStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Builder for [`RuntimeService`].
pub struct RuntimeServiceBuilder {
    backend: Arc<dyn Backend>,
    archive: Option<Arc<dyn AssetArchive>>,
    config: RuntimeConfig,
}

impl fmt::Debug for RuntimeServiceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeServiceBuilder")
            .field("backend", &self.backend.name())
            .field("has_archive", &self.archive.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl RuntimeServiceBuilder {
    /// Read synced assets from this archive.
    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn AssetArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Set liveness limits.
    #[must_use]
    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the control task.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn build(self) -> RuntimeService {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let controller = Controller {
            queue: ExecutionQueue::new(),
            lifecycle: BackendLifecycle::new(self.backend),
            collector: AssetSyncCollector::new(self.archive),
            config: self.config,
            events: event_tx,
            handshake_epoch: 0,
            dispatch_epoch: 0,
            sync_wanted: false,
        };
        tokio::spawn(controller.run(control_rx, event_rx));

        RuntimeService {
            control: control_tx,
        }
    }
}

/// Handle to a runtime that dispatches cells to an isolated backend.
///
/// Dropping every handle shuts the runtime down and terminates the backend.
#[derive(Clone)]
pub struct RuntimeService {
    control: mpsc::UnboundedSender<Control>,
}

impl fmt::Debug for RuntimeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeService")
            .field("closed", &self.control.is_closed())
            .finish_non_exhaustive()
    }
}

impl RuntimeService {
    /// Start configuring a service for the given backend.
    pub fn builder(backend: impl Backend + 'static) -> RuntimeServiceBuilder {
        RuntimeServiceBuilder {
            backend: Arc::new(backend),
            archive: None,
            config: RuntimeConfig::default(),
        }
    }

    /// Start a service with default configuration and no asset archive.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::builder(backend).build()
    }

    /// Queue a cell for execution.
    ///
    /// A request with the same id that has not completed yet is replaced;
    /// its handle resolves to [`Error::Discarded`].
    pub fn request_execution(
        &self,
        id: impl Into<String>,
        source: impl Into<String>,
    ) -> ExecutionHandle {
        let id = id.into();
        let (responder, handle) = Responder::channel(&id);
        let command = Control::Execute {
            id: id.clone(),
            source: source.into(),
            responder,
        };
        if self.control.send(command).is_err() {
            return ExecutionHandle::closed(&id);
        }
        handle
    }

    /// Queue a cell whose result is delivered to `callback` on the control
    /// task. The callback is invoked at most once and never for discarded
    /// requests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceClosed`] if the service has shut down.
    pub fn request_execution_with<F>(
        &self,
        id: impl Into<String>,
        source: impl Into<String>,
        callback: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(ExecutionResult) + Send + 'static,
    {
        self.control
            .send(Control::Execute {
                id: id.into(),
                source: source.into(),
                responder: Responder::Callback(Box::new(callback)),
            })
            .map_err(|_| Error::ServiceClosed)
    }

    /// Replace the queue with the given cells, in order.
    ///
    /// The cells form one cohort: if one fails, the rest are discarded.
    pub fn run_cohort<I, K, S>(&self, cells: I) -> Vec<ExecutionHandle>
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: Into<String>,
    {
        let mut handles = Vec::new();
        let mut queued = Vec::new();
        for (id, source) in cells {
            let id = id.into();
            let (responder, handle) = Responder::channel(&id);
            queued.push((id, source.into(), responder));
            handles.push(handle);
        }

        if self.control.send(Control::Cohort { cells: queued }).is_err() {
            return handles
                .iter()
                .map(|handle| ExecutionHandle::closed(handle.id()))
                .collect();
        }
        handles
    }

    /// Drop every queued request without running it. An in-flight request
    /// is abandoned: the backend is asked to cancel it and its result is
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceClosed`] if the service has shut down.
    pub fn clear_queue(&self) -> Result<(), Error> {
        self.control
            .send(Control::ClearQueue)
            .map_err(|_| Error::ServiceClosed)
    }

    /// Boot (or resync) the backend if needed and wait until it accepts
    /// executions.
    ///
    /// Concurrent callers share one boot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the backend fails before becoming ready
    /// and [`Error::ServiceClosed`] if the service has shut down.
    pub async fn ensure_ready(&self) -> Result<(), Error> {
        let (reply, gate) = oneshot::channel();
        self.control
            .send(Control::EnsureReady { reply })
            .map_err(|_| Error::ServiceClosed)?;
        let gate = gate.await.map_err(|_| Error::ServiceClosed)?;
        gate.await.map_err(Error::from)
    }

    /// Tell the service that the synced asset set changed. A ready backend
    /// resyncs before its next execution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceClosed`] if the service has shut down.
    pub fn notify_assets_changed(&self) -> Result<(), Error> {
        self.control
            .send(Control::AssetsChanged)
            .map_err(|_| Error::ServiceClosed)
    }

    /// Current state of the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceClosed`] if the service has shut down.
    pub async fn status(&self) -> Result<RuntimeStatus, Error> {
        let (reply, status) = oneshot::channel();
        self.control
            .send(Control::Status { reply })
            .map_err(|_| Error::ServiceClosed)?;
        status.await.map_err(|_| Error::ServiceClosed)
    }

    /// Terminate the backend and stop the control task. Pending requests are
    /// discarded. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.control.send(Control::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

/// State owned by the control task.
struct Controller {
    queue: ExecutionQueue,
    lifecycle: BackendLifecycle,
    collector: AssetSyncCollector,
    config: RuntimeConfig,
    events: mpsc::UnboundedSender<BackendEvent>,
    // Bumped whenever a deadline is armed, so stale deadlines are ignored.
    handshake_epoch: u64,
    dispatch_epoch: u64,
    // A caller is waiting for a resync that must wait for the in-flight result.
    sync_wanted: bool,
}

impl Controller {
    #[tracing::instrument(name = "runtime", skip_all)]
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control>,
        mut events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        tracing::debug!(backend = self.lifecycle.backend_name(), "Runtime started");
        loop {
            tokio::select! {
                command = control.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) = self.handle_control(command).await {
                            // Refuse new commands before acknowledging.
                            control.close();
                            let _ = reply.send(());
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                // Never closes: the controller holds a sender.
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
        tracing::debug!("Runtime stopped");
    }

    /// Breaks with the shutdown acknowledgement once the service should stop.
    async fn handle_control(&mut self, command: Control) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Control::Execute {
                id,
                source,
                responder,
            } => {
                self.enqueue(id, source, responder);
                self.dispatch().await;
            }
            Control::Cohort { cells } => {
                self.clear();
                tracing::info!(cells = cells.len(), "Running cohort");
                for (id, source, responder) in cells {
                    self.enqueue(id, source, responder);
                }
                self.dispatch().await;
            }
            Control::ClearQueue => self.clear(),
            Control::EnsureReady { reply } => {
                let gate = self.lifecycle.gate();
                match self.lifecycle.state() {
                    BackendState::Initial => self.boot(),
                    // The in-flight result is only accepted before the resync starts.
                    BackendState::Running if self.queue.is_busy() => self.sync_wanted = true,
                    BackendState::Running => self.start_sync().await,
                    BackendState::Booting | BackendState::Syncing | BackendState::Ready => {}
                }
                let _ = reply.send(gate);
            }
            Control::AssetsChanged => {
                tracing::debug!(state = %self.lifecycle.state(), "Assets changed");
                self.lifecycle.assets_changed();
            }
            Control::Status { reply } => {
                let _ = reply.send(RuntimeStatus {
                    state: self.lifecycle.state(),
                    pending: self.queue.pending_len(),
                    in_flight: self.queue.in_flight_id().map(str::to_string),
                    boots: self.lifecycle.boots(),
                    generation: self.lifecycle.generation(),
                });
            }
            Control::Shutdown { reply } => {
                self.shutdown();
                return ControlFlow::Break(reply);
            }
        }
        ControlFlow::Continue(())
    }

    fn enqueue(&mut self, id: String, source: String, responder: Responder) {
        if self.queue.enqueue(id.clone(), source, responder) {
            let cancelled = self.lifecycle.cancel(&id);
            tracing::debug!(%id, cancelled, "Resubmitted in-flight request");
        }
    }

    fn clear(&mut self) {
        let cleared = self.queue.clear();
        if let Some(id) = &cleared.abandoned {
            self.lifecycle.cancel(id);
        }
        if cleared.discarded > 0 || cleared.abandoned.is_some() {
            tracing::debug!(
                discarded = cleared.discarded,
                abandoned = ?cleared.abandoned,
                "Cleared queue"
            );
        }
    }

    /// Move the queue forward: dispatch the head if the backend is ready,
    /// otherwise start whatever handshake step is needed.
    async fn dispatch(&mut self) {
        if self.queue.is_busy() {
            return;
        }
        let resync = std::mem::take(&mut self.sync_wanted)
            && self.lifecycle.state() == BackendState::Running;
        if self.queue.pending_len() == 0 && !resync {
            return;
        }
        match self.lifecycle.state() {
            BackendState::Ready => {
                let Some((id, src)) = self.queue.start_next() else {
                    return;
                };
                tracing::debug!(%id, "Dispatching execution");
                match self.lifecycle.send(SandboxCommand::Execute { id, src }) {
                    Ok(()) => self.arm_execution_deadline(),
                    Err(failure) => self.fail(failure),
                }
            }
            BackendState::Initial => self.boot(),
            BackendState::Running => self.start_sync().await,
            BackendState::Booting | BackendState::Syncing => {}
        }
    }

    fn boot(&mut self) {
        match self.lifecycle.boot(&self.events) {
            Ok(()) => {
                tracing::info!(
                    generation = self.lifecycle.generation(),
                    "Booting backend"
                );
                self.arm_handshake_deadline();
            }
            Err(failure) => self.fail(failure),
        }
    }

    async fn start_sync(&mut self) {
        let assets = self.collector.collect().await;
        let count = assets.len();
        let resync = self.lifecycle.state() != BackendState::Booting;
        match self.lifecycle.begin_sync(assets) {
            Ok(()) => {
                tracing::debug!(assets = count, resync, "Sync sent");
                // Booting already armed the deadline for the whole handshake.
                if resync {
                    self.arm_handshake_deadline();
                }
            }
            Err(failure) => self.fail(failure),
        }
    }

    async fn handle_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Transport { generation, event } => {
                if generation != self.lifecycle.generation()
                    || self.lifecycle.state() == BackendState::Initial
                {
                    tracing::debug!(generation, "Ignoring event from a retired backend");
                    return;
                }
                match event {
                    TransportEvent::Message(message) => self.handle_message(message).await,
                    TransportEvent::Failure(reason) => self.fail(BackendFailure::Transport(reason)),
                }
            }
            BackendEvent::HandshakeDeadline {
                generation,
                epoch,
                after,
            } => {
                let handshaking = matches!(
                    self.lifecycle.state(),
                    BackendState::Booting | BackendState::Syncing
                );
                if handshaking
                    && generation == self.lifecycle.generation()
                    && epoch == self.handshake_epoch
                {
                    self.fail(BackendFailure::HandshakeTimeout(after));
                }
            }
            BackendEvent::ExecutionDeadline {
                generation,
                epoch,
                after,
            } => {
                if self.queue.is_busy()
                    && generation == self.lifecycle.generation()
                    && epoch == self.dispatch_epoch
                {
                    self.fail(BackendFailure::ExecutionTimeout(after));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SandboxMessage) {
        let state = self.lifecycle.state();
        match (state, message) {
            (BackendState::Booting, SandboxMessage::Alive) => {
                tracing::debug!("Backend alive");
                self.start_sync().await;
            }
            (BackendState::Syncing, SandboxMessage::SyncAck { files }) => {
                match self.lifecycle.sync_acknowledged() {
                    SyncOutcome::Ready => {
                        tracing::info!(files, "Backend ready");
                        self.dispatch().await;
                    }
                    SyncOutcome::Resync => {
                        tracing::debug!("Assets changed during sync, syncing again");
                        self.start_sync().await;
                    }
                }
            }
            (BackendState::Ready | BackendState::Running, SandboxMessage::Result(response)) => {
                let id = response.id.clone();
                match self.queue.complete(response) {
                    Completion::Delivered => {
                        tracing::debug!(%id, "Execution completed");
                        self.dispatch().await;
                    }
                    Completion::Failed { discarded } => {
                        tracing::info!(
                            %id,
                            discarded,
                            "Execution failed, discarding the rest of the cohort"
                        );
                        self.dispatch().await;
                    }
                    Completion::Abandoned => {
                        tracing::debug!(%id, "Dropped result of abandoned execution");
                        self.dispatch().await;
                    }
                    Completion::Unexpected(reason) => {
                        tracing::warn!(%reason, "Protocol violation: unexpected result");
                    }
                }
            }
            (state, message) => {
                tracing::warn!(
                    %state,
                    ?message,
                    "Protocol violation: message not valid in this state"
                );
            }
        }
    }

    /// Transport failure: the in-flight request gets a transport error, the
    /// queue is cleared and the backend goes back to `Initial`.
    fn fail(&mut self, failure: BackendFailure) {
        let discarded = self.queue.fail(&failure.to_string());
        self.sync_wanted = false;
        tracing::error!(%failure, discarded, "Backend failed");
        self.lifecycle.reset(failure);
    }

    fn shutdown(&mut self) {
        let cleared = self.queue.clear();
        tracing::debug!(discarded = cleared.discarded, "Shutting down");
        self.lifecycle.reset(BackendFailure::Shutdown);
    }

    fn arm_handshake_deadline(&mut self) {
        self.handshake_epoch += 1;
        if let Some(after) = self.config.handshake_timeout {
            self.arm(after, BackendEvent::HandshakeDeadline {
                generation: self.lifecycle.generation(),
                epoch: self.handshake_epoch,
                after,
            });
        }
    }

    fn arm_execution_deadline(&mut self) {
        self.dispatch_epoch += 1;
        if let Some(after) = self.config.execution_timeout {
            self.arm(after, BackendEvent::ExecutionDeadline {
                generation: self.lifecycle.generation(),
                epoch: self.dispatch_epoch,
                after,
            });
        }
    }

    fn arm(&self, after: Duration, event: BackendEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(event);
        });
    }
}
