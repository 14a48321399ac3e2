//! Channels to isolated execution contexts.
//!
//! A [`Backend`] knows how to start one kind of isolated context; each start
//! produces a [`SandboxTransport`] for sending commands. Everything coming
//! back from the context (messages and failures) goes through the
//! [`TransportEvents`] sink handed to [`Backend::spawn`], tagged with the
//! generation of the transport so events from a torn-down context can be
//! told apart from the current one.

mod process;
mod worker;

use std::time::Duration;

use cellrun_sandbox::{SandboxCommand, SandboxMessage};
use tokio::sync::mpsc;

use crate::error::Error;

pub use process::ProcessBackend;
pub use worker::WorkerBackend;

/// The host end of a channel to one isolated context.
pub trait SandboxTransport: Send {
    /// Deliver a command.
    ///
    /// # Errors
    ///
    /// Returns an error if the context can no longer be reached.
    fn send(&mut self, command: SandboxCommand) -> Result<(), Error>;

    /// Ask the context to stop the execution with the given id.
    ///
    /// Advisory only: returns whether the request was passed on, not whether
    /// the execution stopped.
    fn cancel(&mut self, id: &str) -> bool {
        let _ = id;
        false
    }

    /// Forcefully shut the context down. Best-effort.
    fn terminate(&mut self);
}

/// A kind of isolated context.
pub trait Backend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Start a new context whose messages and failures are reported to
    /// `events`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the context cannot be started.
    fn spawn(&self, events: TransportEvents) -> Result<Box<dyn SandboxTransport>, Error>;
}

/// Something a transport reported.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TransportEvent {
    Message(SandboxMessage),
    Failure(String),
}

/// Input to the runtime's control task, besides caller commands.
#[derive(Debug)]
pub(crate) enum BackendEvent {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    HandshakeDeadline {
        generation: u64,
        epoch: u64,
        after: Duration,
    },
    ExecutionDeadline {
        generation: u64,
        epoch: u64,
        after: Duration,
    },
}

/// Sink for everything one transport reports back to the runtime.
///
/// Events are delivered in the order they are reported.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    generation: u64,
    sink: mpsc::UnboundedSender<BackendEvent>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, sink: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self { generation, sink }
    }

    /// Generation of the transport this sink belongs to.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a message from the context.
    ///
    /// Returns `false` if the runtime is gone.
    pub fn message(&self, message: SandboxMessage) -> bool {
        self.emit(TransportEvent::Message(message))
    }

    /// Report that the context terminated or became unreachable.
    ///
    /// Returns `false` if the runtime is gone.
    pub fn failure(&self, reason: impl Into<String>) -> bool {
        self.emit(TransportEvent::Failure(reason.into()))
    }

    /// Whether the runtime has stopped listening.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }

    fn emit(&self, event: TransportEvent) -> bool {
        self.sink
            .send(BackendEvent::Transport {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
