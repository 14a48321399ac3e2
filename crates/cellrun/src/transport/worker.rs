//! Backend running the sandbox on a dedicated OS thread.

use cellrun_sandbox::{ExecutionSandbox, SandboxCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Backend, SandboxTransport, TransportEvents};
use crate::error::Error;

/// Runs each sandbox on its own thread with a single-threaded tokio runtime.
///
/// The thread shares nothing with the host except the command and message
/// channels. Requires a tokio runtime on the host side.
#[derive(Debug, Clone)]
pub struct WorkerBackend {
    thread_name: String,
}

impl Default for WorkerBackend {
    fn default() -> Self {
        Self {
            thread_name: "cellrun-worker".to_string(),
        }
    }
}

impl WorkerBackend {
    /// Create a worker backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for worker thread names; the generation is appended.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

impl Backend for WorkerBackend {
    fn name(&self) -> &str {
        "worker"
    }

    fn spawn(&self, events: TransportEvents) -> Result<Box<dyn SandboxTransport>, Error> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let thread_name = format!("{}-{}", self.thread_name, events.generation());

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                let sandbox = match ExecutionSandbox::new() {
                    Ok(sandbox) => sandbox,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to create sandbox");
                        return;
                    }
                };
                runtime.block_on(sandbox.run(command_rx, message_tx));
            })
            .map_err(|e| Error::Spawn(format!("failed to start thread {thread_name}: {e}")))?;

        // The message channel closes when the thread exits or panics.
        let forwarder = tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                if !events.message(message) {
                    return;
                }
            }
            events.failure("worker thread exited");
        });

        tracing::debug!(thread = %thread_name, "Worker started");
        Ok(Box::new(WorkerTransport {
            commands: Some(command_tx),
            forwarder,
        }))
    }
}

struct WorkerTransport {
    commands: Option<mpsc::UnboundedSender<SandboxCommand>>,
    forwarder: JoinHandle<()>,
}

impl SandboxTransport for WorkerTransport {
    fn send(&mut self, command: SandboxCommand) -> Result<(), Error> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Transport("worker was terminated".to_string()))?;
        commands
            .send(command)
            .map_err(|_| Error::Transport("worker thread has exited".to_string()))
    }

    fn cancel(&mut self, id: &str) -> bool {
        self.send(SandboxCommand::Cancel { id: id.to_string() }).is_ok()
    }

    fn terminate(&mut self) {
        // Closing the command channel ends the sandbox loop.
        self.commands = None;
        self.forwarder.abort();
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use cellrun_sandbox::{AssetEntry, ExecutionResponse, SandboxMessage};
    use serde_json::json;

    use super::*;
    use crate::transport::{BackendEvent, TransportEvent};

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<BackendEvent>) -> TransportEvent {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap() {
            BackendEvent::Transport { generation, event } => {
                assert_eq!(generation, 7);
                event
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_speaks_protocol() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WorkerBackend::new()
            .spawn(TransportEvents::new(7, tx))
            .unwrap();

        assert_eq!(next_event(&mut rx).await, TransportEvent::Message(SandboxMessage::Alive));

        transport
            .send(SandboxCommand::Sync(vec![AssetEntry::new("a.csv", b"1,2".to_vec())]))
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(SandboxMessage::SyncAck { files: 1 })
        );

        transport
            .send(SandboxCommand::Execute {
                id: "c1".into(),
                src: "readFile(\"a.csv\")".into(),
            })
            .unwrap();
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(SandboxMessage::Result(ExecutionResponse::success(
                "c1",
                Some(json!("1,2")),
                false
            )))
        );
    }

    #[tokio::test]
    async fn test_terminate_stops_sending() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WorkerBackend::new()
            .with_thread_name("test-worker")
            .spawn(TransportEvents::new(7, tx))
            .unwrap();
        next_event(&mut rx).await;

        transport.terminate();
        assert!(matches!(
            transport.send(SandboxCommand::Sync(vec![])),
            Err(Error::Transport(_))
        ));
        assert!(!transport.cancel("c1"));
    }
}
