//! Backend running the sandbox as a child process.

use std::path::PathBuf;
use std::process::Stdio;

use cellrun_sandbox::{SandboxCommand, SandboxMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{Backend, SandboxTransport, TransportEvents};
use crate::error::Error;

/// Runs each sandbox as a child process speaking newline-delimited JSON on
/// stdin and stdout.
///
/// The program is expected to behave like the `cellrun-sandbox` binary. Its
/// stderr is inherited. Requires a tokio runtime on the host side.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessBackend {
    /// Create a backend that runs `program`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append arguments passed to the program.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl Backend for ProcessBackend {
    fn name(&self) -> &str {
        "process"
    }

    fn spawn(&self, events: TransportEvents) -> Result<Box<dyn SandboxTransport>, Error> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("sandbox process has no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("sandbox process has no stdout".to_string()))?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_commands(stdin, command_rx, events.clone()));
        let reader = tokio::spawn(read_messages(stdout, events));

        tracing::debug!(
            program = %self.program.display(),
            pid = ?child.id(),
            "Sandbox process started"
        );
        Ok(Box::new(ProcessTransport {
            commands: Some(command_tx),
            child,
            reader,
            writer,
        }))
    }
}

async fn write_commands(
    mut stdin: ChildStdin,
    mut commands: mpsc::UnboundedReceiver<SandboxCommand>,
    events: TransportEvents,
) {
    while let Some(command) = commands.recv().await {
        let mut line = match serde_json::to_string(&command) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize command");
                continue;
            }
        };
        line.push('\n');
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            events.failure(format!("failed to write to sandbox process: {e}"));
            return;
        }
    }
}

async fn read_messages(stdout: ChildStdout, events: TransportEvents) {
    let mut lines = BufReader::new(stdout).lines();
    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {}
            Ok(Some(line)) => match serde_json::from_str::<SandboxMessage>(&line) {
                Ok(message) => {
                    if !events.message(message) {
                        return;
                    }
                }
                Err(e) => tracing::warn!(error = %e, %line, "Ignoring malformed sandbox message"),
            },
            Ok(None) => break "sandbox process closed its output".to_string(),
            Err(e) => break format!("failed to read from sandbox process: {e}"),
        }
    };
    events.failure(reason);
}

struct ProcessTransport {
    commands: Option<mpsc::UnboundedSender<SandboxCommand>>,
    child: Child,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SandboxTransport for ProcessTransport {
    fn send(&mut self, command: SandboxCommand) -> Result<(), Error> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| Error::Transport("sandbox process was terminated".to_string()))?;
        commands
            .send(command)
            .map_err(|_| Error::Transport("sandbox process input is closed".to_string()))
    }

    fn cancel(&mut self, id: &str) -> bool {
        self.send(SandboxCommand::Cancel { id: id.to_string() }).is_ok()
    }

    fn terminate(&mut self) {
        self.commands = None;
        self.reader.abort();
        self.writer.abort();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Sandbox process already exited");
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.terminate();
    }
}
