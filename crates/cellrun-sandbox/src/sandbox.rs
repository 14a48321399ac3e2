//! The remote side of a backend.
//!
//! An [`ExecutionSandbox`] owns a private [`VirtualFileStore`] and a persistent
//! JavaScript context. It speaks the protocol in [`crate::protocol`]: the first
//! message it sends is `alive`, every `sync` is answered with `sync_ack`, and
//! every `execute` with exactly one `result` carrying the request id.
//!
//! The context is not `Send`; a sandbox stays on the thread that created it.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::engine::{self, Engine, Evaluation};
use crate::protocol::{
    AssetEntry, ErrorKind, ExecutionError, ExecutionResponse, SandboxCommand, SandboxMessage,
};
use crate::vfs::VirtualFileStore;

/// The JavaScript context could not be set up.
#[derive(Debug, thiserror::Error)]
#[error("failed to initialize the JavaScript context: {0}")]
pub struct InitError(String);

/// Isolated evaluator with a private file store.
pub struct ExecutionSandbox {
    engine: Engine,
    // Commands that arrived while a promise was being awaited.
    backlog: VecDeque<SandboxCommand>,
}

impl fmt::Debug for ExecutionSandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionSandbox")
            .field("files", &self.engine.files().len())
            .field("backlog", &self.backlog.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionSandbox {
    /// Create a sandbox with an empty file store and a fresh global scope.
    ///
    /// # Errors
    ///
    /// Returns an error if the cell library fails to install.
    pub fn new() -> Result<Self, InitError> {
        let engine = Engine::new().map_err(|e| InitError(e.to_string()))?;
        Ok(Self {
            engine,
            backlog: VecDeque::new(),
        })
    }

    /// The sandbox's virtual file store.
    #[must_use]
    pub fn files(&self) -> &VirtualFileStore {
        self.engine.files()
    }

    /// Apply a `sync` payload and return the number of files written.
    ///
    /// Entries with invalid paths are skipped.
    pub fn sync(&mut self, entries: Vec<AssetEntry>) -> usize {
        let files = self.engine.files_mut();
        let mut written = 0;
        for entry in entries {
            match files.write(&entry.path, entry.data) {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(path = %entry.path, error = %e, "Skipping synced asset"),
            }
        }
        tracing::debug!(written, total = files.len(), "Applied sync");
        written
    }

    /// Execute a cell, awaiting the promise it returns, if any.
    pub async fn execute(&mut self, id: String, src: &str) -> ExecutionResponse {
        self.execute_with(id, src, None).await
    }

    /// Serve commands until the command channel closes or the host stops
    /// listening.
    ///
    /// While a promise is awaited, a `cancel` for that execution resolves it
    /// as cancelled; other commands are queued and handled after.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SandboxCommand>,
        messages: mpsc::UnboundedSender<SandboxMessage>,
    ) {
        if messages.send(SandboxMessage::Alive).is_err() {
            return;
        }

        loop {
            let command = match self.backlog.pop_front() {
                Some(command) => command,
                None => match commands.recv().await {
                    Some(command) => command,
                    None => break,
                },
            };

            let reply = match command {
                SandboxCommand::Sync(entries) => SandboxMessage::SyncAck {
                    files: self.sync(entries),
                },
                SandboxCommand::Execute { id, src } => {
                    SandboxMessage::Result(self.execute_with(id, &src, Some(&mut commands)).await)
                }
                SandboxCommand::Cancel { id } => {
                    tracing::debug!(%id, "Cancel for an execution that is not running");
                    continue;
                }
            };

            if messages.send(reply).is_err() {
                tracing::debug!("Host stopped listening");
                break;
            }
        }
    }

    #[tracing::instrument(name = "execute", skip(self, src, commands), fields(id = %id))]
    async fn execute_with(
        &mut self,
        id: String,
        src: &str,
        mut commands: Option<&mut mpsc::UnboundedReceiver<SandboxCommand>>,
    ) -> ExecutionResponse {
        let assignment = match engine::check(src) {
            Ok(assignment) => assignment,
            Err(error) => {
                tracing::debug!(error = %error, "Syntax error");
                return ExecutionResponse::failure(id, error);
            }
        };

        let mut evaluation = self.engine.evaluate(src);
        let response = loop {
            let record = match evaluation {
                Evaluation::Value(value) => {
                    break ExecutionResponse::success(&id, value, assignment);
                }
                Evaluation::Thrown(message) => break failure(&id, message),
                Evaluation::Pending(record) => record,
            };
            if let Some(settled) = self.engine.poll(&record) {
                evaluation = settled;
                continue;
            }
            let Some(due) = self.engine.next_due() else {
                break failure(&id, "promise never settles".to_string());
            };

            let sleep = tokio::time::sleep_until(due);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    () = &mut sleep => break,
                    command = next_command(&mut commands) => match command {
                        Some(SandboxCommand::Cancel { id: target }) if target == id => {
                            tracing::debug!("Execution cancelled");
                            self.engine.clear_timers();
                            return ExecutionResponse::failure(
                                id,
                                ExecutionError::new(ErrorKind::Cancelled, "execution cancelled"),
                            );
                        }
                        Some(other) => self.backlog.push_back(other),
                        None => commands = None,
                    },
                }
            }
            self.engine.fire_due(tokio::time::Instant::now());
            evaluation = Evaluation::Pending(record);
        };
        self.engine.clear_timers();
        response
    }
}

/// The next command, or never once the channel is gone.
async fn next_command(
    commands: &mut Option<&mut mpsc::UnboundedReceiver<SandboxCommand>>,
) -> Option<SandboxCommand> {
    match commands {
        Some(commands) => commands.recv().await,
        None => std::future::pending().await,
    }
}

fn failure(id: &str, message: String) -> ExecutionResponse {
    tracing::debug!(%message, "Evaluation error");
    ExecutionResponse::failure(id, ExecutionError::new(ErrorKind::Evaluation, message))
}

/// Serve a sandbox over a byte stream pair using newline-delimited JSON.
///
/// Returns when the input reaches EOF and every reply has been written.
/// Lines that are not valid commands are logged and skipped.
///
/// # Errors
///
/// Returns an error if the sandbox cannot be created or writing to `writer`
/// fails.
pub async fn serve_stdio<R, W>(reader: R, writer: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sandbox = ExecutionSandbox::new().map_err(io::Error::other)?;
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (message_tx, message_rx) = mpsc::unbounded_channel();

    let pump = async {
        tokio::join!(
            read_commands(reader, command_tx),
            sandbox.run(command_rx, message_tx),
        );
    };
    let write = write_messages(writer, message_rx);
    tokio::pin!(write);

    tokio::select! {
        () = pump => write.await,
        result = &mut write => result,
    }
}

async fn read_commands<R: AsyncRead + Unpin>(
    reader: R,
    commands: mpsc::UnboundedSender<SandboxCommand>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read command stream");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SandboxCommand>(&line) {
            Ok(command) => {
                if commands.send(command).is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed command"),
        }
    }
}

async fn write_messages<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut messages: mpsc::UnboundedReceiver<SandboxMessage>,
) -> io::Result<()> {
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_string(&message).map_err(io::Error::other)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::future::Future;
    use std::time::Duration;

    use serde_json::json;
    use tokio::task::LocalSet;

    use super::*;

    fn sandbox() -> ExecutionSandbox {
        ExecutionSandbox::new().unwrap()
    }

    fn execute_command(id: &str, src: &str) -> SandboxCommand {
        SandboxCommand::Execute {
            id: id.to_string(),
            src: src.to_string(),
        }
    }

    /// Run a sandbox on the current thread while `test` drives it.
    async fn with_running_sandbox<F, Fut>(test: F)
    where
        F: FnOnce(
            mpsc::UnboundedSender<SandboxCommand>,
            mpsc::UnboundedReceiver<SandboxMessage>,
        ) -> Fut,
        Fut: Future<Output = ()>,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        LocalSet::new()
            .run_until(async move {
                tokio::task::spawn_local(sandbox().run(command_rx, message_tx));
                test(command_tx, message_rx).await;
            })
            .await;
    }

    async fn next_result(
        messages: &mut mpsc::UnboundedReceiver<SandboxMessage>,
    ) -> ExecutionResponse {
        match messages.recv().await.unwrap() {
            SandboxMessage::Result(response) => response,
            other => panic!("expected a result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_value() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "1+1").await;
        assert_eq!(response, ExecutionResponse::success("c1", Some(json!(2)), false));
    }

    #[tokio::test]
    async fn test_syntax_error_is_located() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "x=").await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Syntax);
        assert_eq!(error.description, "unexpected end of input");
        assert_eq!((error.line, error.column), (Some(1), Some(3)));
        assert_eq!(response.id, "c1");
    }

    #[tokio::test]
    async fn test_syntax_error_does_not_evaluate() {
        let mut sandbox = sandbox();
        sandbox.execute("c1".into(), "x = 1\ny = ").await;
        let response = sandbox.execute("c2".into(), "x").await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Evaluation);
        assert_eq!(error.description, "x is not defined");
    }

    #[tokio::test]
    async fn test_assignment_flag() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "x = 5").await;
        assert_eq!(response.assignment, Some(true));
        assert_eq!(response.value, Some(json!(5)));
        let response = sandbox.execute("c2".into(), "x * 2").await;
        assert_eq!(response.value, Some(json!(10)));
        assert_eq!(response.assignment, Some(false));
    }

    #[tokio::test]
    async fn test_thrown_error_is_reported() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "throw new Error('boom')").await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Evaluation);
        assert_eq!(error.description, "boom");
        assert_eq!(error.line, None);
    }

    #[tokio::test]
    async fn test_undefined_has_no_value() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "let unused = 1").await;
        assert_eq!(response, ExecutionResponse::success("c1", None, false));
    }

    #[tokio::test]
    async fn test_synced_files_are_readable_and_writable() {
        let mut sandbox = sandbox();
        let written = sandbox.sync(vec![
            AssetEntry::new("a.csv", b"1,2".to_vec()),
            AssetEntry::new("../bad", b"x".to_vec()),
        ]);
        assert_eq!(written, 1);
        assert!(sandbox.files().contains("a.csv"));

        let response = sandbox.execute("c1".into(), "readFile(\"/a.csv\")").await;
        assert_eq!(response.value, Some(json!("1,2")));

        sandbox.execute("c2".into(), "writeFile('out.txt', 42)").await;
        assert_eq!(sandbox.files().read("out.txt").unwrap(), b"42");
        let response = sandbox.execute("c3".into(), "listFiles()").await;
        assert_eq!(response.value, Some(json!(["a.csv", "out.txt"])));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_evaluation_error() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "readFile('nope.csv')").await;
        assert_eq!(response.error.unwrap().description, "File not found: nope.csv");
    }

    #[tokio::test]
    async fn test_host_functions_cannot_be_replaced() {
        let mut sandbox = sandbox();
        sandbox.sync(vec![AssetEntry::new("a.csv", b"1,2".to_vec())]);
        sandbox.execute("c1".into(), "readFile = () => 'fake'").await;
        let response = sandbox.execute("c2".into(), "readFile('a.csv')").await;
        assert_eq!(response.value, Some(json!("1,2")));
    }

    #[tokio::test]
    async fn test_table_is_reported_as_html() {
        let mut sandbox = sandbox();
        sandbox.sync(vec![AssetEntry::new("t.csv", b"a,b\n1,2\n3,4".to_vec())]);
        let response = sandbox.execute("c1".into(), "t = fromCSV(readFile(\"t.csv\"))").await;
        let value = response.value.unwrap();
        assert_eq!(value["type"], "html");
        assert!(value["html"].as_str().unwrap().contains("<th>a</th>"));

        let response = sandbox
            .execute("c2".into(), "t.column('b').reduce((a, b) => a + b, 0)")
            .await;
        assert_eq!(response.value, Some(json!(6)));
    }

    #[tokio::test]
    async fn test_scatter_plot_renders_svg() {
        let mut sandbox = sandbox();
        let response = sandbox
            .execute(
                "c1".into(),
                "plot.scatterPlot([{x: 0, y: 0}, {x: 10, y: 5}], {width: 100, height: 100})",
            )
            .await;
        let value = response.value.unwrap();
        assert_eq!(value["type"], "html");
        let svg = value["html"].as_str().unwrap();
        assert!(svg.starts_with("<svg"), "{svg}");
        assert!(svg.contains("<circle cx=\"10\" cy=\"90\" r=\"3\"/>"), "{svg}");
        assert!(svg.contains("<circle cx=\"90\" cy=\"10\" r=\"3\"/>"), "{svg}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_promises_are_awaited() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "delay(50, delay(50, \"done\"))").await;
        assert_eq!(response.value, Some(json!("done")));

        let response = sandbox
            .execute("c2".into(), "later = delay(10, 1).then(v => v + 1)")
            .await;
        assert_eq!(response.value, Some(json!(2)));
        assert_eq!(response.assignment, Some(true));

        let response = sandbox.execute("c3".into(), "rejectAfter(10, \"nope\")").await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Evaluation);
        assert_eq!(error.description, "nope");
        assert_eq!(error.line, None);
    }

    #[tokio::test]
    async fn test_promise_without_timers_never_settles() {
        let mut sandbox = sandbox();
        let response = sandbox.execute("c1".into(), "new Promise(() => {})").await;
        assert_eq!(response.error.unwrap().description, "promise never settles");
    }

    #[tokio::test]
    async fn test_run_protocol() {
        with_running_sandbox(|commands, mut messages| async move {
            assert_eq!(messages.recv().await.unwrap(), SandboxMessage::Alive);

            commands
                .send(SandboxCommand::Sync(vec![AssetEntry::new("a.csv", b"1,2".to_vec())]))
                .unwrap();
            assert_eq!(messages.recv().await.unwrap(), SandboxMessage::SyncAck { files: 1 });

            commands.send(execute_command("c1", "listFiles().length")).unwrap();
            assert_eq!(
                next_result(&mut messages).await,
                ExecutionResponse::success("c1", Some(json!(1)), false)
            );

            drop(commands);
            assert!(messages.recv().await.is_none());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_execution() {
        with_running_sandbox(|commands, mut messages| async move {
            assert_eq!(messages.recv().await.unwrap(), SandboxMessage::Alive);

            commands.send(execute_command("slow", "delay(60000, 1)")).unwrap();
            commands.send(execute_command("next", "2")).unwrap();
            commands.send(SandboxCommand::Cancel { id: "slow".into() }).unwrap();

            let cancelled = next_result(&mut messages).await;
            assert_eq!(cancelled.id, "slow");
            assert_eq!(cancelled.error.unwrap().kind, ErrorKind::Cancelled);

            let next = next_result(&mut messages).await;
            assert_eq!(next.id, "next");
            assert_eq!(next.value, Some(json!(2)));
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_for_other_id_does_not_interrupt() {
        with_running_sandbox(|commands, mut messages| async move {
            messages.recv().await.unwrap();

            commands.send(execute_command("slow", "delay(1000, 1)")).unwrap();
            commands.send(SandboxCommand::Cancel { id: "other".into() }).unwrap();

            let response = tokio::time::timeout(Duration::from_secs(5), next_result(&mut messages))
                .await
                .unwrap();
            assert_eq!(response.value, Some(json!(1)));
        })
        .await;
    }

    #[tokio::test]
    async fn test_serve_stdio_round_trip() {
        let input = concat!(
            "{\"command\":\"sync\",\"args\":[{\"path\":\"a.csv\",\"data\":\"312c32\"}]}\n",
            "not json\n",
            "{\"command\":\"execute\",",
            "\"args\":{\"id\":\"c1\",\"src\":\"readFile(\\\"a.csv\\\")\"}}\n",
        );
        let mut output = Vec::new();
        serve_stdio(input.as_bytes(), &mut output).await.unwrap();

        let lines: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(
            lines,
            vec![
                json!({"kind": "alive"}),
                json!({"kind": "sync_ack", "files": 1}),
                json!({"kind": "result", "id": "c1", "value": "1,2", "assignment": false}),
            ]
        );
    }
}
