//! Wire protocol between the host runtime and a sandbox.
//!
//! Every message is a tagged JSON object, so the host never has to infer a
//! message's meaning from its position in the stream:
//!
//! ```text
//! host -> sandbox  {"command":"sync","args":[{"path":"a.csv","data":"312c32"}]}
//! host -> sandbox  {"command":"execute","args":{"id":"c1","src":"1+1"}}
//! host -> sandbox  {"command":"cancel","args":{"id":"c1"}}
//! sandbox -> host  {"kind":"alive"}
//! sandbox -> host  {"kind":"sync_ack","files":1}
//! sandbox -> host  {"kind":"result","id":"c1","value":2}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// A file that must be visible inside the sandbox before execution.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEntry {
    /// Path of the file inside the sandbox's virtual file store.
    pub path: String,
    /// Raw file contents, hex-encoded on the wire.
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl AssetEntry {
    /// Create a new asset entry.
    #[must_use]
    pub fn new(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            data: data.into(),
        }
    }
}

impl fmt::Debug for AssetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetEntry")
            .field("path", &self.path)
            .field("data_len", &self.data.len())
            .finish()
    }
}

/// Commands sent from the host to the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum SandboxCommand {
    /// Write the given files into the sandbox's virtual file store.
    Sync(Vec<AssetEntry>),
    /// Evaluate a cell's source.
    Execute {
        /// Request id, echoed back in the response.
        id: String,
        /// Source text.
        src: String,
    },
    /// Ask the sandbox to abandon the execution with the given id.
    ///
    /// Advisory: only executions waiting on a deferred value can be
    /// interrupted.
    Cancel {
        /// Id of the execution to cancel.
        id: String,
    },
}

/// Messages sent from the sandbox to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SandboxMessage {
    /// The sandbox has started and accepts commands.
    Alive,
    /// A `sync` command was applied.
    SyncAck {
        /// Number of files written by the sync.
        files: usize,
    },
    /// Outcome of an `execute` command.
    Result(ExecutionResponse),
}

/// Outcome of one `execute` command as reported by the sandbox.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionResponse {
    /// Id of the request this responds to.
    pub id: String,
    /// Result value, absent for `null` results and failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// Structured error, present when the execution failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    /// Whether the last top-level statement was an assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<bool>,
}

impl ExecutionResponse {
    /// A successful response.
    #[must_use]
    pub fn success(
        id: impl Into<String>,
        value: Option<serde_json::Value>,
        assignment: bool,
    ) -> Self {
        Self {
            id: id.into(),
            value,
            error: None,
            assignment: Some(assignment),
        }
    }

    /// A failed response.
    #[must_use]
    pub fn failure(id: impl Into<String>, error: ExecutionError) -> Self {
        Self {
            id: id.into(),
            value: None,
            error: Some(error),
            assignment: None,
        }
    }
}

/// The category of an [`ExecutionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The source failed validation; nothing was evaluated.
    Syntax,
    /// Evaluation raised an error.
    Evaluation,
    /// The execution was cancelled before it produced a value.
    Cancelled,
    /// The sandbox crashed or became unreachable while the request was in flight.
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Syntax => "syntax error",
            Self::Evaluation => "evaluation error",
            Self::Cancelled => "cancelled",
            Self::Transport => "transport failure",
        };
        f.write_str(name)
    }
}

/// Structured error reported for a failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {description}")]
pub struct ExecutionError {
    /// Error category.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Human-readable message.
    pub description: String,
    /// 1-based source line, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-based source column, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl ExecutionError {
    /// Create an error without a source location.
    #[must_use]
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            line: None,
            column: None,
        }
    }

    /// Attach a source location.
    #[must_use]
    pub const fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(data))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(encoded).map_err(serde::de::Error::custom)
    }
}
