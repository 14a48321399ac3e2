//! # cellrun-sandbox
//!
//! The isolated side of a cellrun backend.
//!
//! A sandbox holds a private virtual file store and a persistent JavaScript
//! context (`boa_engine`). Cells see the file store through `readFile`,
//! `writeFile` and `listFiles`, plus a small library for CSV tables, HTML and
//! scatter plots, and timers. A cell that returns a promise is awaited.
//!
//! The sandbox talks to the host only through the tagged messages in
//! [`protocol`], either over in-process channels
//! ([`ExecutionSandbox::run`]) or over newline-delimited JSON on a byte
//! stream ([`serve_stdio`], used by the `cellrun-sandbox` binary).
//!
//! ## Quick Start
//!
//! ```rust
//! use cellrun_sandbox::{AssetEntry, ExecutionSandbox};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let mut sandbox = ExecutionSandbox::new().expect("context starts");
//!     sandbox.sync(vec![AssetEntry::new("a.csv", b"x,y\n1,2".to_vec())]);
//!
//!     let response = sandbox
//!         .execute("c1".to_string(), "fromCSV(readFile(\"a.csv\")).column(\"y\")")
//!         .await;
//!     assert_eq!(response.value, Some(serde_json::json!([2])));
//! }
//! ```

mod engine;
pub mod protocol;
mod sandbox;
pub mod vfs;

pub use protocol::{
    AssetEntry, ErrorKind, ExecutionError, ExecutionResponse, SandboxCommand, SandboxMessage,
};
pub use sandbox::{ExecutionSandbox, InitError, serve_stdio};
pub use vfs::{VfsError, VirtualFileStore};
