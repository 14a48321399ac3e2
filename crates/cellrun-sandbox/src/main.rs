//! Serves a cellrun sandbox over stdio.
//!
//! Commands are read from stdin and messages written to stdout, one JSON
//! object per line. Diagnostics go to stderr.
//!
//! ```bash
//! echo '{"command":"execute","args":{"id":"c1","src":"1+1"}}' | cellrun-sandbox
//! ```

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // stdout carries the protocol
    let filter = EnvFilter::try_from_env("CELLRUN_SANDBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::new("cellrun_sandbox=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(pid = std::process::id(), "Sandbox starting");
    cellrun_sandbox::serve_stdio(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Sandbox stopped")?;
    tracing::debug!("Command stream closed, exiting");
    Ok(())
}
