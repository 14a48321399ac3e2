//! Run a notebook against a cellrun sandbox.
//!
//! Every cell of the notebook is queued as one cohort: cells run in order and
//! the first failing cell stops the rest.
//!
//! # Examples
//!
//! ```bash
//! # Run in a sandbox thread inside this process
//! cellrun run analysis.nb --asset data.csv
//!
//! # Run in a separate sandbox process
//! cellrun run analysis.nb --backend process
//!
//! # Use a standalone sandbox binary instead of this one
//! cellrun run analysis.nb --backend process --sandbox-program ./cellrun-sandbox
//! ```

mod notebook;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use cellrun::{
    Backend, Error, ExecutionResult, MemoryArchive, ProcessBackend, RuntimeConfig, RuntimeService,
    WorkerBackend,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Run notebooks in an isolated cellrun sandbox.
#[derive(Parser, Debug)]
#[command(name = "cellrun")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every cell of a notebook, in order
    Run(RunArgs),

    /// Serve a sandbox over stdin and stdout (used by the process backend)
    #[command(hide = true)]
    Sandbox,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Notebook file, cells separated by `%%` lines
    #[arg(required = true)]
    notebook: PathBuf,

    /// File to make readable inside the sandbox, under its file name
    ///
    /// Can be specified multiple times.
    #[arg(long = "asset", value_name = "PATH")]
    assets: Vec<PathBuf>,

    /// Where cells are evaluated
    #[arg(long, value_enum, default_value_t = BackendKind::Worker)]
    backend: BackendKind,

    /// Sandbox program for the process backend
    ///
    /// Defaults to this executable's hidden `sandbox` command.
    #[arg(long, value_name = "PATH")]
    sandbox_program: Option<PathBuf>,

    /// Seconds to wait for the sandbox to boot and sync (0 disables)
    #[arg(long, default_value_t = 30.0, value_name = "SECS")]
    handshake_timeout: f64,

    /// Seconds a single cell may run before the sandbox is restarted
    #[arg(long, value_name = "SECS")]
    execution_timeout: Option<f64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    /// A sandbox thread inside this process
    Worker,
    /// A sandbox child process
    Process,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Sandbox => sandbox().await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let filter = if args.verbose {
        "cellrun=debug,cellrun_sandbox=debug"
    } else {
        "cellrun=warn,cellrun_sandbox=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let text = tokio::fs::read_to_string(&args.notebook)
        .await
        .with_context(|| format!("Failed to read notebook {}", args.notebook.display()))?;
    let cells = notebook::parse(&text).context("Invalid notebook")?;
    if cells.is_empty() {
        println!("No cells to run");
        return Ok(());
    }

    let archive = load_assets(&args.assets).await?;
    let config = RuntimeConfig::default()
        .with_handshake_timeout(seconds(args.handshake_timeout)?)
        .with_execution_timeout(args.execution_timeout.map(seconds).transpose()?.flatten());

    let service = build_service(&args, archive, config)?;
    if let Err(e) = service.ensure_ready().await {
        service.shutdown().await;
        return Err(e).context("Sandbox did not start");
    }
    tracing::info!(cells = cells.len(), backend = ?args.backend, "Running notebook");

    let handles = service.run_cohort(cells.into_iter().map(|cell| (cell.id, cell.source)));
    let mut failed = 0;
    for handle in handles {
        let id = handle.id().to_string();
        match handle.await {
            Ok(result) => {
                if result.is_error() {
                    failed += 1;
                }
                println!("{}", describe(&result));
            }
            Err(Error::Discarded(_)) => println!("[{id}] skipped"),
            Err(e) => {
                service.shutdown().await;
                return Err(e).with_context(|| format!("Cell {id} did not run"));
            }
        }
    }
    service.shutdown().await;

    if failed > 0 {
        bail!("{failed} cell(s) failed");
    }
    Ok(())
}

fn build_service(
    args: &RunArgs,
    archive: MemoryArchive,
    config: RuntimeConfig,
) -> Result<RuntimeService> {
    let service = match args.backend {
        BackendKind::Worker => start(WorkerBackend::new(), archive, config),
        BackendKind::Process => {
            let backend = match &args.sandbox_program {
                Some(program) => ProcessBackend::new(program),
                None => {
                    let program = std::env::current_exe()
                        .context("Failed to locate the cellrun executable")?;
                    ProcessBackend::new(program).with_args(["sandbox"])
                }
            };
            start(backend, archive, config)
        }
    };
    Ok(service)
}

fn start(
    backend: impl Backend + 'static,
    archive: MemoryArchive,
    config: RuntimeConfig,
) -> RuntimeService {
    RuntimeService::builder(backend)
        .with_archive(Arc::new(archive))
        .with_config(config)
        .build()
}

async fn load_assets(paths: &[PathBuf]) -> Result<MemoryArchive> {
    let archive = MemoryArchive::new();
    for path in paths {
        let name = asset_name(path)?;
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read asset {}", path.display()))?;
        tracing::debug!(%name, bytes = data.len(), "Loaded asset");
        archive.insert(name, data, true).await;
    }
    Ok(archive)
}

fn asset_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("Asset path {} has no usable file name", path.display()))
}

/// `0` disables the limit.
fn seconds(secs: f64) -> Result<Option<Duration>> {
    if secs == 0.0 {
        return Ok(None);
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .with_context(|| format!("Invalid timeout: {secs}"))
}

fn describe(result: &ExecutionResult) -> String {
    let id = &result.id;
    if let Some(error) = &result.error {
        return match (error.line, error.column) {
            (Some(line), Some(column)) => format!("[{id}] {error} (line {line}, column {column})"),
            _ => format!("[{id}] {error}"),
        };
    }
    match (&result.value, result.assignment) {
        (Some(value), Some(false) | None) => format!("[{id}] {value}"),
        (_, Some(true)) => format!("[{id}] ok"),
        (None, _) => format!("[{id}] null"),
    }
}

async fn sandbox() -> Result<()> {
    // stdout carries the protocol
    let filter = EnvFilter::try_from_env("CELLRUN_SANDBOX_LOG")
        .unwrap_or_else(|_| EnvFilter::new("cellrun_sandbox=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    cellrun_sandbox::serve_stdio(tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Sandbox stopped")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use cellrun::{ErrorKind, ExecutionError};
    use serde_json::json;

    use super::*;

    fn result(value: Option<serde_json::Value>, assignment: Option<bool>) -> ExecutionResult {
        ExecutionResult {
            id: "c1".into(),
            sequence_number: 0,
            value,
            error: None,
            assignment,
        }
    }

    #[test]
    fn test_describe_value() {
        assert_eq!(describe(&result(Some(json!(2)), Some(false))), "[c1] 2");
        assert_eq!(describe(&result(Some(json!("a")), None)), "[c1] \"a\"");
        assert_eq!(describe(&result(None, Some(false))), "[c1] null");
        assert_eq!(describe(&result(Some(json!(1)), Some(true))), "[c1] ok");
    }

    #[test]
    fn test_describe_error() {
        let mut failed = result(None, None);
        failed.error =
            Some(ExecutionError::new(ErrorKind::Syntax, "unexpected end of input").at(1, 3));
        assert_eq!(
            describe(&failed),
            "[c1] syntax error: unexpected end of input (line 1, column 3)"
        );
    }

    #[test]
    fn test_seconds() {
        assert_eq!(seconds(0.0).unwrap(), None);
        assert_eq!(seconds(1.5).unwrap(), Some(Duration::from_millis(1500)));
        assert!(seconds(-1.0).is_err());
    }

    #[test]
    fn test_asset_name() {
        assert_eq!(asset_name(Path::new("/tmp/data/a.csv")).unwrap(), "a.csv");
        assert!(asset_name(Path::new("/")).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "cellrun", "run", "nb.txt", "--asset", "a.csv", "--backend", "process",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.backend, BackendKind::Process);
        assert_eq!(args.assets, vec![PathBuf::from("a.csv")]);
        assert_eq!(args.handshake_timeout, 30.0);
    }
}
