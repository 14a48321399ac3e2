//! Runs notebooks through the `cellrun` binary.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

fn cellrun(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cellrun"))
        .args(args)
        .output()
        .expect("failed to run cellrun")
}

fn write(dir: &TempDir, name: &str, contents: &str) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path_str(&path)
}

fn path_str(path: &Path) -> String {
    path.to_str().unwrap().to_string()
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).unwrap()
}

// =============================================================================
// Worker backend
// =============================================================================

#[test]
fn test_runs_cells_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = write(&dir, "nb.txt", "%% setup\ntotal = 40\n%% answer\ntotal + 2\n");

    let output = cellrun(&["run", &notebook]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "[setup] ok\n[answer] 42\n");
}

#[test]
fn test_error_skips_remaining_cells() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = write(&dir, "nb.txt", "%% a\nx=\n%% b\n2+2\n");

    let output = cellrun(&["run", &notebook]);
    assert!(!output.status.success());
    assert_eq!(
        stdout(&output),
        "[a] syntax error: unexpected end of input (line 1, column 3)\n[b] skipped\n"
    );
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("1 cell(s) failed"), "{stderr}");
}

#[test]
fn test_assets_are_readable() {
    let dir = tempfile::tempdir().unwrap();
    let asset = write(&dir, "a.csv", "1,2");
    let notebook = write(&dir, "nb.txt", "%% read\nreadFile(\"a.csv\")\n");

    let output = cellrun(&["run", &notebook, "--asset", &asset]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "[read] \"1,2\"\n");
}

#[test]
fn test_rejected_promise_fails_cell() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = write(&dir, "nb.txt", "%% wait\nrejectAfter(5, \"gave up\")\n");

    let output = cellrun(&["run", &notebook]);
    assert!(!output.status.success());
    assert_eq!(stdout(&output), "[wait] evaluation error: gave up\n");
}

#[test]
fn test_empty_notebook() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = write(&dir, "nb.txt", "%%\n\n");

    let output = cellrun(&["run", &notebook]);
    assert!(output.status.success());
    assert_eq!(stdout(&output), "No cells to run\n");
}

#[test]
fn test_missing_notebook_fails() {
    let dir = tempfile::tempdir().unwrap();
    let missing = path_str(&dir.path().join("missing.txt"));

    let output = cellrun(&["run", &missing]);
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Failed to read notebook"), "{stderr}");
}

// =============================================================================
// Process backend
// =============================================================================

#[test]
fn test_process_backend_runs_cells() {
    let dir = tempfile::tempdir().unwrap();
    let asset = write(&dir, "a.csv", "x,y\n1,2\n3,4");
    let notebook = write(
        &dir,
        "nb.txt",
        concat!(
            "%% load\nt = fromCSV(readFile(\"a.csv\"))\n",
            "%% total\nt.column(\"y\").reduce((a, b) => a + b, 0)\n",
        ),
    );

    let output = cellrun(&["run", &notebook, "--backend", "process", "--asset", &asset]);
    assert!(output.status.success(), "{output:?}");
    assert_eq!(stdout(&output), "[load] ok\n[total] 6\n");
}

#[test]
fn test_missing_sandbox_program_fails() {
    let dir = tempfile::tempdir().unwrap();
    let notebook = write(&dir, "nb.txt", "1+1\n");
    let missing = path_str(&dir.path().join("no-such-sandbox"));

    let output = cellrun(&[
        "run",
        &notebook,
        "--backend",
        "process",
        "--sandbox-program",
        &missing,
    ]);
    assert!(!output.status.success());
    assert!(stdout(&output).is_empty());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Sandbox did not start"), "{stderr}");
}
