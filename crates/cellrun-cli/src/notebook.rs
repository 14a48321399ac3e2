//! Notebook files: plain text with cells separated by `%%` marker lines.
//!
//! ```text
//! %% load
//! rows = readFile("data.csv")
//! %%
//! rows.split("\n").length
//! ```
//!
//! Text after `%%` names the cell; unnamed cells are called `cell-<n>`,
//! counting from 1. Text before the first marker is a cell of its own.
//! Blank cells are dropped.

use std::collections::HashSet;

use anyhow::{Result, bail};

const MARKER: &str = "%%";

/// One cell of a notebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub id: String,
    pub source: String,
}

/// Split a notebook into its cells, in order.
pub fn parse(text: &str) -> Result<Vec<Cell>> {
    let mut cells = Vec::new();
    let mut name: Option<String> = None;
    let mut lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(MARKER) {
            push_cell(&mut cells, name.take(), &lines);
            lines.clear();
            let rest = rest.trim();
            name = (!rest.is_empty()).then(|| rest.to_string());
        } else {
            lines.push(line);
        }
    }
    push_cell(&mut cells, name, &lines);

    let mut seen = HashSet::new();
    for cell in &cells {
        if !seen.insert(cell.id.as_str()) {
            bail!("duplicate cell id '{}'", cell.id);
        }
    }
    Ok(cells)
}

fn push_cell(cells: &mut Vec<Cell>, name: Option<String>, lines: &[&str]) {
    let source = lines.join("\n").trim().to_string();
    if source.is_empty() {
        return;
    }
    let id = name.unwrap_or_else(|| format!("cell-{}", cells.len() + 1));
    cells.push(Cell { id, source });
}
