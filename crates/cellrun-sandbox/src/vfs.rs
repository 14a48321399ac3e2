//! Private virtual file store of a sandbox.
//!
//! The store is populated from `sync` payloads and is the only file system
//! sandboxed programs can see. Paths are relative keys; a leading `/` is
//! accepted and dropped, so `/data/a.csv` and `data/a.csv` name the same file.

use std::collections::BTreeMap;

/// Errors produced by the virtual file store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VfsError {
    /// No file exists at the given path.
    #[error("File not found: {0}")]
    NotFound(String),

    /// The path is empty or escapes the store root.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

/// Result type for virtual file store operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// In-memory key-to-bytes file store.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileStore {
    files: BTreeMap<String, Vec<u8>>,
}

impl VirtualFileStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a path (drop leading `/` and `.` segments, reject `..`).
    fn normalize_path(path: &str) -> VfsResult<String> {
        let mut components: Vec<&str> = Vec::new();
        for component in path.split('/') {
            match component {
                "" | "." => continue,
                ".." => {
                    if components.pop().is_none() {
                        return Err(VfsError::InvalidPath(format!("path escapes root: {path}")));
                    }
                }
                c => components.push(c),
            }
        }

        if components.is_empty() {
            return Err(VfsError::InvalidPath(format!("empty path: {path:?}")));
        }
        Ok(components.join("/"))
    }

    /// Read a file's contents.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::NotFound`] if the file does not exist.
    pub fn read(&self, path: &str) -> VfsResult<&[u8]> {
        let key = Self::normalize_path(path)?;
        self.files
            .get(&key)
            .map(Vec::as_slice)
            .ok_or_else(|| VfsError::NotFound(path.to_string()))
    }

    /// Write a file, replacing any previous contents.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::InvalidPath`] for empty or escaping paths.
    pub fn write(&mut self, path: &str, data: impl Into<Vec<u8>>) -> VfsResult<()> {
        let key = Self::normalize_path(path)?;
        self.files.insert(key, data.into());
        Ok(())
    }

    /// Whether a file exists at the given path.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        Self::normalize_path(path).is_ok_and(|key| self.files.contains_key(&key))
    }

    /// All stored paths in sorted order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Number of stored files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
