//! Assets that must be visible inside the sandbox.
//!
//! The document layer owns an [`AssetArchive`]; the runtime only ever reads
//! from it. Every time a backend enters the syncing phase, the
//! [`AssetSyncCollector`] gathers the entries flagged for synchronization and
//! their bytes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use cellrun_sandbox::AssetEntry;
use futures::future::join_all;
use tokio::sync::RwLock;

use crate::error::Error;

/// A manifest entry of an [`AssetArchive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDescriptor {
    /// Path of the asset, also used as its path inside the sandbox.
    pub path: String,
    /// Whether the asset must be copied into the sandbox.
    pub sync: bool,
}

/// Read access to the document's asset store.
#[async_trait]
pub trait AssetArchive: Send + Sync {
    /// The asset manifest, in a stable order.
    async fn asset_entries(&self) -> Result<Vec<AssetDescriptor>, Error>;

    /// Contents of one asset.
    async fn blob(&self, path: &str) -> Result<Vec<u8>, Error>;
}

/// An [`AssetArchive`] held in memory.
#[derive(Debug, Default)]
pub struct MemoryArchive {
    entries: RwLock<Vec<(AssetDescriptor, Vec<u8>)>>,
}

impl MemoryArchive {
    /// Create an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an asset while building the archive.
    #[must_use]
    pub fn with_asset(
        mut self,
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
        sync: bool,
    ) -> Self {
        upsert(self.entries.get_mut(), path.into(), data.into(), sync);
        self
    }

    /// Add or replace an asset.
    pub async fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>, sync: bool) {
        upsert(&mut *self.entries.write().await, path.into(), data.into(), sync);
    }

    /// Remove an asset. Returns whether it existed.
    pub async fn remove(&self, path: &str) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(descriptor, _)| descriptor.path != path);
        entries.len() != before
    }
}

fn upsert(entries: &mut Vec<(AssetDescriptor, Vec<u8>)>, path: String, data: Vec<u8>, sync: bool) {
    let descriptor = AssetDescriptor { path, sync };
    match entries.iter_mut().find(|(d, _)| d.path == descriptor.path) {
        Some(existing) => *existing = (descriptor, data),
        None => entries.push((descriptor, data)),
    }
}

#[async_trait]
impl AssetArchive for MemoryArchive {
    async fn asset_entries(&self) -> Result<Vec<AssetDescriptor>, Error> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .map(|(descriptor, _)| descriptor.clone())
            .collect())
    }

    async fn blob(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.entries
            .read()
            .await
            .iter()
            .find(|(descriptor, _)| descriptor.path == path)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| Error::Asset(format!("no asset at {path}")))
    }
}

/// Gathers the assets to send with a `sync` command.
#[derive(Clone, Default)]
pub struct AssetSyncCollector {
    archive: Option<Arc<dyn AssetArchive>>,
}

impl fmt::Debug for AssetSyncCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssetSyncCollector")
            .field("has_archive", &self.archive.is_some())
            .finish()
    }
}

impl AssetSyncCollector {
    /// Create a collector over an optional archive.
    #[must_use]
    pub fn new(archive: Option<Arc<dyn AssetArchive>>) -> Self {
        Self { archive }
    }

    /// Collect every asset flagged for sync, in manifest order.
    ///
    /// Blobs are fetched concurrently. Assets that cannot be read are logged
    /// and left out; a missing archive yields an empty list.
    #[tracing::instrument(skip(self))]
    pub async fn collect(&self) -> Vec<AssetEntry> {
        let Some(archive) = &self.archive else {
            return Vec::new();
        };

        let descriptors = match archive.asset_entries().await {
            Ok(descriptors) => descriptors,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read asset manifest");
                return Vec::new();
            }
        };

        let fetches = descriptors
            .into_iter()
            .filter(|descriptor| descriptor.sync)
            .map(|descriptor| async move {
                let blob = archive.blob(&descriptor.path).await;
                (descriptor.path, blob)
            });

        let entries: Vec<AssetEntry> = join_all(fetches)
            .await
            .into_iter()
            .filter_map(|(path, blob)| match blob {
                Ok(data) => Some(AssetEntry::new(path, data)),
                Err(e) => {
                    tracing::warn!(%path, error = %e, "Skipping asset that could not be read");
                    None
                }
            })
            .collect();

        tracing::debug!(count = entries.len(), "Collected assets");
        entries
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Archive whose manifest lists a path it cannot serve.
    struct BrokenArchive;

    #[async_trait]
    impl AssetArchive for BrokenArchive {
        async fn asset_entries(&self) -> Result<Vec<AssetDescriptor>, Error> {
            Ok(vec![
                AssetDescriptor {
                    path: "ok.txt".into(),
                    sync: true,
                },
                AssetDescriptor {
                    path: "gone.txt".into(),
                    sync: true,
                },
            ])
        }

        async fn blob(&self, path: &str) -> Result<Vec<u8>, Error> {
            match path {
                "ok.txt" => Ok(b"ok".to_vec()),
                other => Err(Error::Asset(format!("no asset at {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn test_no_archive_yields_nothing() {
        assert!(AssetSyncCollector::new(None).collect().await.is_empty());
    }

    #[tokio::test]
    async fn test_only_synced_assets_in_manifest_order() {
        let archive = MemoryArchive::new()
            .with_asset("b.csv", b"b".to_vec(), true)
            .with_asset("private.bin", b"p".to_vec(), false)
            .with_asset("a.csv", b"1,2".to_vec(), true);
        let collector = AssetSyncCollector::new(Some(Arc::new(archive)));

        let entries = collector.collect().await;
        assert_eq!(
            entries,
            vec![AssetEntry::new("b.csv", b"b".to_vec()), AssetEntry::new("a.csv", b"1,2".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_unreadable_assets_are_skipped() {
        let collector = AssetSyncCollector::new(Some(Arc::new(BrokenArchive)));
        let entries = collector.collect().await;
        assert_eq!(entries, vec![AssetEntry::new("ok.txt", b"ok".to_vec())]);
    }

    #[tokio::test]
    async fn test_memory_archive_insert_replaces() {
        let archive = MemoryArchive::new().with_asset("a", b"1".to_vec(), true);
        archive.insert("a", b"2".to_vec(), false).await;
        assert_eq!(
            archive.asset_entries().await.unwrap(),
            vec![AssetDescriptor {
                path: "a".into(),
                sync: false
            }]
        );
        assert_eq!(archive.blob("a").await.unwrap(), b"2");
        assert!(archive.remove("a").await);
        assert!(archive.blob("a").await.is_err());
    }
}
