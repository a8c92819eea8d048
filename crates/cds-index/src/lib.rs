//! Local item index (spec.md §4.4): metadata plus per-device replication
//! status for every item, mirrored in memory and flushed to `index.json`
//! with the tmp-file-then-rename pattern used for on-disk session state.

mod error;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

pub use error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceStatus {
    pub code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeviceStatus {
    pub fn ok() -> Self {
        Self {
            code: 200,
            message: None,
        }
    }

    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ItemRecord {
    pub id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub status: HashMap<String, DeviceStatus>,
    /// Additive field: items are tombstoned rather than removed from the
    /// index so peers that only ever learn of the delete via broadcast can
    /// still resolve the id (spec.md §5.8, §9 Open Question 5).
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// When set, writes are coalesced and flushed on this interval instead
    /// of synchronously after every mutation.
    pub flush_interval: Option<Duration>,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            flush_interval: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct OnDisk {
    items: HashMap<String, ItemRecord>,
}

pub struct Index {
    path: PathBuf,
    items: RwLock<HashMap<String, ItemRecord>>,
    dirty: std::sync::atomic::AtomicBool,
    /// When `None`, every mutation flushes synchronously (spec.md §4.4: "the
    /// source serializes the entire map on every create"). When `Some`, a
    /// background task owns flushing and mutations only mark the index dirty
    /// (spec.md §9 Redesign Flag: bounded-coalescing writer).
    flush_interval: Option<Duration>,
}

impl Index {
    pub async fn open(base_dir: impl AsRef<Path>, opts: IndexOptions) -> Result<std::sync::Arc<Self>> {
        let base_dir = base_dir.as_ref();
        tokio::fs::create_dir_all(base_dir)
            .await
            .map_err(|e| Error::Write {
                path: base_dir.to_path_buf(),
                source: e,
            })?;
        let path = base_dir.join("index.json");

        let items = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let on_disk: OnDisk = serde_json::from_slice(&bytes).map_err(|e| Error::Malformed {
                    path: path.clone(),
                    source: e,
                })?;
                on_disk.items
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(Error::Read {
                    path: path.clone(),
                    source: e,
                });
            }
        };

        let this = std::sync::Arc::new(Self {
            path,
            items: RwLock::new(items),
            dirty: std::sync::atomic::AtomicBool::new(false),
            flush_interval: opts.flush_interval,
        });

        if let Some(interval) = opts.flush_interval {
            let this = this.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if this.dirty.swap(false, std::sync::atomic::Ordering::AcqRel) {
                        if let Err(e) = this.flush().await {
                            warn!("error flushing index: {e:#}");
                        }
                    }
                }
            });
        }

        Ok(this)
    }

    pub async fn get_item(&self, id: &str) -> Option<ItemRecord> {
        self.items.read().await.get(id).cloned()
    }

    /// Inserts a new item record. Returns `Error::AlreadyExists` if `id` is
    /// already indexed, matching the source's uniqueness guarantee on
    /// `createItem` (spec.md §4.4).
    pub async fn create_item(&self, record: ItemRecord) -> Result<()> {
        {
            let mut items = self.items.write().await;
            if items.contains_key(&record.id) {
                return Err(Error::AlreadyExists(record.id));
            }
            items.insert(record.id.clone(), record);
        }
        self.mark_dirty_and_maybe_flush().await
    }

    /// Replaces an existing item record in place (used to update
    /// per-device status and the `deleted` tombstone after the record has
    /// been created).
    pub async fn update_item(&self, record: ItemRecord) -> Result<()> {
        {
            let mut items = self.items.write().await;
            if !items.contains_key(&record.id) {
                return Err(Error::NotFound(record.id));
            }
            items.insert(record.id.clone(), record);
        }
        self.mark_dirty_and_maybe_flush().await
    }

    pub async fn all_items(&self) -> Vec<ItemRecord> {
        self.items.read().await.values().cloned().collect()
    }

    /// Persists immediately unless a coalescing interval is configured, in
    /// which case the background flush task (spawned in `open`) picks up the
    /// dirty flag on its own schedule (spec.md §4.4, §9 Redesign Flag).
    async fn mark_dirty_and_maybe_flush(&self) -> Result<()> {
        self.dirty.store(true, std::sync::atomic::Ordering::Release);
        if self.flush_interval.is_none() {
            self.flush().await
        } else {
            Ok(())
        }
    }

    pub async fn flush(&self) -> Result<()> {
        let items = self.items.read().await;
        let on_disk = OnDisk {
            items: items.clone(),
        };
        drop(items);

        let bytes = serde_json::to_vec(&on_disk).expect("index is always serializable");
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| Error::Write {
            path: tmp.clone(),
            source: e,
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| Error::Write {
            path: self.path.clone(),
            source: e,
        })?;
        self.dirty.store(false, std::sync::atomic::Ordering::Release);
        trace!(path = ?self.path, "flushed index");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_reload_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let index = Index::open(dir.path(), IndexOptions::default()).await.unwrap();
            index
                .create_item(ItemRecord {
                    id: "abc123".to_string(),
                    metadata: serde_json::json!({"name": "x"}),
                    status: HashMap::from([("local".to_string(), DeviceStatus::ok())]),
                    deleted: false,
                })
                .await
                .unwrap();
        }

        let index = Index::open(dir.path(), IndexOptions::default()).await.unwrap();
        let item = index.get_item("abc123").await.unwrap();
        assert_eq!(item.metadata["name"], "x");
    }

    #[tokio::test]
    async fn duplicate_id_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), IndexOptions::default()).await.unwrap();
        let record = ItemRecord {
            id: "dup".to_string(),
            ..Default::default()
        };
        index.create_item(record.clone()).await.unwrap();
        assert!(matches!(
            index.create_item(record).await,
            Err(Error::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn update_unknown_item_errors() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), IndexOptions::default()).await.unwrap();
        let record = ItemRecord {
            id: "ghost".to_string(),
            ..Default::default()
        };
        assert!(matches!(index.update_item(record).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn coalesced_writes_are_visible_in_process_before_flush_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(
            dir.path(),
            IndexOptions {
                flush_interval: Some(Duration::from_secs(3600)),
            },
        )
        .await
        .unwrap();

        index
            .create_item(ItemRecord {
                id: "coalesced".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        // Visible immediately in-process (spec.md §4.4 visibility invariant)...
        assert!(index.get_item("coalesced").await.is_some());
        // ...but the background flush task hasn't run yet, so nothing durable exists on disk
        // until an explicit flush (or shutdown) happens.
        assert!(!dir.path().join("index.json").exists());

        index.flush().await.unwrap();
        assert!(dir.path().join("index.json").exists());
    }
}
