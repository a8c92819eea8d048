//! Replication core (spec.md §5): hashes incoming content while spooling it
//! to a temp file, derives a content-addressed id, indexes it, and fans the
//! bytes out to every configured device in parallel.

mod error;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use cds_device::Device;
use cds_index::{DeviceStatus, Index, ItemRecord};
use cds_index_net::IndexNet;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

pub use error::{Error, Result};

/// What a save, get, delete, or sync operation was doing when it failed, so
/// a registered error handler can tell operations apart (spec.md §5.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Save,
    Get,
    Delete,
    Sync,
    Purge,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Save => "save",
            Operation::Get => "get",
            Operation::Delete => "delete",
            Operation::Sync => "sync",
            Operation::Purge => "purge",
        }
    }
}

pub type ErrorHandler = Arc<dyn Fn(&anyhow::Error, &str, Option<&str>, Operation) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: String,
    pub namespace: Option<String>,
    pub metadata: Value,
}

fn compose_id(hash_hex: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{hash_hex}_{ns}"),
        None => hash_hex.to_string(),
    }
}

pub struct DataStore {
    devices: Vec<(String, Arc<dyn Device>)>,
    index: Arc<Index>,
    index_net: Option<Arc<IndexNet>>,
    spool_dir: PathBuf,
    error_handler: Option<ErrorHandler>,
}

impl DataStore {
    pub fn new(
        devices: Vec<(String, Arc<dyn Device>)>,
        index: Arc<Index>,
        index_net: Option<Arc<IndexNet>>,
        spool_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            devices,
            index,
            index_net,
            spool_dir: spool_dir.into(),
            error_handler: None,
        }
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = Some(handler);
        self
    }

    fn report_error(&self, error: &anyhow::Error, item_id: &str, namespace: Option<&str>, op: Operation) {
        warn!(item_id, ?namespace, op = op.as_str(), "{error:#}");
        if let Some(handler) = &self.error_handler {
            handler(error, item_id, namespace, op);
        }
    }

    /// Streams `content` to a temp file while hashing it, derives the
    /// content-addressed id, indexes the item, and fans the bytes out to
    /// every device in parallel (spec.md §5.1-§5.3).
    ///
    /// Re-saving bytes that hash to an id already present in the index is
    /// treated as a successful no-op fan-out: the content is already
    /// replicated under that id (spec.md §9 Open Question 1).
    pub async fn save(
        &self,
        mut content: impl AsyncRead + Unpin,
        namespace: Option<String>,
        metadata: Value,
    ) -> Result<Item> {
        tokio::fs::create_dir_all(&self.spool_dir)
            .await
            .map_err(Error::Spool)?;
        let spool_path = self.spool_dir.join(Uuid::new_v4().to_string());

        let mut hasher = Sha256::new();
        {
            let mut spool_file = tokio::fs::File::create(&spool_path)
                .await
                .map_err(Error::Spool)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = content.read(&mut buf).await.map_err(Error::Spool)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                spool_file.write_all(&buf[..n]).await.map_err(Error::Spool)?;
            }
            spool_file.flush().await.map_err(Error::Spool)?;
        }

        let id = compose_id(&hex::encode(hasher.finalize()), namespace.as_deref());
        let result = self.replicate(&id, &spool_path, namespace, metadata).await;
        let _ = tokio::fs::remove_file(&spool_path).await;
        result
    }

    async fn replicate(
        &self,
        id: &str,
        spool_path: &std::path::Path,
        namespace: Option<String>,
        metadata: Value,
    ) -> Result<Item> {
        let record = ItemRecord {
            id: id.to_string(),
            metadata: metadata.clone(),
            status: HashMap::new(),
            deleted: false,
        };

        match self.index.create_item(record.clone()).await {
            Ok(()) => {}
            Err(cds_index::Error::AlreadyExists(_)) => {
                debug!(%id, "content already replicated under this id, skipping fan-out");
                return Ok(Item {
                    id: id.to_string(),
                    namespace,
                    metadata,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let puts = self.devices.iter().map(|(name, device)| {
            let name = name.clone();
            let device = device.clone();
            let spool_path = spool_path.to_path_buf();
            async move {
                let status = match tokio::fs::File::open(&spool_path).await {
                    Ok(mut file) => match device.put(id, &mut file).await {
                        Ok(()) => DeviceStatus::ok(),
                        Err(e) => DeviceStatus::error(500, e.to_string()),
                    },
                    Err(e) => DeviceStatus::error(500, e.to_string()),
                };
                (name, status)
            }
        });
        let results = futures::future::join_all(puts).await;

        let mut status = HashMap::new();
        let mut any_failed = false;
        for (name, device_status) in results {
            if device_status.code != 200 {
                any_failed = true;
                self.report_error(
                    &anyhow::anyhow!(device_status.message.clone().unwrap_or_default()),
                    id,
                    namespace.as_deref(),
                    Operation::Save,
                );
            }
            status.insert(name, device_status);
        }

        self.index
            .update_item(ItemRecord {
                id: id.to_string(),
                metadata: metadata.clone(),
                status,
                deleted: false,
            })
            .await?;

        if let Some(index_net) = &self.index_net {
            index_net
                .announce_item(ItemRecord {
                    id: id.to_string(),
                    metadata: metadata.clone(),
                    status: HashMap::new(),
                    deleted: false,
                })
                .await;
        }

        let item = Item {
            id: id.to_string(),
            namespace,
            metadata,
        };

        // The item is always indexed above regardless of outcome -- the
        // index is the source of truth -- but any device failure still
        // surfaces as an error carrying the item (spec.md §4.8 step 6).
        if any_failed {
            return Err(Error::PartialFailure { item });
        }

        Ok(item)
    }

    /// Returns a reader from the first device that both pings and reports
    /// the item present (spec.md §5.4).
    pub async fn get(&self, hash_hex: &str, namespace: Option<&str>) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let id = compose_id(hash_hex, namespace);
        for (_, device) in &self.devices {
            match device.ping().await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.report_error(&anyhow::anyhow!(e.to_string()), &id, namespace, Operation::Get);
                    continue;
                }
            }
            match device.exists(&id).await {
                Ok(true) => match device.get(&id).await {
                    Ok(reader) => return Ok(reader),
                    Err(e) => {
                        self.report_error(&anyhow::anyhow!(e.to_string()), &id, namespace, Operation::Get);
                        continue;
                    }
                },
                Ok(false) => continue,
                Err(e) => {
                    self.report_error(&anyhow::anyhow!(e.to_string()), &id, namespace, Operation::Get);
                    continue;
                }
            }
        }
        Err(Error::NotFound(id))
    }

    /// Tombstones an item in the index rather than attempting to scrub it
    /// from every device synchronously (spec.md §5.8: deletion is logical;
    /// `purge` does the physical cleanup).
    pub async fn delete(&self, hash_hex: &str, namespace: Option<&str>) -> Result<()> {
        let id = compose_id(hash_hex, namespace);
        let mut record = self.index.get_item(&id).await.ok_or_else(|| Error::NotFound(id.clone()))?;
        record.deleted = true;
        self.index.update_item(record).await?;
        Ok(())
    }

    /// Re-replicates every item that's missing a `200` status for one of
    /// the configured devices, pulling bytes from whichever device already
    /// has them (spec.md §5.8).
    pub async fn sync(&self) -> Result<()> {
        for record in self.index.all_items().await {
            if record.deleted {
                continue;
            }
            let missing: Vec<_> = self
                .devices
                .iter()
                .filter(|(name, _)| {
                    !matches!(record.status.get(*name), Some(s) if s.code == 200)
                })
                .collect();
            if missing.is_empty() {
                continue;
            }

            let mut source_device = None;
            for (_, device) in &self.devices {
                if matches!(device.exists(&record.id).await, Ok(true)) {
                    source_device = Some(device.clone());
                    break;
                }
            }
            let Some(source_device) = source_device else {
                self.report_error(
                    &anyhow::anyhow!("no device currently holds item {}", record.id),
                    &record.id,
                    None,
                    Operation::Sync,
                );
                continue;
            };

            let mut status = record.status.clone();
            for (name, device) in missing {
                let result: anyhow::Result<()> = async {
                    let mut reader = source_device.get(&record.id).await?;
                    device.put(&record.id, &mut reader).await?;
                    Ok(())
                }
                .await;

                match result {
                    Ok(()) => {
                        status.insert(name.clone(), DeviceStatus::ok());
                    }
                    Err(e) => {
                        status.insert(name.clone(), DeviceStatus::error(500, e.to_string()));
                        self.report_error(&e, &record.id, None, Operation::Sync);
                    }
                }
            }

            self.index
                .update_item(ItemRecord {
                    status,
                    ..record
                })
                .await?;
        }
        Ok(())
    }

    /// Physically removes every device's copy of items tombstoned by
    /// `delete` (spec.md §5.8).
    pub async fn purge(&self) -> Result<()> {
        for record in self.index.all_items().await {
            if !record.deleted {
                continue;
            }
            for (_, device) in &self.devices {
                if let Err(e) = device.remove(&record.id).await {
                    self.report_error(&anyhow::anyhow!(e.to_string()), &record.id, None, Operation::Purge);
                }
            }
        }
        Ok(())
    }

    /// Flushes the index to disk. Called on orderly shutdown (spec.md §5).
    pub async fn close(&self) -> Result<()> {
        self.index.flush().await?;
        Ok(())
    }
}

/// A device that always refuses writes, used to exercise the partial-failure
/// path of `save` (spec.md §8 scenario S3) without touching the filesystem.
#[cfg(test)]
struct FailingDevice;

#[cfg(test)]
#[async_trait::async_trait]
impl Device for FailingDevice {
    async fn put(&self, _id: &str, _content: &mut (dyn AsyncRead + Unpin + Send)) -> cds_device::Result<()> {
        Err(cds_device::Error::Write {
            path: "/dev/full".into(),
            source: std::io::Error::other("disk full"),
        })
    }
    async fn get(&self, id: &str) -> cds_device::Result<Box<dyn AsyncRead + Unpin + Send>> {
        Err(cds_device::Error::NotFound(id.to_string()))
    }
    async fn exists(&self, _id: &str) -> cds_device::Result<bool> {
        Ok(false)
    }
    async fn ping(&self) -> cds_device::Result<bool> {
        Ok(false)
    }
    async fn remove(&self, _id: &str) -> cds_device::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn partial_device_failure_is_recorded_per_device_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let good: Arc<dyn Device> = Arc::new(cds_device::LocalDevice::new(dir.path().join("good")));
        let bad: Arc<dyn Device> = Arc::new(FailingDevice);

        let handler_calls = Arc::new(AtomicUsize::new(0));
        let handler_calls_clone = handler_calls.clone();
        let store = DataStore::new(
            vec![("good".to_string(), good), ("bad".to_string(), bad)],
            index.clone(),
            None,
            dir.path().join("spool"),
        )
        .with_error_handler(Arc::new(move |_err, _id, _ns, op| {
            assert_eq!(op, Operation::Save);
            handler_calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        // save() resolves with an error carrying the item even though only
        // one of two devices failed (spec.md §4.8 step 6: "if any device
        // failed... resolve with (Error(...), item)"); the item is still
        // indexed regardless, since the index is the source of truth.
        let err = store
            .save(Cursor::new(b"partial".to_vec()), None, Value::Null)
            .await
            .unwrap_err();
        let item = match err {
            Error::PartialFailure { item } => item,
            other => panic!("expected PartialFailure, got {other:?}"),
        };

        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

        let record = index.get_item(&item.id).await.unwrap();
        assert_eq!(record.status["good"].code, 200);
        assert_eq!(record.status["bad"].code, 500);
        assert!(record.status["bad"].message.is_some());
    }

    #[tokio::test]
    async fn save_then_get_roundtrips_through_a_local_device() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let device: Arc<dyn Device> = Arc::new(cds_device::LocalDevice::new(dir.path().join("device")));
        let store = DataStore::new(
            vec![("local".to_string(), device)],
            index,
            None,
            dir.path().join("spool"),
        );

        let item = store
            .save(Cursor::new(b"hello world".to_vec()), None, serde_json::json!({"name": "greeting"}))
            .await
            .unwrap();

        let hash = hex::encode(Sha256::digest(b"hello world"));
        assert_eq!(item.id, hash);

        let mut reader = store.get(&hash, None).await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn saving_identical_content_twice_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let device: Arc<dyn Device> = Arc::new(cds_device::LocalDevice::new(dir.path().join("device")));
        let store = DataStore::new(
            vec![("local".to_string(), device)],
            index,
            None,
            dir.path().join("spool"),
        );

        store.save(Cursor::new(b"same".to_vec()), None, Value::Null).await.unwrap();
        let second = store.save(Cursor::new(b"same".to_vec()), None, Value::Null).await.unwrap();
        assert_eq!(second.id, hex::encode(Sha256::digest(b"same")));
    }

    #[tokio::test]
    async fn delete_tombstones_without_removing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let device: Arc<dyn Device> = Arc::new(cds_device::LocalDevice::new(dir.path().join("device")));
        let store = DataStore::new(
            vec![("local".to_string(), device)],
            index,
            None,
            dir.path().join("spool"),
        );

        let item = store.save(Cursor::new(b"bye".to_vec()), None, Value::Null).await.unwrap();
        let hash = hex::encode(Sha256::digest(b"bye"));
        store.delete(&hash, None).await.unwrap();

        // still fetchable directly from the device until purge runs
        assert!(store.get(&hash, None).await.is_ok());
        let _ = item;
    }

    #[tokio::test]
    async fn purge_removes_tombstoned_items_from_devices() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let device: Arc<dyn Device> = Arc::new(cds_device::LocalDevice::new(dir.path().join("device")));
        let store = DataStore::new(
            vec![("local".to_string(), device)],
            index,
            None,
            dir.path().join("spool"),
        );

        store.save(Cursor::new(b"gone".to_vec()), None, Value::Null).await.unwrap();
        let hash = hex::encode(Sha256::digest(b"gone"));
        store.delete(&hash, None).await.unwrap();
        store.purge().await.unwrap();

        assert!(matches!(store.get(&hash, None).await, Err(Error::NotFound(_))));
    }
}
