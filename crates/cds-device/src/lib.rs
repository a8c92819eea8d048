//! Device abstraction (spec.md §4.6) and the content-addressed local
//! filesystem device every replica ultimately stores bytes on.

mod error;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

pub use error::{Error, Result};

/// A place items can be put, fetched, and checked for. `LocalDevice`
/// implements this against a filesystem tree; `cds-device-net` implements it
/// against the rest of the swarm (spec.md §4.6, §4.7).
#[async_trait]
pub trait Device: Send + Sync {
    async fn put(&self, id: &str, content: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>>;
    async fn exists(&self, id: &str) -> Result<bool>;
    /// Cheap reachability check, independent of any specific item.
    async fn ping(&self) -> Result<bool>;
    /// Physically removes an item, used by purge (spec.md §5.8). Devices
    /// that cannot honor removal (e.g. a read-through network device) treat
    /// this as a no-op rather than an error.
    async fn remove(&self, id: &str) -> Result<()>;
}

/// Splits a content id into the three path segments the source's sharded
/// layout uses, so no single directory holds more than a few thousand
/// entries (spec.md §4.6: `baseDir/<id[0:2]>/<id[2:6]>/<id[4:10]>/<id>`).
fn shard_path(base_dir: &Path, id: &str) -> Result<PathBuf> {
    if id.len() < 10 {
        return Err(Error::IdTooShort(id.to_string()));
    }
    Ok(base_dir
        .join(&id[0..2])
        .join(&id[2..6])
        .join(&id[4..10])
        .join(id))
}

pub struct LocalDevice {
    base_dir: PathBuf,
}

impl LocalDevice {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn item_path(&self, id: &str) -> Result<PathBuf> {
        shard_path(&self.base_dir, id)
    }
}

#[async_trait]
impl Device for LocalDevice {
    /// Writes content to its sharded path. Never retries on failure
    /// (spec.md §4.6, §9 Redesign Flag: a failed put surfaces immediately
    /// as a non-200 `DeviceStatus` rather than being silently retried).
    async fn put(&self, id: &str, content: &mut (dyn AsyncRead + Unpin + Send)) -> Result<()> {
        let path = shard_path(&self.base_dir, id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| Error::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = tokio::fs::File::create(&path).await.map_err(|e| Error::Write {
            path: path.clone(),
            source: e,
        })?;
        tokio::io::copy(content, &mut file).await.map_err(|e| Error::Write {
            path: path.clone(),
            source: e,
        })?;
        file.flush().await.map_err(|e| Error::Write {
            path: path.clone(),
            source: e,
        })?;
        debug!(%id, ?path, "stored item locally");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Box<dyn AsyncRead + Unpin + Send>> {
        let path = shard_path(&self.base_dir, id)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(id.to_string())),
            Err(e) => Err(Error::Read { path, source: e }),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let path = shard_path(&self.base_dir, id)?;
        match tokio::fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Read { path, source: e }),
        }
    }

    async fn ping(&self) -> Result<bool> {
        match tokio::fs::metadata(&self.base_dir).await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("local device ping failed: {e}");
                Ok(false)
            }
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let path = shard_path(&self.base_dir, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Write { path, source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_path_splits_id_into_three_levels() {
        let base = Path::new("/base");
        let path = shard_path(base, "abcdef0123456789").unwrap();
        assert_eq!(path, Path::new("/base/ab/cdef/012345/abcdef0123456789"));
    }

    #[test]
    fn short_id_is_rejected() {
        let base = Path::new("/base");
        assert!(matches!(shard_path(base, "abc"), Err(Error::IdTooShort(_))));
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        let id = "abcdef0123456789";

        let mut content = std::io::Cursor::new(b"hello world".to_vec());
        device.put(id, &mut content).await.unwrap();

        assert!(device.exists(id).await.unwrap());
        let mut reader = device.get(id).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello world");
    }

    #[tokio::test]
    async fn get_missing_item_errors() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        assert!(matches!(
            device.get("abcdef0123456789").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn ping_succeeds_for_existing_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let device = LocalDevice::new(dir.path());
        assert!(device.ping().await.unwrap());
    }
}
