//! Peer roster (spec.md §4.3): every known peer, including this process's
//! own node, is a JSON file under `<base>/peers/`. The local node is kept
//! under the reserved filename `__local__` so it never collides with a real
//! peer id.

mod error;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub use error::{Error, Result};

const LOCAL_NODE_FILENAME: &str = "__local__";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub master: bool,
}

fn default_protocol() -> String {
    "http".to_string()
}

impl Peer {
    pub fn new(id: Uuid, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            protocol: default_protocol(),
            master: false,
        }
    }
}

pub struct Swarm {
    peers_dir: PathBuf,
    local_id: RwLock<Option<Uuid>>,
}

impl Swarm {
    pub async fn open(base_dir: impl AsRef<Path>) -> Result<Self> {
        let peers_dir = base_dir.as_ref().join("peers");
        tokio::fs::create_dir_all(&peers_dir)
            .await
            .map_err(|e| Error::Write {
                path: peers_dir.clone(),
                source: e,
            })?;

        let local_id = match read_peer_file(&peers_dir.join(LOCAL_NODE_FILENAME)).await {
            Ok(Some(peer)) => Some(peer.id),
            Ok(None) => None,
            Err(e) => {
                warn!("error reading local node record: {e:#}");
                None
            }
        };

        Ok(Self {
            peers_dir,
            local_id: RwLock::new(local_id),
        })
    }

    fn peer_path(&self, id: Uuid) -> PathBuf {
        self.peers_dir.join(id.to_string())
    }

    pub async fn get_local_node(&self) -> Result<Peer> {
        read_peer_file(&self.peers_dir.join(LOCAL_NODE_FILENAME))
            .await?
            .ok_or(Error::NoLocalNode)
    }

    /// Writes (or replaces) this process's own node record.
    pub async fn update_local_node(&self, peer: Peer) -> Result<()> {
        write_peer_file(&self.peers_dir.join(LOCAL_NODE_FILENAME), &peer).await?;
        *self.local_id.write().await = Some(peer.id);
        Ok(())
    }

    /// All known peers excluding the local node.
    pub async fn get_peers(&self) -> Result<Vec<Peer>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.peers_dir)
            .await
            .map_err(|e| Error::Read {
                path: self.peers_dir.clone(),
                source: e,
            })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Read {
            path: self.peers_dir.clone(),
            source: e,
        })? {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some(LOCAL_NODE_FILENAME) {
                continue;
            }
            if let Some(peer) = read_peer_file(&path).await? {
                out.push(peer);
            }
        }
        Ok(out)
    }

    /// Inserts a new peer or updates the existing record for its id
    /// (resolves an inverted "peer already known" check in the source that
    /// silently dropped updates to already-known peers).
    pub async fn join(&self, peer: Peer) -> Result<()> {
        let path = self.peer_path(peer.id);
        let existed = tokio::fs::try_exists(&path).await.unwrap_or(false);
        write_peer_file(&path, &peer).await?;
        debug!(peer = %peer.id, existed, "peer joined swarm");
        Ok(())
    }

    pub async fn leave(&self, id: Uuid) -> Result<()> {
        let path = self.peer_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Write { path, source: e }),
        }
    }
}

async fn read_peer_file(path: &Path) -> Result<Option<Peer>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Malformed {
                path: path.to_path_buf(),
                source: e,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Read {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn write_peer_file(path: &Path, peer: &Peer) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(peer).expect("Peer is always serializable");
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| Error::Write {
            path: tmp.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| Error::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_then_update_overwrites_record() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = Swarm::open(dir.path()).await.unwrap();

        let id = Uuid::new_v4();
        let mut peer = Peer::new(id, "10.0.0.2", 9000);
        swarm.join(peer.clone()).await.unwrap();

        peer.port = 9100;
        swarm.join(peer.clone()).await.unwrap();

        let peers = swarm.get_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port, 9100);
    }

    #[tokio::test]
    async fn local_node_excluded_from_peers() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = Swarm::open(dir.path()).await.unwrap();

        swarm
            .update_local_node(Peer::new(Uuid::new_v4(), "127.0.0.1", 8000))
            .await
            .unwrap();
        swarm.join(Peer::new(Uuid::new_v4(), "10.0.0.3", 8001)).await.unwrap();

        assert_eq!(swarm.get_peers().await.unwrap().len(), 1);
        assert!(swarm.get_local_node().await.is_ok());
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let swarm = Swarm::open(dir.path()).await.unwrap();
        let id = Uuid::new_v4();
        swarm.leave(id).await.unwrap();
        swarm.join(Peer::new(id, "10.0.0.4", 8002)).await.unwrap();
        swarm.leave(id).await.unwrap();
        swarm.leave(id).await.unwrap();
        assert!(swarm.get_peers().await.unwrap().is_empty());
    }
}
