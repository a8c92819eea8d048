//! Network-aware item index (spec.md §4.5): wraps the local index with
//! broadcast fallback reads and fire-and-forget write fan-out over the peer
//! transport, and keeps a reserved `__p2p__` item whose metadata mirrors the
//! peer roster so a remote peer can learn the swarm just by asking for that
//! id, the same way it asks for any other item.

mod error;

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use cds_index::{Index, ItemRecord};
use cds_swarm::{Peer, Swarm};
use cds_transport::{Envelope, PeerChannel};
use tracing::{debug, warn};

pub use error::{Error, Result};

pub const NAMESPACE: &str = "p2p:index";
pub const GET_ITEM: &str = "index:getItem";
pub const CREATE_ITEM: &str = "index:createItem";

/// Reserved item id carrying the serialized peer roster (spec.md §4.5,
/// §9 Open Question 2).
pub const NETWORK_MAP_ID: &str = "__p2p__";

pub struct IndexNet {
    index: Arc<Index>,
    swarm: Arc<Swarm>,
    channel: Arc<PeerChannel>,
    local_peer_id: String,
}

impl IndexNet {
    pub fn new(index: Arc<Index>, swarm: Arc<Swarm>, channel: Arc<PeerChannel>, local_peer_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            index,
            swarm,
            channel,
            local_peer_id: local_peer_id.into(),
        })
    }

    /// Registers the `index:getItem` responder on the transport. Call once
    /// after construction.
    pub fn register_handlers(self: &Arc<Self>) {
        let this = self.clone();
        self.channel.register_handler(NAMESPACE, GET_ITEM, move |req: Envelope| {
            let this = this.clone();
            async move {
                let id = req
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing id".to_string())?;
                match this.index.get_item(id).await {
                    Some(item) => serde_json::to_value(item).map_err(|e| e.to_string()),
                    None => Err(format!("item {id} not found")),
                }
            }
        });

        let this = self.clone();
        self.channel.register_handler(NAMESPACE, CREATE_ITEM, move |req: Envelope| {
            let this = this.clone();
            async move {
                let record: ItemRecord = serde_json::from_value(req.data).map_err(|e| e.to_string())?;
                match this.index.create_item(record).await {
                    Ok(()) => Ok(serde_json::Value::Bool(true)),
                    Err(cds_index::Error::AlreadyExists(_)) => Ok(serde_json::Value::Bool(true)),
                    Err(e) => Err(e.to_string()),
                }
            }
        });
    }

    /// Local-first lookup; broadcasts to known peers only on a local miss
    /// (spec.md §4.5).
    pub async fn get_item(&self, id: &str) -> Result<ItemRecord> {
        if let Some(item) = self.index.get_item(id).await {
            return Ok(item);
        }

        let peers = self.swarm.get_peers().await?;
        let targets = peer_addrs(&peers);
        if targets.is_empty() {
            return Err(Error::NotFound(id.to_string()));
        }

        let request = Envelope::request(
            NAMESPACE,
            &self.local_peer_id,
            "*",
            GET_ITEM,
            serde_json::json!({ "id": id }),
            true,
        );

        match self.channel.broadcast(&targets, request).await {
            Ok(response) => {
                if let Some(err) = response.envelope.error {
                    warn!(%err, %id, "peer reported item not found");
                    return Err(Error::NotFound(id.to_string()));
                }
                let remote: ItemRecord =
                    serde_json::from_value(response.envelope.data).map_err(|e| Error::MalformedPeerResponse {
                        peer: response.envelope.source.clone(),
                        source: e,
                    })?;
                self.synthesize_local_entry(&remote, &response.envelope.source).await;
                Ok(remote)
            }
            Err(_) => Err(Error::NotFound(id.to_string())),
        }
    }

    /// After resolving an id via broadcast, synthesizes a local entry so
    /// subsequent reads of the same id are local hits, with `metadata.nodes`
    /// recording which peer it came from (spec.md §4.5: "synthesize a local
    /// entry" with the returned `{id, metadata}` extended with
    /// `nodes: [respondingPeer.id]").
    async fn synthesize_local_entry(&self, remote: &ItemRecord, responding_peer: &str) {
        let mut metadata = remote.metadata.clone();
        match metadata {
            serde_json::Value::Object(ref mut map) => {
                map.insert("nodes".to_string(), serde_json::json!([responding_peer]));
            }
            _ => {
                metadata = serde_json::json!({ "value": metadata, "nodes": [responding_peer] });
            }
        }
        let record = ItemRecord {
            id: remote.id.clone(),
            metadata,
            status: remote.status.clone(),
            deleted: remote.deleted,
        };
        if let Err(e) = self.index.create_item(record).await {
            warn!(id = %remote.id, "failed to synthesize local entry from peer response: {e:#}");
        }
    }

    /// Creates the item locally, then announces it to every known peer
    /// without waiting for acknowledgement (spec.md §4.5: "write fan-out is
    /// local-create-then-broadcast-announce").
    pub async fn create_item(&self, record: ItemRecord) -> Result<()> {
        self.index.create_item(record.clone()).await?;
        self.announce_item(record).await;
        Ok(())
    }

    /// Broadcasts `index:createItem` for an already-locally-created record,
    /// without touching the local index. Fire-and-forget: per-peer send
    /// failures are logged, never propagated (spec.md §4.5).
    pub async fn announce_item(&self, record: ItemRecord) {
        let peers = match self.swarm.get_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("error listing peers to announce item: {e:#}");
                return;
            }
        };
        let data = serde_json::to_value(&record).expect("ItemRecord is always serializable");
        for (peer, addr) in peers.iter().zip(peer_addrs(&peers)) {
            let announce = Envelope::request(
                NAMESPACE,
                &self.local_peer_id,
                &peer.id.to_string(),
                CREATE_ITEM,
                data.clone(),
                false,
            );
            if let Err(e) = self.channel.send_fire_and_forget(addr, &announce).await {
                warn!(peer = %peer.id, "failed to announce item: {e:#}");
            }
        }
    }

    pub async fn join(&self, peer: Peer) -> Result<()> {
        self.swarm.join(peer).await?;
        self.refresh_network_map().await
    }

    pub async fn leave(&self, peer_id: uuid::Uuid) -> Result<()> {
        self.swarm.leave(peer_id).await?;
        self.refresh_network_map().await
    }

    async fn refresh_network_map(&self) -> Result<()> {
        let peers = self.swarm.get_peers().await?;
        let metadata = serde_json::to_value(&peers).expect("peer list is always serializable");
        let record = ItemRecord {
            id: NETWORK_MAP_ID.to_string(),
            metadata,
            status: HashMap::from([("local".to_string(), cds_index::DeviceStatus::ok())]),
            deleted: false,
        };

        match self.index.get_item(NETWORK_MAP_ID).await {
            Some(_) => self.index.update_item(record).await?,
            None => self.index.create_item(record).await?,
        }
        debug!(count = peers.len(), "refreshed network map");
        Ok(())
    }
}

fn peer_addrs(peers: &[Peer]) -> Vec<SocketAddr> {
    peers
        .iter()
        .filter_map(|p| {
            (p.address.as_str(), p.port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut it| it.next())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_item_falls_back_to_not_found_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), cds_index::IndexOptions::default()).await.unwrap();
        let swarm = Arc::new(Swarm::open(dir.path()).await.unwrap());
        let channel = PeerChannel::bind(
            "127.0.0.1:0".parse().unwrap(),
            "local",
            cds_transport::TransportOptions {
                send_timeout: std::time::Duration::from_millis(200),
                broadcast_timeout: std::time::Duration::from_millis(200),
            },
        )
        .await
        .unwrap();

        let net = IndexNet::new(index, swarm, channel, "local");
        net.register_handlers();
        assert!(matches!(net.get_item("missing").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn get_item_resolved_via_broadcast_is_synthesized_locally_with_nodes() {
        let dir_a = tempfile::tempdir().unwrap();
        let index_a = Index::open(dir_a.path(), cds_index::IndexOptions::default()).await.unwrap();
        let swarm_a = Arc::new(Swarm::open(dir_a.path()).await.unwrap());
        // The channel's local peer id and the roster's peer id must be the
        // same value, the way main.rs derives both from one `local_id` --
        // `Envelope::respond` stamps responses with the *channel's* id, and
        // that's what ends up in `metadata.nodes`.
        let id_a = uuid::Uuid::new_v4();
        let channel_a = PeerChannel::bind(
            "127.0.0.1:0".parse().unwrap(),
            id_a.to_string(),
            cds_transport::TransportOptions::default(),
        )
        .await
        .unwrap();
        swarm_a
            .update_local_node(Peer::new(
                id_a,
                "127.0.0.1",
                channel_a.local_addr().unwrap().port(),
            ))
            .await
            .unwrap();
        index_a
            .create_item(ItemRecord {
                id: "foo".to_string(),
                metadata: serde_json::json!({"name": "shared"}),
                status: HashMap::from([("local".to_string(), cds_index::DeviceStatus::ok())]),
                deleted: false,
            })
            .await
            .unwrap();
        let net_a = IndexNet::new(index_a, swarm_a.clone(), channel_a.clone(), id_a.to_string());
        net_a.register_handlers();

        let dir_b = tempfile::tempdir().unwrap();
        let index_b = Index::open(dir_b.path(), cds_index::IndexOptions::default()).await.unwrap();
        let swarm_b = Arc::new(Swarm::open(dir_b.path()).await.unwrap());
        let id_b = uuid::Uuid::new_v4();
        let channel_b = PeerChannel::bind(
            "127.0.0.1:0".parse().unwrap(),
            id_b.to_string(),
            cds_transport::TransportOptions::default(),
        )
        .await
        .unwrap();
        let peer_a = swarm_a.get_local_node().await.unwrap();
        swarm_b.join(peer_a.clone()).await.unwrap();
        let net_b = IndexNet::new(index_b.clone(), swarm_b, channel_b, id_b.to_string());
        net_b.register_handlers();

        let resolved = net_b.get_item("foo").await.unwrap();
        assert_eq!(resolved.metadata["name"], "shared");

        let local = index_b.get_item("foo").await.unwrap();
        assert_eq!(local.metadata["nodes"], serde_json::json!([peer_a.id.to_string()]));
        assert_eq!(local.metadata["name"], "shared");
    }
}
