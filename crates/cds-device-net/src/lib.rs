//! Network-aware device (spec.md §4.7): local-first `get`, falling back to
//! asking the swarm which peer holds an item and pulling its bytes over the
//! HTTP content side-channel, then spooling them into the local device so
//! the next lookup is a local hit.

mod error;

use std::io::Cursor;
use std::net::ToSocketAddrs;
use std::sync::Arc;

use async_trait::async_trait;
use cds_device::{Device, LocalDevice};
use cds_index_net::IndexNet;
use cds_swarm::{Peer, Swarm};
use cds_transport::{Envelope, PeerChannel};
use tokio::io::AsyncRead;
use tracing::{debug, warn};

pub use error::{Error, Result};

pub const NAMESPACE: &str = "p2p-device";
pub const GET: &str = "nd:get";

pub struct NetworkDevice {
    local: Arc<LocalDevice>,
    index_net: Arc<IndexNet>,
    swarm: Arc<Swarm>,
    channel: Arc<PeerChannel>,
    http_client: reqwest::Client,
    local_peer_id: String,
    /// This process's content HTTP server port, handed out in `nd:get`
    /// responses. The content server binds an independently random port,
    /// not the datagram port (spec.md §4.2: `createHttpServer` "chooses a
    /// random port in [1024, 13024)"), so a responding peer must tell the
    /// requester which port to fetch from rather than the requester
    /// inferring it from the roster (spec.md §4.7: the responder "replies
    /// `{port: <its HTTP server port>}`").
    http_port: u16,
}

impl NetworkDevice {
    pub fn new(
        local: Arc<LocalDevice>,
        index_net: Arc<IndexNet>,
        swarm: Arc<Swarm>,
        channel: Arc<PeerChannel>,
        local_peer_id: impl Into<String>,
        http_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            index_net,
            swarm,
            channel,
            http_client: reqwest::Client::new(),
            local_peer_id: local_peer_id.into(),
            http_port,
        })
    }

    /// Registers the `nd:get` responder: if this process's local device has
    /// `id`, replies with the port its content HTTP server is actually
    /// listening on, so the requester knows where to fetch bytes from
    /// (spec.md §4.7).
    pub fn register_handlers(self: &Arc<Self>) {
        let this = self.clone();
        self.channel.register_handler(NAMESPACE, GET, move |req: Envelope| {
            let this = this.clone();
            async move {
                let id = req
                    .data
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing id".to_string())?;
                match this.local.exists(id).await {
                    Ok(true) => Ok(serde_json::json!({ "port": this.http_port })),
                    Ok(false) => Err(format!("item {id} not found")),
                    Err(e) => Err(e.to_string()),
                }
            }
        });
    }

    /// Fetches `id`'s bytes from `peer_id`'s content HTTP server at `port`
    /// (the port that peer's own `nd:get` response named, not the port on
    /// record in the roster — spec.md §4.7).
    async fn fetch_from_peer(&self, peer_id: &str, port: u16, id: &str) -> Result<Vec<u8>> {
        let peers = self.swarm.get_peers().await?;
        let peer = peers
            .into_iter()
            .find(|p| p.id.to_string() == peer_id)
            .ok_or_else(|| Error::UnknownPeer {
                peer: peer_id.to_string(),
            })?;

        let base_url = format!("{}://{}:{}/", peer.protocol, peer.address, port);
        let bytes = cds_transport::fetch_content(&self.http_client, &base_url, &self.local_peer_id, id)
            .await?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl Device for NetworkDevice {
    async fn put(&self, id: &str, content: &mut (dyn AsyncRead + Unpin + Send)) -> cds_device::Result<()> {
        self.local.put(id, content).await
    }

    /// Delegates presence checks to the network-aware index rather than the
    /// filesystem, so `exists` reflects what the swarm knows about, not just
    /// what this process happens to have spooled (spec.md §4.7).
    async fn exists(&self, id: &str) -> cds_device::Result<bool> {
        match self.index_net.get_item(id).await {
            Ok(_) => Ok(true),
            Err(cds_index_net::Error::NotFound(_)) => Ok(false),
            Err(e) => {
                warn!(%id, "error checking network index: {e:#}");
                Ok(false)
            }
        }
    }

    async fn get(&self, id: &str) -> cds_device::Result<Box<dyn AsyncRead + Unpin + Send>> {
        if self.local.exists(id).await? {
            return self.local.get(id).await;
        }

        let peers = self.swarm.get_peers().await.map_err(|e| {
            cds_device::Error::Unreachable(anyhow::anyhow!("{e:#}"))
        })?;
        let targets: Vec<_> = peers
            .iter()
            .filter_map(|p| (p.address.as_str(), p.port).to_socket_addrs().ok().and_then(|mut it| it.next()))
            .collect();
        if targets.is_empty() {
            return Err(cds_device::Error::NotFound(id.to_string()));
        }

        let request = Envelope::request(
            NAMESPACE,
            &self.local_peer_id,
            "*",
            GET,
            serde_json::json!({ "id": id }),
            true,
        );
        let response = self
            .channel
            .broadcast(&targets, request)
            .await
            .map_err(|e| cds_device::Error::Unreachable(anyhow::anyhow!("{e:#}")))?;
        if response.envelope.error.is_some() {
            return Err(cds_device::Error::NotFound(id.to_string()));
        }
        let port = response
            .envelope
            .data
            .get("port")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| cds_device::Error::Unreachable(anyhow::anyhow!("peer response missing content port")))?
            as u16;

        let bytes = self
            .fetch_from_peer(&response.envelope.source, port, id)
            .await
            .map_err(|e| cds_device::Error::Unreachable(anyhow::anyhow!("{e:#}")))?;

        debug!(%id, peer = %response.envelope.source, "fetched item from peer");
        let mut cursor = Cursor::new(bytes.clone());
        if let Err(e) = self.local.put(id, &mut cursor).await {
            warn!(%id, "failed to spool fetched item locally: {e:#}");
        }
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn ping(&self) -> cds_device::Result<bool> {
        self.local.ping().await
    }

    /// Removing from the swarm at large is out of scope for a single
    /// process; only the local spool is cleared (spec.md §4.7).
    async fn remove(&self, id: &str) -> cds_device::Result<()> {
        self.local.remove(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cds_index::{Index, IndexOptions};

    #[tokio::test]
    async fn exists_false_when_index_has_no_record() {
        let dir = tempfile::tempdir().unwrap();
        let index = Index::open(dir.path(), IndexOptions::default()).await.unwrap();
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
        let index_net = IndexNet::new(index, swarm.clone(), channel.clone(), "local");
        index_net.register_handlers();

        let local = Arc::new(LocalDevice::new(dir.path().join("store")));
        let device = NetworkDevice::new(local, index_net, swarm, channel, "local", 0);
        assert!(!device.exists("abcdef0123456789").await.unwrap());
    }

    struct DeviceContentProvider(Arc<LocalDevice>);

    #[async_trait::async_trait]
    impl cds_transport::ContentProvider for DeviceContentProvider {
        async fn fetch(&self, _target: &str, item: &str) -> std::result::Result<bytes::Bytes, String> {
            let mut reader = self.0.get(item).await.map_err(|e| e.to_string())?;
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf)
                .await
                .map_err(|e| e.to_string())?;
            Ok(bytes::Bytes::from(buf))
        }
    }

    struct TestPeer {
        local_device: Arc<LocalDevice>,
        swarm: Arc<Swarm>,
        network_device: Arc<NetworkDevice>,
    }

    async fn spawn_peer(dir: &std::path::Path) -> TestPeer {
        let id = uuid::Uuid::new_v4();
        let local_device = Arc::new(LocalDevice::new(dir.join("device")));
        let index = Index::open(dir.join("index"), IndexOptions::default()).await.unwrap();
        let swarm = Arc::new(Swarm::open(dir).await.unwrap());
        let channel = PeerChannel::bind(
            "127.0.0.1:0".parse().unwrap(),
            id.to_string(),
            cds_transport::TransportOptions {
                send_timeout: std::time::Duration::from_secs(2),
                broadcast_timeout: std::time::Duration::from_secs(2),
            },
        )
        .await
        .unwrap();

        let http = cds_transport::create_http_server(
            "127.0.0.1".parse().unwrap(),
            Arc::new(DeviceContentProvider(local_device.clone())),
            None,
        )
        .await
        .unwrap();

        swarm
            .update_local_node(Peer::new(id, "127.0.0.1", channel.local_addr().unwrap().port()))
            .await
            .unwrap();

        let index_net = IndexNet::new(index, swarm.clone(), channel.clone(), id.to_string());
        index_net.register_handlers();

        let network_device = NetworkDevice::new(
            local_device.clone(),
            index_net,
            swarm.clone(),
            channel,
            id.to_string(),
            http.local_addr.port(),
        );
        network_device.register_handlers();

        TestPeer {
            local_device,
            swarm,
            network_device,
        }
    }

    /// S4 (spec.md §8): peer A saves content, peer B has no local copy;
    /// `B.get(id)` streams bytes equal to A's, and afterward B's local
    /// device reports the item as present.
    #[tokio::test]
    async fn network_device_fetches_content_transparently_from_a_peer() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let peer_a = spawn_peer(dir_a.path()).await;
        let peer_b = spawn_peer(dir_b.path()).await;

        let id = "abcdef0123456789";
        let mut content = Cursor::new(b"hello from peer a".to_vec());
        peer_a.local_device.put(id, &mut content).await.unwrap();

        let a_record = peer_a.swarm.get_local_node().await.unwrap();
        peer_b.swarm.join(a_record).await.unwrap();

        let mut reader = peer_b.network_device.get(id).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await.unwrap();
        assert_eq!(buf, b"hello from peer a");

        assert!(peer_b.local_device.exists(id).await.unwrap());
    }
}
