//! Peer transport: a UDP datagram channel with correlation ids for
//! control-plane request/response and broadcast, plus an HTTP side-channel
//! for bulk content bytes (spec.md §4.2, §6).

mod datagram;
pub mod envelope;
mod error;
mod http;

pub use datagram::{BroadcastResponse, Handler, PeerChannel, TransportOptions};
pub use envelope::Envelope;
pub use error::{Error, Result};
pub use http::{create_http_server, fetch_content, ContentProvider, HttpServer, ITEM_HEADER, TARGET_HEADER};

use std::net::SocketAddr;
use std::sync::Arc;

/// Ties the datagram channel and the HTTP content server together under one
/// local peer identity.
pub struct Transport {
    pub channel: Arc<PeerChannel>,
    pub http: HttpServer,
}

impl Transport {
    /// Binds the datagram channel on `datagram_addr` and the HTTP content
    /// server on the same IP, optionally forwarding the HTTP port via
    /// `gateway` (spec.md §4.2).
    pub async fn bind(
        datagram_addr: SocketAddr,
        local_peer_id: impl Into<String>,
        opts: TransportOptions,
        provider: Arc<dyn ContentProvider>,
        gateway: Option<&cds_gateway::Gateway>,
    ) -> Result<Self> {
        let channel = PeerChannel::bind(datagram_addr, local_peer_id, opts).await?;
        let http = create_http_server(datagram_addr.ip(), provider, gateway).await?;
        Ok(Self { channel, http })
    }
}
