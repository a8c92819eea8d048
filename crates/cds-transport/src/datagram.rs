use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Handles an incoming request envelope and produces the response payload,
/// or an error message (spec.md §4.2: "a handler receives the parsed request
/// and a completion callback taking (err, data)").
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: Envelope) -> std::result::Result<Value, String>;
}

#[async_trait::async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = std::result::Result<Value, String>> + Send,
{
    async fn handle(&self, request: Envelope) -> std::result::Result<Value, String> {
        self(request).await
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Local send-ack timeout. The source arms this per-datagram and it only
    /// reflects local send completion, not a peer's response (spec.md §4.2,
    /// §9 Redesign Flag 4) — kept as a distinct, separately configurable
    /// knob from `broadcast_timeout`.
    pub send_timeout: Duration,
    /// Deadline for a broadcast's first response. Unbounded in the source
    /// (spec.md §9 Open Question 3); this implementation requires callers to
    /// bound it.
    pub broadcast_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(6),
            broadcast_timeout: Duration::from_secs(10),
        }
    }
}

/// A single response to a broadcast: which peer answered and what it said.
pub struct BroadcastResponse {
    pub envelope: Envelope,
}

pub struct PeerChannel {
    socket: Arc<UdpSocket>,
    local_peer_id: String,
    opts: TransportOptions,
    handlers: DashMap<(String, String), Arc<dyn Handler>>,
    pending: DashMap<Uuid, oneshot::Sender<BroadcastResponse>>,
}

impl PeerChannel {
    pub async fn bind(
        addr: SocketAddr,
        local_peer_id: impl Into<String>,
        opts: TransportOptions,
    ) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await.map_err(Error::Bind)?;
        let this = Arc::new(Self {
            socket: Arc::new(socket),
            local_peer_id: local_peer_id.into(),
            opts,
            handlers: DashMap::new(),
            pending: DashMap::new(),
        });
        this.clone().spawn_recv_loop();
        Ok(this)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn register_handler(
        &self,
        namespace: impl Into<String>,
        kind: impl Into<String>,
        handler: impl Handler + 'static,
    ) {
        self.handlers
            .insert((namespace.into(), kind.into()), Arc::new(handler));
    }

    fn spawn_recv_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, from) = match self.socket.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("error receiving datagram: {e:#}");
                        continue;
                    }
                };
                let envelope = match Envelope::from_bytes(&buf[..len]) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(%from, "dropping malformed envelope: {e:#}");
                        continue;
                    }
                };
                // A broadcast request is addressed to every peer at once, so
                // its `target` names the sender's intent ("*" or similar)
                // rather than a single recipient; only non-broadcast
                // requests and all responses are filtered by exact target.
                let is_broadcast_request = envelope.ping == Some(true) && envelope.broadcast;
                if !is_broadcast_request && !envelope.is_addressed_to(&self.local_peer_id) {
                    trace!(target = %envelope.target, "dropping envelope not addressed to us");
                    continue;
                }

                let this = self.clone();
                tokio::spawn(async move { this.dispatch(envelope, from).await });
            }
        });
    }

    async fn dispatch(self: Arc<Self>, envelope: Envelope, from: SocketAddr) {
        if envelope.pong == Some(true) {
            self.resolve_pending(envelope);
            return;
        }

        let key = (envelope.namespace.clone(), envelope.kind.clone());
        let handler = self.handlers.get(&key).map(|h| h.clone());
        let (data, error) = match handler {
            Some(h) => match h.handle(envelope.clone()).await {
                Ok(data) => (data, None),
                Err(e) => (Value::Null, Some(e)),
            },
            None => (
                Value::Null,
                Some(format!("Message {} not found", envelope.kind)),
            ),
        };

        let response = envelope.respond(&self.local_peer_id, data, error);
        if let Err(e) = self.send_datagram(from, &response).await {
            warn!(%from, "error sending response datagram: {e:#}");
        }
    }

    /// First matching response for `id` wins; later ones are dropped
    /// (spec.md §4.2, §5 ordering guarantees).
    fn resolve_pending(&self, envelope: Envelope) {
        if let Some((_, tx)) = self.pending.remove(&envelope.id) {
            let _ = tx.send(BroadcastResponse { envelope });
        } else {
            trace!(id = %envelope.id, "dropping duplicate or unexpected response");
        }
    }

    /// Sends a single datagram, bounded by the configured send-ack timeout
    /// (spec.md §4.2, §5).
    pub async fn send_datagram(&self, target: SocketAddr, envelope: &Envelope) -> Result<()> {
        let bytes = envelope
            .to_bytes()
            .map_err(Error::MalformedEnvelope)?;
        match tokio::time::timeout(self.opts.send_timeout, self.socket.send_to(&bytes, target))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(Error::Send(e)),
            Err(_) => Err(Error::SendTimeout(self.opts.send_timeout)),
        }
    }

    /// Fire-and-forget send: no response is awaited at this layer (spec.md
    /// §4.2: "non-broadcast requests are fire-and-forget at this layer").
    pub async fn send_fire_and_forget(&self, target: SocketAddr, envelope: &Envelope) -> Result<()> {
        self.send_datagram(target, envelope).await
    }

    /// Sends the same request to every target and resolves with the first
    /// non-duplicate response, bounded by `broadcast_timeout` (spec.md §4.2,
    /// §4.5, §9 Open Question 3).
    pub async fn broadcast(
        &self,
        targets: &[SocketAddr],
        envelope: Envelope,
    ) -> Result<BroadcastResponse> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(envelope.id, tx);

        for &target in targets {
            if let Err(e) = self.send_datagram(target, &envelope).await {
                warn!(%target, "broadcast send failed: {e:#}");
            }
        }

        let result = tokio::time::timeout(self.opts.broadcast_timeout, rx).await;
        self.pending.remove(&envelope.id);

        match result {
            Ok(Ok(resp)) => {
                debug!(peer = %resp.envelope.source, kind = %envelope.kind, "broadcast resolved");
                Ok(resp)
            }
            Ok(Err(_)) => Err(Error::BroadcastTimeout(self.opts.broadcast_timeout)),
            Err(_) => Err(Error::BroadcastTimeout(self.opts.broadcast_timeout)),
        }
    }
}
