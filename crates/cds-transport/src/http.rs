//! HTTP side-channel for bulk content transfer (spec.md §6): the datagram
//! channel carries control-plane messages only, so item bytes move over a
//! plain `GET /` request carrying `target`/`item` headers.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rand::Rng;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const TARGET_HEADER: &str = "target";
pub const ITEM_HEADER: &str = "item";

/// Serves item bytes for the HTTP side-channel. Implemented by whatever owns
/// local storage (cds-device in the full stack); this crate only knows about
/// transport.
#[async_trait::async_trait]
pub trait ContentProvider: Send + Sync {
    async fn fetch(&self, target: &str, item: &str) -> std::result::Result<Bytes, String>;
}

struct ServerState {
    provider: Arc<dyn ContentProvider>,
}

async fn handle_get(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> Response {
    let target = headers
        .get(TARGET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let item = headers
        .get(ITEM_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if item.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing item header").into_response();
    }

    match state.provider.fetch(&target, &item).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e).into_response(),
    }
}

/// A bound HTTP content server. Dropping this does not stop the server;
/// the accept loop runs for the lifetime of the process, matching the
/// source's fire-and-forget `createHttpServer`.
pub struct HttpServer {
    pub local_addr: SocketAddr,
}

/// Binds a random port in `[1024, 13024)` (spec.md §6), serves `provider` on
/// `GET /`, and — if `gateway` is given — asks it to forward the port,
/// logging but not failing on a forwarding error (spec.md §4.2: "requests
/// `Gateway.openPort`... failure logged but non-fatal").
pub async fn create_http_server(
    bind_ip: IpAddr,
    provider: Arc<dyn ContentProvider>,
    gateway: Option<&cds_gateway::Gateway>,
) -> Result<HttpServer> {
    let state = Arc::new(ServerState { provider });
    let app = Router::new().route("/", get(handle_get)).with_state(state);

    let listener = bind_random_port(bind_ip).await?;
    let local_addr = listener.local_addr().map_err(|e| Error::HttpServer(e.into()))?;

    if let Some(gateway) = gateway {
        if let Err(e) = gateway.open_port("tcp", local_addr.port()).await {
            warn!(port = local_addr.port(), "failed to open port on gateway: {e:#}");
        }
    }

    info!(%local_addr, "content HTTP server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("content HTTP server exited: {e:#}");
        }
    });

    Ok(HttpServer { local_addr })
}

async fn bind_random_port(ip: IpAddr) -> Result<TcpListener> {
    const MIN_PORT: u16 = 1024;
    const MAX_PORT: u16 = 13024;
    const ATTEMPTS: u32 = 20;

    let mut last_err = None;
    for _ in 0..ATTEMPTS {
        let port = rand::rng().random_range(MIN_PORT..MAX_PORT);
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(Error::HttpServer(
        last_err.unwrap_or_else(|| std::io::Error::other("no port available")).into(),
    ))
}

/// Fetches item bytes from a peer's content server (spec.md §6).
pub async fn fetch_content(
    client: &reqwest::Client,
    base_url: &str,
    target: &str,
    item: &str,
) -> Result<Bytes> {
    let response = client
        .get(base_url)
        .header(TARGET_HEADER, target)
        .header(ITEM_HEADER, item)
        .send()
        .await
        .map_err(|e| Error::Http(e.into()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::HttpStatus(status.as_u16()));
    }
    response.bytes().await.map_err(|e| Error::Http(e.into()))
}
