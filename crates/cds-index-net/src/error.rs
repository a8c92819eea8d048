#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Index(#[from] cds_index::Error),
    #[error(transparent)]
    Swarm(#[from] cds_swarm::Error),
    #[error("item {0} not found locally or on any known peer")]
    NotFound(String),
    #[error("peer {peer} sent a malformed response: {source:#}")]
    MalformedPeerResponse {
        peer: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid peer address {address:?}:{port}: {source}")]
    InvalidPeerAddress {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
