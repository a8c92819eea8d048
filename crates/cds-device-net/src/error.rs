#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Device(#[from] cds_device::Error),
    #[error(transparent)]
    IndexNet(#[from] cds_index_net::Error),
    #[error(transparent)]
    Swarm(#[from] cds_swarm::Error),
    #[error("item {0} not found on this device or any known peer")]
    NotFound(String),
    #[error("peer {peer} did not have an address on record")]
    UnknownPeer { peer: String },
    #[error(transparent)]
    Transport(#[from] cds_transport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
