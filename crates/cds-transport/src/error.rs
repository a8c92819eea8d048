#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error binding UDP socket: {0}")]
    Bind(#[source] std::io::Error),
    #[error("error sending datagram: {0}")]
    Send(#[source] std::io::Error),
    #[error("send-ack timeout after {0:?}")]
    SendTimeout(std::time::Duration),
    #[error("broadcast response timeout after {0:?}")]
    BroadcastTimeout(std::time::Duration),
    #[error("malformed envelope: {0:#}")]
    MalformedEnvelope(#[source] anyhow::Error),
    #[error("no handler registered for ({namespace}, {kind})")]
    NoHandler { namespace: String, kind: String },
    #[error("remote error: {0}")]
    Remote(String),
    #[error("error opening HTTP content server: {0:#}")]
    HttpServer(#[source] anyhow::Error),
    #[error("HTTP content transfer failed with status {0}")]
    HttpStatus(u16),
    #[error("error during HTTP content transfer: {0:#}")]
    Http(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
