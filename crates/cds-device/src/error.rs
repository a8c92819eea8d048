#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("item id {0:?} is too short to address on disk (need at least 10 hex characters)")]
    IdTooShort(String),
    #[error("item {0} not found on this device")]
    NotFound(String),
    #[error("error reading {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error writing {path:?}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("device unreachable: {0:#}")]
    Unreachable(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
