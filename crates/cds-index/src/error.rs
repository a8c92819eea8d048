#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("item {0} already exists")]
    AlreadyExists(String),
    #[error("item {0} not found")]
    NotFound(String),
    #[error("error reading index at {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error writing index at {path:?}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed index at {path:?}: {source:#}")]
    Malformed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
