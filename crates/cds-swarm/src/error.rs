#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error reading peer roster at {path:?}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("error writing peer roster at {path:?}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed peer record at {path:?}: {source:#}")]
    Malformed {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no local node has been registered yet")]
    NoLocalNode,
}

pub type Result<T> = std::result::Result<T, Error>;
