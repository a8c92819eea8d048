#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error spooling incoming content: {0}")]
    Spool(#[source] std::io::Error),
    #[error("item {0} not found")]
    NotFound(String),
    /// Save always indexes the item even when replication is incomplete --
    /// the index is the source of truth -- but still resolves as an error so
    /// the caller notices (spec.md §4.8 step 6).
    #[error("item could not be sent to some devices")]
    PartialFailure { item: crate::Item },
    #[error(transparent)]
    Index(#[from] cds_index::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
