use thiserror::Error;

pub type EmberResult<T> = Result<T, EmberError>;

#[derive(Error, Debug)]
pub enum EmberError {
    #[error("tx not writable")]
    TxNotWritable,

    #[error("tx closed")]
    TxClosed,

    #[error("not found")]
    NotFound,

    #[error("invalid database")]
    Invalid,

    #[error("database closed")]
    DatabaseClosed,

    #[error("index exists")]
    IndexExists,

    #[error("invalid operation")]
    InvalidOperation,

    #[error("invalid sync policy")]
    InvalidSyncPolicy,

    #[error("shrink is in-process")]
    ShrinkInProcess,

    #[error("persistence active")]
    PersistenceActive,

    #[error("tx is iterating")]
    TxIterating,

    /// The commit is visible in memory but did not reach the log.
    #[error("commit not durable: {0}")]
    Durability(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EmberError {
    /// Transient conditions that may succeed when retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EmberError::ShrinkInProcess | EmberError::PersistenceActive)
    }
}
