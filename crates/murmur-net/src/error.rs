use murmur_store::StoreError;
use thiserror::Error;

/// Network-side failures. Most are transient: the lease manager falls back
/// or retries on the next tick. A 4xx answer or an encoding failure will not
/// get better by retrying.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server responded with status {0}")]
    Status(u16),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Channel closed")]
    Closed,

    #[error("Encoding error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl NetError {
    pub fn is_transient(&self) -> bool {
        match self {
            NetError::Status(code) => !(400..500).contains(code),
            NetError::Codec(_) => false,
            _ => true,
        }
    }
}
