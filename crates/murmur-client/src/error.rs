use murmur_net::NetError;
use murmur_shared::{ChannelId, CryptoError, HandleError, MurmurError, ProtocolError};
use murmur_store::StoreError;
use thiserror::Error;

/// Every failure a [`Messenger`](crate::Messenger) call can surface.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid handle: {0}")]
    Handle(#[from] HandleError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("No identity loaded")]
    NoIdentity,

    /// The sealed identity blob no longer opens (wrong device secret or
    /// corruption). Needs re-provisioning.
    #[error("Stored identity cannot be opened: {0}")]
    Identity(MurmurError),

    #[error("Message {0} cannot be retried")]
    NotRetryable(uuid::Uuid),

    #[error("Not a participant of channel {0}")]
    NotParticipant(ChannelId),

    #[error("Client is shutting down")]
    ShuttingDown,
}

impl From<MurmurError> for ClientError {
    fn from(e: MurmurError) -> Self {
        match e {
            MurmurError::Crypto(e) => Self::Crypto(e),
            MurmurError::Protocol(e) => Self::Protocol(e),
            MurmurError::Handle(e) => Self::Handle(e),
            MurmurError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}

impl ClientError {
    /// `true` when the failure is confined to one channel or message and the
    /// rest of the client keeps working. Identity-level and storage failures
    /// return `false` and need the host's attention.
    pub fn is_channel_scoped(&self) -> bool {
        match self {
            Self::Crypto(_)
            | Self::Protocol(_)
            | Self::Net(_)
            | Self::NotParticipant(_)
            | Self::NotRetryable(_) => true,
            Self::Store(StoreError::InvalidTransition { .. } | StoreError::NotFound) => true,
            _ => false,
        }
    }
}
