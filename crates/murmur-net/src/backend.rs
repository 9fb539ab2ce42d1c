//! Remote message backend capability.
//!
//! The backend is append-only: messages and delivery receipts are inserted,
//! never updated. Readers either poll a channel for changes newer than a
//! cursor or hold a realtime subscription that pushes the same changes.

use async_trait::async_trait;
use murmur_shared::{ChannelId, Handle, PreKeyBundle, WireMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::NetError;

/// One entry in a channel's change stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Change {
    Message(WireMessage),
    Delivered {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        #[serde(rename = "messageId")]
        message_id: Uuid,
        at: i64,
    },
}

impl Change {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            Self::Message(m) => &m.channel_id,
            Self::Delivered { channel_id, .. } => channel_id,
        }
    }

    /// Position in the stream; sync cursors advance to the largest seen.
    pub fn at(&self) -> i64 {
        match self {
            Self::Message(m) => m.created_at,
            Self::Delivered { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

#[async_trait]
pub trait RemoteBackend: Send + Sync + 'static {
    /// Append a message. Inserting an id that already exists is a no-op.
    async fn insert(&self, message: &WireMessage) -> Result<(), NetError>;

    /// Append a delivery receipt for `message_id`.
    async fn acknowledge(&self, channel_id: &ChannelId, message_id: Uuid, at: i64) -> Result<(), NetError>;

    /// Every change on `channel_id` strictly newer than `after`, oldest first.
    async fn changes_since(&self, channel_id: &ChannelId, after: i64) -> Result<Vec<Change>, NetError>;

    /// Push future changes on `channel_id` into `sink` until unsubscribed.
    async fn subscribe(
        &self,
        channel_id: &ChannelId,
        sink: mpsc::Sender<Change>,
    ) -> Result<SubscriptionId, NetError>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), NetError>;

    async fn publish_bundle(&self, bundle: &PreKeyBundle) -> Result<(), NetError>;

    async fn fetch_bundle(&self, handle: &Handle) -> Result<Option<PreKeyBundle>, NetError>;
}
