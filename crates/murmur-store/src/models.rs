//! Domain model structs persisted in the local database.
//!
//! Timestamps are Unix epoch milliseconds throughout.

use murmur_shared::{
    bucket_of, ChannelId, DeliveryStatus, Handle, HandshakeHeader, WireMessage,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A provisioned local identity. The key material is opaque to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredIdentity {
    pub handle: Handle,
    /// Output of `IdentityKeys::seal`.
    pub sealed_keys: Vec<u8>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A pairwise conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    /// Short, non-secret summary of the newest message.
    pub last_message_preview: Option<String>,
    pub last_activity_at: i64,
    pub unread_count: u32,
    /// Per-channel expiry override in hours. `None` falls back to the
    /// client default, `Some(0)` means messages never expire.
    pub expiry_hours: Option<u32>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbound" => Some(Self::Outbound),
            "inbound" => Some(Self::Inbound),
            _ => None,
        }
    }
}

/// A single message. Holds the wire ciphertext; plaintext only ever appears
/// sealed under the local storage key in `sealed_body`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub sender_handle: Handle,
    pub direction: Direction,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub ratchet_public_key: [u8; 32],
    pub message_number: u32,
    pub handshake: Option<HandshakeHeader>,
    pub sealed_body: Option<Vec<u8>>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub created_at: i64,
    /// `None` = never expires.
    pub expires_at: Option<i64>,
    pub status: DeliveryStatus,
}

impl Message {
    /// Retrieval bucket, always derived from `created_at`.
    pub fn bucket_id(&self) -> i64 {
        bucket_of(self.created_at)
    }

    /// Strictly past: a message expiring exactly `now` is kept.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    pub fn from_wire(wire: &WireMessage, direction: Direction, status: DeliveryStatus) -> Self {
        Self {
            id: wire.id,
            channel_id: wire.channel_id.clone(),
            sender_handle: wire.sender_handle.clone(),
            direction,
            ciphertext: wire.ciphertext.clone(),
            nonce: wire.nonce.clone(),
            ratchet_public_key: wire.ratchet_public_key,
            message_number: wire.message_number,
            handshake: wire.handshake.clone(),
            sealed_body: None,
            media_type: wire.media_type.clone(),
            media_url: wire.media_url.clone(),
            created_at: wire.created_at,
            expires_at: wire.expires_at,
            status,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            id: self.id,
            channel_id: self.channel_id.clone(),
            sender_handle: self.sender_handle.clone(),
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            ratchet_public_key: self.ratchet_public_key,
            message_number: self.message_number,
            media_type: self.media_type.clone(),
            media_url: self.media_url.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            handshake: self.handshake.clone(),
        }
    }
}
