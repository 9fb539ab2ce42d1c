use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::encoding::{b64_bytes, b64_key};
use crate::types::{ChannelId, Handle};

/// A message as it travels over the network and across same-device contexts.
/// Only ciphertext ever appears here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub sender_handle: Handle,
    #[serde(with = "b64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "b64_key")]
    pub ratchet_public_key: [u8; 32],
    pub message_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    /// Unix epoch millis.
    pub created_at: i64,
    /// Unix epoch millis; `None` = never expires.
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Present on the first message of a session so the responder can run
    /// the receiving side of the key agreement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<HandshakeHeader>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeHeader {
    #[serde(with = "b64_key")]
    pub identity_key: [u8; 32],
    #[serde(with = "b64_key")]
    pub ephemeral_key: [u8; 32],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey_id: Option<u32>,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

// ---------------------------------------------------------------------------
// Admission (heartbeat) RPC
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LeaseStatus {
    Active,
    Queued,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub user_id: String,
    pub pin_handle: Handle,
    /// The user is composing right now; typing identities are evicted last.
    #[serde(default)]
    pub typing: bool,
    /// Last user activity (Unix epoch millis). Defaults to the heartbeat time.
    #[serde(default)]
    pub last_active_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub status: LeaseStatus,
    pub active_connections: u32,
}

// ---------------------------------------------------------------------------
// Same-device relay
// ---------------------------------------------------------------------------

/// Envelope published on the same-device broadcast bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub sender: Handle,
    #[serde(flatten)]
    pub event: RelayEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    Message {
        message: WireMessage,
    },
    Typing {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
    },
    Delivered {
        #[serde(rename = "channelId")]
        channel_id: ChannelId,
        #[serde(rename = "messageId")]
        message_id: Uuid,
    },
    Online {
        online: bool,
    },
}

impl RelayEnvelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}
