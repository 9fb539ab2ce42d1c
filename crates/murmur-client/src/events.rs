use murmur_net::LeaseState;
use murmur_shared::{crypto, ChannelId, DeliveryStatus, Handle};
use murmur_store::{Direction, Message};
use serde::Serialize;
use uuid::Uuid;

use crate::error::ClientError;

/// Reference to an attachment stored elsewhere. Only the URL and type travel
/// with the message.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub media_type: String,
    pub url: String,
}

/// A message as the UI sees it. `body` is `None` when the message could not
/// be decrypted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub channel_id: ChannelId,
    pub sender: Handle,
    pub direction: Direction,
    pub body: Option<String>,
    pub media_type: Option<String>,
    pub media_url: Option<String>,
    pub created_at: i64,
    pub expires_at: Option<i64>,
    pub bucket_id: i64,
    pub status: DeliveryStatus,
}

impl MessageView {
    /// Rehydrate a stored message, opening its sealed body with the local
    /// storage key.
    pub fn from_message(m: &Message, storage_key: &[u8; 32]) -> Self {
        let body = m
            .sealed_body
            .as_deref()
            .and_then(|sealed| crypto::open(storage_key, sealed).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok());
        Self {
            id: m.id,
            channel_id: m.channel_id.clone(),
            sender: m.sender_handle.clone(),
            direction: m.direction,
            body,
            media_type: m.media_type.clone(),
            media_url: m.media_url.clone(),
            created_at: m.created_at,
            expires_at: m.expires_at,
            bucket_id: m.bucket_id(),
            status: m.status,
        }
    }

    pub fn is_readable(&self) -> bool {
        self.body.is_some()
    }
}

/// Notifications pushed to the host application.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    Connection { state: String },
    MessageReceived { message: MessageView },
    #[serde(rename_all = "camelCase")]
    MessageUnreadable { channel_id: ChannelId, message_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Delivered { channel_id: ChannelId, message_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Typing { channel_id: ChannelId, handle: Handle },
    Presence { handle: Handle, online: bool },
    OutboxFlushed { sent: usize },
    Expired { count: usize },
}

impl ClientEvent {
    pub(crate) fn connection(state: LeaseState) -> Self {
        let state = match state {
            LeaseState::Disconnected => "disconnected",
            LeaseState::Heartbeating => "heartbeating",
            LeaseState::Active => "active",
            LeaseState::Queued => "queued",
            LeaseState::Polling => "polling",
        };
        Self::Connection {
            state: state.to_string(),
        }
    }

    /// JSON payload for hosts that forward events across a process or
    /// language boundary.
    pub fn to_json(&self) -> Result<String, ClientError> {
        serde_json::to_string(self).map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_camel_case() {
        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();
        let event = ClientEvent::Delivered {
            channel_id: ChannelId::between(&a, &b),
            message_id: Uuid::nil(),
        };
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "delivered");
        assert_eq!(json["channelId"], "AAAAAAAA_BBBBBBBB");

        let json: serde_json::Value =
            serde_json::from_str(&ClientEvent::connection(LeaseState::Queued).to_json().unwrap()).unwrap();
        assert_eq!(json["event"], "connection");
        assert_eq!(json["state"], "queued");
    }

    #[test]
    fn test_view_without_sealed_body_is_unreadable() {
        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();
        let key = crypto::generate_symmetric_key().unwrap();
        let message = Message {
            id: Uuid::new_v4(),
            channel_id: ChannelId::between(&a, &b),
            sender_handle: b,
            direction: Direction::Inbound,
            ciphertext: Vec::new(),
            nonce: Vec::new(),
            ratchet_public_key: [0; 32],
            message_number: 0,
            handshake: None,
            sealed_body: None,
            media_type: None,
            media_url: None,
            created_at: 5_000,
            expires_at: None,
            status: DeliveryStatus::Failed,
        };
        let view = MessageView::from_message(&message, &key);
        assert!(!view.is_readable());
        assert_eq!(view.bucket_id, 0);

        let mut sealed = message.clone();
        sealed.sealed_body = Some(crypto::seal(&key, b"hi").unwrap());
        assert_eq!(MessageView::from_message(&sealed, &key).body.as_deref(), Some("hi"));
    }
}
