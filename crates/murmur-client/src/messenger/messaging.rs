use murmur_net::HostSignal;
use murmur_shared::constants::ONE_TIME_PREKEY_POOL;
use murmur_shared::{crypto, ChannelId, DeliveryStatus, Handle, IdentityKeys, RatchetPayload, WireMessage};
use murmur_store::{Direction, Message, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sessions::{accepts_rekey, adopt_handshake};
use super::{Core, Messenger};
use crate::error::ClientError;
use crate::events::{ClientEvent, MediaRef, MessageView};

/// Channel list preview. Never carries message content.
fn preview(media_type: Option<&str>) -> String {
    match media_type {
        Some(kind) => format!("[{kind}]"),
        None => "New message".to_string(),
    }
}

impl Core {
    pub(crate) async fn send(
        &self,
        peer: &Handle,
        body: &str,
        media: Option<MediaRef>,
    ) -> Result<MessageView, ClientError> {
        let links = self.links()?;
        let me = links.handle.clone();
        let channel_id = ChannelId::between(&me, peer);
        if *peer == me {
            return Err(ClientError::NotParticipant(channel_id));
        }

        let now = self.now();
        let channel_hours = match self.store.channel(&channel_id).await {
            Ok(channel) => channel.expiry_hours,
            Err(StoreError::NotFound) => None,
            Err(e) => return Err(e.into()),
        };

        let (payload, handshake) = {
            let keys = self.keys.lock().await;
            let identity = keys.as_ref().ok_or(ClientError::NoIdentity)?;
            let (mut state, handshake) = match self.load_ratchet(&channel_id).await? {
                Some(state) => (state, None),
                None => self.initiate(identity, peer).await?,
            };
            let payload = state.encrypt(body.as_bytes())?;
            self.save_ratchet(&channel_id, &state).await?;
            (payload, handshake)
        };

        let (media_type, media_url) = match media {
            Some(m) => (Some(m.media_type), Some(m.url)),
            None => (None, None),
        };
        let wire = WireMessage {
            id: Uuid::new_v4(),
            channel_id: channel_id.clone(),
            sender_handle: me,
            ciphertext: payload.ciphertext,
            nonce: payload.nonce.to_vec(),
            ratchet_public_key: payload.ratchet_key,
            message_number: payload.message_number,
            media_type,
            media_url,
            created_at: now,
            expires_at: self.config.expires_at(now, channel_hours),
            handshake,
        };

        let mut message = Message::from_wire(&wire, Direction::Outbound, DeliveryStatus::Pending);
        message.sealed_body = Some(crypto::seal(&self.storage_key, body.as_bytes())?);
        self.store.append(message.clone()).await?;
        self.store
            .record_channel_activity(&channel_id, &preview(wire.media_type.as_deref()), now, false)
            .await?;
        debug!(channel = %channel_id, id = %wire.id, n = wire.message_number, "message queued");

        links.signal(HostSignal::Activity(now));
        links.signal(HostSignal::FlushOutbox);
        if let Err(e) = links.relay.publish_message(&wire) {
            debug!(error = %e, "relay publish failed");
        }

        Ok(MessageView::from_message(&message, &self.storage_key))
    }

    /// Decrypt and persist one incoming message. Returns `None` for our own
    /// echoes and for messages already stored.
    pub(crate) async fn receive(&self, wire: WireMessage) -> Result<Option<MessageView>, ClientError> {
        let links = self.links()?;
        let me = &links.handle;
        if wire.sender_handle == *me {
            return Ok(None);
        }
        let peer = wire
            .channel_id
            .peer_of(me)
            .filter(|p| *p == wire.sender_handle)
            .ok_or_else(|| ClientError::NotParticipant(wire.channel_id.clone()))?;

        match self.store.message(wire.id).await {
            Ok(_) => return Ok(None),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let outcome = {
            let mut keys = self.keys.lock().await;
            let identity = keys.as_mut().ok_or(ClientError::NoIdentity)?;
            self.decrypt_inbound(identity, me, &peer, &wire).await
        };

        let mut message = Message::from_wire(&wire, Direction::Inbound, DeliveryStatus::Delivered);
        let readable = match outcome.map(String::from_utf8) {
            Ok(Ok(text)) => {
                message.sealed_body = Some(crypto::seal(&self.storage_key, text.as_bytes())?);
                true
            }
            Ok(Err(_)) => {
                warn!(channel = %wire.channel_id, id = %wire.id, "message body is not UTF-8");
                false
            }
            Err(e) if e.is_channel_scoped() => {
                warn!(channel = %wire.channel_id, id = %wire.id, error = %e, "message unreadable");
                false
            }
            Err(e) => return Err(e),
        };
        if !readable {
            message.status = DeliveryStatus::Failed;
        }

        self.store.append(message.clone()).await?;
        self.store
            .record_channel_activity(
                &wire.channel_id,
                &preview(wire.media_type.as_deref()),
                wire.created_at,
                true,
            )
            .await?;

        let view = MessageView::from_message(&message, &self.storage_key);
        if readable {
            debug!(channel = %wire.channel_id, id = %wire.id, "message received");
            if let Err(e) = self.backend.acknowledge(&wire.channel_id, wire.id, self.now()).await {
                warn!(id = %wire.id, error = %e, "delivery receipt failed");
            }
            if let Err(e) = links.relay.publish_delivered(&wire.channel_id, wire.id) {
                debug!(error = %e, "relay publish failed");
            }
            self.emit(ClientEvent::MessageReceived {
                message: view.clone(),
            });
        } else {
            self.emit(ClientEvent::MessageUnreadable {
                channel_id: wire.channel_id.clone(),
                message_id: wire.id,
            });
        }
        Ok(Some(view))
    }

    /// Run the ratchet for one inbound message. On success the new ratchet
    /// state (and any consumed one-time pre-key) is committed; on failure
    /// nothing changes.
    ///
    /// A handshake on an established session is either a repeat of the one
    /// that started it or the peer re-keying after a reset. The existing
    /// session gets the first try; the handshake's session replaces it only
    /// if it opens the message.
    async fn decrypt_inbound(
        &self,
        identity: &mut IdentityKeys,
        me: &Handle,
        peer: &Handle,
        wire: &WireMessage,
    ) -> Result<Vec<u8>, ClientError> {
        let payload = RatchetPayload::try_from(wire)?;
        let existing = self.load_ratchet(&wire.channel_id).await?;

        let mut rekeyed = false;
        let (mut state, updated_identity) = match (existing, &wire.handshake) {
            (Some(state), Some(header)) if adopt_handshake(&state, me, peer) => {
                info!(channel = %wire.channel_id, "adopting peer's session");
                Core::respond(identity, header)?
            }
            (Some(mut state), Some(header)) if accepts_rekey(&state) => match state.decrypt(&payload) {
                Ok(plaintext) => {
                    self.save_ratchet(&wire.channel_id, &state).await?;
                    return Ok(plaintext);
                }
                Err(e) => {
                    debug!(channel = %wire.channel_id, error = %e, "current session rejected handshake message");
                    rekeyed = true;
                    Core::respond(identity, header)?
                }
            },
            (Some(state), _) => (state, None),
            (None, Some(header)) => Core::respond(identity, header)?,
            (None, None) => {
                warn!(channel = %wire.channel_id, "first message without handshake, using handle-derived session");
                (Core::fallback(me, peer)?, None)
            }
        };

        let plaintext = state.decrypt(&payload)?;
        self.save_ratchet(&wire.channel_id, &state).await?;
        if rekeyed {
            info!(channel = %wire.channel_id, "session re-keyed by peer");
        }
        if let Some(mut updated) = updated_identity {
            // A one-time pre-key was spent: top the pool up and advertise a
            // fresh one.
            updated.replenish_one_time_prekeys(ONE_TIME_PREKEY_POOL)?;
            self.persist_identity(&updated).await?;
            if let Err(e) = self.backend.publish_bundle(&updated.bundle(true)).await {
                warn!(handle = %me, error = %e, "republishing pre-key bundle failed");
            }
            *identity = updated;
        }
        Ok(plaintext)
    }

    /// Apply a delivery receipt to one of our outbound messages.
    pub(crate) async fn on_delivered(&self, channel_id: &ChannelId, message_id: Uuid) {
        match self.store.update_status(message_id, DeliveryStatus::Delivered).await {
            Ok(DeliveryStatus::Delivered) => {}
            Ok(_) => {
                debug!(channel = %channel_id, id = %message_id, "delivered");
                self.emit(ClientEvent::Delivered {
                    channel_id: channel_id.clone(),
                    message_id,
                });
            }
            Err(StoreError::NotFound) => {}
            Err(e @ StoreError::InvalidTransition { .. }) => {
                debug!(id = %message_id, error = %e, "receipt ignored");
            }
            Err(e) => warn!(id = %message_id, error = %e, "recording receipt failed"),
        }
    }
}

impl Messenger {
    /// Encrypt `body` for `peer` and queue it. Returns immediately with the
    /// pending message; delivery happens in the background.
    pub async fn send(&self, peer: &Handle, body: &str) -> Result<MessageView, ClientError> {
        self.core.send(peer, body, None).await
    }

    pub async fn send_media(
        &self,
        peer: &Handle,
        caption: &str,
        media: MediaRef,
    ) -> Result<MessageView, ClientError> {
        self.core.send(peer, caption, Some(media)).await
    }

    /// Feed a message obtained outside the lease manager (push payload,
    /// manual import).
    pub async fn receive(&self, wire: WireMessage) -> Result<Option<MessageView>, ClientError> {
        self.core.receive(wire).await
    }

    /// Mark one of our messages delivered.
    pub async fn acknowledge(&self, channel_id: &ChannelId, message_id: Uuid) {
        self.core.on_delivered(channel_id, message_id).await
    }

    /// Put a failed outbound message back in the outbox.
    pub async fn retry(&self, message_id: Uuid) -> Result<(), ClientError> {
        let message = self.core.store.message(message_id).await?;
        if message.direction != Direction::Outbound || message.status != DeliveryStatus::Failed {
            return Err(ClientError::NotRetryable(message_id));
        }
        self.core
            .store
            .update_status(message_id, DeliveryStatus::Pending)
            .await?;
        info!(id = %message_id, "message re-queued");
        if let Ok(links) = self.core.links() {
            links.signal(HostSignal::FlushOutbox);
        }
        Ok(())
    }

    /// The most recent messages of a channel, oldest first.
    pub async fn history(&self, channel_id: &ChannelId, limit: Option<u32>) -> Result<Vec<MessageView>, ClientError> {
        let limit = limit.unwrap_or(self.core.config.history_page);
        let messages = self.core.store.messages_by_channel(channel_id, limit).await?;
        Ok(messages
            .iter()
            .map(|m| MessageView::from_message(m, &self.core.storage_key))
            .collect())
    }

    /// Every message of one retrieval bucket, oldest first.
    pub async fn bucket(&self, channel_id: &ChannelId, bucket_id: i64) -> Result<Vec<MessageView>, ClientError> {
        let messages = self.core.store.messages_by_bucket(channel_id, bucket_id).await?;
        Ok(messages
            .iter()
            .map(|m| MessageView::from_message(m, &self.core.storage_key))
            .collect())
    }

    pub async fn message(&self, message_id: Uuid) -> Result<MessageView, ClientError> {
        let message = self.core.store.message(message_id).await?;
        Ok(MessageView::from_message(&message, &self.core.storage_key))
    }
}
