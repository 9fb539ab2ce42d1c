use murmur_net::HostSignal;
use murmur_shared::{ChannelId, Handle};
use murmur_store::Channel;
use tracing::{debug, info};

use super::Messenger;
use crate::error::ClientError;

impl Messenger {
    /// Open the conversation with `peer`: the channel is created if needed
    /// and gets a realtime subscription while the lease is active.
    pub async fn open_channel(&self, peer: &Handle) -> Result<ChannelId, ClientError> {
        let links = self.core.links()?;
        let channel_id = ChannelId::between(&links.handle, peer);
        if *peer == links.handle {
            return Err(ClientError::NotParticipant(channel_id));
        }
        self.core.store.ensure_channel(&channel_id, self.core.now()).await?;
        links.signal(HostSignal::ChannelOpened(channel_id.clone()));
        Ok(channel_id)
    }

    /// Stop watching a channel in realtime. It is still polled.
    pub fn close_channel(&self, channel_id: &ChannelId) -> Result<(), ClientError> {
        self.core
            .links()?
            .signal(HostSignal::ChannelClosed(channel_id.clone()));
        Ok(())
    }

    /// Channels, most recently active first.
    pub async fn channels(&self) -> Result<Vec<Channel>, ClientError> {
        Ok(self.core.store.channels().await?)
    }

    pub async fn mark_read(&self, channel_id: &ChannelId) -> Result<(), ClientError> {
        if !self.core.store.mark_read(channel_id).await? {
            return Err(ClientError::Store(murmur_store::StoreError::NotFound));
        }
        Ok(())
    }

    /// Expiry for messages sent on this channel from now on. `None` falls
    /// back to the client default, `Some(0)` keeps them forever.
    pub async fn set_channel_expiry(&self, channel_id: &ChannelId, hours: Option<u32>) -> Result<(), ClientError> {
        if !self.core.store.set_channel_expiry(channel_id, hours).await? {
            return Err(ClientError::Store(murmur_store::StoreError::NotFound));
        }
        Ok(())
    }

    /// Remove a channel with its messages, session and cursor.
    pub async fn delete_channel(&self, channel_id: &ChannelId) -> Result<bool, ClientError> {
        if let Ok(links) = self.core.links() {
            links.signal(HostSignal::ChannelClosed(channel_id.clone()));
        }
        let removed = self.core.store.delete_channel(channel_id).await?;
        info!(channel = %channel_id, removed, "channel deleted");
        Ok(removed)
    }

    /// Drop the ratchet session of a channel. The next message in either
    /// direction runs a fresh key agreement. Used after a protocol violation.
    pub async fn reset_session(&self, channel_id: &ChannelId) -> Result<(), ClientError> {
        let _keys = self.core.keys.lock().await;
        let removed = self.core.store.delete_ratchet_state(channel_id).await?;
        info!(channel = %channel_id, removed, "session reset");
        Ok(())
    }

    /// Tell same-device contexts and the admission service that the user is
    /// composing in `channel_id`.
    pub fn set_typing(&self, channel_id: &ChannelId, typing: bool) -> Result<(), ClientError> {
        let links = self.core.links()?;
        links.signal(HostSignal::Typing(typing));
        if typing {
            links.signal(HostSignal::Activity(self.core.now()));
            if let Err(e) = links.relay.publish_typing(channel_id) {
                debug!(error = %e, "relay publish failed");
            }
        }
        Ok(())
    }

    /// Whether `who` typed in `channel_id` within the typing timeout.
    pub fn is_typing(&self, channel_id: &ChannelId, who: &Handle) -> bool {
        self.core
            .links()
            .map(|l| l.relay.is_typing(channel_id, who))
            .unwrap_or(false)
    }

    /// Last presence another same-device context announced.
    pub fn is_online(&self, who: &Handle) -> Option<bool> {
        self.core.links().ok().and_then(|l| l.relay.is_online(who))
    }

    pub fn set_foreground(&self, foreground: bool) -> Result<(), ClientError> {
        self.core.links()?.signal(HostSignal::Foreground(foreground));
        Ok(())
    }

    /// Connectivity change reported by the host. Coming back online triggers
    /// an immediate heartbeat and outbox flush.
    pub fn set_online(&self, online: bool) -> Result<(), ClientError> {
        let links = self.core.links()?;
        links.signal(HostSignal::Online(online));
        if let Err(e) = links.relay.publish_online(online) {
            debug!(error = %e, "relay publish failed");
        }
        Ok(())
    }

    /// Record user activity, used to rank this client for admission.
    pub fn touch(&self) -> Result<(), ClientError> {
        self.core
            .links()?
            .signal(HostSignal::Activity(self.core.now()));
        Ok(())
    }
}
