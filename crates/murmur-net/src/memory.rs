//! In-process implementations of the host capabilities: a message backend
//! and a broadcast bus. Used by tests and single-process embeddings.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use murmur_shared::{ChannelId, Handle, PreKeyBundle, WireMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{Change, RemoteBackend, SubscriptionId};
use crate::error::NetError;
use crate::relay::BroadcastBus;

// ---------------------------------------------------------------------------
// Message backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    log: HashMap<ChannelId, Vec<Change>>,
    message_ids: HashSet<Uuid>,
    subscriptions: HashMap<SubscriptionId, (ChannelId, mpsc::Sender<Change>)>,
    bundles: HashMap<Handle, PreKeyBundle>,
    next_subscription: u64,
}

impl BackendState {
    fn append(&mut self, change: Change) {
        let channel_id = change.channel_id().clone();
        self.subscriptions.retain(|id, (subscribed, sink)| {
            if *subscribed != channel_id {
                return true;
            }
            match sink.try_send(change.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscription = id.0, "subscriber lagging, change dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        self.log.entry(channel_id).or_default().push(change);
    }
}

/// Backend kept entirely in memory. [`MemoryBackend::set_offline`] makes
/// every call fail, which is how tests simulate lost connectivity.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<BackendState>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Live subscriptions on `channel_id`.
    pub fn subscription_count(&self, channel_id: &ChannelId) -> usize {
        self.state
            .lock()
            .map(|s| {
                s.subscriptions
                    .values()
                    .filter(|(c, sink)| c == channel_id && !sink.is_closed())
                    .count()
            })
            .unwrap_or_default()
    }

    /// Messages stored for `channel_id`, in insertion order.
    pub fn messages(&self, channel_id: &ChannelId) -> Vec<WireMessage> {
        self.state
            .lock()
            .map(|s| {
                s.log
                    .get(channel_id)
                    .into_iter()
                    .flatten()
                    .filter_map(|c| match c {
                        Change::Message(m) => Some(m.clone()),
                        Change::Delivered { .. } => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BackendState>, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Unavailable("backend offline".into()));
        }
        self.state
            .lock()
            .map_err(|_| NetError::Unavailable("backend state poisoned".into()))
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn insert(&self, message: &WireMessage) -> Result<(), NetError> {
        let mut state = self.lock()?;
        if !state.message_ids.insert(message.id) {
            debug!(id = %message.id, "duplicate insert ignored");
            return Ok(());
        }
        state.append(Change::Message(message.clone()));
        Ok(())
    }

    async fn acknowledge(&self, channel_id: &ChannelId, message_id: Uuid, at: i64) -> Result<(), NetError> {
        self.lock()?.append(Change::Delivered {
            channel_id: channel_id.clone(),
            message_id,
            at,
        });
        Ok(())
    }

    async fn changes_since(&self, channel_id: &ChannelId, after: i64) -> Result<Vec<Change>, NetError> {
        let state = self.lock()?;
        let mut changes: Vec<Change> = state
            .log
            .get(channel_id)
            .into_iter()
            .flatten()
            .filter(|c| c.at() > after)
            .cloned()
            .collect();
        changes.sort_by_key(Change::at);
        Ok(changes)
    }

    async fn subscribe(
        &self,
        channel_id: &ChannelId,
        sink: mpsc::Sender<Change>,
    ) -> Result<SubscriptionId, NetError> {
        let mut state = self.lock()?;
        state.next_subscription += 1;
        let id = SubscriptionId(state.next_subscription);
        state.subscriptions.insert(id, (channel_id.clone(), sink));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), NetError> {
        // Tear-down must work even while "offline" so no subscription leaks.
        let mut state = self
            .state
            .lock()
            .map_err(|_| NetError::Unavailable("backend state poisoned".into()))?;
        state.subscriptions.remove(&id);
        Ok(())
    }

    async fn publish_bundle(&self, bundle: &PreKeyBundle) -> Result<(), NetError> {
        self.lock()?.bundles.insert(bundle.handle.clone(), bundle.clone());
        Ok(())
    }

    /// Hands out the advertised one-time pre-key at most once.
    async fn fetch_bundle(&self, handle: &Handle) -> Result<Option<PreKeyBundle>, NetError> {
        let mut state = self.lock()?;
        Ok(state.bundles.get_mut(handle).map(|stored| {
            let bundle = stored.clone();
            stored.one_time_prekey = None;
            bundle
        }))
    }
}

// ---------------------------------------------------------------------------
// Broadcast bus
// ---------------------------------------------------------------------------

const BUS_CAPACITY: usize = 256;

/// Same-process broadcast bus keyed by channel name.
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, name: &str) -> Result<broadcast::Sender<Vec<u8>>, NetError> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| NetError::Unavailable("bus state poisoned".into()))?;
        Ok(channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .clone())
    }
}

impl BroadcastBus for LocalBus {
    fn publish(&self, name: &str, payload: Vec<u8>) -> Result<(), NetError> {
        // No listeners is fine; the envelope simply goes nowhere.
        let _ = self.sender(name)?.send(payload);
        Ok(())
    }

    fn subscribe(&self, name: &str) -> Result<broadcast::Receiver<Vec<u8>>, NetError> {
        Ok(self.sender(name)?.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(created_at: i64) -> WireMessage {
        let a = Handle::parse("AAAAAAAA").unwrap();
        let b = Handle::parse("BBBBBBBB").unwrap();
        WireMessage {
            id: Uuid::new_v4(),
            channel_id: ChannelId::between(&a, &b),
            sender_handle: a,
            ciphertext: vec![1; 17],
            nonce: vec![0; 12],
            ratchet_public_key: [5; 32],
            message_number: 0,
            media_type: None,
            media_url: None,
            created_at,
            expires_at: None,
            handshake: None,
        }
    }

    #[tokio::test]
    async fn changes_since_is_strict_and_ordered() {
        let backend = MemoryBackend::new();
        let m1 = wire(200);
        let m2 = wire(100);
        backend.insert(&m1).await.unwrap();
        backend.insert(&m2).await.unwrap();
        backend.insert(&m1).await.unwrap();

        let all = backend.changes_since(&m1.channel_id, 0).await.unwrap();
        assert_eq!(all.iter().map(Change::at).collect::<Vec<_>>(), vec![100, 200]);

        let newer = backend.changes_since(&m1.channel_id, 100).await.unwrap();
        assert_eq!(newer, vec![Change::Message(m1)]);
    }

    #[tokio::test]
    async fn subscription_receives_until_unsubscribed() {
        let backend = MemoryBackend::new();
        let m = wire(1);
        let (tx, mut rx) = mpsc::channel(8);
        let id = backend.subscribe(&m.channel_id, tx).await.unwrap();
        assert_eq!(backend.subscription_count(&m.channel_id), 1);

        backend.insert(&m).await.unwrap();
        assert_eq!(rx.recv().await, Some(Change::Message(m.clone())));

        backend.unsubscribe(id).await.unwrap();
        assert_eq!(backend.subscription_count(&m.channel_id), 0);
        backend.insert(&wire(2)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_backend_fails_fast() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(matches!(backend.insert(&wire(1)).await, Err(NetError::Unavailable(_))));
    }

    #[tokio::test]
    async fn local_bus_fans_out_by_name() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("murmur").unwrap();
        let mut other = bus.subscribe("elsewhere").unwrap();
        bus.publish("murmur", b"hi".to_vec()).unwrap();
        assert_eq!(a.recv().await.unwrap(), b"hi".to_vec());
        assert!(other.try_recv().is_err());
    }
}
