//! Same-device fan-out between concurrently open contexts.
//!
//! Every context publishes [`RelayEnvelope`]s on a shared, named bus and
//! listens on the same name. Envelopes carry the sender's handle; a context
//! discards its own envelopes so nothing loops back. The relay neither
//! persists nor encrypts: message payloads are already ciphertext.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use murmur_shared::{ChannelId, Handle, RelayEnvelope, RelayEvent, WireMessage};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::NetError;

/// Host broadcast primitive (a `BroadcastChannel`, an IPC pipe, an
/// in-process channel...).
pub trait BroadcastBus: Send + Sync + 'static {
    fn publish(&self, name: &str, payload: Vec<u8>) -> Result<(), NetError>;
    fn subscribe(&self, name: &str) -> Result<broadcast::Receiver<Vec<u8>>, NetError>;
}

/// Remembers when each peer last signalled typing in each channel. An entry
/// counts as typing for `timeout` after the signal, then lapses on its own.
#[derive(Debug)]
pub struct TypingTracker {
    timeout: Duration,
    seen: HashMap<(ChannelId, Handle), Instant>,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            seen: HashMap::new(),
        }
    }

    pub fn record(&mut self, channel_id: ChannelId, who: Handle, at: Instant) {
        self.seen.insert((channel_id, who), at);
    }

    pub fn is_typing_at(&self, channel_id: &ChannelId, who: &Handle, now: Instant) -> bool {
        self.seen
            .get(&(channel_id.clone(), who.clone()))
            .is_some_and(|at| now.saturating_duration_since(*at) < self.timeout)
    }

    /// Drop lapsed entries.
    pub fn prune(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < timeout);
    }
}

pub struct CrossContextRelay {
    bus: Arc<dyn BroadcastBus>,
    name: String,
    me: Handle,
    typing: Mutex<TypingTracker>,
    presence: Mutex<HashMap<Handle, bool>>,
}

impl CrossContextRelay {
    pub fn new(bus: Arc<dyn BroadcastBus>, name: impl Into<String>, me: Handle, typing_timeout: Duration) -> Self {
        Self {
            bus,
            name: name.into(),
            me,
            typing: Mutex::new(TypingTracker::new(typing_timeout)),
            presence: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.me
    }

    pub fn publish(&self, event: RelayEvent) -> Result<(), NetError> {
        let envelope = RelayEnvelope {
            sender: self.me.clone(),
            event,
        };
        self.bus.publish(&self.name, envelope.to_bytes()?)
    }

    pub fn publish_message(&self, message: &WireMessage) -> Result<(), NetError> {
        self.publish(RelayEvent::Message {
            message: message.clone(),
        })
    }

    pub fn publish_typing(&self, channel_id: &ChannelId) -> Result<(), NetError> {
        self.publish(RelayEvent::Typing {
            channel_id: channel_id.clone(),
        })
    }

    pub fn publish_delivered(&self, channel_id: &ChannelId, message_id: Uuid) -> Result<(), NetError> {
        self.publish(RelayEvent::Delivered {
            channel_id: channel_id.clone(),
            message_id,
        })
    }

    pub fn publish_online(&self, online: bool) -> Result<(), NetError> {
        self.publish(RelayEvent::Online { online })
    }

    pub fn is_typing(&self, channel_id: &ChannelId, who: &Handle) -> bool {
        self.typing
            .lock()
            .map(|t| t.is_typing_at(channel_id, who, Instant::now()))
            .unwrap_or(false)
    }

    /// Last presence announced by `who`, if any.
    pub fn is_online(&self, who: &Handle) -> Option<bool> {
        self.presence
            .lock()
            .ok()
            .and_then(|p| p.get(who).copied())
    }

    /// Apply an envelope to local state. Returns `None` for envelopes this
    /// context sent itself.
    pub fn accept(&self, envelope: RelayEnvelope) -> Option<RelayEnvelope> {
        if envelope.sender == self.me {
            return None;
        }
        match &envelope.event {
            RelayEvent::Typing { channel_id } => {
                if let Ok(mut typing) = self.typing.lock() {
                    let now = Instant::now();
                    typing.prune(now);
                    typing.record(channel_id.clone(), envelope.sender.clone(), now);
                }
            }
            RelayEvent::Online { online } => {
                if let Ok(mut presence) = self.presence.lock() {
                    presence.insert(envelope.sender.clone(), *online);
                }
            }
            RelayEvent::Message { .. } | RelayEvent::Delivered { .. } => {}
        }
        Some(envelope)
    }

    /// Listen on the bus and forward foreign envelopes to `sink` until
    /// `shutdown` flips or the bus closes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        sink: mpsc::Sender<RelayEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, NetError> {
        let mut rx = self.bus.subscribe(&self.name)?;
        let relay = Arc::clone(self);

        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(bytes) => {
                            let envelope = match RelayEnvelope::from_bytes(&bytes) {
                                Ok(env) => env,
                                Err(e) => {
                                    warn!(error = %e, "undecodable relay envelope dropped");
                                    continue;
                                }
                            };
                            let Some(envelope) = relay.accept(envelope) else {
                                continue;
                            };
                            debug!(from = %envelope.sender, "relay envelope received");
                            if sink.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "relay listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!(handle = %relay.me, "relay listener stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LocalBus;

    fn h(s: &str) -> Handle {
        Handle::parse(s).unwrap()
    }

    #[test]
    fn typing_lapses_after_timeout() {
        let mut tracker = TypingTracker::new(Duration::from_secs(5));
        let chan = ChannelId("AAAAAAAA_BBBBBBBB".into());
        let start = Instant::now();
        tracker.record(chan.clone(), h("BBBBBBBB"), start);

        assert!(tracker.is_typing_at(&chan, &h("BBBBBBBB"), start + Duration::from_secs(4)));
        assert!(!tracker.is_typing_at(&chan, &h("BBBBBBBB"), start + Duration::from_secs(5)));
        assert!(!tracker.is_typing_at(&chan, &h("CCCCCCCC"), start));

        tracker.prune(start + Duration::from_secs(6));
        assert!(!tracker.is_typing_at(&chan, &h("BBBBBBBB"), start));
    }

    #[tokio::test]
    async fn own_envelopes_are_dropped() {
        let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
        let timeout = Duration::from_secs(5);
        let alice = Arc::new(CrossContextRelay::new(bus.clone(), "murmur", h("AAAAAAAA"), timeout));
        let bob = Arc::new(CrossContextRelay::new(bus.clone(), "murmur", h("BBBBBBBB"), timeout));

        let (_stop_tx, stop_rx) = watch::channel(false);
        let (alice_tx, mut alice_rx) = mpsc::channel(8);
        let (bob_tx, mut bob_rx) = mpsc::channel(8);
        alice.spawn_listener(alice_tx, stop_rx.clone()).unwrap();
        bob.spawn_listener(bob_tx, stop_rx).unwrap();

        let chan = ChannelId::between(alice.handle(), bob.handle());
        alice.publish_typing(&chan).unwrap();

        let got = bob_rx.recv().await.unwrap();
        assert_eq!(got.sender, h("AAAAAAAA"));
        assert!(bob.is_typing(&chan, &h("AAAAAAAA")));

        // Bob's own echo must not come back to him, and Alice never sees hers.
        bob.publish_online(true).unwrap();
        let seen_by_alice = alice_rx.recv().await.unwrap();
        assert_eq!(seen_by_alice.event, RelayEvent::Online { online: true });
        assert_eq!(alice.is_online(&h("BBBBBBBB")), Some(true));
        assert!(alice_rx.try_recv().is_err());
        assert!(bob_rx.try_recv().is_err());
    }

    #[test]
    fn accept_filters_by_sender_only() {
        let bus: Arc<dyn BroadcastBus> = Arc::new(LocalBus::new());
        let relay = CrossContextRelay::new(bus, "murmur", h("AAAAAAAA"), Duration::from_secs(5));
        let own = RelayEnvelope {
            sender: h("AAAAAAAA"),
            event: RelayEvent::Online { online: true },
        };
        let foreign = RelayEnvelope {
            sender: h("BBBBBBBB"),
            event: RelayEvent::Online { online: false },
        };
        assert!(relay.accept(own).is_none());
        assert!(relay.accept(foreign).is_some());
        assert_eq!(relay.is_online(&h("BBBBBBBB")), Some(false));
    }
}
