//! Connection lease manager.
//!
//! Runs in its own tokio task and talks to the embedding application through
//! typed channels: [`HostSignal`]s go in, [`LeaseEvent`]s come out.
//!
//! ```text
//!               heartbeat ok + active + foreground
//!   Disconnected ──► Heartbeating ──────────────────► Active    (realtime)
//!        ▲                │   ok + active + background ► Polling (timed poll)
//!        │  failure       │   ok + queued ───────────► Queued  (timed poll)
//!        └────────────────┘
//! ```
//!
//! While `Active`, every open channel has exactly one realtime subscription.
//! In every other state subscriptions are torn down and, when the backend is
//! reachable, open and known channels are polled from their sync cursor.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use murmur_shared::{ChannelId, DeliveryStatus, Handle, HeartbeatRequest, LeaseStatus};
use murmur_store::MessageStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::admission::AdmissionService;
use crate::backend::{Change, RemoteBackend, SubscriptionId};
use crate::error::NetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaseState {
    Disconnected,
    Heartbeating,
    Active,
    Queued,
    Polling,
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Stable user/device id sent with every heartbeat.
    pub user_id: String,
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    /// Polls re-read this far behind the cursor. Messages are stamped by the
    /// sender's clock and may reach the backend late (offline outbox), so a
    /// strict cursor would skip them. Duplicates are dropped downstream.
    pub poll_overlap: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            heartbeat_interval: Duration::from_secs(20),
            poll_interval: Duration::from_secs(10),
            poll_overlap: Duration::from_secs(300),
        }
    }
}

/// Signals from the host environment into the manager.
#[derive(Debug, Clone)]
pub enum HostSignal {
    /// UI became visible (`true`) or hidden.
    Foreground(bool),
    /// Connectivity changed. Going online triggers an immediate heartbeat
    /// and outbox flush.
    Online(bool),
    ChannelOpened(ChannelId),
    ChannelClosed(ChannelId),
    /// The user is composing; reported to admission so typing identities are
    /// evicted last.
    Typing(bool),
    /// User activity at the given time (Unix epoch millis).
    Activity(i64),
    /// New pending messages are waiting in the store.
    FlushOutbox,
}

/// Notifications from the manager to the application.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    StateChanged(LeaseState),
    /// A change arrived from the backend, via realtime or polling.
    Change(Change),
    /// Pending messages handed to the backend and marked sent. Rejected ones
    /// are marked failed and not counted.
    OutboxFlushed { sent: usize },
}

/// Handle to the running manager. Dropping it does not stop the task; call
/// [`LeaseHandle::shutdown`].
pub struct LeaseHandle {
    pub signals: mpsc::Sender<HostSignal>,
    pub state: watch::Receiver<LeaseState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LeaseHandle {
    pub fn current(&self) -> LeaseState {
        *self.state.borrow()
    }

    pub async fn signal(&self, signal: HostSignal) -> Result<(), NetError> {
        self.signals.send(signal).await.map_err(|_| NetError::Closed)
    }

    /// Cancel every timer, drop all subscriptions and wait for the task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "lease task ended abnormally");
        }
    }
}

/// Spawn the lease manager for `handle`. Returns the control handle and the
/// event stream.
pub fn spawn_lease_manager(
    handle: Handle,
    config: LeaseConfig,
    admission: Arc<dyn AdmissionService>,
    backend: Arc<dyn RemoteBackend>,
    store: Arc<MessageStore>,
) -> (LeaseHandle, mpsc::Receiver<LeaseEvent>) {
    let (signal_tx, signal_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(LeaseState::Disconnected);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (change_tx, change_rx) = mpsc::channel(256);

    let manager = LeaseManager {
        handle,
        config,
        admission,
        backend,
        store,
        state: LeaseState::Disconnected,
        lease: None,
        foreground: true,
        online: true,
        typing: false,
        last_active_at: None,
        open_channels: BTreeSet::new(),
        subscriptions: HashMap::new(),
        change_tx,
        events: event_tx,
        state_tx,
    };
    let task = tokio::spawn(manager.run(signal_rx, change_rx, shutdown_rx));

    (
        LeaseHandle {
            signals: signal_tx,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        },
        event_rx,
    )
}

struct LeaseManager {
    handle: Handle,
    config: LeaseConfig,
    admission: Arc<dyn AdmissionService>,
    backend: Arc<dyn RemoteBackend>,
    store: Arc<MessageStore>,
    state: LeaseState,
    /// Last answer from admission; `None` until the first success or after a
    /// failure.
    lease: Option<LeaseStatus>,
    foreground: bool,
    online: bool,
    typing: bool,
    last_active_at: Option<i64>,
    open_channels: BTreeSet<ChannelId>,
    subscriptions: HashMap<ChannelId, SubscriptionId>,
    change_tx: mpsc::Sender<Change>,
    events: mpsc::Sender<LeaseEvent>,
    state_tx: watch::Sender<LeaseState>,
}

impl LeaseManager {
    async fn run(
        mut self,
        mut signals: mpsc::Receiver<HostSignal>,
        mut changes: mpsc::Receiver<Change>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(handle = %self.handle, "lease manager started");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => self.heartbeat().await,
                _ = poll.tick(), if self.should_poll() => self.poll_all().await,
                signal = signals.recv() => match signal {
                    Some(signal) => self.on_signal(signal).await,
                    None => break,
                },
                Some(change) = changes.recv() => self.on_realtime_change(change).await,
                _ = shutdown.changed() => break,
            }
        }

        self.teardown_subscriptions().await;
        self.set_state(LeaseState::Disconnected).await;
        info!(handle = %self.handle, "lease manager stopped");
    }

    fn should_poll(&self) -> bool {
        matches!(self.state, LeaseState::Queued | LeaseState::Polling)
    }

    async fn set_state(&mut self, next: LeaseState) {
        if self.state == next {
            return;
        }
        info!(handle = %self.handle, from = ?self.state, to = ?next, "lease state changed");
        self.state = next;
        let _ = self.state_tx.send(next);
        let _ = self.events.send(LeaseEvent::StateChanged(next)).await;
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    async fn heartbeat(&mut self) {
        if !self.online {
            self.lose_connection().await;
            return;
        }

        if self.state == LeaseState::Disconnected {
            self.set_state(LeaseState::Heartbeating).await;
        }
        let request = HeartbeatRequest {
            user_id: self.config.user_id.clone(),
            pin_handle: self.handle.clone(),
            typing: self.typing,
            last_active_at: self.last_active_at,
        };

        match self.admission.heartbeat(&request).await {
            Ok(resp) => {
                debug!(
                    handle = %self.handle,
                    status = ?resp.status,
                    active = resp.active_connections,
                    "heartbeat ok"
                );
                self.lease = Some(resp.status);
                self.settle().await;
                self.flush_outbox().await;
            }
            Err(e) => {
                warn!(handle = %self.handle, error = %e, "heartbeat failed");
                self.lose_connection().await;
            }
        }
    }

    async fn lose_connection(&mut self) {
        self.lease = None;
        self.teardown_subscriptions().await;
        self.set_state(LeaseState::Disconnected).await;
    }

    /// Derive the state from the current lease and foreground flag, and
    /// bring subscriptions in line with it.
    async fn settle(&mut self) {
        let next = match self.lease {
            None => LeaseState::Disconnected,
            Some(LeaseStatus::Queued) => LeaseState::Queued,
            Some(LeaseStatus::Active) if self.foreground => LeaseState::Active,
            Some(LeaseStatus::Active) => LeaseState::Polling,
        };

        if next == LeaseState::Active {
            let channels: Vec<ChannelId> = self.open_channels.iter().cloned().collect();
            for channel_id in channels {
                if !self.subscriptions.contains_key(&channel_id) {
                    self.subscribe(&channel_id).await;
                }
            }
            if self.state != LeaseState::Active {
                // Catch up on anything missed while not subscribed. Runs after
                // subscribing so nothing falls between the two.
                self.poll_all().await;
            }
        } else {
            self.teardown_subscriptions().await;
        }
        self.set_state(next).await;
    }

    // ------------------------------------------------------------------
    // Realtime subscriptions
    // ------------------------------------------------------------------

    /// (Re)subscribe one channel; any prior subscription is torn down first.
    async fn subscribe(&mut self, channel_id: &ChannelId) {
        self.unsubscribe(channel_id).await;
        match self.backend.subscribe(channel_id, self.change_tx.clone()).await {
            Ok(id) => {
                debug!(channel = %channel_id, subscription = id.0, "subscribed");
                self.subscriptions.insert(channel_id.clone(), id);
            }
            Err(e) => warn!(channel = %channel_id, error = %e, "subscribe failed"),
        }
    }

    async fn unsubscribe(&mut self, channel_id: &ChannelId) {
        if let Some(id) = self.subscriptions.remove(channel_id) {
            if let Err(e) = self.backend.unsubscribe(id).await {
                warn!(channel = %channel_id, error = %e, "unsubscribe failed");
            }
        }
    }

    async fn teardown_subscriptions(&mut self) {
        let channels: Vec<ChannelId> = self.subscriptions.keys().cloned().collect();
        for channel_id in channels {
            self.unsubscribe(&channel_id).await;
        }
    }

    async fn on_realtime_change(&mut self, change: Change) {
        // Late deliveries from a subscription already torn down are dropped;
        // polling will pick them up from the cursor.
        if !self.subscriptions.contains_key(change.channel_id()) {
            return;
        }
        let channel_id = change.channel_id().clone();
        let at = change.at();
        let _ = self.events.send(LeaseEvent::Change(change)).await;
        if let Err(e) = self.store.advance_sync_cursor(&channel_id, at).await {
            warn!(channel = %channel_id, error = %e, "cursor update failed");
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    async fn poll_all(&mut self) {
        let mut channels = self.open_channels.clone();
        match self.store.channels().await {
            Ok(known) => channels.extend(known.into_iter().map(|c| c.id)),
            Err(e) => warn!(error = %e, "listing channels for poll failed"),
        }
        for channel_id in channels {
            if let Err(e) = self.poll_channel(&channel_id).await {
                warn!(channel = %channel_id, error = %e, "poll failed");
                return;
            }
        }
    }

    async fn poll_channel(&mut self, channel_id: &ChannelId) -> Result<(), NetError> {
        let cursor = self.store.sync_cursor(channel_id).await?.unwrap_or(0);
        let overlap = i64::try_from(self.config.poll_overlap.as_millis()).unwrap_or(i64::MAX);
        let changes = self
            .backend
            .changes_since(channel_id, cursor.saturating_sub(overlap))
            .await?;
        if changes.is_empty() {
            return Ok(());
        }

        let newest = changes.iter().map(Change::at).max().unwrap_or(cursor);
        debug!(channel = %channel_id, count = changes.len(), cursor, newest, "poll");
        for change in changes {
            let _ = self.events.send(LeaseEvent::Change(change)).await;
        }
        self.store.advance_sync_cursor(channel_id, newest).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Outbox
    // ------------------------------------------------------------------

    /// Hand every pending outbound message to the backend, oldest first.
    /// Stops at the first failure so ordering is preserved on retry.
    async fn flush_outbox(&mut self) {
        let pending = match self.store.pending_outbound().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "reading outbox failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let mut sent = 0;
        for message in pending {
            let next = match self.backend.insert(&message.to_wire()).await {
                Ok(()) => DeliveryStatus::Sent,
                Err(e) if e.is_transient() => {
                    warn!(id = %message.id, error = %e, "outbound insert failed, will retry");
                    break;
                }
                Err(e) => {
                    warn!(id = %message.id, error = %e, "backend rejected message");
                    DeliveryStatus::Failed
                }
            };
            if let Err(e) = self.store.update_status(message.id, next).await {
                warn!(id = %message.id, error = %e, "recording outbound status failed");
            }
            if next == DeliveryStatus::Sent {
                sent += 1;
            }
        }
        info!(sent, "outbox flushed");
        let _ = self.events.send(LeaseEvent::OutboxFlushed { sent }).await;
    }

    // ------------------------------------------------------------------
    // Host signals
    // ------------------------------------------------------------------

    async fn on_signal(&mut self, signal: HostSignal) {
        debug!(handle = %self.handle, ?signal, "host signal");
        match signal {
            HostSignal::Foreground(foreground) => {
                self.foreground = foreground;
                if self.lease.is_some() {
                    self.settle().await;
                }
            }
            HostSignal::Online(true) => {
                self.online = true;
                self.heartbeat().await;
            }
            HostSignal::Online(false) => {
                self.online = false;
                self.lose_connection().await;
            }
            HostSignal::ChannelOpened(channel_id) => {
                self.open_channels.insert(channel_id.clone());
                if self.state == LeaseState::Active {
                    self.subscribe(&channel_id).await;
                    if let Err(e) = self.poll_channel(&channel_id).await {
                        warn!(channel = %channel_id, error = %e, "catch-up poll failed");
                    }
                }
            }
            HostSignal::ChannelClosed(channel_id) => {
                self.open_channels.remove(&channel_id);
                self.unsubscribe(&channel_id).await;
            }
            HostSignal::Typing(typing) => self.typing = typing,
            HostSignal::Activity(at) => {
                self.last_active_at = Some(self.last_active_at.map_or(at, |prev| prev.max(at)));
            }
            HostSignal::FlushOutbox => {
                if self.lease.is_some() {
                    self.flush_outbox().await;
                }
            }
        }
    }
}
