//! Async message store with a write-ahead buffer.
//!
//! Appends land in an in-memory queue and are committed to SQLite in batches:
//! when the queue reaches `flush_threshold`, on every `flush_interval` tick of
//! the background flusher, and before any read that must see fresh data.
//! A failed commit leaves the whole batch queued for the next attempt.
//!
//! All SQLite work runs on the blocking pool; the [`Database`] itself sits
//! behind a mutex so at most one statement runs at a time.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use murmur_shared::{ChannelId, DeliveryStatus, Handle};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Channel, Message, StoredIdentity};

#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Queue length that triggers an immediate commit.
    pub flush_threshold: usize,
    /// Period of the background flusher.
    pub flush_interval: Duration,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 20,
            flush_interval: Duration::from_secs(3),
        }
    }
}

pub struct MessageStore {
    db: Arc<Mutex<Database>>,
    wal: Mutex<VecDeque<Message>>,
    // Serialises flushes so a batch is never committed and drained twice.
    flush_lock: AsyncMutex<()>,
    config: WalConfig,
}

impl MessageStore {
    pub fn open(path: &Path, config: WalConfig) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?, config))
    }

    /// Open the database in the platform data directory.
    pub fn open_default(config: WalConfig) -> Result<Self> {
        Ok(Self::from_database(Database::new()?, config))
    }

    pub fn from_database(db: Database, config: WalConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            wal: Mutex::new(VecDeque::new()),
            flush_lock: AsyncMutex::new(()),
            config,
        }
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn lock_wal(&self) -> Result<MutexGuard<'_, VecDeque<Message>>> {
        self.wal.lock().map_err(|_| StoreError::LockPoisoned)
    }

    // ------------------------------------------------------------------
    // Write-ahead buffer
    // ------------------------------------------------------------------

    /// Queue a message. The record is buffered as soon as this is called;
    /// an `Err` means the threshold-triggered commit failed and the record
    /// is still queued for the next flush.
    pub async fn append(&self, message: Message) -> Result<()> {
        let queued = {
            let mut wal = self.lock_wal()?;
            wal.push_back(message);
            wal.len()
        };
        if queued >= self.config.flush_threshold {
            self.flush().await?;
        }
        Ok(())
    }

    /// Records buffered but not yet committed.
    pub fn queued(&self) -> usize {
        self.wal.lock().map(|wal| wal.len()).unwrap_or_default()
    }

    /// Commit everything queued, in append order. Returns the number of
    /// records taken off the queue.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<Message> = self.lock_wal()?.iter().cloned().collect();
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();

        match self.with_db(move |db| db.insert_messages(&batch)).await {
            Ok(inserted) => {
                self.lock_wal()?.drain(..count).for_each(drop);
                debug!(count, inserted, "wal flushed");
                Ok(count)
            }
            Err(e) => {
                warn!(error = %e, queued = count, "wal commit failed, records kept for retry");
                Err(e)
            }
        }
    }

    /// Periodic flusher. Stops, after a final flush, once `shutdown` flips.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.flush().await {
                            warn!(error = %e, "periodic wal flush failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            if let Err(e) = store.flush().await {
                warn!(error = %e, "final wal flush failed");
            }
            info!("wal flusher stopped");
        })
    }

    // ------------------------------------------------------------------
    // Message reads (flush first)
    // ------------------------------------------------------------------

    pub async fn messages_by_channel(&self, channel_id: &ChannelId, limit: u32) -> Result<Vec<Message>> {
        self.flush().await?;
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.get_messages_by_channel(&channel_id, limit))
            .await
    }

    pub async fn messages_by_bucket(&self, channel_id: &ChannelId, bucket_id: i64) -> Result<Vec<Message>> {
        self.flush().await?;
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.get_messages_by_bucket(&channel_id, bucket_id))
            .await
    }

    pub async fn message(&self, id: Uuid) -> Result<Message> {
        self.flush().await?;
        self.with_db(move |db| db.get_message(id)).await
    }

    pub async fn pending_outbound(&self) -> Result<Vec<Message>> {
        self.flush().await?;
        self.with_db(|db| db.pending_outbound()).await
    }

    /// Committed rows only; queued records are not counted.
    pub async fn durable_count(&self, channel_id: &ChannelId) -> Result<usize> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.count_messages(&channel_id)).await
    }

    // ------------------------------------------------------------------
    // Message writes
    // ------------------------------------------------------------------

    /// Remove messages whose expiry is strictly before `now`.
    pub async fn delete_expired(&self, now: i64) -> Result<usize> {
        self.flush().await?;
        let removed = self.with_db(move |db| db.delete_expired(now)).await?;
        if removed > 0 {
            info!(removed, "expired messages deleted");
        }
        Ok(removed)
    }

    pub async fn update_status(&self, id: Uuid, next: DeliveryStatus) -> Result<DeliveryStatus> {
        self.flush().await?;
        self.with_db(move |db| db.update_message_status(id, next)).await
    }

    // ------------------------------------------------------------------
    // Identities
    // ------------------------------------------------------------------

    pub async fn insert_identity(&self, identity: StoredIdentity) -> Result<()> {
        self.with_db(move |db| db.insert_identity(&identity)).await
    }

    pub async fn replace_identity(&self, identity: StoredIdentity) -> Result<()> {
        self.with_db(move |db| db.replace_identity(&identity)).await
    }

    pub async fn identity(&self, handle: &Handle) -> Result<StoredIdentity> {
        let handle = handle.clone();
        self.with_db(move |db| db.get_identity(&handle)).await
    }

    pub async fn first_identity(&self) -> Result<Option<StoredIdentity>> {
        self.with_db(|db| db.first_identity()).await
    }

    // ------------------------------------------------------------------
    // Channels
    // ------------------------------------------------------------------

    pub async fn record_channel_activity(
        &self,
        channel_id: &ChannelId,
        preview: &str,
        at: i64,
        inbound: bool,
    ) -> Result<()> {
        let channel_id = channel_id.clone();
        let preview = preview.to_string();
        self.with_db(move |db| db.record_channel_activity(&channel_id, &preview, at, inbound))
            .await
    }

    pub async fn ensure_channel(&self, channel_id: &ChannelId, at: i64) -> Result<()> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.ensure_channel(&channel_id, at)).await
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Channel> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.get_channel(&channel_id)).await
    }

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        self.with_db(|db| db.list_channels()).await
    }

    pub async fn mark_read(&self, channel_id: &ChannelId) -> Result<bool> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.mark_channel_read(&channel_id)).await
    }

    pub async fn set_channel_expiry(&self, channel_id: &ChannelId, hours: Option<u32>) -> Result<bool> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.set_channel_expiry(&channel_id, hours))
            .await
    }

    /// Delete a channel and everything hanging off it, including records
    /// still sitting in the buffer.
    pub async fn delete_channel(&self, channel_id: &ChannelId) -> Result<bool> {
        let _guard = self.flush_lock.lock().await;
        self.lock_wal()?.retain(|m| m.channel_id != *channel_id);
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.delete_channel(&channel_id)).await
    }

    // ------------------------------------------------------------------
    // Ratchet state and sync cursors
    // ------------------------------------------------------------------

    pub async fn save_ratchet_state(&self, channel_id: &ChannelId, sealed: Vec<u8>, at: i64) -> Result<()> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.save_ratchet_state(&channel_id, &sealed, at))
            .await
    }

    pub async fn load_ratchet_state(&self, channel_id: &ChannelId) -> Result<Option<Vec<u8>>> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.load_ratchet_state(&channel_id)).await
    }

    pub async fn delete_ratchet_state(&self, channel_id: &ChannelId) -> Result<bool> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.delete_ratchet_state(&channel_id)).await
    }

    pub async fn sync_cursor(&self, channel_id: &ChannelId) -> Result<Option<i64>> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.get_sync_cursor(&channel_id)).await
    }

    pub async fn advance_sync_cursor(&self, channel_id: &ChannelId, cursor: i64) -> Result<i64> {
        let channel_id = channel_id.clone();
        self.with_db(move |db| db.advance_sync_cursor(&channel_id, cursor))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    fn chan() -> ChannelId {
        ChannelId("AAAAAAAA_BBBBBBBB".into())
    }

    fn msg(created_at: i64) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id: chan(),
            sender_handle: Handle::parse("AAAAAAAA").unwrap(),
            direction: Direction::Outbound,
            ciphertext: vec![1; 20],
            nonce: vec![2; 12],
            ratchet_public_key: [3; 32],
            message_number: 0,
            handshake: None,
            sealed_body: None,
            media_type: None,
            media_url: None,
            created_at,
            expires_at: None,
            status: DeliveryStatus::Pending,
        }
    }

    fn open(config: WalConfig) -> (tempfile::TempDir, MessageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(&dir.path().join("test.db"), config).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn nineteen_stay_buffered_twentieth_flushes() {
        let (_dir, store) = open(WalConfig {
            flush_threshold: 20,
            flush_interval: Duration::from_secs(3600),
        });

        for t in 0..19 {
            store.append(msg(t)).await.unwrap();
        }
        assert_eq!(store.queued(), 19);
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 0);

        store.append(msg(19)).await.unwrap();
        assert_eq!(store.queued(), 0);
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn reads_flush_first_and_keep_append_order() {
        let (_dir, store) = open(WalConfig::default());
        let first = msg(5);
        let second = msg(5);
        store.append(first.clone()).await.unwrap();
        store.append(second.clone()).await.unwrap();

        let got = store.messages_by_channel(&chan(), 10).await.unwrap();
        assert_eq!(got.iter().map(|m| m.id).collect::<Vec<_>>(), vec![first.id, second.id]);
        assert_eq!(store.queued(), 0);
    }

    #[tokio::test]
    async fn failed_commit_keeps_records_queued() {
        let (_dir, store) = open(WalConfig::default());
        store
            .with_db(|db| Ok(db.conn().execute_batch("DROP TABLE messages")?))
            .await
            .unwrap();

        store.append(msg(1)).await.unwrap();
        assert!(store.flush().await.is_err());
        assert_eq!(store.queued(), 1);

        store
            .with_db(|db| Ok(crate::migrations::v001_initial::up(db.conn())?))
            .await
            .unwrap();
        assert_eq!(store.flush().await.unwrap(), 1);
        assert_eq!(store.queued(), 0);
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn background_flusher_commits_and_stops() {
        let (_dir, store) = open(WalConfig {
            flush_threshold: 20,
            flush_interval: Duration::from_millis(20),
        });
        let store = Arc::new(store);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = store.spawn_flusher(shutdown_rx);

        store.append(msg(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 1);

        store.append(msg(2)).await.unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn delete_channel_drops_buffered_records() {
        let (_dir, store) = open(WalConfig::default());
        store.ensure_channel(&chan(), 1).await.unwrap();
        store.append(msg(1)).await.unwrap();

        assert!(store.delete_channel(&chan()).await.unwrap());
        assert_eq!(store.queued(), 0);
        assert!(store.messages_by_channel(&chan(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expiry_sweep_sees_buffered_records() {
        let (_dir, store) = open(WalConfig::default());
        let mut old = msg(1);
        old.expires_at = Some(50);
        store.append(old).await.unwrap();

        assert_eq!(store.delete_expired(100).await.unwrap(), 1);
        assert_eq!(store.durable_count(&chan()).await.unwrap(), 0);
    }
}
