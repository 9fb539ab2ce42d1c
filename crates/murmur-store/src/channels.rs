//! CRUD operations for [`Channel`] records.

use murmur_shared::ChannelId;
use rusqlite::params;

use crate::database::Database;
use crate::error::{not_found, Result};
use crate::models::Channel;

impl Database {
    // ------------------------------------------------------------------
    // Upsert
    // ------------------------------------------------------------------

    /// Create the channel on first activity, otherwise bump its preview and
    /// activity time. Inbound activity also increments the unread counter.
    /// The activity time never moves backwards.
    pub fn record_channel_activity(
        &self,
        id: &ChannelId,
        preview: &str,
        at: i64,
        inbound: bool,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channels (id, last_message_preview, last_activity_at, unread_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?3)
             ON CONFLICT(id) DO UPDATE SET
                last_message_preview = CASE
                    WHEN excluded.last_activity_at >= channels.last_activity_at
                    THEN excluded.last_message_preview
                    ELSE channels.last_message_preview END,
                last_activity_at = MAX(channels.last_activity_at, excluded.last_activity_at),
                unread_count     = channels.unread_count + excluded.unread_count",
            params![id.as_str(), preview, at, i64::from(inbound)],
        )?;
        Ok(())
    }

    /// Ensure a channel row exists without touching its counters.
    pub fn ensure_channel(&self, id: &ChannelId, at: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channels (id, last_activity_at, created_at)
             VALUES (?1, ?2, ?2)
             ON CONFLICT(id) DO NOTHING",
            params![id.as_str(), at],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_channel(&self, id: &ChannelId) -> Result<Channel> {
        self.conn()
            .query_row(
                "SELECT id, last_message_preview, last_activity_at, unread_count,
                        expiry_hours, created_at
                 FROM channels
                 WHERE id = ?1",
                params![id.as_str()],
                row_to_channel,
            )
            .map_err(not_found)
    }

    /// All channels, most recently active first.
    pub fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, last_message_preview, last_activity_at, unread_count,
                    expiry_hours, created_at
             FROM channels
             ORDER BY last_activity_at DESC",
        )?;

        let rows = stmt.query_map([], row_to_channel)?;

        let mut channels = Vec::new();
        for row in rows {
            channels.push(row?);
        }
        Ok(channels)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    pub fn mark_channel_read(&self, id: &ChannelId) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE channels SET unread_count = 0 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(affected > 0)
    }

    /// `None` restores the client default; `Some(0)` disables expiry.
    pub fn set_channel_expiry(&self, id: &ChannelId, hours: Option<u32>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE channels SET expiry_hours = ?2 WHERE id = ?1",
            params![id.as_str(), hours],
        )?;
        Ok(affected > 0)
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove a channel together with its messages, ratchet state and sync
    /// cursor. Returns `true` if the channel row existed.
    pub fn delete_channel(&mut self, id: &ChannelId) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        tx.execute("DELETE FROM messages WHERE channel_id = ?1", params![id.as_str()])?;
        tx.execute(
            "DELETE FROM ratchet_states WHERE channel_id = ?1",
            params![id.as_str()],
        )?;
        tx.execute(
            "DELETE FROM sync_cursors WHERE channel_id = ?1",
            params![id.as_str()],
        )?;
        let affected = tx.execute("DELETE FROM channels WHERE id = ?1", params![id.as_str()])?;
        tx.commit()?;
        Ok(affected > 0)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    Ok(Channel {
        id: ChannelId(row.get(0)?),
        last_message_preview: row.get(1)?,
        last_activity_at: row.get(2)?,
        unread_count: row.get(3)?,
        expiry_hours: row.get(4)?,
        created_at: row.get(5)?,
    })
}
