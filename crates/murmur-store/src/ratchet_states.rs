//! Sealed per-channel ratchet snapshots. The store never sees them unsealed.

use murmur_shared::ChannelId;
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn save_ratchet_state(&self, channel_id: &ChannelId, sealed: &[u8], updated_at: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO ratchet_states (channel_id, sealed_state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET
                sealed_state = excluded.sealed_state,
                updated_at   = excluded.updated_at",
            params![channel_id.as_str(), sealed, updated_at],
        )?;
        Ok(())
    }

    pub fn load_ratchet_state(&self, channel_id: &ChannelId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT sealed_state FROM ratchet_states WHERE channel_id = ?1",
                params![channel_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Drop a session so the next message re-keys from scratch.
    pub fn delete_ratchet_state(&self, channel_id: &ChannelId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM ratchet_states WHERE channel_id = ?1",
            params![channel_id.as_str()],
        )?;
        Ok(affected > 0)
    }
}
