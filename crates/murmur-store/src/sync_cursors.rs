//! Per-channel polling cursors: the newest remote `created_at` already
//! ingested. Cursors only move forward.

use murmur_shared::{now_millis, ChannelId};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn get_sync_cursor(&self, channel_id: &ChannelId) -> Result<Option<i64>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE channel_id = ?1",
                params![channel_id.as_str()],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Advance to `cursor` unless the stored value is already newer.
    /// Returns the cursor in effect afterwards.
    pub fn advance_sync_cursor(&self, channel_id: &ChannelId, cursor: i64) -> Result<i64> {
        self.conn().execute(
            "INSERT INTO sync_cursors (channel_id, cursor, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET
                cursor     = MAX(sync_cursors.cursor, excluded.cursor),
                updated_at = excluded.updated_at",
            params![channel_id.as_str(), cursor, now_millis()],
        )?;
        Ok(self.get_sync_cursor(channel_id)?.unwrap_or(cursor))
    }
}
