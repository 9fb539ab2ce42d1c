//! CRUD operations for [`Message`] records.
//!
//! Inserts normally arrive in batches from the write-ahead buffer in
//! [`crate::wal`]; reads here see only what has already been flushed.

use murmur_shared::constants::SCRUBBED_SENTINEL;
use murmur_shared::{ChannelId, DeliveryStatus, Handle, HandshakeHeader};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::{Direction, Message};

const COLUMNS: &str = "id, channel_id, sender_handle, direction, ciphertext, nonce,
    ratchet_public_key, message_number, handshake, sealed_body, media_type, media_url,
    created_at, expires_at, status";

impl Database {
    /// Insert a batch in one transaction, preserving slice order. A message
    /// whose id is already stored is skipped, so re-delivery is harmless.
    /// Returns the number of rows actually inserted.
    pub fn insert_messages(&mut self, messages: &[Message]) -> Result<usize> {
        let tx = self.conn_mut().transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO messages (id, channel_id, sender_handle, direction, content,
                    ciphertext, nonce, ratchet_public_key, message_number, handshake,
                    sealed_body, media_type, media_url, created_at, bucket_id, expires_at, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(id) DO NOTHING",
            )?;
            for m in messages {
                let handshake = m.handshake.as_ref().map(serde_json::to_string).transpose()?;
                inserted += stmt.execute(params![
                    m.id.to_string(),
                    m.channel_id.as_str(),
                    m.sender_handle.as_str(),
                    m.direction.as_str(),
                    SCRUBBED_SENTINEL,
                    m.ciphertext,
                    m.nonce,
                    m.ratchet_public_key.as_slice(),
                    m.message_number,
                    handshake,
                    m.sealed_body,
                    m.media_type,
                    m.media_url,
                    m.created_at,
                    m.bucket_id(),
                    m.expires_at,
                    m.status.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    /// The most recent `limit` messages of a channel, oldest first.
    pub fn get_messages_by_channel(&self, channel_id: &ChannelId, limit: u32) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM (
                SELECT * FROM messages
                WHERE channel_id = ?1
                ORDER BY created_at DESC, seq DESC
                LIMIT ?2
             )
             ORDER BY created_at ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![channel_id.as_str(), limit], row_to_message)?;
        collect(rows)
    }

    /// Every message of a channel in one 10-day bucket, oldest first.
    pub fn get_messages_by_bucket(&self, channel_id: &ChannelId, bucket_id: i64) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE channel_id = ?1 AND bucket_id = ?2
             ORDER BY created_at ASC, seq ASC"
        ))?;
        let rows = stmt.query_map(params![channel_id.as_str(), bucket_id], row_to_message)?;
        collect(rows)
    }

    /// Outbound messages still waiting for the backend, in append order.
    pub fn pending_outbound(&self) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE direction = 'outbound' AND status = 'pending'
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map([], row_to_message)?;
        collect(rows)
    }

    pub fn count_messages(&self, channel_id: &ChannelId) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
            params![channel_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Delete every message whose expiry lies strictly before `now`.
    pub fn delete_expired(&self, now: i64) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM messages WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        )?)
    }

    /// Move a message to `next`, enforcing the forward-only lifecycle.
    /// Returns the previous status.
    pub fn update_message_status(&mut self, id: Uuid, next: DeliveryStatus) -> Result<DeliveryStatus> {
        let tx = self.conn_mut().transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM messages WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .and_then(|s| DeliveryStatus::parse(&s))
            .ok_or(StoreError::NotFound)?;

        if !current.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        if current != next {
            tx.execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1",
                params![id.to_string(), next.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(current)
    }
}

fn collect(rows: impl Iterator<Item = rusqlite::Result<Message>>) -> Result<Vec<Message>> {
    let mut messages = Vec::new();
    for row in rows {
        messages.push(row?);
    }
    Ok(messages)
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug, thiserror::Error)]
#[error("unrecognised {0} value {1:?}")]
struct BadEnum(&'static str, String);

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let channel_id: String = row.get(1)?;
    let sender_str: String = row.get(2)?;
    let direction_str: String = row.get(3)?;
    let ratchet_key: Vec<u8> = row.get(6)?;
    let handshake_json: Option<String> = row.get(8)?;
    let status_str: String = row.get(14)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| conversion_error(0, e))?;
    let sender_handle = Handle::parse(&sender_str).map_err(|e| conversion_error(2, e))?;
    let direction = Direction::parse(&direction_str)
        .ok_or_else(|| conversion_error(3, BadEnum("direction", direction_str.clone())))?;
    let ratchet_public_key = <[u8; 32]>::try_from(ratchet_key.as_slice()).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Blob, Box::new(e))
    })?;
    let handshake = handshake_json
        .map(|json| serde_json::from_str::<HandshakeHeader>(&json))
        .transpose()
        .map_err(|e| conversion_error(8, e))?;
    let status = DeliveryStatus::parse(&status_str)
        .ok_or_else(|| conversion_error(14, BadEnum("status", status_str.clone())))?;

    Ok(Message {
        id,
        channel_id: ChannelId(channel_id),
        sender_handle,
        direction,
        ciphertext: row.get(4)?,
        nonce: row.get(5)?,
        ratchet_public_key,
        message_number: row.get(7)?,
        handshake,
        sealed_body: row.get(9)?,
        media_type: row.get(10)?,
        media_url: row.get(11)?,
        created_at: row.get(12)?,
        expires_at: row.get(13)?,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::constants::BUCKET_WINDOW_MS;

    fn open() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn chan() -> ChannelId {
        ChannelId("AAAAAAAA_BBBBBBBB".into())
    }

    fn msg(created_at: i64, expires_at: Option<i64>) -> Message {
        Message {
            id: Uuid::new_v4(),
            channel_id: chan(),
            sender_handle: Handle::parse("AAAAAAAA").unwrap(),
            direction: Direction::Outbound,
            ciphertext: vec![0xC0; 24],
            nonce: vec![7; 12],
            ratchet_public_key: [3; 32],
            message_number: 0,
            handshake: None,
            sealed_body: None,
            media_type: None,
            media_url: None,
            created_at,
            expires_at,
            status: DeliveryStatus::Pending,
        }
    }

    #[test]
    fn content_column_is_scrubbed() {
        let (_dir, mut db) = open();
        let m = msg(1000, None);
        db.insert_messages(&[m.clone()]).unwrap();

        let content: String = db
            .conn()
            .query_row("SELECT content FROM messages WHERE id = ?1", params![m.id.to_string()], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(content, SCRUBBED_SENTINEL);
        assert_eq!(db.get_message(m.id).unwrap(), m);
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let (_dir, mut db) = open();
        let m = msg(1000, None);
        assert_eq!(db.insert_messages(&[m.clone(), m.clone()]).unwrap(), 1);
        assert_eq!(db.insert_messages(&[m]).unwrap(), 0);
        assert_eq!(db.count_messages(&chan()).unwrap(), 1);
    }

    #[test]
    fn by_channel_returns_latest_ascending() {
        let (_dir, mut db) = open();
        let batch: Vec<_> = [500, 100, 300, 400, 200].iter().map(|t| msg(*t, None)).collect();
        db.insert_messages(&batch).unwrap();

        let got: Vec<_> = db
            .get_messages_by_channel(&chan(), 3)
            .unwrap()
            .into_iter()
            .map(|m| m.created_at)
            .collect();
        assert_eq!(got, vec![300, 400, 500]);
    }

    #[test]
    fn by_bucket_is_chronological_and_bounded() {
        let (_dir, mut db) = open();
        let edge = BUCKET_WINDOW_MS;
        db.insert_messages(&[msg(edge + 5, None), msg(edge - 1, None), msg(edge, None), msg(3, None)])
            .unwrap();

        let first: Vec<_> = db
            .get_messages_by_bucket(&chan(), 0)
            .unwrap()
            .into_iter()
            .map(|m| m.created_at)
            .collect();
        assert_eq!(first, vec![3, edge - 1]);

        let second: Vec<_> = db
            .get_messages_by_bucket(&chan(), 1)
            .unwrap()
            .into_iter()
            .map(|m| m.created_at)
            .collect();
        assert_eq!(second, vec![edge, edge + 5]);
    }

    #[test]
    fn delete_expired_keeps_now_and_future() {
        let (_dir, mut db) = open();
        let now = 10_000;
        let past = msg(1, Some(now - 1));
        let at_now = msg(2, Some(now));
        let future = msg(3, Some(now + 1));
        let never = msg(4, None);
        db.insert_messages(&[past.clone(), at_now.clone(), future.clone(), never.clone()])
            .unwrap();

        assert_eq!(db.delete_expired(now).unwrap(), 1);
        assert_eq!(db.delete_expired(now).unwrap(), 0);

        assert!(matches!(db.get_message(past.id), Err(StoreError::NotFound)));
        for kept in [at_now, future, never] {
            assert!(db.get_message(kept.id).is_ok());
        }
    }

    #[test]
    fn status_moves_forward_only() {
        let (_dir, mut db) = open();
        let m = msg(1, None);
        db.insert_messages(&[m.clone()]).unwrap();

        assert_eq!(
            db.update_message_status(m.id, DeliveryStatus::Sent).unwrap(),
            DeliveryStatus::Pending
        );
        db.update_message_status(m.id, DeliveryStatus::Delivered).unwrap();
        assert!(matches!(
            db.update_message_status(m.id, DeliveryStatus::Pending),
            Err(StoreError::InvalidTransition { .. })
        ));
        assert_eq!(db.get_message(m.id).unwrap().status, DeliveryStatus::Delivered);

        assert!(matches!(
            db.update_message_status(Uuid::new_v4(), DeliveryStatus::Sent),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn failed_message_can_be_retried() {
        let (_dir, mut db) = open();
        let m = msg(1, None);
        db.insert_messages(&[m.clone()]).unwrap();
        db.update_message_status(m.id, DeliveryStatus::Failed).unwrap();
        assert!(db.pending_outbound().unwrap().is_empty());

        db.update_message_status(m.id, DeliveryStatus::Pending).unwrap();
        let pending = db.pending_outbound().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, m.id);
    }

    #[test]
    fn delete_channel_cascades() {
        let (_dir, mut db) = open();
        db.record_channel_activity(&chan(), "x", 1, false).unwrap();
        db.insert_messages(&[msg(1, None), msg(2, None)]).unwrap();
        db.save_ratchet_state(&chan(), &[1, 2, 3], 1).unwrap();
        db.advance_sync_cursor(&chan(), 2).unwrap();

        assert!(db.delete_channel(&chan()).unwrap());
        assert_eq!(db.count_messages(&chan()).unwrap(), 0);
        assert!(db.load_ratchet_state(&chan()).unwrap().is_none());
        assert_eq!(db.get_sync_cursor(&chan()).unwrap(), None);
        assert!(matches!(db.get_channel(&chan()), Err(StoreError::NotFound)));
    }
}
