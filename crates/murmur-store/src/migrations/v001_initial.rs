//! v001 -- Initial schema.
//!
//! Timestamps are Unix epoch milliseconds. `messages.content` never holds
//! plaintext; it is always the scrubbed sentinel.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identities (sealed key material)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS identities (
    handle      TEXT PRIMARY KEY NOT NULL,    -- 8-char public handle
    sealed_keys BLOB NOT NULL,                -- sealed with the device storage key
    created_at  INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Channels (one per unordered pair of handles)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id                   TEXT PRIMARY KEY NOT NULL,  -- "<lo>_<hi>"
    last_message_preview TEXT,
    last_activity_at     INTEGER NOT NULL,
    unread_count         INTEGER NOT NULL DEFAULT 0,
    expiry_hours         INTEGER,                    -- NULL = default, 0 = never
    created_at           INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_channels_activity
    ON channels(last_activity_at DESC);

-- ----------------------------------------------------------------
-- Messages (ciphertext only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,  -- append order
    id                 TEXT NOT NULL UNIQUE,               -- UUID v4
    channel_id         TEXT NOT NULL,
    sender_handle      TEXT NOT NULL,
    direction          TEXT NOT NULL,                      -- 'outbound' | 'inbound'
    content            TEXT NOT NULL,                      -- scrubbed sentinel
    ciphertext         BLOB NOT NULL,
    nonce              BLOB NOT NULL,
    ratchet_public_key BLOB NOT NULL,
    message_number     INTEGER NOT NULL,
    handshake          TEXT,                               -- JSON, first message only
    sealed_body        BLOB,                               -- local at-rest copy
    media_type         TEXT,
    media_url          TEXT,
    created_at         INTEGER NOT NULL,
    bucket_id          INTEGER NOT NULL,
    expires_at         INTEGER,                            -- NULL = never
    status             TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_channel
    ON messages(channel_id, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_channel_bucket
    ON messages(channel_id, bucket_id);

CREATE INDEX IF NOT EXISTS idx_messages_expires
    ON messages(expires_at);

CREATE INDEX IF NOT EXISTS idx_messages_status
    ON messages(direction, status);

-- ----------------------------------------------------------------
-- Ratchet state (sealed, one per channel)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS ratchet_states (
    channel_id   TEXT PRIMARY KEY NOT NULL,
    sealed_state BLOB NOT NULL,
    updated_at   INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Sync cursors (newest remote created_at seen per channel)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS sync_cursors (
    channel_id TEXT PRIMARY KEY NOT NULL,
    cursor     INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
