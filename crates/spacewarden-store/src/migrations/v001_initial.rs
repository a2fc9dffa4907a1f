//! v001 -- Initial schema creation.
//!
//! Creates the five core tables: `autoinvite_rules`, `user_blocks`,
//! `invite_queue`, `seen_events`, and `bot_state`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Autoinvite rules: space -> target room mappings
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS autoinvite_rules (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    space_id   TEXT NOT NULL,                -- !space:server
    room_id    TEXT NOT NULL,                -- !room:server
    added_by   TEXT,                         -- @user:server, if added by command
    created_at TEXT NOT NULL,                -- ISO-8601 / RFC-3339

    UNIQUE (space_id, room_id)
);

CREATE INDEX IF NOT EXISTS idx_rules_space ON autoinvite_rules(space_id);

-- ----------------------------------------------------------------
-- User blocks: suppress re-invitation per (user, room)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_blocks (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    room_id    TEXT NOT NULL,
    reason     TEXT NOT NULL,                -- 'left' | 'banned' | 'manual'
    created_at TEXT NOT NULL,

    UNIQUE (user_id, room_id)
);

CREATE INDEX IF NOT EXISTS idx_blocks_user ON user_blocks(user_id);
CREATE INDEX IF NOT EXISTS idx_blocks_room ON user_blocks(room_id);

-- ----------------------------------------------------------------
-- Invite queue: durable invite intents
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS invite_queue (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    room_id     TEXT NOT NULL,               -- target room
    space_id    TEXT,                        -- originating space, if any
    status      TEXT NOT NULL DEFAULT 'pending',
    attempts    INTEGER NOT NULL DEFAULT 0,
    enqueued_at TEXT NOT NULL,
    expires_at  TEXT                         -- acceptance deadline, if configured
);

-- At most one non-terminal item per (user, room); terminal rows are kept
-- as history and do not participate in the constraint.
CREATE UNIQUE INDEX IF NOT EXISTS idx_invite_queue_active
    ON invite_queue(user_id, room_id)
    WHERE status IN ('pending', 'invited');

CREATE INDEX IF NOT EXISTS idx_invite_queue_status ON invite_queue(status);
CREATE INDEX IF NOT EXISTS idx_invite_queue_fifo
    ON invite_queue(enqueued_at) WHERE status = 'pending';

-- ----------------------------------------------------------------
-- Seen events: at-most-once event processing
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS seen_events (
    event_id   TEXT PRIMARY KEY NOT NULL,
    event_type TEXT NOT NULL,
    room_id    TEXT NOT NULL,
    sender     TEXT,
    timestamp  INTEGER NOT NULL,             -- server timestamp, ms
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_seen_events_timestamp ON seen_events(timestamp);

-- ----------------------------------------------------------------
-- Bot state (key-value), e.g. the sync token
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bot_state (
    key        TEXT PRIMARY KEY NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
