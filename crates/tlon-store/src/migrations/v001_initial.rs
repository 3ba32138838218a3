//! v001 -- Initial schema creation.
//!
//! Creates the core entity tables: `groups`, `channels`, `posts`, `contacts`,
//! plus `field_clocks` used for last-writer-wins reconciliation.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id            TEXT PRIMARY KEY NOT NULL,   -- ~host/name
    title         TEXT NOT NULL,
    description   TEXT NOT NULL DEFAULT '',
    image         TEXT NOT NULL DEFAULT '',
    cover         TEXT NOT NULL DEFAULT '',
    privacy       TEXT NOT NULL DEFAULT 'public',
    channel_order TEXT NOT NULL DEFAULT '[]',  -- JSON array of channel ids
    members       TEXT NOT NULL DEFAULT '[]',  -- JSON array of members
    roles         TEXT NOT NULL DEFAULT '{}',  -- JSON object role -> meta
    joined        INTEGER NOT NULL DEFAULT 1   -- boolean 0/1
);

-- ----------------------------------------------------------------
-- Channels (no FK: a channel may arrive before its group)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    id           TEXT PRIMARY KEY NOT NULL,    -- nest, ~ship or 0v club id
    kind         TEXT NOT NULL,
    group_id     TEXT,                         -- nullable for DMs
    title        TEXT NOT NULL DEFAULT '',
    description  TEXT NOT NULL DEFAULT '',
    writers      TEXT NOT NULL DEFAULT '[]',   -- JSON array of roles
    unread_count INTEGER NOT NULL DEFAULT 0,
    last_read    TEXT,                         -- post id storage key
    orphaned     INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_channels_group_id ON channels(group_id);

-- ----------------------------------------------------------------
-- Posts (ids are zero-padded @da so text order is time order)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS posts (
    channel_id  TEXT NOT NULL,
    id          TEXT NOT NULL,
    author      TEXT NOT NULL,
    sent        INTEGER NOT NULL,              -- unix millis
    content     TEXT NOT NULL,                 -- JSON story
    parent_id   TEXT,                          -- nullable, replies only
    reactions   TEXT NOT NULL DEFAULT '{}',    -- JSON object ship -> react
    reply_count INTEGER NOT NULL DEFAULT 0,
    delivery    TEXT NOT NULL DEFAULT 'sent',  -- pending | sent
    edited      INTEGER NOT NULL DEFAULT 0,
    deleted     INTEGER NOT NULL DEFAULT 0,    -- tombstone
    orphaned    INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (channel_id, id)
);

CREATE INDEX IF NOT EXISTS idx_posts_thread ON posts(channel_id, parent_id, id);
CREATE INDEX IF NOT EXISTS idx_posts_cache_id ON posts(channel_id, author, sent);

-- ----------------------------------------------------------------
-- Contacts
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS contacts (
    id            TEXT PRIMARY KEY NOT NULL,   -- ~ship
    nickname      TEXT NOT NULL DEFAULT '',
    avatar        TEXT NOT NULL DEFAULT '',
    bio           TEXT NOT NULL DEFAULT '',
    color         TEXT NOT NULL DEFAULT '',
    pinned_groups TEXT NOT NULL DEFAULT '[]'
);

-- ----------------------------------------------------------------
-- Field clocks (last-writer-wins bookkeeping)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS field_clocks (
    entity_key TEXT NOT NULL,
    field      TEXT NOT NULL,
    time       INTEGER NOT NULL,               -- logical millis
    pending    TEXT,                           -- owning mutation id, if unconfirmed

    PRIMARY KEY (entity_key, field)
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
