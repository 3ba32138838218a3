use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS activity_events (
    source     TEXT NOT NULL,                  -- channel id or channel id + parent
    post_id    TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    parent_id  TEXT,
    author     TEXT NOT NULL,
    kind       TEXT NOT NULL,                  -- post | reply | mention
    group_id   TEXT,
    time       INTEGER NOT NULL,               -- unix millis
    preview    TEXT NOT NULL DEFAULT '',

    PRIMARY KEY (source, post_id)
);

CREATE INDEX IF NOT EXISTS idx_activity_time ON activity_events(time DESC);

CREATE TABLE IF NOT EXISTS cohorts (
    id      TEXT PRIMARY KEY NOT NULL,         -- cohort tag
    targets TEXT NOT NULL DEFAULT '[]'         -- JSON array of ships
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
