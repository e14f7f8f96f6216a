//! v001 -- Initial schema.
//!
//! Every table uses an explicit `AUTOINCREMENT` row id. Observers identify
//! rows by it, so ids must never be reused after a delete.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Channels
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channels (
    row_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    cid             TEXT NOT NULL UNIQUE,      -- "type:id"
    kind            TEXT NOT NULL,
    id              TEXT NOT NULL,
    name            TEXT,
    created_at      TEXT NOT NULL,             -- RFC-3339, microsecond precision
    updated_at      TEXT NOT NULL,
    last_message_at TEXT,
    deleted_at      TEXT,
    truncated_at    TEXT,
    hidden          INTEGER NOT NULL DEFAULT 0,
    members         TEXT NOT NULL DEFAULT '[]' -- JSON array of user ids
);

-- ----------------------------------------------------------------
-- Read cursors (one per channel member)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS channel_reads (
    row_id            INTEGER PRIMARY KEY AUTOINCREMENT,
    cid               TEXT NOT NULL,
    user_id           TEXT NOT NULL,
    last_read         TEXT NOT NULL,
    last_delivered_at TEXT,
    unread_messages   INTEGER NOT NULL DEFAULT 0,

    UNIQUE (cid, user_id),
    FOREIGN KEY (cid) REFERENCES channels(cid) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    row_id             INTEGER PRIMARY KEY AUTOINCREMENT,
    id                 TEXT NOT NULL UNIQUE,
    cid                TEXT NOT NULL,
    user_id            TEXT NOT NULL,
    text               TEXT NOT NULL DEFAULT '',
    created_at         TEXT NOT NULL,          -- ordering timestamp
    updated_at         TEXT NOT NULL,
    deleted_at         TEXT,
    local_state        TEXT,                   -- NULL once synced
    locally_created_at TEXT,
    parent_id          TEXT,
    reaction_counts    TEXT NOT NULL DEFAULT '{}',
    reaction_scores    TEXT NOT NULL DEFAULT '{}',
    attachments        TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_messages_cid_created
    ON messages(cid, created_at);

CREATE INDEX IF NOT EXISTS idx_messages_parent
    ON messages(parent_id, created_at);

-- ----------------------------------------------------------------
-- Query links (channel list query <-> channel)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS query_links (
    row_id    INTEGER PRIMARY KEY AUTOINCREMENT,
    query_key TEXT NOT NULL,
    cid       TEXT NOT NULL,
    linked_at TEXT NOT NULL,

    UNIQUE (query_key, cid),
    FOREIGN KEY (cid) REFERENCES channels(cid) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        up(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        for expected in ["channel_reads", "channels", "messages", "query_links"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn test_migration_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        up(&conn).unwrap();
        up(&conn).unwrap();
    }
}
