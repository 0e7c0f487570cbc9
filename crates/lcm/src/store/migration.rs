//! Forward-only schema migrations.
//!
//! The current version is an integer in the `meta` table; each migration
//! runs in its own transaction and bumps it. There is no downgrade path.

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::info;

const MIGRATION_1_INITIAL: &str = "
-- Sessions are created lazily on first write and never deleted.
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Summary DAG nodes. Level 0 covers messages, level k covers level k-1.
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    level INTEGER NOT NULL DEFAULT 0,
    kind TEXT NOT NULL CHECK (kind IN ('preserve_details', 'bullet_points', 'truncated')),
    content TEXT NOT NULL,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    offset_start INTEGER NOT NULL,
    offset_end INTEGER NOT NULL,
    condensed_by INTEGER REFERENCES summaries(id),
    created_at TEXT NOT NULL
);

-- Immutable message log. The only legal update is summarized_by NULL -> id.
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    token_estimate INTEGER NOT NULL DEFAULT 0,
    transcript_offset INTEGER NOT NULL,
    summarized_by INTEGER REFERENCES summaries(id),
    created_at TEXT NOT NULL,
    UNIQUE (session_id, transcript_offset)
);

-- Parent -> child edges. The UNIQUE constraint is what stops a message or
-- summary being attached to two parents.
CREATE TABLE IF NOT EXISTS summary_children (
    parent_id INTEGER NOT NULL REFERENCES summaries(id),
    child_kind TEXT NOT NULL CHECK (child_kind IN ('message', 'summary')),
    child_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (parent_id, position),
    UNIQUE (child_kind, child_id)
);

-- Large blob references, keyed by (path, sha256). A changed hash creates a
-- new file id; last_seen_message_id is the one mutable column.
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    path TEXT NOT NULL,
    sha256 TEXT NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    first_seen_message_id INTEGER,
    last_seen_message_id INTEGER,
    snippet TEXT,
    content TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (path, sha256)
);

-- One FTS index over both message and summary content. Rows are written in
-- the same transaction as the row they index.
CREATE VIRTUAL TABLE IF NOT EXISTS search_index USING fts5(
    content,
    kind UNINDEXED,
    ref_id UNINDEXED,
    session_id UNINDEXED,
    tokenize='porter unicode61'
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, transcript_offset);
CREATE INDEX IF NOT EXISTS idx_messages_unsummarized ON messages (session_id) WHERE summarized_by IS NULL;
CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries (session_id, level);
CREATE INDEX IF NOT EXISTS idx_summaries_uncondensed ON summaries (session_id, level) WHERE condensed_by IS NULL;
CREATE INDEX IF NOT EXISTS idx_files_session ON files (session_id);
";

const MIGRATION_2_POISONED_SESSIONS: &str = "
-- Sessions latched after a read exposed impossible state. A present row
-- means every further write for the session is refused.
CREATE TABLE IF NOT EXISTS poisoned_sessions (
    session_id TEXT PRIMARY KEY,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

fn migrations() -> Vec<(i64, &'static str)> {
    vec![
        (1, MIGRATION_1_INITIAL),
        (2, MIGRATION_2_POISONED_SESSIONS),
    ]
}

pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    pub fn initialize_database(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let current = self.current_version()?;
        self.apply_migrations(current)
    }

    pub fn current_version(&self) -> Result<i64> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    fn apply_migrations(&mut self, current: i64) -> Result<()> {
        for (version, sql) in migrations() {
            if version <= current {
                continue;
            }
            info!("Applying schema migration {}", version);

            let tx = self.conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [version.to_string()],
            )?;
            tx.commit()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_once_and_record_version() {
        let mut conn = Connection::open_in_memory().unwrap();

        let mut migrator = MigrationManager::new(&mut conn);
        migrator.initialize_database().unwrap();
        assert_eq!(migrator.current_version().unwrap(), 2);

        // Re-running is a no-op.
        migrator.initialize_database().unwrap();
        assert_eq!(migrator.current_version().unwrap(), 2);
    }

    #[test]
    fn schema_creates_expected_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn)
            .initialize_database()
            .unwrap();

        for table in [
            "sessions",
            "messages",
            "summaries",
            "summary_children",
            "files",
            "poisoned_sessions",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn child_edges_are_unique_per_child() {
        let mut conn = Connection::open_in_memory().unwrap();
        MigrationManager::new(&mut conn)
            .initialize_database()
            .unwrap();

        conn.execute_batch(
            "INSERT INTO sessions (id, created_at) VALUES ('s1', 'now');
             INSERT INTO summaries (session_id, level, kind, content, offset_start, offset_end, created_at)
             VALUES ('s1', 0, 'truncated', 'a', 1, 2, 'now');
             INSERT INTO summaries (session_id, level, kind, content, offset_start, offset_end, created_at)
             VALUES ('s1', 0, 'truncated', 'b', 3, 4, 'now');",
        )
        .unwrap();

        conn.execute(
            "INSERT INTO summary_children (parent_id, child_kind, child_id, position) VALUES (1, 'message', 7, 0)",
            [],
        )
        .unwrap();
        // The same message attached to a second parent must be rejected.
        let dup = conn.execute(
            "INSERT INTO summary_children (parent_id, child_kind, child_id, position) VALUES (2, 'message', 7, 0)",
            [],
        );
        assert!(dup.is_err());
    }
}
