//! Append-only message store.
//!
//! Messages are never edited or deleted. The single legal update
//! (`summarized_by` NULL -> id) happens inside the summary store's leaf
//! transaction. Duplicate `(session_id, transcript_offset)` inserts are
//! ignored, which is what makes concurrent capture a no-op.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::schema::StoredMessage;
use crate::text::estimate_tokens;

pub struct MessageStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MessageStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub(crate) fn ensure_session_with_conn(
        conn: &Connection,
        session_id: &str,
    ) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, created_at) VALUES (?1, ?2)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Append one message. Returns `None` when the transcript offset is
    /// already stored for this session.
    pub fn append(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        transcript_offset: i64,
    ) -> anyhow::Result<Option<StoredMessage>> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let stored = Self::insert_with_conn(&tx, session_id, role, content, transcript_offset)?;
        tx.commit()?;
        Ok(stored)
    }

    /// Insert on an existing connection so capture can batch many records
    /// (plus their file refs) into one transaction.
    pub(crate) fn insert_with_conn(
        conn: &Connection,
        session_id: &str,
        role: &str,
        content: &str,
        transcript_offset: i64,
    ) -> anyhow::Result<Option<StoredMessage>> {
        crate::store::assert_session_writable(conn, session_id)?;
        Self::ensure_session_with_conn(conn, session_id)?;

        let token_estimate = estimate_tokens(content);
        let now = Utc::now().to_rfc3339();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages
             (session_id, role, content, token_estimate, transcript_offset, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![session_id, role, content, token_estimate, transcript_offset, now],
        )?;
        if inserted == 0 {
            return Ok(None);
        }

        let id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO search_index (content, kind, ref_id, session_id)
             VALUES (?1, 'message', ?2, ?3)",
            params![content, id, session_id],
        )?;

        Ok(Some(StoredMessage {
            id,
            session_id: session_id.to_string(),
            role: role.to_string(),
            content: content.to_string(),
            token_estimate,
            transcript_offset,
            summarized_by: None,
            created_at: now,
        }))
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<StoredMessage>> {
        let conn = self.get_conn()?;
        let msg = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                [id],
                row_to_message,
            )
            .optional()?;
        Ok(msg)
    }

    /// Fetch a set of messages by id, ordered by transcript offset.
    pub fn get_many(&self, ids: &[i64]) -> anyhow::Result<Vec<StoredMessage>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.get_conn()?;
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT {COLUMNS} FROM messages WHERE id IN ({placeholders})
             ORDER BY transcript_offset"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(ids), row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Messages covering an inclusive transcript-offset range.
    pub fn by_offset_range(
        &self,
        session_id: &str,
        start: i64,
        end: i64,
    ) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE session_id = ?1 AND transcript_offset >= ?2 AND transcript_offset <= ?3
             ORDER BY transcript_offset"
        ))?;
        let rows = stmt
            .query_map(params![session_id, start, end], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Messages without a covering leaf yet, oldest first.
    pub fn unsummarized(&self, session_id: &str) -> anyhow::Result<Vec<StoredMessage>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM messages
             WHERE session_id = ?1 AND summarized_by IS NULL
             ORDER BY transcript_offset"
        ))?;
        let rows = stmt
            .query_map([session_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Sum of token estimates over every stored message.
    pub fn total_tokens(&self, session_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let total = conn.query_row(
            "SELECT COALESCE(SUM(token_estimate), 0) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    pub fn count(&self, session_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Highest transcript offset stored for the session, 0 when empty.
    pub fn max_offset(&self, session_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let max = conn.query_row(
            "SELECT COALESCE(MAX(transcript_offset), 0) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(max)
    }
}

const COLUMNS: &str =
    "id, session_id, role, content, token_estimate, transcript_offset, summarized_by, created_at";

fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        token_estimate: row.get(4)?,
        transcript_offset: row.get(5)?,
        summarized_by: row.get(6)?,
        created_at: row.get(7)?,
    })
}
