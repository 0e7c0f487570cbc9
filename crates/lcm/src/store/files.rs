//! File references, surfaced as `F<id>`.
//!
//! Keyed by `(path, sha256)`: identical blobs at the same path deduplicate,
//! a changed hash creates a new id. Diverted tool-result blobs keep their
//! full content here so the engine stays lossless; refs to on-disk files
//! leave `content` NULL. The one mutable column is `last_seen_message_id`
//! (and `first_seen_message_id`, set exactly once).

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::store::messages::MessageStore;
use crate::store::schema::FileRef;

pub struct FileStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

/// Hex sha256 of a blob, the dedup key component.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

impl FileStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Insert or find the ref for `(path, sha256)`. Returns its id.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        session_id: &str,
        path: &str,
        sha256: &str,
        size_bytes: i64,
        snippet: Option<&str>,
        content: Option<&str>,
    ) -> anyhow::Result<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let id = Self::upsert_with_conn(&tx, session_id, path, sha256, size_bytes, snippet, content)?;
        tx.commit()?;
        Ok(id)
    }

    pub(crate) fn upsert_with_conn(
        conn: &Connection,
        session_id: &str,
        path: &str,
        sha256: &str,
        size_bytes: i64,
        snippet: Option<&str>,
        content: Option<&str>,
    ) -> anyhow::Result<i64> {
        crate::store::assert_session_writable(conn, session_id)?;
        MessageStore::ensure_session_with_conn(conn, session_id)?;

        conn.execute(
            "INSERT OR IGNORE INTO files
             (session_id, path, sha256, size_bytes, snippet, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                path,
                sha256,
                size_bytes,
                snippet,
                content,
                Utc::now().to_rfc3339()
            ],
        )?;

        let id = conn.query_row(
            "SELECT id FROM files WHERE path = ?1 AND sha256 = ?2",
            params![path, sha256],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Record a sighting from a message: sets `first_seen_message_id` once
    /// and refreshes `last_seen_message_id`.
    pub(crate) fn touch_with_conn(
        conn: &Connection,
        id: i64,
        message_id: i64,
    ) -> anyhow::Result<()> {
        conn.execute(
            "UPDATE files SET
                first_seen_message_id = COALESCE(first_seen_message_id, ?2),
                last_seen_message_id = ?2
             WHERE id = ?1",
            params![id, message_id],
        )?;
        Ok(())
    }

    pub fn touch(&self, id: i64, message_id: i64) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        Self::touch_with_conn(&conn, id, message_id)
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<FileRef>> {
        let conn = self.get_conn()?;
        let file = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM files WHERE id = ?1"),
                [id],
                row_to_file,
            )
            .optional()?;
        Ok(file)
    }

    pub fn by_session(&self, session_id: &str) -> anyhow::Result<Vec<FileRef>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM files WHERE session_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([session_id], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Substring search over stored paths.
    pub fn search_by_path(
        &self,
        session_id: &str,
        pattern: &str,
    ) -> anyhow::Result<Vec<FileRef>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM files
             WHERE session_id = ?1 AND path LIKE ?2 ORDER BY id"
        ))?;
        let rows = stmt
            .query_map(params![session_id, format!("%{pattern}%")], row_to_file)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

const COLUMNS: &str = "id, session_id, path, sha256, size_bytes, first_seen_message_id, last_seen_message_id, snippet, content, created_at";

fn row_to_file(row: &Row) -> rusqlite::Result<FileRef> {
    Ok(FileRef {
        id: row.get(0)?,
        session_id: row.get(1)?,
        path: row.get(2)?,
        sha256: row.get(3)?,
        size_bytes: row.get(4)?,
        first_seen_message_id: row.get(5)?,
        last_seen_message_id: row.get(6)?,
        snippet: row.get(7)?,
        content: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn upsert_dedupes_on_path_and_hash() {
        let store = Store::in_memory().unwrap();
        let hash = content_hash(b"blob");

        let a = store
            .files
            .upsert("s1", "src/big.json", &hash, 4, Some("blo"), Some("blob"))
            .unwrap();
        let b = store
            .files
            .upsert("s1", "src/big.json", &hash, 4, Some("blo"), Some("blob"))
            .unwrap();
        assert_eq!(a, b);

        // Same path, different hash: a new file id.
        let c = store
            .files
            .upsert("s1", "src/big.json", &content_hash(b"other"), 5, None, None)
            .unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn touch_sets_first_seen_once_and_moves_last_seen() {
        let store = Store::in_memory().unwrap();
        let id = store
            .files
            .upsert("s1", "a.txt", &content_hash(b"x"), 1, None, None)
            .unwrap();

        store.files.touch(id, 10).unwrap();
        store.files.touch(id, 25).unwrap();

        let file = store.files.get(id).unwrap().unwrap();
        assert_eq!(file.first_seen_message_id, Some(10));
        assert_eq!(file.last_seen_message_id, Some(25));
    }

    #[test]
    fn diverted_content_is_retained() {
        let store = Store::in_memory().unwrap();
        let blob = "very large tool output".repeat(10);
        let id = store
            .files
            .upsert(
                "s1",
                "tool_result/7",
                &content_hash(blob.as_bytes()),
                blob.len() as i64,
                Some(&blob[..16]),
                Some(&blob),
            )
            .unwrap();

        let file = store.files.get(id).unwrap().unwrap();
        assert_eq!(file.content.as_deref(), Some(blob.as_str()));
        assert_eq!(file.size_bytes, blob.len() as i64);
    }

    #[test]
    fn path_search_is_substring_based() {
        let store = Store::in_memory().unwrap();
        store
            .files
            .upsert("s1", "src/engine/core.rs", &content_hash(b"a"), 1, None, None)
            .unwrap();
        store
            .files
            .upsert("s1", "docs/readme.md", &content_hash(b"b"), 1, None, None)
            .unwrap();

        let found = store.files.search_by_path("s1", "engine").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "src/engine/core.rs");
    }

    #[test]
    fn hash_is_stable_hex_sha256() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
