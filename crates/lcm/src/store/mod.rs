//! SQLite-backed store: append-only message log, summary DAG, file
//! references, and the shared full-text index.
//!
//! A single r2d2 pool backs three sub-stores. Writers serialize at the
//! SQLite level; readers run WAL-concurrent. Every multi-row state change
//! (leaf creation, condensation, a capture batch) is one transaction.

pub mod files;
pub mod messages;
pub mod migration;
pub mod schema;
pub mod summaries;

pub use files::FileStore;
pub use messages::MessageStore;
pub use schema::*;
pub use summaries::SummaryStore;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use regex::RegexBuilder;
use rusqlite::{params, OptionalExtension};
use tracing::{debug, error, info};

type SqlitePool = Arc<Pool<SqliteConnectionManager>>;

pub struct Store {
    pub messages: MessageStore,
    pub summaries: SummaryStore,
    pub files: FileStore,
    pool: SqlitePool,
}

impl Store {
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening store at {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;
                     PRAGMA busy_timeout = 5000;",
                )
            });

        Self::from_manager(manager, 10)
    }

    /// Shared-cache in-memory database, one per call. Used by tests; the
    /// pool keeps an idle connection so the database outlives any borrow.
    pub fn in_memory() -> anyhow::Result<Self> {
        let uri = format!(
            "file:lcm-mem-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4()
        );
        let manager = SqliteConnectionManager::file(uri)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        Self::from_manager(manager, 4)
    }

    fn from_manager(manager: SqliteConnectionManager, max_size: u32) -> anyhow::Result<Self> {
        let pool = Pool::builder()
            .max_size(max_size)
            .min_idle(Some(1))
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            let mut migrator = migration::MigrationManager::new(&mut conn);
            migrator.initialize_database()?;
        }

        let pool = Arc::new(pool);
        Ok(Self {
            messages: MessageStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            files: FileStore::new(Arc::clone(&pool)),
            pool,
        })
    }

    pub(crate) fn conn(
        &self,
    ) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Create the session row if it does not exist yet. Sessions are
    /// otherwise created lazily on first write.
    pub fn ensure_session(&self, session_id: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        MessageStore::ensure_session_with_conn(&conn, session_id)?;
        Ok(())
    }

    /// Latch a session after a read exposed impossible state. From here on
    /// every write for the session is refused; reads stay available for
    /// diagnosis. The latch is a table row, so separate hook processes
    /// observe it too.
    pub fn poison_session(&self, session_id: &str, reason: &str) -> anyhow::Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO poisoned_sessions (session_id, reason, created_at)
             VALUES (?1, ?2, ?3)",
            params![session_id, reason, chrono::Utc::now().to_rfc3339()],
        )?;
        error!(
            "Session {} poisoned, refusing further writes: {}",
            session_id, reason
        );
        Ok(())
    }

    /// The recorded poison reason, if any.
    pub fn session_poisoned(&self, session_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn()?;
        let reason = conn
            .query_row(
                "SELECT reason FROM poisoned_sessions WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(reason)
    }

    /// Token pressure and row counts for one session.
    pub fn session_totals(&self, session_id: &str) -> anyhow::Result<SessionTotals> {
        let conn = self.conn()?;

        let message_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        let summary_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM summaries WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        let unsummarized_tokens: i64 = conn.query_row(
            "SELECT COALESCE(SUM(token_estimate), 0) FROM messages
             WHERE session_id = ?1 AND summarized_by IS NULL",
            [session_id],
            |row| row.get(0),
        )?;
        let uncondensed_summary_tokens: i64 = conn.query_row(
            "SELECT COALESCE(SUM(token_estimate), 0) FROM summaries
             WHERE session_id = ?1 AND condensed_by IS NULL",
            [session_id],
            |row| row.get(0),
        )?;

        Ok(SessionTotals {
            message_count,
            summary_count,
            unsummarized_tokens,
            uncondensed_summary_tokens,
            tokens: unsummarized_tokens + uncondensed_summary_tokens,
        })
    }

    /// Full-text search over the shared index. Query uses FTS5 syntax.
    pub fn fts_search(
        &self,
        session_id: &str,
        query: &str,
        scope: SearchScope,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let conn = self.conn()?;

        let mut sql = String::from(
            "SELECT ref_id, kind FROM search_index
             WHERE search_index MATCH ?1 AND session_id = ?2",
        );
        match scope {
            SearchScope::Messages => sql.push_str(" AND kind = 'message'"),
            SearchScope::Summaries => sql.push_str(" AND kind = 'summary'"),
            SearchScope::Both => {}
        }
        sql.push_str(" ORDER BY rank LIMIT ?3 OFFSET ?4");

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<(i64, String)> = stmt
            .query_map(
                params![query, session_id, limit as i64, offset as i64],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut hits = Vec::with_capacity(refs.len());
        for (ref_id, kind) in refs {
            if let Some(hit) = self.hydrate_hit(&conn, ref_id, &kind)? {
                hits.push(hit);
            }
        }
        debug!("FTS search {:?} matched {} hit(s)", query, hits.len());
        Ok(hits)
    }

    /// Linear regex scan over content, bounded by a result cap and a
    /// wall-clock budget so pathological patterns cannot stall a reader.
    #[allow(clippy::too_many_arguments)]
    pub fn regex_search(
        &self,
        session_id: &str,
        pattern: &str,
        scope: SearchScope,
        limit: usize,
        offset: usize,
        result_cap: usize,
        scan_budget: Duration,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| anyhow::anyhow!("invalid regex {:?}: {}", pattern, e))?;

        let conn = self.conn()?;
        let started = Instant::now();
        let wanted = limit.min(result_cap);
        let mut skipped = 0usize;
        let mut hits = Vec::new();

        if scope.includes_messages() {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, content, transcript_offset FROM messages
                 WHERE session_id = ?1 ORDER BY transcript_offset",
            )?;
            let mut rows = stmt.query([session_id])?;
            while let Some(row) = rows.next()? {
                if hits.len() >= wanted || started.elapsed() > scan_budget {
                    break;
                }
                let content: String = row.get(2)?;
                if re.is_match(&content) {
                    if skipped < offset {
                        skipped += 1;
                        continue;
                    }
                    hits.push(SearchHit {
                        kind: ChildKind::Message,
                        ref_id: row.get(0)?,
                        session_id: row.get(1)?,
                        content,
                        transcript_offset: row.get(3)?,
                    });
                }
            }
        }

        if scope.includes_summaries() {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, content, offset_start FROM summaries
                 WHERE session_id = ?1 ORDER BY offset_start, level",
            )?;
            let mut rows = stmt.query([session_id])?;
            while let Some(row) = rows.next()? {
                if hits.len() >= wanted || started.elapsed() > scan_budget {
                    break;
                }
                let content: String = row.get(2)?;
                if re.is_match(&content) {
                    if skipped < offset {
                        skipped += 1;
                        continue;
                    }
                    hits.push(SearchHit {
                        kind: ChildKind::Summary,
                        ref_id: row.get(0)?,
                        session_id: row.get(1)?,
                        content,
                        transcript_offset: row.get(3)?,
                    });
                }
            }
        }

        Ok(hits)
    }

    fn hydrate_hit(
        &self,
        conn: &rusqlite::Connection,
        ref_id: i64,
        kind: &str,
    ) -> anyhow::Result<Option<SearchHit>> {
        let hit = match kind {
            "message" => conn
                .query_row(
                    "SELECT session_id, content, transcript_offset FROM messages WHERE id = ?1",
                    [ref_id],
                    |row| {
                        Ok(SearchHit {
                            kind: ChildKind::Message,
                            ref_id,
                            session_id: row.get(0)?,
                            content: row.get(1)?,
                            transcript_offset: row.get(2)?,
                        })
                    },
                )
                .optional()?,
            "summary" => conn
                .query_row(
                    "SELECT session_id, content, offset_start FROM summaries WHERE id = ?1",
                    [ref_id],
                    |row| {
                        Ok(SearchHit {
                            kind: ChildKind::Summary,
                            ref_id,
                            session_id: row.get(0)?,
                            content: row.get(1)?,
                            transcript_offset: row.get(2)?,
                        })
                    },
                )
                .optional()?,
            _ => None,
        };
        Ok(hit)
    }
}

/// Write guard checked inside every write transaction: a poisoned session
/// takes no more state changes.
pub(crate) fn assert_session_writable(
    conn: &rusqlite::Connection,
    session_id: &str,
) -> anyhow::Result<()> {
    let reason: Option<String> = conn
        .query_row(
            "SELECT reason FROM poisoned_sessions WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )
        .optional()?;
    match reason {
        Some(reason) => anyhow::bail!(
            "writes refused for poisoned session {session_id}: {reason}"
        ),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_session_totals_are_zero() {
        let store = Store::in_memory().unwrap();
        let totals = store.session_totals("nope").unwrap();
        assert_eq!(totals.message_count, 0);
        assert_eq!(totals.summary_count, 0);
        assert_eq!(totals.tokens, 0);
    }

    #[test]
    fn totals_track_unsummarized_messages() {
        let store = Store::in_memory().unwrap();
        store
            .messages
            .append("s1", "user", &"x".repeat(400), 1)
            .unwrap();
        store
            .messages
            .append("s1", "assistant", &"y".repeat(400), 2)
            .unwrap();

        let totals = store.session_totals("s1").unwrap();
        assert_eq!(totals.message_count, 2);
        assert_eq!(totals.unsummarized_tokens, 200);
        assert_eq!(totals.tokens, 200);
    }

    #[test]
    fn fts_finds_message_content() {
        let store = Store::in_memory().unwrap();
        store
            .messages
            .append("s1", "user", "the xylophone sprocket broke", 1)
            .unwrap();
        store
            .messages
            .append("s1", "assistant", "ordinary reply", 2)
            .unwrap();

        let hits = store
            .fts_search("s1", "xylophone", SearchScope::Both, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].transcript_offset, 1);
        assert_eq!(hits[0].kind, ChildKind::Message);
    }

    #[test]
    fn fts_is_session_scoped() {
        let store = Store::in_memory().unwrap();
        store
            .messages
            .append("s1", "user", "xylophone here", 1)
            .unwrap();
        store
            .messages
            .append("s2", "user", "xylophone there", 1)
            .unwrap();

        let hits = store
            .fts_search("s1", "xylophone", SearchScope::Both, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "s1");
    }

    #[test]
    fn regex_scan_respects_result_cap() {
        let store = Store::in_memory().unwrap();
        for i in 1..=20 {
            store
                .messages
                .append("s1", "user", &format!("needle {i}"), i)
                .unwrap();
        }

        let hits = store
            .regex_search(
                "s1",
                "needle",
                SearchScope::Messages,
                100,
                0,
                5,
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(hits.len(), 5);
    }

    #[test]
    fn regex_rejects_invalid_pattern() {
        let store = Store::in_memory().unwrap();
        let res = store.regex_search(
            "s1",
            "(unclosed",
            SearchScope::Both,
            10,
            0,
            100,
            Duration::from_millis(500),
        );
        assert!(res.is_err());
    }

    #[test]
    fn poisoned_session_refuses_every_write() {
        let store = Store::in_memory().unwrap();
        store.messages.append("s1", "user", "before", 1).unwrap();
        store
            .poison_session("s1", "dangling summarized_by")
            .unwrap();

        assert!(store.messages.append("s1", "user", "after", 2).is_err());
        let block = store.messages.by_offset_range("s1", 1, 1).unwrap();
        assert!(store
            .summaries
            .create_leaf("s1", "x", SummaryKind::PreserveDetails, &block)
            .is_err());
        assert!(store.files.upsert("s1", "a.txt", "ff", 1, None, None).is_err());

        // Reads stay available for diagnosis; other sessions are untouched.
        assert_eq!(store.messages.count("s1").unwrap(), 1);
        assert!(store.messages.append("s2", "user", "fine", 1).unwrap().is_some());
        assert_eq!(
            store.session_poisoned("s1").unwrap().as_deref(),
            Some("dangling summarized_by")
        );
        assert_eq!(store.session_poisoned("s2").unwrap(), None);
    }

    #[test]
    fn poison_keeps_the_first_reason() {
        let store = Store::in_memory().unwrap();
        store.poison_session("s1", "first").unwrap();
        store.poison_session("s1", "second").unwrap();
        assert_eq!(store.session_poisoned("s1").unwrap().as_deref(), Some("first"));
    }

    #[test]
    fn regex_offset_skips_earlier_matches() {
        let store = Store::in_memory().unwrap();
        for i in 1..=4 {
            store
                .messages
                .append("s1", "user", &format!("needle {i}"), i)
                .unwrap();
        }

        let hits = store
            .regex_search(
                "s1",
                "needle",
                SearchScope::Messages,
                10,
                2,
                100,
                Duration::from_millis(500),
            )
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].transcript_offset, 3);
    }
}
