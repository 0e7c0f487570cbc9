//! Summary DAG store.
//!
//! Parent -> child edges live in a dedicated relation with a UNIQUE child
//! constraint, so a message or summary can belong to at most one parent.
//! Leaf creation and condensation each run as a single transaction: the
//! node insert, its edges, the FTS row and the child-side `summarized_by` /
//! `condensed_by` flips all land together or not at all.

use std::sync::Arc;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use tracing::debug;

use crate::store::schema::{ChildKind, StoredMessage, Summary, SummaryKind};
use crate::text::estimate_tokens;

pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Create a level-0 summary covering a contiguous block of messages and
    /// mark every message as summarized by it, atomically.
    pub fn create_leaf(
        &self,
        session_id: &str,
        content: &str,
        kind: SummaryKind,
        block: &[StoredMessage],
    ) -> anyhow::Result<Summary> {
        let (first, last) = match (block.first(), block.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => anyhow::bail!("leaf summary requires a non-empty message block"),
        };

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        crate::store::assert_session_writable(&tx, session_id)?;
        let now = Utc::now().to_rfc3339();
        let token_estimate = estimate_tokens(content);

        tx.execute(
            "INSERT INTO summaries
             (session_id, level, kind, content, token_estimate, offset_start, offset_end, created_at)
             VALUES (?1, 0, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session_id,
                kind.as_str(),
                content,
                token_estimate,
                first.transcript_offset,
                last.transcript_offset,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        for (position, msg) in block.iter().enumerate() {
            tx.execute(
                "INSERT INTO summary_children (parent_id, child_kind, child_id, position)
                 VALUES (?1, 'message', ?2, ?3)",
                params![id, msg.id, position as i64],
            )?;
        }

        let placeholders = vec!["?"; block.len()].join(",");
        let flipped = tx.execute(
            &format!(
                "UPDATE messages SET summarized_by = {id}
                 WHERE summarized_by IS NULL AND id IN ({placeholders})"
            ),
            rusqlite::params_from_iter(block.iter().map(|m| m.id)),
        )?;
        if flipped != block.len() {
            anyhow::bail!(
                "leaf {} would cover {} message(s) but only {} were unsummarized",
                id,
                block.len(),
                flipped
            );
        }

        tx.execute(
            "INSERT INTO search_index (content, kind, ref_id, session_id)
             VALUES (?1, 'summary', ?2, ?3)",
            params![content, id, session_id],
        )?;

        tx.commit()?;
        debug!(
            "Created leaf S{} covering offsets {}..={} ({} message(s), kind {})",
            id,
            first.transcript_offset,
            last.transcript_offset,
            block.len(),
            kind.as_str()
        );

        Ok(Summary {
            id,
            session_id: session_id.to_string(),
            level: 0,
            kind,
            content: content.to_string(),
            token_estimate,
            offset_start: first.transcript_offset,
            offset_end: last.transcript_offset,
            condensed_by: None,
            created_at: now,
        })
    }

    /// Create a level-(k+1) summary over level-k children and mark each
    /// child as condensed by it, atomically.
    pub fn create_condensed(
        &self,
        session_id: &str,
        content: &str,
        kind: SummaryKind,
        children: &[Summary],
    ) -> anyhow::Result<Summary> {
        let first = match children.first() {
            Some(f) => f,
            None => anyhow::bail!("condensed summary requires at least one child"),
        };
        let child_level = first.level;
        if children.iter().any(|c| c.level != child_level) {
            anyhow::bail!("condensation children must share one level");
        }

        let offset_start = children.iter().map(|c| c.offset_start).min().unwrap_or(0);
        let offset_end = children.iter().map(|c| c.offset_end).max().unwrap_or(0);

        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        crate::store::assert_session_writable(&tx, session_id)?;
        let now = Utc::now().to_rfc3339();
        let token_estimate = estimate_tokens(content);

        tx.execute(
            "INSERT INTO summaries
             (session_id, level, kind, content, token_estimate, offset_start, offset_end, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id,
                child_level + 1,
                kind.as_str(),
                content,
                token_estimate,
                offset_start,
                offset_end,
                now
            ],
        )?;
        let id = tx.last_insert_rowid();

        for (position, child) in children.iter().enumerate() {
            tx.execute(
                "INSERT INTO summary_children (parent_id, child_kind, child_id, position)
                 VALUES (?1, 'summary', ?2, ?3)",
                params![id, child.id, position as i64],
            )?;
        }

        let placeholders = vec!["?"; children.len()].join(",");
        let flipped = tx.execute(
            &format!(
                "UPDATE summaries SET condensed_by = {id}
                 WHERE condensed_by IS NULL AND id IN ({placeholders})"
            ),
            rusqlite::params_from_iter(children.iter().map(|c| c.id)),
        )?;
        if flipped != children.len() {
            anyhow::bail!(
                "condensed {} would cover {} child(ren) but only {} were uncondensed",
                id,
                children.len(),
                flipped
            );
        }

        tx.execute(
            "INSERT INTO search_index (content, kind, ref_id, session_id)
             VALUES (?1, 'summary', ?2, ?3)",
            params![content, id, session_id],
        )?;

        tx.commit()?;
        debug!(
            "Condensed {} level-{} summaries into S{} (offsets {}..={})",
            children.len(),
            child_level,
            id,
            offset_start,
            offset_end
        );

        Ok(Summary {
            id,
            session_id: session_id.to_string(),
            level: child_level + 1,
            kind,
            content: content.to_string(),
            token_estimate,
            offset_start,
            offset_end,
            condensed_by: None,
            created_at: now,
        })
    }

    pub fn get(&self, id: i64) -> anyhow::Result<Option<Summary>> {
        let conn = self.get_conn()?;
        let summary = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM summaries WHERE id = ?1"),
                [id],
                row_to_summary,
            )
            .optional()?;
        Ok(summary)
    }

    /// Ordered child edges of a summary.
    pub fn child_refs(&self, id: i64) -> anyhow::Result<Vec<(ChildKind, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT child_kind, child_id FROM summary_children
             WHERE parent_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map([id], |row| {
                let kind: String = row.get(0)?;
                Ok((kind, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .map(|(kind, child_id)| {
                let kind = if kind == "message" {
                    ChildKind::Message
                } else {
                    ChildKind::Summary
                };
                (kind, child_id)
            })
            .collect())
    }

    pub fn child_count(&self, id: i64) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM summary_children WHERE parent_id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Uncondensed summaries at one level, oldest covered range first.
    pub fn uncondensed_at_level(
        &self,
        session_id: &str,
        level: i64,
    ) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM summaries
             WHERE session_id = ?1 AND level = ?2 AND condensed_by IS NULL
             ORDER BY offset_start"
        ))?;
        let rows = stmt
            .query_map(params![session_id, level], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// `(level, uncondensed count)` pairs, ascending by level.
    pub fn uncondensed_level_counts(&self, session_id: &str) -> anyhow::Result<Vec<(i64, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT level, COUNT(*) FROM summaries
             WHERE session_id = ?1 AND condensed_by IS NULL
             GROUP BY level ORDER BY level",
        )?;
        let rows = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// DAG roots: summaries not yet condensed into a parent, in insertion
    /// order (which is also transcript order, since blocks drain oldest
    /// first).
    pub fn top_level(&self, session_id: &str) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM summaries
             WHERE session_id = ?1 AND condensed_by IS NULL
             ORDER BY id"
        ))?;
        let rows = stmt
            .query_map([session_id], row_to_summary)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn count(&self, session_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM summaries WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn count_by_level(&self, session_id: &str) -> anyhow::Result<Vec<(i64, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT level, COUNT(*) FROM summaries WHERE session_id = ?1
             GROUP BY level ORDER BY level",
        )?;
        let rows = stmt
            .query_map([session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Number of levels in the DAG: 0 for no summaries, max level + 1
    /// otherwise.
    pub fn dag_depth(&self, session_id: &str) -> anyhow::Result<i64> {
        let conn = self.get_conn()?;
        let max_level: Option<i64> = conn.query_row(
            "SELECT MAX(level) FROM summaries WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(max_level.map(|l| l + 1).unwrap_or(0))
    }
}

const COLUMNS: &str = "id, session_id, level, kind, content, token_estimate, offset_start, offset_end, condensed_by, created_at";

fn row_to_summary(row: &Row) -> rusqlite::Result<Summary> {
    let kind_raw: String = row.get(3)?;
    let kind = SummaryKind::parse(&kind_raw).unwrap_or(SummaryKind::Truncated);
    Ok(Summary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        level: row.get(2)?,
        kind,
        content: row.get(4)?,
        token_estimate: row.get(5)?,
        offset_start: row.get(6)?,
        offset_end: row.get(7)?,
        condensed_by: row.get(8)?,
        created_at: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn seed_messages(store: &Store, session: &str, count: i64) -> Vec<StoredMessage> {
        (1..=count)
            .map(|i| {
                store
                    .messages
                    .append(session, "user", &format!("message number {i}"), i)
                    .unwrap()
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn leaf_marks_every_covered_message() {
        let store = Store::in_memory().unwrap();
        let block = seed_messages(&store, "s1", 3);

        let leaf = store
            .summaries
            .create_leaf("s1", "a summary", SummaryKind::PreserveDetails, &block)
            .unwrap();
        assert_eq!(leaf.level, 0);
        assert_eq!(leaf.offset_start, 1);
        assert_eq!(leaf.offset_end, 3);

        for msg in &block {
            let stored = store.messages.get(msg.id).unwrap().unwrap();
            assert_eq!(stored.summarized_by, Some(leaf.id));
        }
        let refs = store.summaries.child_refs(leaf.id).unwrap();
        assert_eq!(refs.len(), 3);
        assert!(refs.iter().all(|(kind, _)| *kind == ChildKind::Message));
    }

    #[test]
    fn message_cannot_join_two_leaves() {
        let store = Store::in_memory().unwrap();
        let block = seed_messages(&store, "s1", 2);

        store
            .summaries
            .create_leaf("s1", "first", SummaryKind::BulletPoints, &block)
            .unwrap();
        // A second leaf over the same messages must fail and leave no row.
        let dup = store
            .summaries
            .create_leaf("s1", "second", SummaryKind::BulletPoints, &block);
        assert!(dup.is_err());
        assert_eq!(store.summaries.count("s1").unwrap(), 1);
    }

    #[test]
    fn empty_block_is_rejected() {
        let store = Store::in_memory().unwrap();
        let res = store
            .summaries
            .create_leaf("s1", "nothing", SummaryKind::Truncated, &[]);
        assert!(res.is_err());
    }

    #[test]
    fn condensation_marks_children_and_spans_ranges() {
        let store = Store::in_memory().unwrap();
        let msgs = seed_messages(&store, "s1", 10);

        let mut leaves = Vec::new();
        for chunk in msgs.chunks(2) {
            leaves.push(
                store
                    .summaries
                    .create_leaf("s1", "leaf", SummaryKind::PreserveDetails, chunk)
                    .unwrap(),
            );
        }
        assert_eq!(leaves.len(), 5);

        let parent = store
            .summaries
            .create_condensed("s1", "condensed", SummaryKind::BulletPoints, &leaves)
            .unwrap();
        assert_eq!(parent.level, 1);
        assert_eq!(parent.offset_start, 1);
        assert_eq!(parent.offset_end, 10);

        for leaf in &leaves {
            let row = store.summaries.get(leaf.id).unwrap().unwrap();
            assert_eq!(row.condensed_by, Some(parent.id));
        }

        // Only the parent is now top-level.
        let tops = store.summaries.top_level("s1").unwrap();
        assert_eq!(tops.len(), 1);
        assert_eq!(tops[0].id, parent.id);
        assert_eq!(store.summaries.dag_depth("s1").unwrap(), 2);
    }

    #[test]
    fn condensation_rejects_mixed_levels() {
        let store = Store::in_memory().unwrap();
        let msgs = seed_messages(&store, "s1", 4);
        let a = store
            .summaries
            .create_leaf("s1", "a", SummaryKind::PreserveDetails, &msgs[..2])
            .unwrap();
        let b = store
            .summaries
            .create_leaf("s1", "b", SummaryKind::PreserveDetails, &msgs[2..])
            .unwrap();
        let parent = store
            .summaries
            .create_condensed("s1", "p", SummaryKind::BulletPoints, &[a])
            .unwrap();

        let res = store
            .summaries
            .create_condensed("s1", "mixed", SummaryKind::BulletPoints, &[b, parent]);
        assert!(res.is_err());
    }

    #[test]
    fn uncondensed_level_counts_track_state() {
        let store = Store::in_memory().unwrap();
        let msgs = seed_messages(&store, "s1", 6);
        let mut leaves = Vec::new();
        for chunk in msgs.chunks(2) {
            leaves.push(
                store
                    .summaries
                    .create_leaf("s1", "leaf", SummaryKind::PreserveDetails, chunk)
                    .unwrap(),
            );
        }
        assert_eq!(
            store.summaries.uncondensed_level_counts("s1").unwrap(),
            vec![(0, 3)]
        );

        store
            .summaries
            .create_condensed("s1", "p", SummaryKind::BulletPoints, &leaves[..2])
            .unwrap();
        assert_eq!(
            store.summaries.uncondensed_level_counts("s1").unwrap(),
            vec![(0, 1), (1, 1)]
        );
    }

    #[test]
    fn uncondensed_at_level_is_range_ordered() {
        let store = Store::in_memory().unwrap();
        let msgs = seed_messages(&store, "s1", 4);
        store
            .summaries
            .create_leaf("s1", "first", SummaryKind::PreserveDetails, &msgs[..2])
            .unwrap();
        store
            .summaries
            .create_leaf("s1", "second", SummaryKind::PreserveDetails, &msgs[2..])
            .unwrap();

        let leaves = store.summaries.uncondensed_at_level("s1", 0).unwrap();
        assert_eq!(leaves.len(), 2);
        assert!(leaves[0].offset_start < leaves[1].offset_start);
    }

    #[test]
    fn summary_content_is_fts_searchable() {
        let store = Store::in_memory().unwrap();
        let block = seed_messages(&store, "s1", 2);
        store
            .summaries
            .create_leaf(
                "s1",
                "discussed the quasar renderer",
                SummaryKind::PreserveDetails,
                &block,
            )
            .unwrap();

        let hits = store
            .fts_search("s1", "quasar", crate::store::SearchScope::Summaries, 10, 0)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, ChildKind::Summary);
    }
}
