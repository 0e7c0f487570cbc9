//! Session status: row counts, token totals, DAG shape.

use serde::Serialize;

use crate::errors::LcmError;
use crate::store::Store;
use crate::text::preview;

#[derive(Debug, Serialize)]
pub struct LevelCount {
    pub level: i64,
    pub count: i64,
}

#[derive(Debug, Serialize)]
pub struct TopLevelPreview {
    pub id: String,
    pub level: i64,
    pub kind: String,
    pub msg_range: String,
    pub tokens: i64,
    pub preview: String,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub session_id: String,
    pub message_count: i64,
    pub summary_count: i64,
    pub summaries_by_level: Vec<LevelCount>,
    pub summarized_tokens: i64,
    pub unsummarized_tokens: i64,
    pub uncondensed_summary_tokens: i64,
    /// What the compaction thresholds are checked against.
    pub tracked_tokens: i64,
    pub dag_depth: i64,
    pub top_level_summaries: Vec<TopLevelPreview>,
}

pub fn status(store: &Store, session_id: &str) -> Result<StatusReport, LcmError> {
    let totals = store.session_totals(session_id)?;
    let total_message_tokens = store.messages.total_tokens(session_id)?;
    let by_level = store.summaries.count_by_level(session_id)?;
    let top_level = store.summaries.top_level(session_id)?;

    Ok(StatusReport {
        session_id: session_id.to_string(),
        message_count: totals.message_count,
        summary_count: totals.summary_count,
        summaries_by_level: by_level
            .into_iter()
            .map(|(level, count)| LevelCount { level, count })
            .collect(),
        summarized_tokens: total_message_tokens - totals.unsummarized_tokens,
        unsummarized_tokens: totals.unsummarized_tokens,
        uncondensed_summary_tokens: totals.uncondensed_summary_tokens,
        tracked_tokens: totals.tokens,
        dag_depth: store.summaries.dag_depth(session_id)?,
        top_level_summaries: top_level
            .iter()
            .map(|s| TopLevelPreview {
                id: format!("S{}", s.id),
                level: s.level,
                kind: s.kind.as_str().to_string(),
                msg_range: format!("{}-{}", s.offset_start, s.offset_end),
                tokens: s.token_estimate,
                preview: preview(&s.content, 200),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::SummaryKind;

    #[test]
    fn empty_session_is_well_formed() {
        let store = Store::in_memory().unwrap();
        let report = status(&store, "empty").unwrap();
        assert_eq!(report.message_count, 0);
        assert_eq!(report.summary_count, 0);
        assert_eq!(report.tracked_tokens, 0);
        assert_eq!(report.dag_depth, 0);
        assert!(report.summaries_by_level.is_empty());
        assert!(report.top_level_summaries.is_empty());
    }

    #[test]
    fn token_split_tracks_summarization() {
        let store = Store::in_memory().unwrap();
        for i in 1..=4 {
            store
                .messages
                .append("s1", "user", &"word ".repeat(80), i)
                .unwrap();
        }
        let msgs = store.messages.by_offset_range("s1", 1, 4).unwrap();
        store
            .summaries
            .create_leaf("s1", "half summarized", SummaryKind::PreserveDetails, &msgs[..2])
            .unwrap();

        let report = status(&store, "s1").unwrap();
        assert_eq!(report.message_count, 4);
        assert_eq!(report.summary_count, 1);
        assert_eq!(report.summarized_tokens, 200);
        assert_eq!(report.unsummarized_tokens, 200);
        assert!(report.uncondensed_summary_tokens > 0);
        assert_eq!(
            report.tracked_tokens,
            report.unsummarized_tokens + report.uncondensed_summary_tokens
        );
        assert_eq!(report.dag_depth, 1);
        assert_eq!(report.top_level_summaries.len(), 1);
        assert_eq!(report.top_level_summaries[0].msg_range, "1-2");
    }
}
