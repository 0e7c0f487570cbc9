//! Row types for the message store, summary DAG and file references.

use serde::{Deserialize, Serialize};

/// One immutable transcript record.
///
/// Once inserted, only `summarized_by` may change, and only NULL -> id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub session_id: String,
    /// One of `user`, `assistant`, `system`, `tool_use`, `tool_result`.
    pub role: String,
    pub content: String,
    pub token_estimate: i64,
    /// 1-based position in the source transcript; gap-free per session.
    pub transcript_offset: i64,
    pub summarized_by: Option<i64>,
    pub created_at: String,
}

/// Which escalation level produced a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    PreserveDetails,
    BulletPoints,
    Truncated,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::PreserveDetails => "preserve_details",
            SummaryKind::BulletPoints => "bullet_points",
            SummaryKind::Truncated => "truncated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "preserve_details" => Some(SummaryKind::PreserveDetails),
            "bullet_points" => Some(SummaryKind::BulletPoints),
            "truncated" => Some(SummaryKind::Truncated),
            _ => None,
        }
    }
}

/// A node in the summary DAG.
///
/// Level 0 nodes cover contiguous runs of messages; level k nodes cover
/// level k-1 summaries. Immutable except `condensed_by` NULL -> id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: String,
    pub level: i64,
    pub kind: SummaryKind,
    pub content: String,
    pub token_estimate: i64,
    /// Covered transcript-offset range, inclusive.
    pub offset_start: i64,
    pub offset_end: i64,
    pub condensed_by: Option<i64>,
    pub created_at: String,
}

/// Child edge of a summary: either a message (leaf) or a lower summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    Message,
    Summary,
}

impl ChildKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChildKind::Message => "message",
            ChildKind::Summary => "summary",
        }
    }
}

/// A deduplicated reference to a large blob, surfaced as `F<id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    pub id: i64,
    pub session_id: String,
    pub path: String,
    pub sha256: String,
    pub size_bytes: i64,
    pub first_seen_message_id: Option<i64>,
    pub last_seen_message_id: Option<i64>,
    pub snippet: Option<String>,
    /// Diverted tool-result content; NULL for refs to on-disk files.
    #[serde(skip_serializing, default)]
    pub content: Option<String>,
    pub created_at: String,
}

/// Token pressure for one session.
///
/// `tokens` is what the compaction thresholds are checked against: the sum
/// over unsummarized messages plus uncondensed summary content.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionTotals {
    pub message_count: i64,
    pub summary_count: i64,
    pub unsummarized_tokens: i64,
    pub uncondensed_summary_tokens: i64,
    pub tokens: i64,
}

/// One raw search hit, before grouping by covering summary.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub kind: ChildKind,
    pub ref_id: i64,
    pub session_id: String,
    pub content: String,
    /// Transcript offset for messages, range start for summaries.
    pub transcript_offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Messages,
    Summaries,
    Both,
}

impl SearchScope {
    pub fn includes_messages(&self) -> bool {
        matches!(self, SearchScope::Messages | SearchScope::Both)
    }

    pub fn includes_summaries(&self) -> bool {
        matches!(self, SearchScope::Summaries | SearchScope::Both)
    }
}
