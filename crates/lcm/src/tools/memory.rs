//! Retrieval verbs: grep, describe, expand.
//!
//! grep groups raw hits under their covering summary (the highest live
//! ancestor in the DAG) so the agent sees clusters instead of a flat
//! list. describe and expand navigate by stable LCM ids.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;
use crate::errors::LcmError;
use crate::ids::LcmId;
use crate::store::schema::{ChildKind, SearchHit, SearchScope, StoredMessage, Summary};
use crate::store::Store;
use crate::text::preview;

const PREVIEW_BYTES: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Fts,
    Regex,
}

impl SearchMode {
    pub fn parse(raw: &str) -> Result<Self, LcmError> {
        match raw {
            "fts" => Ok(SearchMode::Fts),
            "regex" => Ok(SearchMode::Regex),
            _ => Err(LcmError::InputError(format!(
                "unknown search mode {raw:?} (expected fts or regex)"
            ))),
        }
    }
}

pub fn parse_scope(raw: &str) -> Result<SearchScope, LcmError> {
    match raw {
        "messages" => Ok(SearchScope::Messages),
        "summaries" => Ok(SearchScope::Summaries),
        "both" => Ok(SearchScope::Both),
        _ => Err(LcmError::InputError(format!(
            "unknown search scope {raw:?} (expected messages, summaries or both)"
        ))),
    }
}

/// Opaque pagination cursor: `(last_id, offset)` under base64.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageToken {
    pub last_id: i64,
    pub offset: usize,
}

impl PageToken {
    pub fn encode(&self) -> String {
        BASE64.encode(format!("{}:{}", self.last_id, self.offset))
    }

    pub fn decode(raw: &str) -> Result<Self, LcmError> {
        let bytes = BASE64
            .decode(raw.trim())
            .map_err(|_| LcmError::InputError(format!("malformed page token {raw:?}")))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| LcmError::InputError(format!("malformed page token {raw:?}")))?;
        let (last_id, offset) = text
            .split_once(':')
            .ok_or_else(|| LcmError::InputError(format!("malformed page token {raw:?}")))?;
        Ok(Self {
            last_id: last_id
                .parse()
                .map_err(|_| LcmError::InputError(format!("malformed page token {raw:?}")))?,
            offset: offset
                .parse()
                .map_err(|_| LcmError::InputError(format!("malformed page token {raw:?}")))?,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct GrepHit {
    pub id: String,
    pub kind: String,
    pub transcript_offset: i64,
    pub preview: String,
}

#[derive(Debug, Serialize)]
pub struct GrepGroup {
    /// `S<id>` of the covering summary, or `unsummarized`.
    pub covering: String,
    pub summary_preview: Option<String>,
    pub hits: Vec<GrepHit>,
}

#[derive(Debug, Serialize)]
pub struct GrepResponse {
    pub query: String,
    pub mode: String,
    pub groups: Vec<GrepGroup>,
    pub page_size: usize,
    pub next_page: Option<String>,
}

/// Record a detected invariant violation. The session is latched in the
/// store so every further write for it is refused; this read still
/// surfaces the diagnostic.
fn invariant_violation(store: &Store, session_id: &str, message: String) -> LcmError {
    if let Err(e) = store.poison_session(session_id, &message) {
        warn!("Failed to latch poisoned session {}: {}", session_id, e);
    }
    LcmError::InvariantViolation(message)
}

/// Walk `summarized_by` then `condensed_by*` to the highest live ancestor.
/// A dangling reference is an invariant violation, not a miss.
pub fn covering_summary_of_message(
    store: &Store,
    msg: &StoredMessage,
) -> Result<Option<Summary>, LcmError> {
    let Some(leaf_id) = msg.summarized_by else {
        return Ok(None);
    };
    let leaf = store.summaries.get(leaf_id)?.ok_or_else(|| {
        invariant_violation(
            store,
            &msg.session_id,
            format!("message {} references missing summary S{}", msg.id, leaf_id),
        )
    })?;
    Ok(Some(walk_to_top(store, leaf)?))
}

fn walk_to_top(store: &Store, mut current: Summary) -> Result<Summary, LcmError> {
    while let Some(parent_id) = current.condensed_by {
        let next = store.summaries.get(parent_id)?;
        current = match next {
            Some(parent) => parent,
            None => {
                return Err(invariant_violation(
                    store,
                    &current.session_id,
                    format!(
                        "summary S{} references missing parent S{}",
                        current.id, parent_id
                    ),
                ))
            }
        };
    }
    Ok(current)
}

/// Search message/summary content and group hits by covering summary.
/// `within_summary` restricts the scan to the messages inside one
/// summary's covered range.
#[allow(clippy::too_many_arguments)]
pub fn grep(
    store: &Store,
    cfg: &Config,
    session_id: &str,
    query: &str,
    mode: SearchMode,
    scope: SearchScope,
    within_summary: Option<i64>,
    page_token: Option<&str>,
) -> Result<GrepResponse, LcmError> {
    if query.trim().is_empty() {
        return Err(LcmError::InputError("empty query".into()));
    }
    let page = match page_token {
        Some(raw) => PageToken::decode(raw)?,
        None => PageToken::default(),
    };
    let page_size = cfg.page_size;
    let budget = Duration::from_millis(cfg.regex_scan_budget_ms);

    // Fetch one extra hit to learn whether another page exists.
    let mut hits = if let Some(summary_id) = within_summary {
        scan_within_summary(
            store,
            session_id,
            summary_id,
            query,
            mode,
            page.offset,
            page_size + 1,
        )?
    } else {
        match mode {
            SearchMode::Fts => {
                match store.fts_search(session_id, query, scope, page_size + 1, page.offset) {
                    Ok(hits) => hits,
                    // FTS5 syntax errors degrade to a literal scan.
                    Err(_) => store.regex_search(
                        session_id,
                        &regex::escape(query),
                        scope,
                        page_size + 1,
                        page.offset,
                        cfg.regex_result_cap,
                        budget,
                    )?,
                }
            }
            SearchMode::Regex => {
                regex::RegexBuilder::new(query)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| LcmError::InputError(format!("invalid regex: {e}")))?;
                store.regex_search(
                    session_id,
                    query,
                    scope,
                    page_size + 1,
                    page.offset,
                    cfg.regex_result_cap,
                    budget,
                )?
            }
        }
    };

    let has_more = hits.len() > page_size;
    hits.truncate(page_size);

    let next_page = if has_more {
        hits.last().map(|last| {
            PageToken {
                last_id: last.ref_id,
                offset: page.offset + page_size,
            }
            .encode()
        })
    } else {
        None
    };

    let mut groups: Vec<GrepGroup> = Vec::new();
    for hit in &hits {
        let covering = match hit.kind {
            ChildKind::Message => {
                let msg = store.messages.get(hit.ref_id)?.ok_or_else(|| {
                    invariant_violation(
                        store,
                        session_id,
                        format!("search index references missing message {}", hit.ref_id),
                    )
                })?;
                covering_summary_of_message(store, &msg)?
            }
            ChildKind::Summary => {
                let summary = store.summaries.get(hit.ref_id)?.ok_or_else(|| {
                    invariant_violation(
                        store,
                        session_id,
                        format!("search index references missing summary S{}", hit.ref_id),
                    )
                })?;
                Some(walk_to_top(store, summary)?)
            }
        };

        let key = covering
            .as_ref()
            .map(|s| format!("S{}", s.id))
            .unwrap_or_else(|| "unsummarized".to_string());

        let entry = GrepHit {
            id: match hit.kind {
                ChildKind::Message => hit.ref_id.to_string(),
                ChildKind::Summary => format!("S{}", hit.ref_id),
            },
            kind: hit.kind.as_str().to_string(),
            transcript_offset: hit.transcript_offset,
            preview: preview(&hit.content, PREVIEW_BYTES),
        };

        match groups.iter_mut().find(|g| g.covering == key) {
            Some(group) => group.hits.push(entry),
            None => groups.push(GrepGroup {
                covering: key,
                summary_preview: covering.as_ref().map(|s| preview(&s.content, 200)),
                hits: vec![entry],
            }),
        }
    }

    for group in &mut groups {
        group.hits.sort_by_key(|h| h.transcript_offset);
    }

    Ok(GrepResponse {
        query: query.to_string(),
        mode: match mode {
            SearchMode::Fts => "fts",
            SearchMode::Regex => "regex",
        }
        .to_string(),
        groups,
        page_size,
        next_page,
    })
}

/// Linear match over the messages one summary covers. FTS mode degrades
/// to case-insensitive literal containment here; there is no per-summary
/// full-text index.
fn scan_within_summary(
    store: &Store,
    session_id: &str,
    summary_id: i64,
    query: &str,
    mode: SearchMode,
    offset: usize,
    limit: usize,
) -> Result<Vec<SearchHit>, LcmError> {
    let summary = store
        .summaries
        .get(summary_id)?
        .ok_or_else(|| LcmError::InputError(format!("summary S{summary_id} not found")))?;
    let messages =
        store
            .messages
            .by_offset_range(session_id, summary.offset_start, summary.offset_end)?;

    let matcher: Box<dyn Fn(&str) -> bool> = match mode {
        SearchMode::Regex => {
            let re = regex::RegexBuilder::new(query)
                .case_insensitive(true)
                .build()
                .map_err(|e| LcmError::InputError(format!("invalid regex: {e}")))?;
            Box::new(move |content: &str| re.is_match(content))
        }
        SearchMode::Fts => {
            let needle = query.to_lowercase();
            Box::new(move |content: &str| content.to_lowercase().contains(&needle))
        }
    };

    Ok(messages
        .into_iter()
        .filter(|m| matcher(&m.content))
        .skip(offset)
        .take(limit)
        .map(|m| SearchHit {
            kind: ChildKind::Message,
            ref_id: m.id,
            transcript_offset: m.transcript_offset,
            session_id: m.session_id,
            content: m.content,
        })
        .collect())
}

/// Metadata lookup for any LCM id.
pub fn describe(store: &Store, raw_id: &str) -> Result<Value, LcmError> {
    match LcmId::parse(raw_id)? {
        LcmId::Message(id) => {
            let msg = store
                .messages
                .get(id)?
                .ok_or_else(|| LcmError::InputError(format!("message {id} not found")))?;
            let covering = covering_summary_of_message(store, &msg)?;
            Ok(json!({
                "type": "message",
                "id": msg.id,
                "role": msg.role,
                "transcript_offset": msg.transcript_offset,
                "tokens": msg.token_estimate,
                "created_at": msg.created_at,
                "summarized_by": msg.summarized_by.map(|s| format!("S{s}")),
                "covering_summary": covering.map(|s| summary_value(&s)),
                "preview": preview(&msg.content, PREVIEW_BYTES),
            }))
        }
        LcmId::Summary(id) => {
            let summary = store
                .summaries
                .get(id)?
                .ok_or_else(|| LcmError::InputError(format!("summary S{id} not found")))?;
            if let Some(parent_id) = summary.condensed_by {
                if store.summaries.get(parent_id)?.is_none() {
                    return Err(invariant_violation(
                        store,
                        &summary.session_id,
                        format!("summary S{id} references missing parent S{parent_id}"),
                    ));
                }
            }
            let child_count = store.summaries.child_count(id)?;
            Ok(json!({
                "type": "summary",
                "id": format!("S{id}"),
                "level": summary.level,
                "kind": summary.kind.as_str(),
                "msg_range": format!("{}-{}", summary.offset_start, summary.offset_end),
                "child_count": child_count,
                "parent": summary.condensed_by.map(|p| format!("S{p}")),
                "tokens": summary.token_estimate,
                "created_at": summary.created_at,
                "preview": preview(&summary.content, PREVIEW_BYTES),
            }))
        }
        LcmId::File(id) => {
            let file = store
                .files
                .get(id)?
                .ok_or_else(|| LcmError::InputError(format!("file F{id} not found")))?;
            Ok(json!({
                "type": "file",
                "id": format!("F{id}"),
                "path": file.path,
                "sha256": file.sha256,
                "size_bytes": file.size_bytes,
                "first_seen_message_id": file.first_seen_message_id,
                "last_seen_message_id": file.last_seen_message_id,
                "snippet": file.snippet,
                "has_content": file.content.is_some(),
                "created_at": file.created_at,
            }))
        }
    }
}

/// Expand a summary into its immediate children (paginated), or a file
/// reference into its stored content.
pub fn expand(store: &Store, cfg: &Config, raw_id: &str, page: usize) -> Result<Value, LcmError> {
    let page = page.max(1);
    let page_size = cfg.page_size;

    match LcmId::parse(raw_id)? {
        LcmId::Summary(id) => {
            let summary = store
                .summaries
                .get(id)?
                .ok_or_else(|| LcmError::InputError(format!("summary S{id} not found")))?;
            let refs = store.summaries.child_refs(id)?;
            let total = refs.len();
            let offset = (page - 1) * page_size;

            let mut children = Vec::new();
            for (kind, child_id) in refs.into_iter().skip(offset).take(page_size) {
                match kind {
                    ChildKind::Message => {
                        let msg = store.messages.get(child_id)?.ok_or_else(|| {
                            invariant_violation(
                                store,
                                &summary.session_id,
                                format!("summary S{id} references missing message {child_id}"),
                            )
                        })?;
                        children.push(message_value(&msg));
                    }
                    ChildKind::Summary => {
                        let child = store.summaries.get(child_id)?.ok_or_else(|| {
                            invariant_violation(
                                store,
                                &summary.session_id,
                                format!("summary S{id} references missing child S{child_id}"),
                            )
                        })?;
                        children.push(summary_value(&child));
                    }
                }
            }

            Ok(json!({
                "summary": summary_value(&summary),
                "page": page,
                "page_size": page_size,
                "total_children": total,
                "children": children,
                "has_more": offset + page_size < total,
            }))
        }
        LcmId::File(id) => {
            let file = store
                .files
                .get(id)?
                .ok_or_else(|| LcmError::InputError(format!("file F{id} not found")))?;
            Ok(json!({
                "id": format!("F{id}"),
                "path": file.path,
                "size_bytes": file.size_bytes,
                "content": file.content,
            }))
        }
        LcmId::Message(_) => Err(LcmError::InputError(
            "expand takes a summary (S<n>) or file (F<n>) id".into(),
        )),
    }
}

fn message_value(msg: &StoredMessage) -> Value {
    json!({
        "id": msg.id,
        "kind": "message",
        "role": msg.role,
        "transcript_offset": msg.transcript_offset,
        "tokens": msg.token_estimate,
        "preview": preview(&msg.content, PREVIEW_BYTES),
    })
}

fn summary_value(summary: &Summary) -> Value {
    json!({
        "id": format!("S{}", summary.id),
        "kind": "summary",
        "level": summary.level,
        "summary_kind": summary.kind.as_str(),
        "msg_range": format!("{}-{}", summary.offset_start, summary.offset_end),
        "tokens": summary.token_estimate,
        "preview": preview(&summary.content, PREVIEW_BYTES),
    })
}
