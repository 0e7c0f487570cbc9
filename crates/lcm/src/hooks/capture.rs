//! Transcript capture: diff the host's JSONL transcript against the store
//! and append whatever is new.
//!
//! A record's 1-based line number is its `transcript_offset`. Every line
//! becomes exactly one message, so offsets stay gap-free; lines that fail
//! to parse are kept verbatim under the `system` role rather than dropped.
//! One capture call is one transaction, and the offset uniqueness
//! constraint turns concurrent capture into a no-op.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, info};

use crate::errors::LcmError;
use crate::store::files::{content_hash, FileStore};
use crate::store::messages::MessageStore;
use crate::store::Store;
use crate::text::{head, preview};

const SNIPPET_BYTES: usize = 256;
const TOOL_ARGS_PREVIEW_BYTES: usize = 200;

#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub captured: usize,
    pub diverted_blobs: usize,
    pub last_offset: i64,
}

struct NormalizedRecord {
    role: String,
    content: String,
    path_hint: Option<String>,
}

/// Append all transcript records newer than what the store holds.
pub fn capture_transcript(
    store: &Store,
    session_id: &str,
    transcript_path: &Path,
    blob_threshold_bytes: usize,
) -> Result<CaptureStats, LcmError> {
    if let Some(reason) = store.session_poisoned(session_id)? {
        return Err(LcmError::InvariantViolation(format!(
            "writes refused for session {session_id}: {reason}"
        )));
    }

    let text = std::fs::read_to_string(transcript_path).map_err(|source| {
        LcmError::TranscriptUnreadable {
            path: transcript_path.to_path_buf(),
            source,
        }
    })?;

    let last_offset = store.messages.max_offset(session_id)?;
    let mut stats = CaptureStats {
        last_offset,
        ..Default::default()
    };

    let mut conn = store.conn()?;
    let tx = conn.transaction().map_err(anyhow::Error::from)?;

    for (idx, line) in text.lines().enumerate() {
        let offset = idx as i64 + 1;
        if offset <= last_offset {
            continue;
        }

        let record = match serde_json::from_str::<Value>(line.trim()) {
            Ok(value) => normalize(&value),
            // Unparseable lines are kept verbatim so nothing is lost and
            // the offset sequence has no holes.
            Err(_) => NormalizedRecord {
                role: "system".to_string(),
                content: line.to_string(),
                path_hint: None,
            },
        };

        let mut content = record.content;
        let mut diverted_file: Option<i64> = None;

        if record.role == "tool_result" && content.len() > blob_threshold_bytes {
            let hash = content_hash(content.as_bytes());
            let path = record
                .path_hint
                .unwrap_or_else(|| format!("tool_result/{offset}"));
            let file_id = FileStore::upsert_with_conn(
                &tx,
                session_id,
                &path,
                &hash,
                content.len() as i64,
                Some(head(&content, SNIPPET_BYTES)),
                Some(&content),
            )?;
            debug!(
                "Diverted {} byte tool result at offset {} to F{}",
                content.len(),
                offset,
                file_id
            );
            content = format!("[F{file_id}] {}", preview(&content, SNIPPET_BYTES));
            diverted_file = Some(file_id);
        }

        if let Some(msg) =
            MessageStore::insert_with_conn(&tx, session_id, &record.role, &content, offset)?
        {
            stats.captured += 1;
            if let Some(file_id) = diverted_file {
                FileStore::touch_with_conn(&tx, file_id, msg.id)?;
                stats.diverted_blobs += 1;
            }
        }
        stats.last_offset = offset;
    }

    tx.commit().map_err(anyhow::Error::from)?;

    if stats.captured > 0 {
        info!(
            "Captured {} message(s) for session {} (through offset {})",
            stats.captured, session_id, stats.last_offset
        );
    }
    Ok(stats)
}

/// Flatten one transcript record into a role and a canonical content
/// string. Variant-specific fields land in a structured prefix so the FTS
/// index covers them uniformly.
fn normalize(value: &Value) -> NormalizedRecord {
    let record_type = value.get("type").and_then(Value::as_str).unwrap_or("");

    match record_type {
        "message" => {
            let role = match value.get("role").and_then(Value::as_str) {
                Some(r @ ("user" | "assistant" | "system" | "tool_use" | "tool_result")) => r,
                _ => "system",
            };
            let content = value
                .get("content")
                .map(flatten_content)
                .unwrap_or_default();
            NormalizedRecord {
                role: role.to_string(),
                content,
                path_hint: None,
            }
        }
        "human" => NormalizedRecord {
            role: "user".to_string(),
            content: message_text(value),
            path_hint: None,
        },
        "assistant" => NormalizedRecord {
            role: "assistant".to_string(),
            content: message_text(value),
            path_hint: None,
        },
        "tool_use" => {
            let name = value.get("name").and_then(Value::as_str).unwrap_or("?");
            let input = value.get("input").cloned().unwrap_or(Value::Null);
            NormalizedRecord {
                role: "tool_use".to_string(),
                content: format!(
                    "[tool_use:{name}] {}",
                    preview(&input.to_string(), TOOL_ARGS_PREVIEW_BYTES)
                ),
                path_hint: None,
            }
        }
        "tool_result" => NormalizedRecord {
            role: "tool_result".to_string(),
            content: value
                .get("content")
                .map(flatten_content)
                .unwrap_or_default(),
            path_hint: extract_path_hint(value),
        },
        // Unknown record shape: keep the raw JSON under the system role.
        _ => NormalizedRecord {
            role: "system".to_string(),
            content: value.to_string(),
            path_hint: None,
        },
    }
}

fn message_text(value: &Value) -> String {
    value
        .get("message")
        .or_else(|| value.get("content"))
        .map(flatten_content)
        .unwrap_or_default()
}

fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let mut out = Vec::new();
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        out.push(part.get("text").and_then(Value::as_str).unwrap_or("").to_string())
                    }
                    Some("tool_use") => {
                        let name = part.get("name").and_then(Value::as_str).unwrap_or("?");
                        let input = part.get("input").cloned().unwrap_or(Value::Null);
                        out.push(format!(
                            "[tool_use:{name}] {}",
                            preview(&input.to_string(), TOOL_ARGS_PREVIEW_BYTES)
                        ));
                    }
                    Some("tool_result") => {
                        let inner = part.get("content").map(flatten_content).unwrap_or_default();
                        out.push(format!("[tool_result] {inner}"));
                    }
                    _ => {
                        if let Value::String(text) = part {
                            out.push(text.clone());
                        } else {
                            out.push(part.to_string());
                        }
                    }
                }
            }
            out.join("\n")
        }
        other => other.to_string(),
    }
}

fn extract_path_hint(value: &Value) -> Option<String> {
    for key in ["path", "file_path", "filePath"] {
        if let Some(path) = value.get(key).and_then(Value::as_str) {
            return Some(path.to_string());
        }
        if let Some(path) = value
            .get("input")
            .and_then(|input| input.get(key))
            .and_then(Value::as_str)
        {
            return Some(path.to_string());
        }
    }
    None
}
