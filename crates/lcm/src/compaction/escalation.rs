//! Three-level summarization escalation.
//!
//! Levels are tried in order; the first whose output fits the budget wins.
//! The deterministic truncation level never fails and is the terminal
//! fallback, so a forced ladder always produces a summary.

use tracing::debug;

use crate::errors::LcmError;
use crate::llm::{LlmClient, SummarizeMode};
use crate::store::schema::SummaryKind;
use crate::text::{estimate_tokens, head, tail};

/// LLM levels may overshoot the budget by this factor before escalating.
const OVERSHOOT_FACTOR_PERCENT: i64 = 125;

/// Byte headroom reserved for the elision marker in truncated output.
const MARKER_MARGIN_BYTES: usize = 40;

#[derive(Debug, Clone)]
pub struct EscalationOutcome {
    pub content: String,
    pub kind: SummaryKind,
    pub token_estimate: i64,
}

/// Produce exactly one summary of `content` within `target_tokens`.
///
/// `force_truncate` skips the LLM levels entirely (hard compaction with the
/// API down). Without it, an unavailable LLM propagates as an error so a
/// soft pass can abort cleanly.
pub async fn escalated_summarize(
    llm: &dyn LlmClient,
    content: &str,
    target_tokens: i64,
    force_truncate: bool,
) -> Result<EscalationOutcome, LcmError> {
    let target = target_tokens.max(1);
    let original_estimate = estimate_tokens(content);

    // Already within budget: nothing to compress, keep it verbatim.
    if original_estimate <= target {
        return Ok(EscalationOutcome {
            content: content.to_string(),
            kind: SummaryKind::PreserveDetails,
            token_estimate: original_estimate,
        });
    }

    if force_truncate {
        return Ok(truncate_deterministic(content, target));
    }

    let overshoot_limit = target * OVERSHOOT_FACTOR_PERCENT / 100;

    for (mode, kind) in [
        (SummarizeMode::PreserveDetails, SummaryKind::PreserveDetails),
        (SummarizeMode::BulletPoints, SummaryKind::BulletPoints),
    ] {
        let result = llm.summarize(content, mode, target as usize).await?;
        let estimate = estimate_tokens(&result);
        if estimate > 0 && estimate <= overshoot_limit {
            return Ok(EscalationOutcome {
                content: result,
                kind,
                token_estimate: estimate,
            });
        }
        debug!(
            "{} overshot budget ({} > {} tokens), escalating",
            mode.as_str(),
            estimate,
            overshoot_limit
        );
    }

    Ok(truncate_deterministic(content, target))
}

/// Level 3: keep the first and last `target / 2` tokens (approximated via
/// characters) joined by an explicit elision marker. No LLM involved.
pub fn truncate_deterministic(content: &str, target_tokens: i64) -> EscalationOutcome {
    let half_tokens = (target_tokens / 2).max(0) as usize;
    let half_bytes = (half_tokens * 4).saturating_sub(MARKER_MARGIN_BYTES / 2);

    if content.len() <= half_bytes * 2 {
        return EscalationOutcome {
            content: content.to_string(),
            kind: SummaryKind::Truncated,
            token_estimate: estimate_tokens(content),
        };
    }

    let front = head(content, half_bytes);
    let back = tail(content, half_bytes);
    let elided =
        (estimate_tokens(content) - estimate_tokens(front) - estimate_tokens(back)).max(0);

    let result = format!("{front}\n… [{elided} tokens elided] …\n{back}");
    let token_estimate = estimate_tokens(&result);
    EscalationOutcome {
        content: result,
        kind: SummaryKind::Truncated,
        token_estimate,
    }
}
