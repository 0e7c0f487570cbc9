//! Prompt templates for the two LLM summarization modes.

/// LLM-backed summarization modes. The deterministic `truncated` fallback
/// never reaches the API, so it has no template here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeMode {
    PreserveDetails,
    BulletPoints,
}

impl SummarizeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummarizeMode::PreserveDetails => "preserve_details",
            SummarizeMode::BulletPoints => "bullet_points",
        }
    }
}

/// System prompt for a summarization call with the given token budget.
pub fn summarize_system_prompt(mode: SummarizeMode, target_tokens: usize) -> String {
    match mode {
        SummarizeMode::PreserveDetails => format!(
            "Summarize the following conversation segment in at most {target_tokens} tokens. \
             Preserve: key decisions, code references (file paths, function names), \
             identifiers, tool names, error messages, and action items, verbatim where \
             possible. Use bulleted but long-form output."
        ),
        SummarizeMode::BulletPoints => format!(
            "Summarize the following in at most {target_tokens} tokens as bullet points. \
             Focus on: what was done, what was decided, what files were changed. \
             Be extremely concise."
        ),
    }
}

/// System prompt for a label-classification call.
pub fn classify_system_prompt(labels: &[&str]) -> String {
    format!(
        "You are a classifier. Respond with exactly one of the following labels and \
         nothing else: {}",
        labels.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_carry_the_budget() {
        let p = summarize_system_prompt(SummarizeMode::PreserveDetails, 3000);
        assert!(p.contains("3000 tokens"));
        let p = summarize_system_prompt(SummarizeMode::BulletPoints, 500);
        assert!(p.contains("500 tokens"));
        assert!(p.contains("bullet points"));
    }

    #[test]
    fn classify_prompt_lists_labels() {
        let p = classify_system_prompt(&["code", "data"]);
        assert!(p.contains("code, data"));
    }
}
