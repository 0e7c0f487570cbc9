//! LLM client abstraction and the Anthropic-backed implementation.

pub mod client;
pub mod prompts;
pub mod retry;

pub use client::{AnthropicClient, LlmClient};
pub use prompts::SummarizeMode;
pub use retry::RetryConfig;

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-ins for the LLM backend.

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::errors::LcmError;
    use crate::llm::client::LlmClient;
    use crate::llm::prompts::SummarizeMode;

    enum Behavior {
        /// Every call fails with `LlmUnavailable`.
        Fail,
        /// Every summarize call returns this text.
        Fixed(String),
        /// Summarize calls pop from this queue, then fall back to the default.
        Sequence(Mutex<VecDeque<String>>),
    }

    pub(crate) struct StubLlm {
        behavior: Behavior,
        pub summarize_calls: AtomicUsize,
    }

    impl StubLlm {
        pub(crate) fn failing() -> Self {
            Self {
                behavior: Behavior::Fail,
                summarize_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn fixed(text: impl Into<String>) -> Self {
            Self {
                behavior: Behavior::Fixed(text.into()),
                summarize_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn sequence(texts: Vec<String>) -> Self {
            Self {
                behavior: Behavior::Sequence(Mutex::new(texts.into())),
                summarize_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.summarize_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn summarize(
            &self,
            _content: &str,
            _mode: SummarizeMode,
            _target_tokens: usize,
        ) -> Result<String, LcmError> {
            self.summarize_calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Fail => Err(LcmError::llm_unavailable(1, "stubbed failure")),
                Behavior::Fixed(text) => Ok(text.clone()),
                Behavior::Sequence(queue) => Ok(queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| "- stub summary".to_string())),
            }
        }

        async fn classify(&self, _text: &str, labels: &[&str]) -> Result<String, LcmError> {
            match &self.behavior {
                Behavior::Fail => Err(LcmError::llm_unavailable(1, "stubbed failure")),
                _ => Ok(labels.first().unwrap_or(&"other").to_string()),
            }
        }

        async fn agent_loop(
            &self,
            _prompt: &str,
            item: &Value,
            output_schema: Option<&Value>,
            _read_only: bool,
            _max_turns: usize,
        ) -> Result<Value, LcmError> {
            let schema_given = output_schema.is_some();
            match &self.behavior {
                Behavior::Fail => Err(LcmError::llm_unavailable(1, "stubbed failure")),
                Behavior::Fixed(text) => {
                    Ok(json!({"result": text, "item": item, "schema_given": schema_given}))
                }
                Behavior::Sequence(_) => {
                    Ok(json!({"result": "done", "item": item, "schema_given": schema_given}))
                }
            }
        }
    }
}
