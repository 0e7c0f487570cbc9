//! Compaction control loop.
//!
//! Watches token pressure per session and reacts to two thresholds: at
//! tau_soft the oldest unsummarized messages are folded into leaf summaries
//! (non-blocking for the caller), at tau_hard the caller blocks until the
//! total drops back under tau_soft. Independently, five uncondensed
//! summaries at any level condense into one node a level up, cascading.
//!
//! At most one pass runs per session, guarded by an in-memory advisory
//! lock. Every block commit is a single store transaction, so a cancelled
//! or crashed pass leaves no partial state.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::compaction::escalation::escalated_summarize;
use crate::config::Config;
use crate::errors::LcmError;
use crate::llm::LlmClient;
use crate::store::schema::{StoredMessage, Summary};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    pub tau_soft: i64,
    pub tau_hard: i64,
    pub block_min_tokens: i64,
    pub block_max_tokens: i64,
    pub condense_fanout: usize,
    pub condense_target_tokens: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl CompactionConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            tau_soft: cfg.tau_soft,
            tau_hard: cfg.tau_hard,
            block_min_tokens: cfg.block_min_tokens,
            block_max_tokens: cfg.block_max_tokens,
            condense_fanout: cfg.condense_fanout,
            condense_target_tokens: cfg.condense_target_tokens,
        }
    }

    fn leaf_target_tokens(&self) -> i64 {
        self.block_max_tokens / 4
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompactionStats {
    pub leaf_summaries: usize,
    pub condensed_summaries: usize,
    pub tokens_before: i64,
    pub tokens_after: i64,
}

pub struct CompactionEngine {
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    cfg: CompactionConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CompactionEngine {
    pub fn new(store: Arc<Store>, llm: Arc<dyn LlmClient>, cfg: CompactionConfig) -> Self {
        Self {
            store,
            llm,
            cfg,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Detached worker for soft triggers: the caller is never blocked.
    pub fn spawn_check(self: &Arc<Self>, session_id: &str) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        let session = session_id.to_string();
        tokio::spawn(async move {
            match engine.check_and_compact(&session).await {
                Ok(stats) if stats.leaf_summaries + stats.condensed_summaries > 0 => {
                    info!(
                        "Compacted session {}: {} leaf, {} condensed, {} -> {} tokens",
                        session,
                        stats.leaf_summaries,
                        stats.condensed_summaries,
                        stats.tokens_before,
                        stats.tokens_after
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("Compaction for session {} failed: {}", session, e),
            }
        })
    }

    /// Main entry point: check thresholds and react.
    pub async fn check_and_compact(
        &self,
        session_id: &str,
    ) -> Result<CompactionStats, LcmError> {
        if let Some(reason) = self.store.session_poisoned(session_id)? {
            return Err(LcmError::InvariantViolation(format!(
                "compaction refused for poisoned session {session_id}: {reason}"
            )));
        }

        let totals = self.store.session_totals(session_id)?;
        let mut stats = CompactionStats {
            tokens_before: totals.tokens,
            ..Default::default()
        };

        let lock = self.lock_for(session_id);
        let _guard = if totals.tokens >= self.cfg.tau_hard {
            // Hard pressure blocks, even behind a running soft pass.
            lock.lock().await
        } else {
            match lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!("Compaction already running for session {}", session_id);
                    return Ok(stats);
                }
            }
        };

        if totals.tokens >= self.cfg.tau_hard {
            self.hard_drain(session_id, &mut stats).await?;
        } else if totals.tokens >= self.cfg.tau_soft {
            self.soft_drain(session_id, &mut stats).await?;
        }

        // Condensation runs independently of the threshold path.
        match self.condense_pass(session_id, false, &mut stats).await {
            Ok(()) => {}
            Err(LcmError::LlmUnavailable { attempts, message }) => {
                warn!(
                    "Condensation deferred for session {} (LLM unavailable after {} attempts: {})",
                    session_id, attempts, message
                );
            }
            Err(e) => return Err(e),
        }

        stats.tokens_after = self.store.session_totals(session_id)?.tokens;
        Ok(stats)
    }

    /// Drain oldest blocks until pressure drops below tau_soft. An
    /// unavailable LLM aborts the pass cleanly; completed blocks stay.
    async fn soft_drain(
        &self,
        session_id: &str,
        stats: &mut CompactionStats,
    ) -> Result<(), LcmError> {
        loop {
            let totals = self.store.session_totals(session_id)?;
            if totals.tokens < self.cfg.tau_soft {
                break;
            }
            let Some(block) = self.next_block(session_id, false)? else {
                break;
            };

            match self.summarize_block(session_id, &block, false).await {
                Ok(_) => stats.leaf_summaries += 1,
                Err(LcmError::LlmUnavailable { attempts, message }) => {
                    warn!(
                        "Soft compaction aborted for session {} (LLM unavailable after {} attempts: {})",
                        session_id, attempts, message
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }

            match self.condense_pass(session_id, false, stats).await {
                Ok(()) => {}
                Err(LcmError::LlmUnavailable { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Drain until pressure is back under tau_soft, shrinking blocks down
    /// to a single message and forcing deterministic truncation when the
    /// LLM is down. Always terminates.
    async fn hard_drain(
        &self,
        session_id: &str,
        stats: &mut CompactionStats,
    ) -> Result<(), LcmError> {
        loop {
            let totals = self.store.session_totals(session_id)?;
            if totals.tokens <= self.cfg.tau_soft {
                break;
            }

            match self.next_block(session_id, true)? {
                Some(block) => {
                    match self.summarize_block(session_id, &block, false).await {
                        Ok(_) => {}
                        Err(LcmError::LlmUnavailable { .. }) => {
                            debug!("LLM unavailable under hard pressure, forcing truncation");
                            self.summarize_block(session_id, &block, true).await?;
                        }
                        Err(e) => return Err(e),
                    }
                    stats.leaf_summaries += 1;
                    self.condense_pass(session_id, true, stats).await?;
                }
                None => {
                    // No messages left; only condensation can reduce further.
                    let before = stats.condensed_summaries;
                    self.condense_pass(session_id, true, stats).await?;
                    if stats.condensed_summaries == before {
                        warn!(
                            "Hard compaction floor for session {}: {} tokens remain",
                            session_id, totals.tokens
                        );
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Oldest contiguous run of unsummarized messages whose cumulative
    /// estimate reaches block_min without exceeding block_max. A single
    /// oversized message forms a block alone.
    fn next_block(
        &self,
        session_id: &str,
        allow_small: bool,
    ) -> Result<Option<Vec<StoredMessage>>, LcmError> {
        let unsummarized = self.store.messages.unsummarized(session_id)?;
        if unsummarized.is_empty() {
            return Ok(None);
        }

        let mut block = Vec::new();
        let mut total = 0i64;
        for msg in unsummarized {
            if total >= self.cfg.block_min_tokens {
                break;
            }
            if !block.is_empty() && total + msg.token_estimate > self.cfg.block_max_tokens {
                break;
            }
            total += msg.token_estimate;
            block.push(msg);
        }

        if total < self.cfg.block_min_tokens && !allow_small {
            return Ok(None);
        }
        Ok(Some(block))
    }

    async fn summarize_block(
        &self,
        session_id: &str,
        block: &[StoredMessage],
        force_truncate: bool,
    ) -> Result<Summary, LcmError> {
        let content = block
            .iter()
            .map(|m| format!("[{}]: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let outcome = escalated_summarize(
            self.llm.as_ref(),
            &content,
            self.cfg.leaf_target_tokens(),
            force_truncate,
        )
        .await?;

        let summary =
            self.store
                .summaries
                .create_leaf(session_id, &outcome.content, outcome.kind, block)?;
        Ok(summary)
    }

    /// Condense while any level holds at least `condense_fanout` summaries
    /// with no parent. Creating a node can push the next level over the
    /// threshold, so this loops until a full sweep finds nothing; each
    /// step strictly reduces the node count, which bounds the cascade.
    async fn condense_pass(
        &self,
        session_id: &str,
        force_on_failure: bool,
        stats: &mut CompactionStats,
    ) -> Result<(), LcmError> {
        loop {
            let counts = self.store.summaries.uncondensed_level_counts(session_id)?;
            let Some(level) = counts
                .iter()
                .find(|(_, count)| *count >= self.cfg.condense_fanout as i64)
                .map(|(level, _)| *level)
            else {
                break;
            };

            let nodes = self.store.summaries.uncondensed_at_level(session_id, level)?;
            let group: Vec<Summary> = nodes
                .into_iter()
                .take(self.cfg.condense_fanout)
                .collect();
            let content = group
                .iter()
                .map(|s| s.content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n---\n\n");

            let outcome = match escalated_summarize(
                self.llm.as_ref(),
                &content,
                self.cfg.condense_target_tokens,
                false,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(LcmError::LlmUnavailable { .. }) if force_on_failure => {
                    escalated_summarize(
                        self.llm.as_ref(),
                        &content,
                        self.cfg.condense_target_tokens,
                        true,
                    )
                    .await?
                }
                Err(e) => return Err(e),
            };

            self.store.summaries.create_condensed(
                session_id,
                &outcome.content,
                outcome.kind,
                &group,
            )?;
            stats.condensed_summaries += 1;
        }
        Ok(())
    }
}
