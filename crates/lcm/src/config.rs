//! Environment-driven configuration.
//!
//! Every threshold the compaction engine reacts to is overridable via an
//! `LCM_*` variable; the defaults are the engine's contract. Values are
//! process-scoped and passed explicitly so multiple sessions can coexist in
//! tests.

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    /// Database file location (`LCM_DB_PATH`, default `~/.lcm/lcm.db`).
    pub db_path: PathBuf,
    /// Summarization model (`LCM_MODEL`).
    pub model: String,
    /// Bind address for the RPC surface (`LCM_API_ADDR`).
    pub api_addr: String,
    /// Soft compaction threshold in estimated tokens.
    pub tau_soft: i64,
    /// Hard compaction threshold in estimated tokens.
    pub tau_hard: i64,
    /// Minimum cumulative token estimate for a summarization block.
    pub block_min_tokens: i64,
    /// Maximum cumulative token estimate for a summarization block.
    pub block_max_tokens: i64,
    /// Uncondensed summaries per level before condensation kicks in.
    pub condense_fanout: usize,
    /// Token budget for condensed (level >= 1) summaries.
    pub condense_target_tokens: i64,
    /// Tool-result blobs above this byte size are diverted to file refs.
    pub blob_threshold_bytes: usize,
    /// Hard per-call deadline for the LLM API.
    pub llm_timeout_seconds: u64,
    /// Bounded retry attempts for transient LLM failures.
    pub llm_max_attempts: u32,
    /// Items per page for all paginated retrieval verbs.
    pub page_size: usize,
    /// Result cap for regex scans.
    pub regex_result_cap: usize,
    /// Wall-clock budget for one regex scan.
    pub regex_scan_budget_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            model: "claude-haiku-4-5-20251001".to_string(),
            api_addr: "127.0.0.1:8750".to_string(),
            tau_soft: 50_000,
            tau_hard: 200_000,
            block_min_tokens: 4_000,
            block_max_tokens: 12_000,
            condense_fanout: 5,
            condense_target_tokens: 2_000,
            blob_threshold_bytes: 16 * 1024,
            llm_timeout_seconds: 60,
            llm_max_attempts: 5,
            page_size: 10,
            regex_result_cap: 100,
            regex_scan_budget_ms: 500,
        }
    }
}

fn default_db_path() -> PathBuf {
    let home = env::var("HOME").unwrap_or_else(|_| ".".into());
    PathBuf::from(home).join(".lcm").join("lcm.db")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring unparseable {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if dotenvy::dotenv().is_ok() {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Config::default();
        let cfg = Self {
            db_path: env::var("LCM_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            model: env::var("LCM_MODEL").unwrap_or(defaults.model),
            api_addr: env::var("LCM_API_ADDR").unwrap_or(defaults.api_addr),
            tau_soft: env_parse("LCM_TAU_SOFT", defaults.tau_soft),
            tau_hard: env_parse("LCM_TAU_HARD", defaults.tau_hard),
            block_min_tokens: env_parse("LCM_BLOCK_MIN", defaults.block_min_tokens),
            block_max_tokens: env_parse("LCM_BLOCK_MAX", defaults.block_max_tokens),
            condense_fanout: env_parse("LCM_CONDENSE_FANOUT", defaults.condense_fanout),
            condense_target_tokens: env_parse(
                "LCM_CONDENSE_TARGET",
                defaults.condense_target_tokens,
            ),
            blob_threshold_bytes: env_parse("LCM_BLOB_THRESHOLD", defaults.blob_threshold_bytes),
            llm_timeout_seconds: env_parse("LCM_LLM_TIMEOUT", defaults.llm_timeout_seconds),
            llm_max_attempts: env_parse("LCM_LLM_ATTEMPTS", defaults.llm_max_attempts),
            page_size: defaults.page_size,
            regex_result_cap: env_parse("LCM_REGEX_CAP", defaults.regex_result_cap),
            regex_scan_budget_ms: env_parse("LCM_REGEX_BUDGET_MS", defaults.regex_scan_budget_ms),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.tau_soft <= 0 || self.tau_hard <= self.tau_soft {
            anyhow::bail!(
                "thresholds must satisfy 0 < tau_soft < tau_hard (got {} / {})",
                self.tau_soft,
                self.tau_hard
            );
        }
        if self.block_min_tokens <= 0 || self.block_max_tokens < self.block_min_tokens {
            anyhow::bail!(
                "block bounds must satisfy 0 < min <= max (got {} / {})",
                self.block_min_tokens,
                self.block_max_tokens
            );
        }
        if self.condense_fanout < 2 {
            anyhow::bail!("condensation fan-out must be at least 2");
        }
        Ok(())
    }

    /// Leaf summaries get a quarter of the maximum block budget.
    pub fn leaf_target_tokens(&self) -> i64 {
        self.block_max_tokens / 4
    }

    pub fn print_config(&self) {
        info!("LCM configuration:");
        info!("- Database: {}", self.db_path.display());
        info!("- Model: {}", self.model);
        info!("- Thresholds: soft={} hard={}", self.tau_soft, self.tau_hard);
        info!(
            "- Blocks: {}..{} tokens (leaf target {})",
            self.block_min_tokens,
            self.block_max_tokens,
            self.leaf_target_tokens()
        );
        info!(
            "- Condensation: fan-out {} at {} tokens",
            self.condense_fanout, self.condense_target_tokens
        );
        info!("- Blob threshold: {} bytes", self.blob_threshold_bytes);
        info!("- API: {}", self.api_addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config::default()
    }

    // ===== Threshold Tests =====

    #[test]
    fn test_default_thresholds_match_contract() {
        let cfg = create_test_config();
        assert_eq!(cfg.tau_soft, 50_000);
        assert_eq!(cfg.tau_hard, 200_000);
        assert_eq!(cfg.block_min_tokens, 4_000);
        assert_eq!(cfg.block_max_tokens, 12_000);
        assert_eq!(cfg.condense_fanout, 5);
    }

    #[test]
    fn test_leaf_target_is_quarter_of_block_max() {
        let cfg = create_test_config();
        assert_eq!(cfg.leaf_target_tokens(), 3_000);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let cfg = Config {
            tau_soft: 200_000,
            tau_hard: 50_000,
            ..create_test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_block_bounds() {
        let cfg = Config {
            block_min_tokens: 12_000,
            block_max_tokens: 4_000,
            ..create_test_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_fanout() {
        let cfg = Config {
            condense_fanout: 1,
            ..create_test_config()
        };
        assert!(cfg.validate().is_err());
    }

    // ===== Ancillary Defaults =====

    #[test]
    fn test_page_size_is_ten_everywhere() {
        assert_eq!(create_test_config().page_size, 10);
    }

    #[test]
    fn test_regex_scan_is_bounded() {
        let cfg = create_test_config();
        assert_eq!(cfg.regex_result_cap, 100);
        assert_eq!(cfg.regex_scan_budget_ms, 500);
    }

    #[test]
    fn test_blob_threshold_default() {
        assert_eq!(create_test_config().blob_threshold_bytes, 16 * 1024);
    }

    #[test]
    fn test_llm_call_bounds() {
        let cfg = create_test_config();
        assert_eq!(cfg.llm_timeout_seconds, 60);
        assert_eq!(cfg.llm_max_attempts, 5);
    }
}
