//! Parallel data operators: llm_map and agentic_map.
//!
//! Both stream a JSONL file through the LLM client with bounded fan-out
//! and per-item retries, then write successes to a sibling output file.
//! They share only the LLM client with the core; nothing here touches the
//! store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::errors::LcmError;
use crate::llm::LlmClient;

const ITEM_RETRIES: usize = 3;
const ERROR_REPORT_CAP: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct MapItemError {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct MapReport {
    pub output_path: String,
    pub total_items: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<MapItemError>,
}

#[derive(Clone)]
enum MapMode {
    /// One single-turn, read-only call per item.
    Stateless,
    /// Multi-turn agent loop per item.
    Agent { read_only: bool },
}

/// Process each JSONL line with a stateless LLM call. High fan-out.
pub async fn llm_map(
    llm: Arc<dyn LlmClient>,
    input_path: &Path,
    prompt: &str,
    output_schema: Option<Value>,
    concurrency: usize,
) -> Result<MapReport, LcmError> {
    run_map(
        llm,
        input_path,
        prompt,
        output_schema,
        MapMode::Stateless,
        concurrency.max(1),
        "out",
    )
    .await
}

/// Process each JSONL line with a bounded agent loop. Lower fan-out: each
/// item costs several turns.
pub async fn agentic_map(
    llm: Arc<dyn LlmClient>,
    input_path: &Path,
    prompt: &str,
    output_schema: Option<Value>,
    read_only: bool,
    concurrency: usize,
) -> Result<MapReport, LcmError> {
    run_map(
        llm,
        input_path,
        prompt,
        output_schema,
        MapMode::Agent { read_only },
        concurrency.max(1),
        "agent_out",
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_map(
    llm: Arc<dyn LlmClient>,
    input_path: &Path,
    prompt: &str,
    output_schema: Option<Value>,
    mode: MapMode,
    concurrency: usize,
    output_tag: &str,
) -> Result<MapReport, LcmError> {
    if !input_path.exists() {
        return Err(LcmError::InputError(format!(
            "input file not found: {}",
            input_path.display()
        )));
    }
    let items = read_jsonl(input_path)?;
    if items.is_empty() {
        return Err(LcmError::InputError(
            "empty input file or no valid JSONL lines".into(),
        ));
    }

    let output_path = output_path_for(input_path, output_tag);
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut join_set = tokio::task::JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let llm = Arc::clone(&llm);
        let semaphore = Arc::clone(&semaphore);
        let prompt = prompt.to_string();
        let schema = output_schema.clone();
        let mode = mode.clone();

        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let mut last_error = String::new();
            for _attempt in 0..ITEM_RETRIES {
                let result = match &mode {
                    MapMode::Stateless => {
                        llm.agent_loop(&prompt, &item, schema.as_ref(), true, 1).await
                    }
                    MapMode::Agent { read_only } => {
                        llm.agent_loop(&prompt, &item, schema.as_ref(), *read_only, 10)
                            .await
                    }
                };
                match result {
                    Ok(value) => return (index, Ok(value)),
                    Err(e @ LcmError::LlmUnavailable { .. }) => last_error = e.to_string(),
                    Err(e) => return (index, Err(e.to_string())),
                }
            }
            (index, Err(last_error))
        });
    }

    let mut results: Vec<Option<Value>> = (0..total).map(|_| None).collect();
    let mut errors = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let (index, outcome) = joined.map_err(|e| anyhow::anyhow!("map task panicked: {e}"))?;
        match outcome {
            Ok(value) => results[index] = Some(value),
            Err(error) => {
                warn!("Map item {} failed: {}", index, error);
                errors.push(MapItemError { index, error });
            }
        }
    }
    errors.sort_by_key(|e| e.index);

    let successful: Vec<&Value> = results.iter().flatten().collect();
    write_jsonl(&output_path, &successful)?;
    info!(
        "Mapped {} item(s): {} ok, {} failed -> {}",
        total,
        successful.len(),
        errors.len(),
        output_path.display()
    );

    let failed = errors.len();
    errors.truncate(ERROR_REPORT_CAP);
    Ok(MapReport {
        output_path: output_path.display().to_string(),
        total_items: total,
        successful: total - failed,
        failed,
        errors,
    })
}

fn output_path_for(input_path: &Path, tag: &str) -> PathBuf {
    input_path.with_extension(format!("{tag}.jsonl"))
}

/// Read a JSONL file, skipping lines that fail to parse.
fn read_jsonl(path: &Path) -> Result<Vec<Value>, LcmError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        LcmError::InputError(format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

fn write_jsonl(path: &Path, items: &[&Value]) -> Result<(), LcmError> {
    let mut out = String::new();
    for item in items {
        out.push_str(&item.to_string());
        out.push('\n');
    }
    std::fs::write(path, out)
        .map_err(|e| anyhow::anyhow!("cannot write {}: {e}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::StubLlm;
    use std::io::Write;

    fn write_input(lines: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("items.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        (dir, path)
    }

    #[tokio::test]
    async fn llm_map_processes_every_line() {
        let (_dir, path) = write_input(&[
            r#"{"id": 1}"#,
            r#"{"id": 2}"#,
            r#"{"id": 3}"#,
        ]);
        let llm = Arc::new(StubLlm::fixed("categorized"));

        let report = llm_map(llm, &path, "classify each item", None, 4).await.unwrap();
        assert_eq!(report.total_items, 3);
        assert_eq!(report.successful, 3);
        assert_eq!(report.failed, 0);

        let out = std::fs::read_to_string(&report.output_path).unwrap();
        assert_eq!(out.lines().count(), 3);
        for line in out.lines() {
            let value: Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["result"], "categorized");
        }
    }

    #[tokio::test]
    async fn output_schema_reaches_the_client() {
        let (_dir, path) = write_input(&[r#"{"id": 1}"#]);
        let llm = Arc::new(StubLlm::fixed("ok"));
        let schema = serde_json::json!({"type": "object", "required": ["label"]});

        let report = llm_map(llm, &path, "classify", Some(schema), 1).await.unwrap();
        assert_eq!(report.successful, 1);

        let out = std::fs::read_to_string(&report.output_path).unwrap();
        let value: Value = serde_json::from_str(out.lines().next().unwrap()).unwrap();
        assert_eq!(value["schema_given"], true);
    }

    #[tokio::test]
    async fn failures_are_reported_per_item() {
        let (_dir, path) = write_input(&[r#"{"id": 1}"#, r#"{"id": 2}"#]);
        let llm = Arc::new(StubLlm::failing());

        let report = llm_map(llm, &path, "classify", None, 2).await.unwrap();
        assert_eq!(report.total_items, 2);
        assert_eq!(report.successful, 0);
        assert_eq!(report.failed, 2);
        assert_eq!(report.errors.len(), 2);

        let out = std::fs::read_to_string(&report.output_path).unwrap();
        assert_eq!(out.lines().count(), 0);
    }

    #[tokio::test]
    async fn invalid_lines_are_skipped() {
        let (_dir, path) = write_input(&[r#"{"id": 1}"#, "not json", "", r#"{"id": 2}"#]);
        let llm = Arc::new(StubLlm::fixed("ok"));

        let report = llm_map(llm, &path, "p", None, 2).await.unwrap();
        assert_eq!(report.total_items, 2);
    }

    #[tokio::test]
    async fn missing_input_is_an_input_error() {
        let llm: Arc<dyn LlmClient> = Arc::new(StubLlm::fixed("x"));
        let res = llm_map(llm, Path::new("/no/such/input.jsonl"), "p", None, 2).await;
        assert!(matches!(res, Err(LcmError::InputError(_))));
    }

    #[tokio::test]
    async fn agentic_map_writes_to_its_own_output() {
        let (_dir, path) = write_input(&[r#"{"task": "inspect"}"#]);
        let llm = Arc::new(StubLlm::fixed("done"));

        let report = agentic_map(llm, &path, "do the task", None, true, 1).await.unwrap();
        assert!(report.output_path.ends_with(".agent_out.jsonl"));
        assert_eq!(report.successful, 1);
    }
}
