//! CLI entry point: hook dispatch, status, file analysis, and the RPC
//! server.
//!
//! Hooks read JSON from stdin (`{session_id, transcript_path, event}`)
//! with environment fallbacks, log to stderr, and keep stdout clean;
//! inject's stdout is consumed verbatim by the host. Exit codes: 0
//! success, 2 bad usage, 3 store unavailable, 4 LLM unavailable; capture
//! and inject exit 0 whenever they can degrade.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{error, info, warn};

use lcm::compaction::{explorer, CompactionConfig, CompactionEngine};
use lcm::hooks::{build_injection, capture_transcript};
use lcm::llm::{AnthropicClient, LlmClient};
use lcm::store::files::content_hash;
use lcm::{Config, LcmError, Store};

#[derive(Debug, Default, Deserialize)]
struct HookInput {
    session_id: Option<String>,
    transcript_path: Option<String>,
    #[allow(dead_code)]
    event: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    lcm::telemetry::init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = run(&args).await;
    std::process::exit(code);
}

async fn run(args: &[String]) -> i32 {
    match args.first().map(String::as_str) {
        Some("hook") => run_hook(args.get(1).map(String::as_str)).await,
        Some("status") => run_status(args.get(1).cloned()),
        Some("serve") => run_serve().await,
        Some("analyze") => run_analyze(args.get(1).map(String::as_str)).await,
        _ => {
            usage();
            2
        }
    }
}

fn usage() {
    eprintln!("Usage: lcm <command> [args]");
    eprintln!("Commands:");
    eprintln!("  hook <capture|inject|init>   hook entry points (stdin JSON)");
    eprintln!("  status [session]             print session stats");
    eprintln!("  analyze <path>               analyze a file into a file reference");
    eprintln!("  serve                        run the RPC server");
}

fn load_config() -> Result<Config, i32> {
    Config::from_env().map_err(|e| {
        error!("Bad configuration: {}", e);
        2
    })
}

fn open_store(cfg: &Config) -> Result<Arc<Store>, i32> {
    match Store::open(&cfg.db_path) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) => {
            error!("Store unavailable: {}", e);
            Err(3)
        }
    }
}

fn read_hook_input() -> HookInput {
    use std::io::{IsTerminal, Read};
    let mut raw = String::new();
    if !std::io::stdin().is_terminal() {
        let _ = std::io::stdin().read_to_string(&mut raw);
    }
    serde_json::from_str(&raw).unwrap_or_default()
}

fn resolve_session(input: &HookInput) -> String {
    input
        .session_id
        .clone()
        .or_else(|| std::env::var("CLAUDE_SESSION_ID").ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

async fn run_hook(subcommand: Option<&str>) -> i32 {
    let Some(subcommand) = subcommand else {
        usage();
        return 2;
    };
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let store = match open_store(&cfg) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let input = read_hook_input();
    let session_id = resolve_session(&input);

    match subcommand {
        "capture" => hook_capture(cfg, store, input, &session_id).await,
        "inject" => match build_injection(&store, &session_id) {
            Ok(text) => {
                if !text.is_empty() {
                    println!("{text}");
                }
                0
            }
            Err(e) => {
                // The host is never blocked by the augmentation layer.
                warn!("Inject degraded to empty output: {}", e);
                0
            }
        },
        "init" => {
            if let Err(e) = store.ensure_session(&session_id) {
                error!("Session init failed: {}", e);
                return 3;
            }
            let existing = store.messages.count(&session_id).unwrap_or(0);
            info!(
                "Session {} initialized ({} existing message(s))",
                session_id, existing
            );
            0
        }
        other => {
            eprintln!("Unknown hook subcommand: {other}");
            2
        }
    }
}

async fn hook_capture(
    cfg: Config,
    store: Arc<Store>,
    input: HookInput,
    session_id: &str,
) -> i32 {
    let transcript_path = input
        .transcript_path
        .or_else(|| std::env::var("CLAUDE_TRANSCRIPT_PATH").ok());
    let Some(transcript_path) = transcript_path else {
        warn!("No transcript path provided; capture is a no-op");
        return 0;
    };

    match capture_transcript(
        &store,
        session_id,
        Path::new(&transcript_path),
        cfg.blob_threshold_bytes,
    ) {
        Ok(stats) => {
            if stats.captured > 0 {
                // Token pressure may have changed: run the compaction
                // check. The worker is detached from store writers; this
                // one-shot process just holds on until it settles.
                let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::from_config(&cfg));
                let engine = Arc::new(CompactionEngine::new(
                    Arc::clone(&store),
                    llm,
                    CompactionConfig::from_config(&cfg),
                ));
                let _ = engine.spawn_check(session_id).await;
            }
            0
        }
        Err(e) if e.is_degradable() => {
            warn!("Capture degraded to no-op: {}", e);
            0
        }
        Err(e) => {
            error!("Capture failed: {}", e);
            e.exit_code()
        }
    }
}

fn run_status(session_arg: Option<String>) -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let store = match open_store(&cfg) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let session_id = session_arg
        .or_else(|| std::env::var("CLAUDE_SESSION_ID").ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string());

    match lcm::tools::status(&store, &session_id) {
        Ok(report) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).unwrap_or_default()
            );
            0
        }
        Err(e) => {
            error!("Status failed: {}", e);
            e.exit_code()
        }
    }
}

async fn run_serve() -> i32 {
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    cfg.print_config();
    let store = match open_store(&cfg) {
        Ok(store) => store,
        Err(code) => return code,
    };

    let llm: Arc<dyn LlmClient> = Arc::new(AnthropicClient::from_config(&cfg));
    let engine = Arc::new(CompactionEngine::new(
        Arc::clone(&store),
        Arc::clone(&llm),
        CompactionConfig::from_config(&cfg),
    ));
    let state = Arc::new(lcm::api::AppState {
        store,
        engine,
        llm,
        cfg,
    });

    match lcm::api::serve(state).await {
        Ok(()) => 0,
        Err(e) => {
            error!("Server failed: {}", e);
            1
        }
    }
}

async fn run_analyze(path_arg: Option<&str>) -> i32 {
    let Some(path) = path_arg else {
        usage();
        return 2;
    };
    let cfg = match load_config() {
        Ok(cfg) => cfg,
        Err(code) => return code,
    };
    let store = match open_store(&cfg) {
        Ok(store) => store,
        Err(code) => return code,
    };
    let session_id = std::env::var("CLAUDE_SESSION_ID")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "default".to_string());

    let llm = AnthropicClient::from_config(&cfg);
    let analysis = explorer::analyze_file(&llm, Path::new(path)).await;
    let Some(size_bytes) = analysis.size_bytes else {
        eprintln!("{}", analysis.summary);
        return 2;
    };

    let hash = match std::fs::read(path) {
        Ok(bytes) => content_hash(&bytes),
        Err(e) => {
            error!("Cannot hash {}: {}", path, e);
            return 2;
        }
    };

    match store
        .files
        .upsert(&session_id, path, &hash, size_bytes, Some(&analysis.summary), None)
    {
        Ok(id) => {
            println!(
                "{}",
                serde_json::json!({
                    "id": format!("F{id}"),
                    "path": path,
                    "file_type": analysis.file_type,
                    "size_bytes": size_bytes,
                    "summary": analysis.summary,
                })
            );
            0
        }
        Err(e) => {
            error!("Failed to store file reference: {}", e);
            LcmError::from(e).exit_code()
        }
    }
}
