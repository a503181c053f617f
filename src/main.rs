use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skillchain_core::config::{AppConfig, RecorderBackend};
use skillchain_core::event::EventBus;
use skillchain_core::traits::Recorder;
use skillchain_core::types::{RunId, RunResult};
use skillchain_engine::{parse_file, plan, ChainDefinition, Engine, RunLogger, RunOptions};
use skillchain_skills::{builtin, discover, registry_from_config};
use skillchain_store::SqliteRecorder;

#[derive(Parser)]
#[command(name = "skillchain", version, about = "Run skill chains with bounded feedback loops")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "skillchain.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a chain file
    Validate {
        /// Chain file (.toml or .json)
        chain: PathBuf,
    },
    /// Show the execution phases of a chain
    Plan {
        chain: PathBuf,
        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a chain
    Run {
        chain: PathBuf,
        /// Initial context value, KEY=JSON (bare strings allowed)
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// Override engine.concurrency_limit
        #[arg(long)]
        concurrency: Option<usize>,
        /// Whole-run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recorded history (sqlite recorder only)
    History {
        /// Run to show; lists recent runs when omitted
        run_id: Option<String>,
        /// Number of runs to list
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Inspect available skills
    Skills {
        #[command(subcommand)]
        action: SkillsAction,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum SkillsAction {
    /// List builtin and discovered skills
    List,
    /// Show a skill's inputs and outputs
    Show {
        /// Skill identifier
        fqsn: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("skillchain=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "skillchain", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate { chain } => {
            let chain = load_chain(&chain)?;
            println!(
                "ok: {} ({}, {} nodes, {} edges)",
                chain.name(),
                chain.graph_type(),
                chain.nodes().len(),
                chain.edges().len()
            );
        }
        Commands::Plan { chain, json } => {
            let chain = load_chain(&chain)?;
            let plan = plan(&chain)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                for (i, phase) in plan.phases.iter().enumerate() {
                    println!("phase {}: {}", i, phase.join(", "));
                }
                for fb in &plan.feedback {
                    println!(
                        "feedback {} -> {} (max {}): {}",
                        fb.from,
                        fb.to,
                        fb.max_iterations,
                        fb.body.iter().flatten().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
            }
        }
        Commands::Run {
            chain,
            inputs,
            concurrency,
            timeout,
            json,
        } => {
            let chain = load_chain(&chain)?;
            let initial = parse_inputs(&inputs)?;
            let mut options = RunOptions::from_config(&config.engine);
            if let Some(limit) = concurrency {
                options = options.with_concurrency(limit);
            }
            if let Some(secs) = timeout {
                options = options.with_run_timeout(Duration::from_secs(secs));
            }
            let result = run_chain(&config, &chain, initial, options).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_summary(&result);
            }
            if !result.succeeded() {
                std::process::exit(1);
            }
        }
        Commands::History { run_id, limit } => {
            if config.recorder.backend != RecorderBackend::Sqlite {
                bail!("history needs a persistent recorder; set [recorder] backend = \"sqlite\"");
            }
            let store = SqliteRecorder::open(&config.recorder_path())?;
            match run_id {
                Some(id) => {
                    let history = store.history(&RunId(id.clone()))?;
                    if history.is_empty() {
                        bail!("no records for run {}", id);
                    }
                    for r in &history {
                        println!(
                            "{}  {:<24} #{:<3} {:>7}ms  {}{}",
                            r.start_time.format("%H:%M:%S%.3f"),
                            r.node_id,
                            r.attempt,
                            r.duration_ms,
                            r.status,
                            r.error_code
                                .as_ref()
                                .map(|c| format!(" ({})", c))
                                .unwrap_or_default()
                        );
                    }
                }
                None => {
                    for run in store.runs(limit)? {
                        println!(
                            "{}  {}  {} records, {} failed",
                            run.first_start.format("%Y-%m-%d %H:%M:%S"),
                            run.run_id,
                            run.records,
                            run.failed
                        );
                    }
                }
            }
        }
        Commands::Skills { action } => {
            let registry = registry_from_config(&config.skills, config.skill_dirs());
            match action {
                SkillsAction::List => {
                    if config.skills.builtins {
                        for (name, _) in builtin::builtins() {
                            println!("{}  (builtin)", name);
                        }
                    }
                    for dir in config.skill_dirs() {
                        for name in discover(&dir) {
                            println!("{}  ({})", name, dir.display());
                        }
                    }
                }
                SkillsAction::Show { fqsn } => {
                    let skill = registry.resolve(&fqsn).await?;
                    println!("name:     {}", skill.name());
                    println!("inputs:   {}", skill.required_inputs().join(", "));
                    println!("optional: {}", skill.optional_inputs().join(", "));
                    println!("outputs:  {}", skill.outputs().join(", "));
                    if let Some(t) = skill.timeout() {
                        println!("timeout:  {}s", t.as_secs());
                    }
                }
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        info!(path = %path.display(), "Loading config");
        Ok(AppConfig::load(path)?)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn load_chain(path: &Path) -> anyhow::Result<ChainDefinition> {
    parse_file(path).with_context(|| format!("failed to load chain {}", path.display()))
}

/// Parse `KEY=VALUE` pairs. Values that are not valid JSON are taken as strings.
fn parse_inputs(raw: &[String]) -> anyhow::Result<HashMap<String, serde_json::Value>> {
    let mut inputs = HashMap::new();
    for pair in raw {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("input '{}' is not KEY=VALUE", pair);
        };
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        inputs.insert(key.trim().to_string(), value);
    }
    Ok(inputs)
}

async fn run_chain(
    config: &AppConfig,
    chain: &ChainDefinition,
    initial: HashMap<String, serde_json::Value>,
    options: RunOptions,
) -> anyhow::Result<RunResult> {
    let registry = Arc::new(registry_from_config(&config.skills, config.skill_dirs()));
    let event_bus = Arc::new(EventBus::default());
    let mut engine = Engine::new(registry).with_event_bus(event_bus.clone());
    if config.recorder.backend == RecorderBackend::Sqlite {
        let path = config.recorder_path();
        info!(path = %path.display(), "Recording history to SQLite");
        engine = engine.with_recorder(Arc::new(SqliteRecorder::open(&path)?));
    }

    let cancel = CancellationToken::new();
    let run_id = RunId::new();
    let options = options.with_cancel(cancel.clone()).with_run_id(run_id.clone());

    let logger_cancel = CancellationToken::new();
    let logger = config
        .log
        .as_ref()
        .filter(|log| log.enabled)
        .map(|log| {
            RunLogger::new(&log.log_dir, log.level).spawn(&event_bus, run_id.clone(), logger_cancel.clone())
        });

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    let result = engine.run(chain, initial, options).await;

    if let Some(handle) = logger {
        // Validation errors never publish RunFinished.
        if result.is_err() {
            logger_cancel.cancel();
        }
        handle.await.ok();
    }
    Ok(result?)
}

fn print_summary(result: &RunResult) {
    println!(
        "{} {} in {}ms ({} node runs)",
        result.chain_name,
        result.status,
        result.elapsed_ms,
        result.history.len()
    );
    if let Some(err) = result.error() {
        println!("error: {}", err);
    }
    if let Some(ref failure) = result.failure {
        println!("failed at {} (attempt {}) [{}]", failure.node_id, failure.attempt, failure.code);
    }
    for edge in &result.exhausted_edges {
        println!("loop exhausted: {} -> {}", edge.from, edge.to);
    }
    let mut keys: Vec<&String> = result.final_context.keys().collect();
    keys.sort();
    for key in keys {
        println!("  {} = {}", key, result.final_context[key]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inputs() {
        let raw = vec![
            "n=3".to_string(),
            "topic=coal gasification".to_string(),
            "tags=[\"a\",\"b\"]".to_string(),
        ];
        let inputs = parse_inputs(&raw).unwrap();
        assert_eq!(inputs["n"], serde_json::json!(3));
        assert_eq!(inputs["topic"], serde_json::json!("coal gasification"));
        assert_eq!(inputs["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn test_parse_inputs_rejects_missing_equals() {
        assert!(parse_inputs(&["novalue".to_string()]).is_err());
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}
