use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use skillchain_core::event::EventBus;
use skillchain_core::types::{ChainEvent, RunId};

/// JSONL run logger.
///
/// Subscribes to the EventBus and appends one JSON object per line to
/// `{log_dir}/{run_id}.jsonl`. Lines are flushed as they are written, so a
/// crash leaves every earlier entry intact.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = run summary, 2 = per node.
    pub fn new(log_dir: impl Into<PathBuf>, level: u8) -> Self {
        Self {
            log_dir: log_dir.into(),
            level,
        }
    }

    /// Path of the log file for a run.
    pub fn log_path(&self, run_id: &RunId) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", run_id))
    }

    /// Subscribe now and log in a background task until the run finishes or
    /// `cancel` fires. Subscribing before spawning means no event published
    /// after this call is missed.
    pub fn spawn(self, event_bus: &EventBus, run_id: RunId, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(async move { self.run(rx, run_id, cancel).await })
    }

    async fn run(self, mut rx: Receiver<ChainEvent>, run_id: RunId, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let log_path = self.log_path(&run_id);
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event_run_id(&event) != &run_id {
                                continue;
                            }
                            let finished = matches!(event, ChainEvent::RunFinished { .. });
                            if let Some(entry) = self.event_to_entry(&event) {
                                if let Err(e) = write_entry(&mut writer, &entry).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                            }
                            if finished {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// Convert an event to a log entry, or None if filtered by level.
    fn event_to_entry(&self, event: &ChainEvent) -> Option<LogEntry> {
        let entry = |run_id: &RunId, event_type, node_id: Option<&str>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.to_string(),
            event_type,
            node_id: node_id.map(str::to_string),
            detail,
        };

        match event {
            // L1: run summary
            ChainEvent::RunStarted { run_id, chain_name } => Some(entry(
                run_id,
                "run_started",
                None,
                Some(serde_json::json!({ "chain": chain_name })),
            )),
            ChainEvent::LoopExhausted { run_id, edge } => Some(entry(
                run_id,
                "loop_exhausted",
                None,
                Some(serde_json::json!({ "from": edge.from, "to": edge.to })),
            )),
            ChainEvent::RunFinished {
                run_id,
                status,
                elapsed_ms,
            } => Some(entry(
                run_id,
                "run_finished",
                None,
                Some(serde_json::json!({ "status": status, "elapsed_ms": elapsed_ms })),
            )),

            // L2: per node
            ChainEvent::NodeStarted {
                run_id,
                node_id,
                attempt,
            } if self.level >= 2 => Some(entry(
                run_id,
                "node_started",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "attempt": attempt })),
            )),
            ChainEvent::NodeFinished { record } if self.level >= 2 => Some(entry(
                &record.run_id,
                "node_finished",
                Some(record.node_id.as_str()),
                serde_json::to_value(record).ok(),
            )),
            ChainEvent::FeedbackTriggered {
                run_id,
                edge,
                iteration,
            } if self.level >= 2 => Some(entry(
                run_id,
                "feedback_triggered",
                None,
                Some(serde_json::json!({
                    "from": edge.from,
                    "to": edge.to,
                    "iteration": iteration,
                })),
            )),

            _ => None,
        }
    }
}

fn event_run_id(event: &ChainEvent) -> &RunId {
    match event {
        ChainEvent::RunStarted { run_id, .. }
        | ChainEvent::NodeStarted { run_id, .. }
        | ChainEvent::FeedbackTriggered { run_id, .. }
        | ChainEvent::LoopExhausted { run_id, .. }
        | ChainEvent::RunFinished { run_id, .. } => run_id,
        ChainEvent::NodeFinished { record } => &record.run_id,
    }
}

async fn write_entry(
    writer: &mut tokio::io::BufWriter<tokio::fs::File>,
    entry: &LogEntry,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Read back a JSONL run log as raw JSON values.
pub fn read_log(path: &Path) -> std::io::Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(std::io::Error::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillchain_core::types::{EdgeRef, RunStatus};

    #[test]
    fn test_entry_skips_empty_fields() {
        let entry = LogEntry {
            timestamp: "2026-02-24T12:00:00Z".to_string(),
            run_id: "run-1".to_string(),
            event_type: "run_started",
            node_id: None,
            detail: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("run_started"));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_event_level_filtering() {
        let run_id = RunId::from_string("r");
        let node_started = ChainEvent::NodeStarted {
            run_id: run_id.clone(),
            node_id: "extract".into(),
            attempt: 1,
        };
        let exhausted = ChainEvent::LoopExhausted {
            run_id: run_id.clone(),
            edge: EdgeRef {
                from: "validate".into(),
                to: "extract".into(),
            },
        };

        let summary = RunLogger::new("/tmp", 1);
        assert!(summary.event_to_entry(&exhausted).is_some());
        assert!(summary.event_to_entry(&node_started).is_none());

        let detailed = RunLogger::new("/tmp", 2);
        let entry = detailed.event_to_entry(&node_started).unwrap();
        assert_eq!(entry.node_id.as_deref(), Some("extract"));
    }

    #[tokio::test]
    async fn test_writes_jsonl_for_one_run() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let run_id = RunId::from_string("run-42");
        let logger = RunLogger::new(dir.path(), 2);
        let path = logger.log_path(&run_id);
        let handle = logger.spawn(&bus, run_id.clone(), CancellationToken::new());

        bus.publish(ChainEvent::RunStarted {
            run_id: run_id.clone(),
            chain_name: "demo".into(),
        });
        // another run's events are ignored
        bus.publish(ChainEvent::RunStarted {
            run_id: RunId::from_string("other"),
            chain_name: "demo".into(),
        });
        bus.publish(ChainEvent::NodeStarted {
            run_id: run_id.clone(),
            node_id: "a".into(),
            attempt: 1,
        });
        bus.publish(ChainEvent::RunFinished {
            run_id: run_id.clone(),
            status: RunStatus::Succeeded,
            elapsed_ms: 3,
        });

        handle.await.unwrap();
        let lines = read_log(&path).unwrap();
        let types: Vec<&str> = lines
            .iter()
            .map(|l| l["event_type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["run_started", "node_started", "run_finished"]);
        assert_eq!(lines[2]["detail"]["status"], "succeeded");
    }
}
