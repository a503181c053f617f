use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SkillchainError;

/// Named values passed into a skill invocation.
pub type SkillInputs = HashMap<String, serde_json::Value>;

/// Named values produced by a skill invocation.
pub type SkillOutputs = HashMap<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that a skill identifier is a dot-separated hierarchical name,
/// e.g. `energy.extraction.glossary`.
pub fn is_valid_identifier(fqsn: &str) -> bool {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            regex::Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$")
                .expect("identifier pattern is valid")
        })
        .is_match(fqsn)
}

/// Failure reported by a skill, with a machine-readable reason code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillError {
    pub code: String,
    pub message: String,
}

impl SkillError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new("invalid_input", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("internal", message)
    }
}

impl std::fmt::Display for SkillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for SkillError {}

/// Per-invocation context handed to a skill.
#[derive(Debug, Clone)]
pub struct SkillContext {
    pub run_id: RunId,
    pub node_id: String,
    pub attempt: u32,
    /// Fires when the run is cancelled. Skills that support interruption
    /// should watch it; others may ignore it and finish normally.
    pub cancel: CancellationToken,
}

/// Outcome of a single node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Failed,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One invocation of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub run_id: RunId,
    pub node_id: String,
    /// 1-based; incremented each time a feedback loop re-enters the node.
    pub attempt: u32,
    pub start_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl ExecutionRecord {
    pub fn succeeded(&self) -> bool {
        self.status == NodeStatus::Success
    }
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// A critical node failed (propagated failure).
    Failed,
    /// A feedback edge hit its bound with no alternative edge to follow.
    LoopExhausted,
    Cancelled,
    TimedOut,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::LoopExhausted => "loop_exhausted",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// The node failure that ended a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub attempt: u32,
    pub code: String,
    pub message: String,
}

/// A feedback edge identified by its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeRef {
    pub from: String,
    pub to: String,
}

/// Result of a chain run. Always carries the (possibly partial) context and
/// the full history, whatever the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub chain_name: String,
    pub status: RunStatus,
    pub final_context: HashMap<String, serde_json::Value>,
    pub history: Vec<ExecutionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<NodeFailure>,
    /// Feedback edges disabled after reaching their bound.
    #[serde(default)]
    pub exhausted_edges: Vec<EdgeRef>,
    pub elapsed_ms: u64,
}

impl RunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// The run outcome as an error: `Failed` and `Cancelled` runs only.
    /// `LoopExhausted` is a normal outcome and yields `None`.
    pub fn error(&self) -> Option<SkillchainError> {
        match self.status {
            RunStatus::Failed => self.failure.as_ref().map(|f| SkillchainError::PropagatedFailure {
                node: f.node_id.clone(),
                message: f.message.clone(),
            }),
            RunStatus::Cancelled => Some(SkillchainError::Cancelled),
            _ => None,
        }
    }

    /// Records for a single node, in execution order.
    pub fn records_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ExecutionRecord> {
        self.history.iter().filter(move |r| r.node_id == node_id)
    }
}

/// Events emitted by the engine during a run.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// Run started.
    RunStarted { run_id: RunId, chain_name: String },
    /// A node invocation started.
    NodeStarted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
    },
    /// A node invocation settled.
    NodeFinished { record: ExecutionRecord },
    /// A feedback edge re-entered its target.
    FeedbackTriggered {
        run_id: RunId,
        edge: EdgeRef,
        iteration: u32,
    },
    /// A feedback edge reached its bound.
    LoopExhausted { run_id: RunId, edge: EdgeRef },
    /// Run reached a terminal status.
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        elapsed_ms: u64,
    },
}
