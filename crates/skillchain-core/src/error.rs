use thiserror::Error;

use crate::types::SkillError;

#[derive(Debug, Error)]
pub enum SkillchainError {
    // Chain structure errors (raised by the parser / validator)
    #[error("Malformed chain: {0}")]
    MalformedChain(String),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("Edge {from} -> {to} references unknown node '{missing}'")]
    DanglingEdge {
        from: String,
        to: String,
        missing: String,
    },

    #[error("DAG chain contains a cycle: {}", .0.join(" -> "))]
    UnexpectedCycle(Vec<String>),

    #[error("Cycle without max_iterations bound: {}", .0.join(" -> "))]
    UnboundedCycle(Vec<String>),

    #[error("Node '{node}' input '{input}' reads '{key}', which no upstream node or chain input provides")]
    UnresolvedInput {
        node: String,
        input: String,
        key: String,
    },

    // Scheduling errors
    #[error("Cannot schedule nodes (cycle through dependencies): {}", .0.join(", "))]
    Resolution(Vec<String>),

    // Skill resolution errors
    #[error("Skill not found: {0}")]
    SkillNotFound(String),

    #[error("Invalid skill identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Node '{node}' does not satisfy skill '{skill}': {message}")]
    SkillContract {
        node: String,
        skill: String,
        message: String,
    },

    // Runtime errors
    #[error("Skill failed in node '{node}': {source}")]
    Skill {
        node: String,
        #[source]
        source: SkillError,
    },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    Timeout { node: String, timeout_ms: u64 },

    #[error("Missing context key: {0}")]
    MissingKey(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Critical node '{node}' failed: {message}")]
    PropagatedFailure { node: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SkillchainError {
    /// Stable machine-readable code for this error class.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedChain(_) => "malformed_chain",
            Self::DuplicateNode(_) => "duplicate_node",
            Self::DanglingEdge { .. } => "dangling_edge",
            Self::UnexpectedCycle(_) => "unexpected_cycle",
            Self::UnboundedCycle(_) => "unbounded_cycle",
            Self::UnresolvedInput { .. } => "unresolved_input",
            Self::Resolution(_) => "resolution_error",
            Self::SkillNotFound(_) => "not_found",
            Self::InvalidIdentifier(_) => "invalid_identifier",
            Self::SkillContract { .. } => "skill_contract",
            Self::Skill { .. } => "skill_error",
            Self::Timeout { .. } => "timeout",
            Self::MissingKey(_) => "missing_key",
            Self::Cancelled => "cancelled",
            Self::PropagatedFailure { .. } => "propagated_failure",
            Self::Config(_) => "config",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }

    /// Whether this error is a structural chain error raised before any
    /// skill is resolved.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::MalformedChain(_)
                | Self::DuplicateNode(_)
                | Self::DanglingEdge { .. }
                | Self::UnexpectedCycle(_)
                | Self::UnboundedCycle(_)
                | Self::UnresolvedInput { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SkillchainError>;
