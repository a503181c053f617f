//! Chain definitions, phase planning, and execution.
//!
//! A chain is parsed and validated into a [`ChainDefinition`], reduced to a
//! [`Plan`] of phases plus bounded feedback edges, and run by an [`Engine`]
//! against a skill registry.

pub mod chain;
pub mod condition;
pub mod context;
pub mod executor;
mod graph;
pub mod plan;
pub mod recorder;
pub mod run_log;

pub use chain::{parse, parse_file, ChainDefinition, ChainFormat, Edge, GraphType, InputSource, Node};
pub use condition::{Condition, ConditionError};
pub use context::ExecutionContext;
pub use executor::{Engine, PreparedChain, RunOptions};
pub use plan::{plan, FeedbackEdge, Plan};
pub use recorder::MemoryRecorder;
pub use run_log::RunLogger;
