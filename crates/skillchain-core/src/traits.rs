use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// A unit of work with a declared input/output contract.
pub trait Skill: Send + Sync + 'static {
    /// Hierarchical identifier (e.g., "energy.extraction.glossary").
    fn name(&self) -> &str;

    /// Inputs that must be present for every invocation.
    fn required_inputs(&self) -> &[String];

    /// Inputs the skill accepts but can do without.
    fn optional_inputs(&self) -> &[String] {
        &[]
    }

    /// Outputs the skill may produce.
    fn outputs(&self) -> &[String];

    /// Execute the skill with the gathered inputs.
    fn execute(
        &self,
        inputs: SkillInputs,
        ctx: SkillContext,
    ) -> BoxFuture<'_, std::result::Result<SkillOutputs, SkillError>>;

    /// Skill-level default timeout. A node's own `timeout_ms` overrides it;
    /// the engine-wide node timeout applies only when neither is set.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// External discovery mechanism consulted by the registry.
pub trait SkillLoader: Send + Sync + 'static {
    /// Loader name for logs.
    fn name(&self) -> &str;

    /// Load the skill registered under `fqsn`, or `Ok(None)` if this loader
    /// does not know it.
    fn load(&self, fqsn: &str) -> BoxFuture<'_, Result<Option<Arc<dyn Skill>>>>;
}

/// Append-only store of execution records.
pub trait Recorder: Send + Sync + 'static {
    /// Append a record to the run's history.
    fn record(&self, record: &ExecutionRecord) -> Result<()>;

    /// History of a run in execution order.
    fn history(&self, run_id: &RunId) -> Result<Vec<ExecutionRecord>>;
}
