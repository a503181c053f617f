use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use skillchain_core::config::EngineConfig;
use skillchain_core::error::{Result, SkillchainError};
use skillchain_core::event::EventBus;
use skillchain_core::traits::{Recorder, Skill};
use skillchain_core::types::{
    ChainEvent, EdgeRef, ExecutionRecord, NodeFailure, NodeStatus, RunId, RunResult, RunStatus,
    SkillContext, SkillInputs, SkillOutputs,
};
use skillchain_skills::SkillRegistry;

use crate::chain::{ChainDefinition, InputSource, Node};
use crate::context::ExecutionContext;
use crate::plan::{plan, Plan};
use crate::recorder::MemoryRecorder;

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum simultaneous node invocations within a phase.
    pub concurrency_limit: usize,
    /// Whole-run deadline.
    pub run_timeout: Option<Duration>,
    /// Default per-node timeout when neither the node nor the skill sets one.
    pub node_timeout: Option<Duration>,
    /// Cancelling this stops new node starts.
    pub cancel: CancellationToken,
    /// Use a caller-chosen run id (e.g. to attach a logger first).
    pub run_id: Option<RunId>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            run_timeout: None,
            node_timeout: None,
            cancel: CancellationToken::new(),
            run_id: None,
        }
    }
}

impl RunOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            concurrency_limit: config.concurrency_limit.max(1),
            run_timeout: config.run_timeout(),
            node_timeout: config.node_timeout(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// A chain that has been planned and whose skills are all resolved.
pub struct PreparedChain<'c> {
    chain: &'c ChainDefinition,
    plan: Plan,
    /// Resolved skill per node, by declaration index.
    skills: Vec<Arc<dyn Skill>>,
}

impl PreparedChain<'_> {
    pub fn chain(&self) -> &ChainDefinition {
        self.chain
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }
}

/// Runs chains against a skill registry.
///
/// The registry is shared across runs; context, history and loop counters
/// are fresh for every run.
pub struct Engine {
    registry: Arc<SkillRegistry>,
    recorder: Arc<dyn Recorder>,
    event_bus: Option<Arc<EventBus>>,
}

impl Engine {
    pub fn new(registry: Arc<SkillRegistry>) -> Self {
        Self {
            registry,
            recorder: Arc::new(MemoryRecorder::new()),
            event_bus: None,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn registry(&self) -> &Arc<SkillRegistry> {
        &self.registry
    }

    pub fn recorder(&self) -> &Arc<dyn Recorder> {
        &self.recorder
    }

    fn publish(&self, event: ChainEvent) {
        if let Some(ref bus) = self.event_bus {
            bus.publish(event);
        }
    }

    /// Plan the chain, resolve every skill, and check each node against its
    /// skill's declared inputs and outputs. Nothing is invoked.
    pub async fn prepare<'c>(&self, chain: &'c ChainDefinition) -> Result<PreparedChain<'c>> {
        let plan = plan(chain)?;

        let skills = try_join_all(
            chain
                .nodes()
                .iter()
                .map(|node| self.registry.resolve(&node.skill)),
        )
        .await?;

        for (node, skill) in chain.nodes().iter().zip(&skills) {
            check_contract(node, skill.as_ref())?;
        }

        Ok(PreparedChain {
            chain,
            plan,
            skills,
        })
    }

    /// Run a chain to a terminal status.
    ///
    /// Planning, resolution and contract errors are returned as `Err`; once
    /// execution starts, every outcome is reported in the `RunResult`.
    pub async fn run(
        &self,
        chain: &ChainDefinition,
        initial: HashMap<String, Value>,
        options: RunOptions,
    ) -> Result<RunResult> {
        let prepared = self.prepare(chain).await?;
        Ok(self.execute(&prepared, initial, options).await)
    }

    /// Execute an already prepared chain.
    pub async fn execute(
        &self,
        prepared: &PreparedChain<'_>,
        initial: HashMap<String, Value>,
        options: RunOptions,
    ) -> RunResult {
        let chain = prepared.chain;
        let run_id = options.run_id.clone().unwrap_or_default();
        let cancel = options.cancel.child_token();
        let started = Instant::now();

        info!(
            run_id = %run_id,
            chain = %chain.name(),
            phases = prepared.plan.phases.len(),
            "Chain run started"
        );
        self.publish(ChainEvent::RunStarted {
            run_id: run_id.clone(),
            chain_name: chain.name().to_string(),
        });

        let mut state = RunState::new(
            self,
            prepared,
            run_id.clone(),
            ExecutionContext::from_map(initial),
            &options,
            cancel.clone(),
        );
        let phases: Vec<Vec<usize>> = prepared
            .plan
            .phases
            .iter()
            .map(|phase| phase.iter().filter_map(|id| chain.node_index(id)).collect())
            .collect();

        let flow = match options.run_timeout {
            Some(limit) => match tokio::time::timeout(limit, state.run_phases(phases, None)).await {
                Ok(flow) => flow,
                Err(_) => {
                    cancel.cancel();
                    warn!(run_id = %run_id, timeout_ms = limit.as_millis() as u64, "Run deadline reached");
                    Flow::Halt(RunStatus::TimedOut)
                }
            },
            None => state.run_phases(phases, None).await,
        };

        let status = match flow {
            Flow::Continue => RunStatus::Succeeded,
            Flow::Halt(status) => status,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match status {
            RunStatus::Succeeded => {
                info!(run_id = %run_id, elapsed_ms, nodes_run = state.history.len(), "Chain run succeeded")
            }
            RunStatus::Failed => error!(
                run_id = %run_id,
                node_id = state.failure.as_ref().map(|f| f.node_id.as_str()).unwrap_or(""),
                elapsed_ms,
                "Chain run failed"
            ),
            other => warn!(run_id = %run_id, status = %other, elapsed_ms, "Chain run stopped"),
        }
        self.publish(ChainEvent::RunFinished {
            run_id: run_id.clone(),
            status,
            elapsed_ms,
        });

        RunResult {
            run_id,
            chain_name: chain.name().to_string(),
            status,
            final_context: state.context.snapshot(),
            history: state.history,
            failure: state.failure,
            exhausted_edges: state.exhausted,
            elapsed_ms,
        }
    }
}

/// Every required skill input must be mapped, and every mapped output must
/// be one the skill declares.
fn check_contract(node: &Node, skill: &dyn Skill) -> Result<()> {
    let violation = |message: String| SkillchainError::SkillContract {
        node: node.id.clone(),
        skill: node.skill.clone(),
        message,
    };

    for required in skill.required_inputs() {
        if !node.inputs.contains_key(required) {
            return Err(violation(format!("required input '{}' is not mapped", required)));
        }
    }
    for output in node.outputs.keys() {
        if !skill.outputs().contains(output) {
            return Err(violation(format!("output '{}' is not declared by the skill", output)));
        }
    }
    for input in node.inputs.keys() {
        let declared = skill.required_inputs().contains(input) || skill.optional_inputs().contains(input);
        if !declared {
            debug!(node_id = %node.id, input = %input, "Input not declared by skill, passing through");
        }
    }
    Ok(())
}

/// Collect a node's inputs from the phase snapshot.
fn gather_inputs(node: &Node, data: &HashMap<String, Value>) -> Result<SkillInputs> {
    let mut inputs = SkillInputs::new();
    for (name, source) in &node.inputs {
        match source {
            InputSource::Literal(value) => {
                inputs.insert(name.clone(), value.clone());
            }
            InputSource::Key { key, optional } => match data.get(key) {
                Some(value) => {
                    inputs.insert(name.clone(), value.clone());
                }
                None if *optional => {}
                None => return Err(SkillchainError::MissingKey(key.clone())),
            },
        }
    }
    Ok(inputs)
}

enum Flow {
    Continue,
    Halt(RunStatus),
}

enum NodeOutcome {
    /// Never acquired a slot because the run was halting.
    NotStarted,
    Done {
        record: ExecutionRecord,
        outputs: Option<SkillOutputs>,
    },
}

/// Mutable state of one run.
struct RunState<'r> {
    engine: &'r Engine,
    chain: &'r ChainDefinition,
    plan: &'r Plan,
    skills: &'r [Arc<dyn Skill>],
    run_id: RunId,
    context: ExecutionContext,
    node_timeout: Option<Duration>,
    semaphore: Arc<Semaphore>,
    /// Run cancellation, handed to skills.
    cancel: CancellationToken,
    /// Child of `cancel`, also fired by a critical failure. Stops new starts.
    halt: CancellationToken,
    /// Forward edges into each node.
    incoming: Vec<Vec<usize>>,
    /// All edges out of each node, in declaration order.
    outgoing: Vec<Vec<usize>>,
    /// `depends_on` predecessors of each node.
    depends_on: Vec<Vec<usize>>,
    /// Whether each node ran in its latest pass.
    ran: Vec<bool>,
    /// Whether each forward edge fired on its latest evaluation.
    fired: Vec<bool>,
    /// Re-entries taken per feedback edge.
    counters: Vec<u32>,
    disabled: Vec<bool>,
    attempts: Vec<u32>,
    history: Vec<ExecutionRecord>,
    exhausted: Vec<EdgeRef>,
    failure: Option<NodeFailure>,
}

impl<'r> RunState<'r> {
    fn new(
        engine: &'r Engine,
        prepared: &'r PreparedChain<'_>,
        run_id: RunId,
        context: ExecutionContext,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        let chain = prepared.chain;
        let n = chain.nodes().len();
        let edges = chain.edges().len();
        let mut incoming = vec![Vec::new(); n];
        let mut outgoing = vec![Vec::new(); n];
        for (e, edge) in chain.edges().iter().enumerate() {
            let (Some(from), Some(to)) = (chain.node_index(&edge.from), chain.node_index(&edge.to))
            else {
                continue;
            };
            outgoing[from].push(e);
            if !prepared.plan.is_feedback(e) {
                incoming[to].push(e);
            }
        }
        let depends_on = chain
            .nodes()
            .iter()
            .map(|node| node.depends_on.iter().filter_map(|d| chain.node_index(d)).collect())
            .collect();

        Self {
            engine,
            chain,
            plan: &prepared.plan,
            skills: &prepared.skills,
            run_id,
            context,
            node_timeout: options.node_timeout,
            semaphore: Arc::new(Semaphore::new(options.concurrency_limit.max(1))),
            halt: cancel.child_token(),
            cancel,
            incoming,
            outgoing,
            depends_on,
            ran: vec![false; n],
            fired: vec![false; edges],
            counters: vec![0; edges],
            disabled: vec![false; edges],
            attempts: vec![0; n],
            history: Vec::new(),
            exhausted: Vec::new(),
            failure: None,
        }
    }

    /// Every `depends_on` predecessor ran in its latest pass, and the node
    /// has no incoming forward edge or at least one of them fired.
    fn is_eligible(&self, node: usize) -> bool {
        if !self.depends_on[node].iter().all(|&d| self.ran[d]) {
            return false;
        }
        let incoming = &self.incoming[node];
        incoming.is_empty() || incoming.iter().any(|&e| self.fired[e])
    }

    /// Run phases in order. `reentry` names a feedback target that runs
    /// regardless of its incoming edges.
    fn run_phases(&mut self, phases: Vec<Vec<usize>>, reentry: Option<usize>) -> BoxFuture<'_, Flow> {
        async move {
            let chain = self.chain;
            let plan = self.plan;

            for phase in phases {
                if self.cancel.is_cancelled() {
                    return Flow::Halt(RunStatus::Cancelled);
                }

                let (eligible, skipped): (Vec<usize>, Vec<usize>) = phase
                    .into_iter()
                    .partition(|&v| Some(v) == reentry || self.is_eligible(v));
                for v in skipped {
                    debug!(node_id = %chain.nodes()[v].id, "Skipping node, dependencies not satisfied");
                    self.ran[v] = false;
                    for &e in &self.outgoing[v] {
                        self.fired[e] = false;
                    }
                }
                if eligible.is_empty() {
                    continue;
                }

                if let Flow::Halt(status) = self.run_phase(&eligible).await {
                    return Flow::Halt(status);
                }

                // Edges are evaluated against the merged context.
                let data = self.context.snapshot();
                let mut triggered = Vec::new();
                for &v in &eligible {
                    let mut pending = Vec::new();
                    for &e in &self.outgoing[v] {
                        let holds = chain.edges()[e].fires(&data);
                        if plan.is_feedback(e) {
                            if holds && !self.disabled[e] {
                                pending.push(e);
                            }
                        } else {
                            self.fired[e] = holds;
                        }
                    }

                    let forward_fired = self.outgoing[v]
                        .iter()
                        .any(|&e| !plan.is_feedback(e) && self.fired[e]);
                    for &e in &pending {
                        let edge = &chain.edges()[e];
                        let bound = edge.max_iterations.unwrap_or(1);
                        if self.counters[e] < bound {
                            self.counters[e] += 1;
                            triggered.push(e);
                            continue;
                        }

                        self.disabled[e] = true;
                        let edge_ref = EdgeRef {
                            from: edge.from.clone(),
                            to: edge.to.clone(),
                        };
                        warn!(
                            run_id = %self.run_id,
                            from = %edge.from,
                            to = %edge.to,
                            max_iterations = bound,
                            "Feedback edge exhausted"
                        );
                        self.engine.publish(ChainEvent::LoopExhausted {
                            run_id: self.run_id.clone(),
                            edge: edge_ref.clone(),
                        });
                        self.exhausted.push(edge_ref);

                        let other_feedback = pending.iter().any(|&o| o != e && !self.disabled[o]);
                        if !forward_fired && !other_feedback {
                            return Flow::Halt(RunStatus::LoopExhausted);
                        }
                    }
                }

                for e in triggered {
                    let Some(feedback) = plan.feedback_edge(e) else {
                        continue;
                    };
                    let iteration = self.counters[e];
                    info!(
                        run_id = %self.run_id,
                        from = %feedback.from,
                        to = %feedback.to,
                        iteration,
                        "Feedback edge re-entering"
                    );
                    self.engine.publish(ChainEvent::FeedbackTriggered {
                        run_id: self.run_id.clone(),
                        edge: EdgeRef {
                            from: feedback.from.clone(),
                            to: feedback.to.clone(),
                        },
                        iteration,
                    });

                    let body: Vec<Vec<usize>> = feedback
                        .body
                        .iter()
                        .map(|p| p.iter().filter_map(|id| chain.node_index(id)).collect())
                        .collect();
                    let target = chain.node_index(&feedback.to);
                    if let Flow::Halt(status) = self.run_phases(body, target).await {
                        return Flow::Halt(status);
                    }
                }
            }
            Flow::Continue
        }
        .boxed()
    }

    /// Run one phase: concurrent invocations over a shared snapshot, then a
    /// merge in node-id order.
    async fn run_phase(&mut self, eligible: &[usize]) -> Flow {
        let chain = self.chain;
        let attempts: Vec<u32> = eligible
            .iter()
            .map(|&v| {
                self.attempts[v] += 1;
                self.attempts[v]
            })
            .collect();
        let snapshot = self.context.snapshot();

        let outcomes = {
            let this = &*self;
            join_all(
                eligible
                    .iter()
                    .zip(&attempts)
                    .map(|(&v, &attempt)| this.invoke(v, attempt, &snapshot)),
            )
            .await
        };

        let mut critical: Option<NodeFailure> = None;
        for (&v, outcome) in eligible.iter().zip(outcomes) {
            let node = &chain.nodes()[v];
            let (record, outputs) = match outcome {
                NodeOutcome::NotStarted => {
                    self.attempts[v] -= 1;
                    self.ran[v] = false;
                    continue;
                }
                NodeOutcome::Done { record, outputs } => (record, outputs),
            };
            self.ran[v] = true;

            if let Some(outputs) = outputs {
                self.merge_outputs(node, outputs);
            }
            if !record.succeeded() {
                let failure = NodeFailure {
                    node_id: node.id.clone(),
                    attempt: record.attempt,
                    code: record.error_code.clone().unwrap_or_default(),
                    message: record.error.clone().unwrap_or_default(),
                };
                if node.non_critical {
                    warn!(
                        node_id = %node.id,
                        code = %failure.code,
                        error = %failure.message,
                        "Non-critical node failed, continuing"
                    );
                } else if critical.is_none() {
                    error!(
                        node_id = %node.id,
                        code = %failure.code,
                        error = %failure.message,
                        "Critical node failed"
                    );
                    critical = Some(failure);
                }
            }
            self.push_record(record);
        }

        if let Some(failure) = critical {
            self.failure = Some(failure);
            return Flow::Halt(RunStatus::Failed);
        }
        if self.cancel.is_cancelled() {
            return Flow::Halt(RunStatus::Cancelled);
        }
        Flow::Continue
    }

    async fn invoke(&self, v: usize, attempt: u32, snapshot: &HashMap<String, Value>) -> NodeOutcome {
        let node = &self.chain.nodes()[v];
        let skill = &self.skills[v];

        let _permit = tokio::select! {
            biased;
            _ = self.halt.cancelled() => return NodeOutcome::NotStarted,
            permit = self.semaphore.acquire() => match permit {
                Ok(p) => p,
                Err(_) => return NodeOutcome::NotStarted,
            },
        };

        debug!(run_id = %self.run_id, node_id = %node.id, attempt, skill = %node.skill, "Node started");
        self.engine.publish(ChainEvent::NodeStarted {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
        });

        let start_time = Utc::now();
        let started = Instant::now();
        let result = self.call_skill(node, skill.as_ref(), attempt, snapshot).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut record = ExecutionRecord {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
            start_time,
            duration_ms,
            status: NodeStatus::Success,
            error: None,
            error_code: None,
        };

        match result {
            Ok(outputs) => {
                debug!(node_id = %node.id, attempt, duration_ms, "Node succeeded");
                NodeOutcome::Done {
                    record,
                    outputs: Some(outputs),
                }
            }
            Err(e) => {
                if !node.non_critical {
                    self.halt.cancel();
                }
                let (code, message) = match e {
                    SkillchainError::Skill { source, .. } => (source.code, source.message),
                    other => (other.code().to_string(), other.to_string()),
                };
                record.status = NodeStatus::Failed;
                record.error = Some(message);
                record.error_code = Some(code);
                NodeOutcome::Done {
                    record,
                    outputs: None,
                }
            }
        }
    }

    async fn call_skill(
        &self,
        node: &Node,
        skill: &dyn Skill,
        attempt: u32,
        snapshot: &HashMap<String, Value>,
    ) -> Result<SkillOutputs> {
        let inputs = gather_inputs(node, snapshot)?;
        let ctx = SkillContext {
            run_id: self.run_id.clone(),
            node_id: node.id.clone(),
            attempt,
            cancel: self.cancel.clone(),
        };
        let timeout = node
            .timeout_ms
            .map(Duration::from_millis)
            .or_else(|| skill.timeout())
            .or(self.node_timeout);

        let execution = skill.execute(inputs, ctx);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, execution).await.map_err(|_| {
                SkillchainError::Timeout {
                    node: node.id.clone(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => execution.await,
        };
        result.map_err(|source| SkillchainError::Skill {
            node: node.id.clone(),
            source,
        })
    }

    /// Write mapped outputs to the context. Unmapped outputs are dropped.
    fn merge_outputs(&self, node: &Node, mut outputs: SkillOutputs) {
        let mut writes = Vec::with_capacity(node.outputs.len());
        for (name, key) in &node.outputs {
            if let Some(value) = outputs.remove(name) {
                writes.push((key.clone(), value));
            }
        }
        if !outputs.is_empty() {
            debug!(
                node_id = %node.id,
                unmapped = outputs.len(),
                "Dropping unmapped skill outputs"
            );
        }
        self.context.merge(writes);
    }

    fn push_record(&mut self, record: ExecutionRecord) {
        if let Err(e) = self.engine.recorder.record(&record) {
            warn!(node_id = %record.node_id, error = %e, "Failed to persist execution record");
        }
        self.engine.publish(ChainEvent::NodeFinished {
            record: record.clone(),
        });
        self.history.push(record);
    }
}
