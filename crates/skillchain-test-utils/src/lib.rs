//! Shared test utilities: scripted skills, counting loaders, chain fixtures.

pub mod fixtures;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use skillchain_core::error::Result;
use skillchain_core::traits::{Skill, SkillLoader};
use skillchain_core::types::{SkillContext, SkillError, SkillInputs, SkillOutputs};

type Behavior = dyn Fn(&SkillInputs, u32) -> std::result::Result<SkillOutputs, SkillError> + Send + Sync;

/// Tracks how many invocations are in flight at once across skills.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A scripted skill for engine tests.
///
/// The behavior closure receives the inputs and the 1-based attempt number.
pub struct MockSkill {
    name: String,
    inputs: Vec<String>,
    optional_inputs: Vec<String>,
    outputs: Vec<String>,
    delay: Option<Duration>,
    timeout: Option<Duration>,
    behavior: Arc<Behavior>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<SkillInputs>>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
}

impl MockSkill {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: vec![],
            optional_inputs: vec![],
            outputs: vec![],
            delay: None,
            timeout: None,
            behavior: Arc::new(|_, _| Ok(SkillOutputs::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
            gauge: None,
        }
    }

    pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
        self.inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_optional_inputs(mut self, inputs: &[&str]) -> Self {
        self.optional_inputs = inputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_outputs(mut self, outputs: &[&str]) -> Self {
        self.outputs = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    /// Skill-level timeout reported through `Skill::timeout`.
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(Duration::from_millis(ms));
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    pub fn returning<F>(mut self, f: F) -> Self
    where
        F: Fn(&SkillInputs, u32) -> std::result::Result<SkillOutputs, SkillError>
            + Send
            + Sync
            + 'static,
    {
        self.behavior = Arc::new(f);
        self
    }

    /// Always fail with the given code.
    pub fn failing(self, code: &str) -> Self {
        let code = code.to_string();
        self.returning(move |_, _| Err(SkillError::new(code.clone(), "scripted failure")))
    }

    /// Shared invocation counter.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared log of the inputs each invocation received.
    pub fn inputs_log(&self) -> Arc<Mutex<Vec<SkillInputs>>> {
        self.seen.clone()
    }
}

impl Skill for MockSkill {
    fn name(&self) -> &str {
        &self.name
    }

    fn required_inputs(&self) -> &[String] {
        &self.inputs
    }

    fn optional_inputs(&self) -> &[String] {
        &self.optional_inputs
    }

    fn outputs(&self) -> &[String] {
        &self.outputs
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn execute(
        &self,
        inputs: SkillInputs,
        ctx: SkillContext,
    ) -> BoxFuture<'_, std::result::Result<SkillOutputs, SkillError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(inputs.clone());
            }
            if let Some(ref gauge) = self.gauge {
                gauge.enter();
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let result = (self.behavior)(&inputs, ctx.attempt);
            if let Some(ref gauge) = self.gauge {
                gauge.exit();
            }
            result
        })
    }
}

/// Build an outputs map from `(name, value)` pairs.
pub fn outputs<const N: usize>(pairs: [(&str, serde_json::Value); N]) -> SkillOutputs {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// A loader over a fixed set of skills that counts load calls.
pub struct CountingLoader {
    skills: HashMap<String, Arc<dyn Skill>>,
    loads: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl CountingLoader {
    pub fn new() -> Self {
        Self {
            skills: HashMap::new(),
            loads: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    pub fn with_skill(mut self, skill: impl Skill) -> Self {
        self.skills.insert(skill.name().to_string(), Arc::new(skill));
        self
    }

    pub fn with_delay_ms(mut self, ms: u64) -> Self {
        self.delay = Some(Duration::from_millis(ms));
        self
    }

    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        self.loads.clone()
    }
}

impl Default for CountingLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SkillLoader for CountingLoader {
    fn name(&self) -> &str {
        "counting"
    }

    fn load(&self, fqsn: &str) -> BoxFuture<'_, Result<Option<Arc<dyn Skill>>>> {
        let fqsn = fqsn.to_string();
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(self.skills.get(&fqsn).cloned())
        })
    }
}
