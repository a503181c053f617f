use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::warn;

use skillchain_core::error::Result;

use crate::condition::Condition;

/// Whether a chain may contain cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphType {
    #[serde(rename = "DAG", alias = "dag")]
    Dag,
    #[serde(rename = "DCG", alias = "dcg")]
    Dcg,
}

impl std::fmt::Display for GraphType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dag => write!(f, "DAG"),
            Self::Dcg => write!(f, "DCG"),
        }
    }
}

/// Where a skill input gets its value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Read from the execution context. Optional keys that are absent at
    /// invocation time are omitted instead of failing the node.
    Key { key: String, optional: bool },
    /// A constant baked into the chain.
    Literal(serde_json::Value),
}

impl InputSource {
    pub fn key(key: impl Into<String>) -> Self {
        Self::Key {
            key: key.into(),
            optional: false,
        }
    }

    pub fn optional(key: impl Into<String>) -> Self {
        Self::Key {
            key: key.into(),
            optional: true,
        }
    }

    /// The context key read, if any.
    pub fn context_key(&self) -> Option<&str> {
        match self {
            Self::Key { key, .. } => Some(key),
            Self::Literal(_) => None,
        }
    }
}

/// Advisory chain metadata. Recorded, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainAnnotations {
    #[serde(default)]
    pub is_cyclic: Option<bool>,
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub parallel_execution: Option<bool>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The context key a namespaced node output is written to.
pub fn output_key(node_id: &str, output: &str) -> String {
    format!("{}.{}", node_id, output)
}

/// A node in a chain: one skill invocation with its data mappings.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    /// Unique identifier within the chain.
    pub id: String,
    /// Fully qualified skill name.
    pub skill: String,
    /// Skill input name → source.
    pub inputs: BTreeMap<String, InputSource>,
    /// Skill output name → context key it is written to.
    pub outputs: BTreeMap<String, String>,
    /// Explicit ordering dependencies (node ids).
    pub depends_on: Vec<String>,
    /// Failures of a non-critical node are absorbed.
    pub non_critical: bool,
    /// Per-invocation timeout, overriding skill and engine defaults.
    pub timeout_ms: Option<u64>,
}

impl Node {
    pub fn new(id: impl Into<String>, skill: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            skill: skill.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            depends_on: vec![],
            non_critical: false,
            timeout_ms: None,
        }
    }

    /// Map a skill input to a required context key.
    pub fn with_input(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), InputSource::key(key));
        self
    }

    /// Map a skill input to an optional context key.
    pub fn with_optional_input(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), InputSource::optional(key));
        self
    }

    /// Bind a skill input to a literal value.
    pub fn with_literal(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.inputs.insert(name.into(), InputSource::Literal(value));
        self
    }

    /// Write a skill output to `<id>.<name>`.
    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = output_key(&self.id, &name);
        self.outputs.insert(name, key);
        self
    }

    /// Write a skill output to an explicit context key.
    pub fn with_output_alias(mut self, name: impl Into<String>, key: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), key.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn non_critical(mut self) -> Self {
        self.non_critical = true;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Context keys this node writes.
    pub fn written_keys(&self) -> impl Iterator<Item = &str> {
        self.outputs.values().map(String::as_str)
    }
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    /// Fires only when the condition holds; unconditional edges always fire.
    pub condition: Option<Condition>,
    /// Bound on how often this edge may re-enter its target.
    pub max_iterations: Option<u32>,
}

impl Edge {
    /// An unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
            max_iterations: None,
        }
    }

    /// An edge guarded by a condition expression.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: &str,
    ) -> std::result::Result<Self, crate::condition::ConditionError> {
        Ok(Self {
            condition: Some(Condition::parse(expr)?),
            ..Self::always(from, to)
        })
    }

    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn is_bounded(&self) -> bool {
        self.max_iterations.is_some()
    }

    /// Evaluate the guard against context data.
    pub fn fires(&self, data: &HashMap<String, serde_json::Value>) -> bool {
        self.condition.as_ref().map_or(true, |c| c.evaluate(data))
    }
}

/// A validated, immutable chain.
///
/// Construction goes through [`ChainDefinition::new`] (or the parsers in
/// [`crate::chain::parse`]), which rejects structurally invalid chains.
#[derive(Debug, Clone)]
pub struct ChainDefinition {
    name: String,
    graph_type: GraphType,
    inputs: Vec<String>,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    annotations: ChainAnnotations,
    index: HashMap<String, usize>,
}

impl ChainDefinition {
    /// Build and validate a chain.
    pub fn new(
        name: impl Into<String>,
        graph_type: GraphType,
        inputs: Vec<String>,
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        annotations: ChainAnnotations,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.clone(), i).is_some() {
                return Err(skillchain_core::SkillchainError::DuplicateNode(
                    node.id.clone(),
                ));
            }
        }

        let chain = Self {
            name: name.into(),
            graph_type,
            inputs,
            nodes,
            edges,
            annotations,
            index,
        };
        super::validate::validate(&chain)?;
        chain.check_annotations();
        Ok(chain)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn graph_type(&self) -> GraphType {
        self.graph_type
    }

    /// Context keys the caller is expected to provide.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Edges in declaration order.
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn annotations(&self) -> &ChainAnnotations {
        &self.annotations
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Declaration index of a node.
    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Distinct skill identifiers referenced by the chain, sorted.
    pub fn skill_refs(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.nodes.iter().map(|n| n.skill.as_str()).collect();
        refs.sort_unstable();
        refs.dedup();
        refs
    }

    fn check_annotations(&self) {
        if let Some(declared) = self.annotations.is_cyclic {
            let actual = super::validate::has_cycle(self);
            if declared != actual {
                warn!(
                    chain = %self.name,
                    declared,
                    actual,
                    "Chain annotation is_cyclic does not match the graph"
                );
            }
        }
    }
}
