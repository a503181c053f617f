//! TOML / JSON chain files.
//!
//! ```toml
//! chain_name = "extract-validate"
//! graph_type = "DCG"
//! inputs = ["text"]
//!
//! [[nodes]]
//! id = "extract"
//! skill = "energy.extraction.glossary"
//! inputs = { text = "text", hint = { key = "validate.hint", optional = true } }
//! outputs = ["terms"]                  # written to "extract.terms"
//!
//! [[nodes]]
//! id = "validate"
//! skill = "energy.validate"
//! inputs = { terms = "extract.terms", strict = { literal = true } }
//! outputs = { valid = "valid", hint = "validate.hint" }
//!
//! [[edges]]
//! from = "extract"
//! to = "validate"
//!
//! [[edges]]
//! from = "validate"
//! to = "extract"
//! condition = "not valid"
//! max_iterations = 3
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use skillchain_core::error::{Result, SkillchainError};

use super::definition::{
    output_key, ChainAnnotations, ChainDefinition, Edge, GraphType, InputSource, Node,
};
use crate::condition::Condition;

/// Serialization format of a chain file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFormat {
    Toml,
    Json,
}

impl ChainFormat {
    /// Pick the format from a file extension (`.json` → JSON, anything else → TOML).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawChain {
    chain_name: String,
    graph_type: GraphType,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    annotations: ChainAnnotations,
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<RawEdge>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    skill: String,
    #[serde(default)]
    inputs: BTreeMap<String, RawInput>,
    #[serde(default)]
    outputs: RawOutputs,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    non_critical: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInput {
    Key(String),
    Spec(RawInputSpec),
    Literal(serde_json::Value),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawInputSpec {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    literal: Option<serde_json::Value>,
    #[serde(default)]
    optional: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawOutputs {
    Namespaced(Vec<String>),
    Aliased(BTreeMap<String, String>),
}

impl Default for RawOutputs {
    fn default() -> Self {
        Self::Namespaced(vec![])
    }
}

#[derive(Debug, Deserialize)]
struct RawEdge {
    from: String,
    to: String,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    max_iterations: Option<i64>,
}

/// Parse a chain from text in the given format.
pub fn parse(raw: &str, format: ChainFormat) -> Result<ChainDefinition> {
    let chain: RawChain = match format {
        ChainFormat::Toml => {
            toml::from_str(raw).map_err(|e| SkillchainError::MalformedChain(e.to_string()))?
        }
        ChainFormat::Json => serde_json::from_str(raw)
            .map_err(|e| SkillchainError::MalformedChain(e.to_string()))?,
    };
    build(chain)
}

/// Read and parse a chain file; the format follows the extension.
pub fn parse_file(path: &Path) -> Result<ChainDefinition> {
    let content = std::fs::read_to_string(path)?;
    debug!(path = %path.display(), "Parsing chain file");
    parse(&content, ChainFormat::from_path(path))
}

impl ChainDefinition {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        parse(raw, ChainFormat::Toml)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        parse(raw, ChainFormat::Json)
    }
}

fn build(raw: RawChain) -> Result<ChainDefinition> {
    let nodes = raw
        .nodes
        .into_iter()
        .map(build_node)
        .collect::<Result<Vec<_>>>()?;
    let edges = raw
        .edges
        .into_iter()
        .map(build_edge)
        .collect::<Result<Vec<_>>>()?;

    ChainDefinition::new(
        raw.chain_name,
        raw.graph_type,
        raw.inputs,
        nodes,
        edges,
        raw.annotations,
    )
}

fn build_node(raw: RawNode) -> Result<Node> {
    let mut inputs = BTreeMap::new();
    for (name, input) in raw.inputs {
        let source = match input {
            RawInput::Key(key) => InputSource::key(key),
            RawInput::Literal(value) => InputSource::Literal(value),
            RawInput::Spec(spec) => match (spec.key, spec.literal) {
                (Some(key), None) => InputSource::Key {
                    key,
                    optional: spec.optional,
                },
                (None, Some(value)) => InputSource::Literal(value),
                _ => {
                    return Err(SkillchainError::MalformedChain(format!(
                        "node '{}' input '{}' must set exactly one of 'key' or 'literal'",
                        raw.id, name
                    )))
                }
            },
        };
        inputs.insert(name, source);
    }

    let outputs = match raw.outputs {
        RawOutputs::Namespaced(names) => names
            .into_iter()
            .map(|name| {
                let key = output_key(&raw.id, &name);
                (name, key)
            })
            .collect(),
        RawOutputs::Aliased(map) => map,
    };

    Ok(Node {
        id: raw.id,
        skill: raw.skill,
        inputs,
        outputs,
        depends_on: raw.depends_on,
        non_critical: raw.non_critical,
        timeout_ms: raw.timeout_ms,
    })
}

fn build_edge(raw: RawEdge) -> Result<Edge> {
    let condition = raw
        .condition
        .as_deref()
        .map(Condition::parse)
        .transpose()
        .map_err(|e| {
            SkillchainError::MalformedChain(format!(
                "edge {} -> {}: invalid condition: {}",
                raw.from, raw.to, e
            ))
        })?;

    let max_iterations = match raw.max_iterations {
        None => None,
        Some(n) if n >= 1 && n <= u32::MAX as i64 => Some(n as u32),
        Some(n) => {
            return Err(SkillchainError::MalformedChain(format!(
                "edge {} -> {}: max_iterations must be a positive integer, got {}",
                raw.from, raw.to, n
            )))
        }
    };

    Ok(Edge {
        from: raw.from,
        to: raw.to,
        condition,
        max_iterations,
    })
}
