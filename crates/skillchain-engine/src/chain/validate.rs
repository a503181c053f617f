//! Structural validation run when a chain is constructed.
//!
//! Checks run in a fixed order and the first failure wins: node ids, then
//! dangling references, then cycles, then data flow.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use skillchain_core::error::{Result, SkillchainError};
use skillchain_core::types::is_valid_identifier;

use super::definition::{ChainDefinition, GraphType, InputSource};
use crate::graph::Digraph;
use crate::plan::split_feedback;

pub(crate) fn validate(chain: &ChainDefinition) -> Result<()> {
    check_ids(chain)?;
    check_references(chain)?;
    check_cycles(chain)?;
    check_inputs(chain)?;
    check_writers(chain)?;
    debug!(
        chain = %chain.name(),
        nodes = chain.nodes().len(),
        edges = chain.edges().len(),
        "Chain validated"
    );
    Ok(())
}

/// Whether the edge graph (ignoring bounds) contains any cycle.
pub(crate) fn has_cycle(chain: &ChainDefinition) -> bool {
    edge_graph(chain, |_| true).is_cyclic()
}

fn check_ids(chain: &ChainDefinition) -> Result<()> {
    if chain.name().trim().is_empty() {
        return Err(SkillchainError::MalformedChain(
            "chain_name must not be empty".into(),
        ));
    }
    for node in chain.nodes() {
        let simple_id = !node.id.is_empty()
            && node
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !simple_id {
            return Err(SkillchainError::MalformedChain(format!(
                "invalid node id '{}' (allowed: letters, digits, '_' and '-')",
                node.id
            )));
        }
        if !is_valid_identifier(&node.skill) {
            return Err(SkillchainError::MalformedChain(format!(
                "node '{}' has invalid skill identifier '{}'",
                node.id, node.skill
            )));
        }
    }
    for edge in chain.edges() {
        if edge.max_iterations == Some(0) {
            return Err(SkillchainError::MalformedChain(format!(
                "edge {} -> {}: max_iterations must be positive",
                edge.from, edge.to
            )));
        }
    }
    Ok(())
}

fn check_references(chain: &ChainDefinition) -> Result<()> {
    for edge in chain.edges() {
        for end in [&edge.from, &edge.to] {
            if chain.node_index(end).is_none() {
                return Err(SkillchainError::DanglingEdge {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    missing: end.clone(),
                });
            }
        }
    }
    for node in chain.nodes() {
        for dep in &node.depends_on {
            if chain.node_index(dep).is_none() {
                return Err(SkillchainError::DanglingEdge {
                    from: dep.clone(),
                    to: node.id.clone(),
                    missing: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_cycles(chain: &ChainDefinition) -> Result<()> {
    let ids = |cycle: Vec<usize>| -> Vec<String> {
        cycle
            .into_iter()
            .map(|i| chain.nodes()[i].id.clone())
            .collect()
    };

    match chain.graph_type() {
        GraphType::Dag => {
            if let Some(cycle) = edge_graph(chain, |_| true).find_cycle() {
                return Err(SkillchainError::UnexpectedCycle(ids(cycle)));
            }
        }
        GraphType::Dcg => {
            // Every cycle must pass through at least one bounded edge.
            if let Some(cycle) = edge_graph(chain, |bounded| !bounded).find_cycle() {
                return Err(SkillchainError::UnboundedCycle(ids(cycle)));
            }
        }
    }
    Ok(())
}

/// Every context-key input must be a chain input or written by an ancestor.
/// Required inputs count only ancestors in the acyclic skeleton; a key that
/// arrives solely over a feedback edge can satisfy an optional input.
fn check_inputs(chain: &ChainDefinition) -> Result<()> {
    let (skeleton, _) = split_feedback(chain);
    let deps = dependency_graph(chain);
    let writers = writers_by_key(chain);
    let chain_inputs: HashSet<&str> = chain.inputs().iter().map(String::as_str).collect();

    for (idx, node) in chain.nodes().iter().enumerate() {
        let upstream = skeleton.ancestors(idx);
        let looped = deps.ancestors(idx);
        for (input, source) in &node.inputs {
            let InputSource::Key { key, optional } = source else {
                continue;
            };
            if chain_inputs.contains(key.as_str()) {
                continue;
            }
            let ancestors = if *optional { &looped } else { &upstream };
            let provided = writers
                .get(key.as_str())
                .is_some_and(|ws| ws.iter().any(|&w| ancestors[w]));
            if !provided {
                return Err(SkillchainError::UnresolvedInput {
                    node: node.id.clone(),
                    input: input.clone(),
                    key: key.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Two nodes may write the same key only if one runs upstream of the other.
fn check_writers(chain: &ChainDefinition) -> Result<()> {
    let deps = dependency_graph(chain);
    let mut keys: Vec<(&str, Vec<usize>)> = writers_by_key(chain).into_iter().collect();
    keys.sort_by(|a, b| a.0.cmp(b.0));

    for (key, writers) in keys {
        for (i, &a) in writers.iter().enumerate() {
            for &b in &writers[i + 1..] {
                if !deps.reaches(a, b) && !deps.reaches(b, a) {
                    return Err(SkillchainError::MalformedChain(format!(
                        "nodes '{}' and '{}' both write '{}' with no ordering between them",
                        chain.nodes()[a].id,
                        chain.nodes()[b].id,
                        key
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Edge graph restricted to edges whose boundedness passes `keep`.
fn edge_graph(chain: &ChainDefinition, keep: impl Fn(bool) -> bool) -> Digraph {
    let mut g = Digraph::new(chain.nodes().len());
    for edge in chain.edges() {
        if !keep(edge.is_bounded()) {
            continue;
        }
        if let (Some(a), Some(b)) = (chain.node_index(&edge.from), chain.node_index(&edge.to)) {
            g.add_edge(a, b);
        }
    }
    g
}

/// All edges (feedback included) plus `depends_on`.
fn dependency_graph(chain: &ChainDefinition) -> Digraph {
    let mut g = edge_graph(chain, |_| true);
    for (idx, node) in chain.nodes().iter().enumerate() {
        for dep in &node.depends_on {
            if let Some(d) = chain.node_index(dep) {
                g.add_edge(d, idx);
            }
        }
    }
    g
}

fn writers_by_key(chain: &ChainDefinition) -> HashMap<&str, Vec<usize>> {
    let mut writers: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, node) in chain.nodes().iter().enumerate() {
        for key in node.written_keys() {
            let entry = writers.entry(key).or_default();
            if !entry.contains(&idx) {
                entry.push(idx);
            }
        }
    }
    writers
}
