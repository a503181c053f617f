//! Phase planning.
//!
//! The chain is reduced to an acyclic skeleton (all `depends_on` links,
//! unbounded edges, and bounded edges that do not close a cycle). Bounded
//! edges that point back to a node reached earlier from the chain's entry
//! become feedback edges. The skeleton is
//! layered with Kahn's algorithm; each layer is a phase whose nodes may run
//! concurrently.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;
use tracing::debug;

use skillchain_core::error::{Result, SkillchainError};

use crate::chain::ChainDefinition;
use crate::graph::Digraph;

/// A bounded edge that re-enters an earlier part of the chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackEdge {
    /// Index into `ChainDefinition::edges`.
    pub edge: usize,
    pub from: String,
    pub to: String,
    pub max_iterations: u32,
    /// Nodes re-executed when the edge fires: everything on a skeleton path
    /// from `to` to `from`, grouped by phase.
    pub body: Vec<Vec<String>>,
}

/// Execution plan for a chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub phases: Vec<Vec<String>>,
    pub feedback: Vec<FeedbackEdge>,
    #[serde(skip)]
    phase_of: HashMap<String, usize>,
    #[serde(skip)]
    is_feedback: Vec<bool>,
}

impl Plan {
    /// Phase index of a node.
    pub fn phase_of(&self, node_id: &str) -> Option<usize> {
        self.phase_of.get(node_id).copied()
    }

    /// Whether the edge at `edge` (declaration index) is a feedback edge.
    pub fn is_feedback(&self, edge: usize) -> bool {
        self.is_feedback.get(edge).copied().unwrap_or(false)
    }

    /// The feedback entry for an edge index.
    pub fn feedback_edge(&self, edge: usize) -> Option<&FeedbackEdge> {
        self.feedback.iter().find(|f| f.edge == edge)
    }

    /// Node ids in plan order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().flatten().map(String::as_str)
    }
}

/// Split a chain into its acyclic skeleton and its feedback edges.
///
/// A depth-first walk over every link (edges and `depends_on`), started from
/// the entry nodes in declaration order, marks the edges that point back to a
/// node still being walked. Bounded edges then join the skeleton with those
/// loop-closing edges last; any bounded edge whose target can already reach
/// its source becomes a feedback edge. Returns the skeleton and a per-edge
/// feedback flag.
pub(crate) fn split_feedback(chain: &ChainDefinition) -> (Digraph, Vec<bool>) {
    let nodes = chain.nodes();
    let n = nodes.len();
    let ends: Vec<Option<(usize, usize)>> = chain
        .edges()
        .iter()
        .map(|edge| Some((chain.node_index(&edge.from)?, chain.node_index(&edge.to)?)))
        .collect();

    let mut skeleton = Digraph::new(n);
    let mut links = Digraph::new(n);
    let mut entry = vec![true; n];
    for (i, node) in nodes.iter().enumerate() {
        for dep in &node.depends_on {
            if let Some(d) = chain.node_index(dep) {
                skeleton.add_edge(d, i);
                links.add_edge(d, i);
                entry[i] = false;
            }
        }
    }
    for (edge, end) in chain.edges().iter().zip(&ends) {
        let Some((a, b)) = *end else {
            continue;
        };
        links.add_edge(a, b);
        if a != b {
            entry[b] = false;
        }
        if !edge.is_bounded() {
            skeleton.add_edge(a, b);
        }
    }

    let roots: Vec<usize> = (0..n).filter(|&v| entry[v]).collect();
    let back = links.back_edges(roots.into_iter().chain(0..n));
    let closes_loop = |e: usize| ends[e].is_some_and(|pair| back.contains(&pair));

    let mut bounded: Vec<usize> = (0..chain.edges().len())
        .filter(|&e| chain.edges()[e].is_bounded())
        .collect();
    bounded.sort_by_key(|&e| closes_loop(e));

    let mut is_feedback = vec![false; chain.edges().len()];
    for e in bounded {
        let Some((a, b)) = ends[e] else {
            continue;
        };
        if skeleton.reaches(b, a) {
            is_feedback[e] = true;
        } else {
            skeleton.add_edge(a, b);
        }
    }
    (skeleton, is_feedback)
}

/// Compute the phase plan for a validated chain.
pub fn plan(chain: &ChainDefinition) -> Result<Plan> {
    let nodes = chain.nodes();
    let n = nodes.len();
    let idx = |id: &str| chain.node_index(id);
    let (skeleton, is_feedback) = split_feedback(chain);

    let layers = layer(chain, &skeleton)?;
    let mut phase_of_idx = vec![0usize; n];
    for (p, layer) in layers.iter().enumerate() {
        for &v in layer {
            phase_of_idx[v] = p;
        }
    }

    let mut feedback = Vec::new();
    for (e, edge) in chain.edges().iter().enumerate() {
        if !is_feedback[e] {
            continue;
        }
        let (Some(src), Some(dst)) = (idx(&edge.from), idx(&edge.to)) else {
            continue;
        };
        let body: Vec<Vec<String>> = layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .filter(|&&v| skeleton.reaches(dst, v) && skeleton.reaches(v, src))
                    .map(|&v| nodes[v].id.clone())
                    .collect::<Vec<_>>()
            })
            .filter(|phase| !phase.is_empty())
            .collect();
        debug!(
            from = %edge.from,
            to = %edge.to,
            body_nodes = body.iter().map(Vec::len).sum::<usize>(),
            "Feedback edge"
        );
        feedback.push(FeedbackEdge {
            edge: e,
            from: edge.from.clone(),
            to: edge.to.clone(),
            max_iterations: edge.max_iterations.unwrap_or(1),
            body,
        });
    }

    let phases: Vec<Vec<String>> = layers
        .iter()
        .map(|layer| layer.iter().map(|&v| nodes[v].id.clone()).collect())
        .collect();
    let phase_of = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.clone(), phase_of_idx[i]))
        .collect();

    debug!(
        chain = %chain.name(),
        phases = phases.len(),
        feedback_edges = feedback.len(),
        "Chain planned"
    );

    Ok(Plan {
        phases,
        feedback,
        phase_of,
        is_feedback,
    })
}

/// Kahn's algorithm. Each layer is sorted by node id.
fn layer(chain: &ChainDefinition, skeleton: &Digraph) -> Result<Vec<Vec<usize>>> {
    let nodes = chain.nodes();
    let n = nodes.len();
    let mut indegree = vec![0usize; n];
    for v in 0..n {
        for w in skeleton.successors(v) {
            indegree[w] += 1;
        }
    }

    let by_id = |set: BTreeSet<(&str, usize)>| -> Vec<usize> { set.into_iter().map(|(_, v)| v).collect() };

    let mut ready: BTreeSet<(&str, usize)> = (0..n)
        .filter(|&v| indegree[v] == 0)
        .map(|v| (nodes[v].id.as_str(), v))
        .collect();
    let mut layers = Vec::new();
    let mut scheduled = 0;

    while !ready.is_empty() {
        let current = by_id(std::mem::take(&mut ready));
        for &v in &current {
            for w in skeleton.successors(v) {
                indegree[w] -= 1;
                if indegree[w] == 0 {
                    ready.insert((nodes[w].id.as_str(), w));
                }
            }
        }
        scheduled += current.len();
        layers.push(current);
    }

    if scheduled < n {
        let mut stuck: Vec<String> = (0..n)
            .filter(|&v| indegree[v] > 0)
            .map(|v| nodes[v].id.clone())
            .collect();
        stuck.sort();
        return Err(SkillchainError::Resolution(stuck));
    }
    Ok(layers)
}
