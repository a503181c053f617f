//! Node-indexed digraph shared by the validator and the planner.
//!
//! Graph node `i` is the chain node at declaration index `i`.

use petgraph::algo::{astar, has_path_connecting, is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Dfs, DfsEvent, Reversed};

#[derive(Debug, Clone)]
pub(crate) struct Digraph {
    graph: DiGraph<(), ()>,
}

impl Digraph {
    pub fn new(n: usize) -> Self {
        let mut graph = DiGraph::with_capacity(n, n);
        for _ in 0..n {
            graph.add_node(());
        }
        Self { graph }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn add_edge(&mut self, from: usize, to: usize) {
        self.graph
            .update_edge(NodeIndex::new(from), NodeIndex::new(to), ());
    }

    pub fn successors(&self, v: usize) -> impl Iterator<Item = usize> + '_ {
        self.graph.neighbors(NodeIndex::new(v)).map(NodeIndex::index)
    }

    /// Whether a path (possibly empty) leads from `from` to `to`.
    pub fn reaches(&self, from: usize, to: usize) -> bool {
        has_path_connecting(&self.graph, NodeIndex::new(from), NodeIndex::new(to), None)
    }

    /// Nodes with a path of at least one edge into `v`. `v` itself is
    /// included only when it sits on a cycle.
    pub fn ancestors(&self, v: usize) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        let start = NodeIndex::new(v);
        let reversed = Reversed(&self.graph);
        let mut dfs = Dfs::new(reversed, start);
        while let Some(nx) = dfs.next(reversed) {
            if nx != start {
                seen[nx.index()] = true;
            }
        }
        let on_cycle = self.successors(v).any(|s| s == v || seen[s]);
        seen[v] = on_cycle;
        seen
    }

    /// Edges that close a cycle during a depth-first walk started from each
    /// of `starts` in turn (already visited starts are passed over).
    pub fn back_edges(&self, starts: impl IntoIterator<Item = usize>) -> Vec<(usize, usize)> {
        let mut back = Vec::new();
        depth_first_search(&self.graph, starts.into_iter().map(NodeIndex::new), |event| {
            if let DfsEvent::BackEdge(u, v) = event {
                back.push((u.index(), v.index()));
            }
        });
        back
    }

    pub fn is_cyclic(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    /// Find a cycle, returned as the node sequence `v0 .. vk` where `vk → v0`
    /// closes it. The cycle starts at the lowest index of any cyclic
    /// strongly connected component.
    pub fn find_cycle(&self) -> Option<Vec<usize>> {
        let start = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|scc| match scc.as_slice() {
                [only] => self.graph.contains_edge(*only, *only),
                _ => true,
            })
            .filter_map(|scc| scc.into_iter().min())
            .min()?;

        if self.graph.contains_edge(start, start) {
            return Some(vec![start.index()]);
        }
        // Shortest way back to `start` from its lowest successor in the component.
        let next = self
            .graph
            .neighbors(start)
            .filter(|&w| has_path_connecting(&self.graph, w, start, None))
            .min()?;
        let (_, path) = astar(&self.graph, next, |n| n == start, |_| 1u32, |_| 0)?;
        let mut cycle = vec![start.index()];
        cycle.extend(path.iter().take(path.len() - 1).map(|n| n.index()));
        Some(cycle)
    }
}
