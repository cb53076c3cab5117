use std::collections::HashMap;

use petgraph::{
    Direction::{Incoming, Outgoing},
    graph::NodeIndex,
    prelude::StableDiGraph,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    #[error(
        "circular dependency detected: cycle among remaining modules, only {ordered}/{total} modules could be ordered"
    )]
    Cycle { ordered: usize, total: usize },
}

/// Directed dependency graph over module ids.
///
/// An edge `a -> b` means `b` consumes something `a` produces, so `a` must run
/// first. Edges are unique; adding one twice is a no-op.
#[derive(Debug, Default, Clone)]
pub struct ConnectionGraph {
    graph: StableDiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
}

impl ConnectionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: &str) -> NodeIndex {
        if let Some(idx) = self.index_of.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index_of.insert(id.to_string(), idx);
        idx
    }

    /// Adds both endpoints if they are missing.
    pub fn add_connection(&mut self, from: &str, to: &str) {
        let a = self.add_node(from);
        let b = self.add_node(to);
        self.graph.update_edge(a, b, ());
    }

    /// Removes the node and every edge touching it.
    pub fn remove_node(&mut self, id: &str) -> bool {
        match self.index_of.remove(id) {
            Some(idx) => self.graph.remove_node(idx).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn in_degree(&self, id: &str) -> usize {
        self.index_of
            .get(id)
            .map(|idx| self.graph.neighbors_directed(*idx, Incoming).count())
            .unwrap_or(0)
    }

    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Incoming)
    }

    pub fn successors(&self, id: &str) -> Vec<String> {
        self.neighbors(id, Outgoing)
    }

    fn neighbors(&self, id: &str, dir: petgraph::Direction) -> Vec<String> {
        let mut out: Vec<String> = self
            .index_of
            .get(id)
            .map(|idx| {
                self.graph
                    .neighbors_directed(*idx, dir)
                    .map(|n| self.graph[n].clone())
                    .collect()
            })
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Kahn's algorithm, taking the whole zero-in-degree frontier as one level.
    ///
    /// No edge connects two ids of the same level and every edge points to a
    /// later level. Ids inside a level are sorted.
    pub fn execution_levels(&self) -> Result<Vec<Vec<String>>, GraphError> {
        let (levels, ordered) = self.kahn_levels();
        let total = self.graph.node_count();
        if ordered < total {
            return Err(GraphError::Cycle { ordered, total });
        }
        Ok(levels)
    }

    pub fn has_cycle(&self) -> bool {
        let (_, ordered) = self.kahn_levels();
        ordered < self.graph.node_count()
    }

    fn kahn_levels(&self) -> (Vec<Vec<String>>, usize) {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Incoming).count()))
            .collect();

        let mut frontier: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();

        let mut levels = Vec::new();
        let mut ordered = 0;
        while !frontier.is_empty() {
            ordered += frontier.len();
            let mut next = Vec::new();
            for n in &frontier {
                for succ in self.graph.neighbors_directed(*n, Outgoing) {
                    if let Some(d) = in_degree.get_mut(&succ) {
                        *d -= 1;
                        if *d == 0 {
                            next.push(succ);
                        }
                    }
                }
            }
            let mut level: Vec<String> = frontier.iter().map(|n| self.graph[*n].clone()).collect();
            level.sort();
            levels.push(level);
            frontier = next;
        }
        (levels, ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::StdRng};

    fn graph(edges: &[(&str, &str)]) -> ConnectionGraph {
        let mut g = ConnectionGraph::new();
        for (a, b) in edges {
            g.add_connection(a, b);
        }
        g
    }

    fn level_of(levels: &[Vec<String>], id: &str) -> usize {
        levels
            .iter()
            .position(|l| l.iter().any(|x| x == id))
            .unwrap()
    }

    #[test]
    fn test_chain_gives_one_node_per_level() {
        let g = graph(&[("a", "b"), ("b", "c")]);
        assert_eq!(
            g.execution_levels().unwrap(),
            vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_diamond() {
        let g = graph(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert_eq!(
            g.execution_levels().unwrap(),
            vec![
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
    }

    #[test]
    fn test_fan_out_shares_one_level() {
        let g = graph(&[("A", "B"), ("A", "C"), ("A", "D")]);
        assert_eq!(
            g.execution_levels().unwrap(),
            vec![
                vec!["A".to_string()],
                vec!["B".to_string(), "C".to_string(), "D".to_string()],
            ]
        );
    }

    #[test]
    fn test_isolated_nodes_share_first_level() {
        let mut g = ConnectionGraph::new();
        g.add_node("x");
        g.add_node("y");
        g.add_connection("a", "b");
        let levels = g.execution_levels().unwrap();
        assert_eq!(levels[0], vec!["a".to_string(), "x".to_string(), "y".to_string()]);
    }

    #[test]
    fn test_duplicate_connection_is_noop() {
        let g = graph(&[("a", "b"), ("a", "b")]);
        assert_eq!(g.in_degree("b"), 1);
        assert_eq!(g.successors("a"), vec!["b".to_string()]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let g = graph(&[("root", "a"), ("a", "b"), ("b", "c"), ("c", "a")]);
        assert!(g.has_cycle());
        let err = g.execution_levels().unwrap_err();
        assert_eq!(err, GraphError::Cycle { ordered: 1, total: 4 });
        let msg = err.to_string();
        assert!(msg.contains("circular"));
        assert!(msg.contains("cycle"));
        assert!(msg.contains("1/4 modules could be ordered"));
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let g = graph(&[("a", "a")]);
        assert!(g.has_cycle());
        assert!(g.execution_levels().is_err());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let mut g = graph(&[("a", "c"), ("b", "c")]);
        assert_eq!(g.in_degree("c"), 2);
        assert!(g.remove_node("a"));
        assert!(!g.remove_node("a"));
        assert_eq!(g.in_degree("c"), 1);
        assert_eq!(g.predecessors("c"), vec!["b".to_string()]);
        assert!(!g.contains("a"));
    }

    #[test]
    fn test_removing_cycle_member_breaks_cycle() {
        let mut g = graph(&[("a", "b"), ("b", "a")]);
        assert!(g.has_cycle());
        g.remove_node("b");
        assert!(!g.has_cycle());
    }

    // Deterministic pseudo-random DAGs: edges only go from lower to higher index.
    #[test]
    fn test_random_dags_respect_level_properties() {
        let mut rng = StdRng::seed_from_u64(0x9E37_79B9_7F4A_7C15);

        for _ in 0..50 {
            let n: usize = rng.random_range(2..14);
            let mut g = ConnectionGraph::new();
            let mut edges = Vec::new();
            for i in 0..n {
                g.add_node(&format!("m{}", i));
                for j in (i + 1)..n {
                    if rng.random_ratio(1, 3) {
                        let (a, b) = (format!("m{}", i), format!("m{}", j));
                        g.add_connection(&a, &b);
                        edges.push((a, b));
                    }
                }
            }

            let levels = g.execution_levels().unwrap();
            let total: usize = levels.iter().map(|l| l.len()).sum();
            assert_eq!(total, n);
            for (a, b) in &edges {
                assert!(level_of(&levels, a) < level_of(&levels, b));
            }
        }
    }
}
