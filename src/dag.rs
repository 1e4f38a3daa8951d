//! Generic dependency DAG. Adjacency-list graph over nodes identified by
//! some hashable ID type, with cycle/duplicate/missing-child detection at
//! construction and bottom-up/top-down traversal order.
//!
//! This generalizes the fixed-`usize`-ID graph from the teacher's earlier
//! prototype (see `cip999-limmat/src/dag.rs`) to an arbitrary ID type, so
//! the same type serves both the unit dependency graph and (transitively)
//! anything else that wants a DAG over named nodes.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::DagError;

pub trait GraphNode<I: Hash + Eq + Clone> {
    /// Identifier for a node, unique among nodes in the set under consideration.
    fn id(&self) -> impl Borrow<I>;
    /// IDs of nodes that this node depends on (edges point dependency -> dependent
    /// in the `edges` adjacency list below, i.e. `child_ids` are prerequisites).
    fn child_ids(&self) -> Vec<impl Borrow<I>>;
}

#[derive(Debug)]
pub struct Dag<I: Hash + Eq + Clone + Debug, G: GraphNode<I>> {
    nodes: Vec<G>,
    id_to_idx: HashMap<I, usize>,
    edges: Vec<Vec<usize>>,
    root_idxs: HashSet<usize>,
}

impl<I: Hash + Eq + Clone + Debug, G: GraphNode<I>> Dag<I, G> {
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            id_to_idx: HashMap::new(),
            edges: Vec::new(),
            root_idxs: HashSet::new(),
        }
    }

    pub fn new(nodes: impl IntoIterator<Item = G>) -> Result<Self, DagError<I>> {
        let nodes: Vec<G> = nodes.into_iter().collect();

        let mut id_to_idx = HashMap::new();
        for (idx, node) in nodes.iter().enumerate() {
            let id = node.id();
            let id = id.borrow();
            if id_to_idx.contains_key(id) {
                return Err(DagError::DuplicateId(id.clone()));
            }
            id_to_idx.insert(id.clone(), idx);
        }

        let mut edges = vec![Vec::new(); nodes.len()];
        for (idx, node) in nodes.iter().enumerate() {
            for child_id in node.child_ids() {
                let child_idx = id_to_idx
                    .get(child_id.borrow())
                    .copied()
                    .ok_or_else(|| DagError::UnknownDependency {
                        parent: node.id().borrow().clone(),
                        child: child_id.borrow().clone(),
                    })?;
                edges[idx].push(child_idx);
            }
        }

        let mut root_idxs: HashSet<usize> = (0..edges.len()).collect();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut visited_stack: HashSet<usize> = HashSet::new();

        fn recurse(
            visited: &mut HashSet<usize>,
            visited_stack: &mut HashSet<usize>,
            start_idx: usize,
            edges: &[Vec<usize>],
            root_idxs: &mut HashSet<usize>,
        ) -> Option<usize> {
            if visited_stack.contains(&start_idx) {
                return Some(start_idx);
            }
            if visited.contains(&start_idx) {
                return None;
            }
            visited.insert(start_idx);
            visited_stack.insert(start_idx);
            for child in &edges[start_idx] {
                root_idxs.remove(child);
                if let Some(i) = recurse(visited, visited_stack, *child, edges, root_idxs) {
                    return Some(i);
                }
            }
            visited_stack.remove(&start_idx);
            None
        }

        for i in 0..edges.len() {
            if let Some(node_in_cycle) =
                recurse(&mut visited, &mut visited_stack, i, &edges, &mut root_idxs)
            {
                return Err(DagError::Cycle(nodes[node_in_cycle].id().borrow().clone()));
            }
        }

        Ok(Self {
            nodes,
            edges,
            id_to_idx,
            root_idxs: root_idxs.into_iter().collect(),
        })
    }

    /// Returns a new graph with a node added; the node's prerequisites must
    /// already be present.
    pub fn with_node(mut self, node: G) -> Result<Self, DagError<I>> {
        let new_idx = self.nodes.len();
        let id = node.id().borrow().clone();
        if self.id_to_idx.contains_key(&id) {
            return Err(DagError::DuplicateId(id));
        }
        self.id_to_idx.insert(id.clone(), new_idx);
        let child_idxs = node
            .child_ids()
            .into_iter()
            .map(|cid| {
                self.id_to_idx
                    .get(cid.borrow())
                    .copied()
                    .ok_or_else(|| DagError::UnknownDependency {
                        parent: id.clone(),
                        child: cid.borrow().clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        for child_idx in &child_idxs {
            self.root_idxs.remove(child_idx);
        }
        self.edges.push(child_idxs);
        self.root_idxs.insert(new_idx);
        self.nodes.push(node);
        Ok(self)
    }

    /// Visit nodes with prerequisites (children) before the nodes that depend on them.
    pub fn bottom_up(&self) -> BottomUp<'_, I, G> {
        BottomUp {
            dag: self,
            visit_stack: Vec::new(),
            unvisited_roots: self.root_idxs.iter().copied().collect(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &G> + Clone {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: &I) -> Option<&G> {
        Some(&self.nodes[*self.id_to_idx.get(id)?])
    }

    pub fn contains(&self, id: &I) -> bool {
        self.id_to_idx.contains_key(id)
    }

    /// Longest prerequisite chain from any root down to this node (0 for roots).
    pub fn level_of(&self, id: &I) -> Option<usize> {
        let idx = *self.id_to_idx.get(id)?;
        let mut memo: HashMap<usize, usize> = HashMap::new();
        Some(self.level_rec(idx, &mut memo))
    }

    fn level_rec(&self, idx: usize, memo: &mut HashMap<usize, usize>) -> usize {
        if let Some(&lvl) = memo.get(&idx) {
            return lvl;
        }
        let lvl = self.edges[idx]
            .iter()
            .map(|&child_idx| self.level_rec(child_idx, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(idx, lvl);
        lvl
    }

    /// All nodes with their computed level, used only for visualization
    /// (`GraphSnapshot`).
    pub fn levels(&self) -> Vec<(&I, usize)> {
        let mut memo = HashMap::new();
        (0..self.nodes.len())
            .map(|idx| {
                let lvl = self.level_rec(idx, &mut memo);
                let id = self
                    .id_to_idx
                    .iter()
                    .find(|(_, &i)| i == idx)
                    .map(|(k, _)| k)
                    .expect("every node has an id mapping");
                (id, lvl)
            })
            .collect()
    }

    /// All edges as (dependent_id, prerequisite_id) pairs.
    pub fn edges(&self) -> Vec<(&I, &I)> {
        let idx_to_id: HashMap<usize, &I> = self.id_to_idx.iter().map(|(k, &v)| (v, k)).collect();
        self.edges
            .iter()
            .enumerate()
            .flat_map(|(idx, children)| {
                children
                    .iter()
                    .map(move |&c| (idx_to_id[&idx], idx_to_id[&c]))
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct BottomUp<'a, I: Hash + Eq + Clone + Debug, G: GraphNode<I>> {
    dag: &'a Dag<I, G>,
    visit_stack: Vec<usize>,
    unvisited_roots: Vec<usize>,
}

impl<'a, I: Hash + Eq + Clone + Debug, G: GraphNode<I>> Iterator for BottomUp<'a, I, G> {
    type Item = &'a G;

    fn next(&mut self) -> Option<&'a G> {
        if self.visit_stack.is_empty() {
            let mut temp_stack = vec![self.unvisited_roots.pop()?];
            while let Some(cur_idx) = temp_stack.pop() {
                self.visit_stack.push(cur_idx);
                for child_idx in &self.dag.edges[cur_idx] {
                    temp_stack.push(*child_idx);
                }
            }
        }
        Some(&self.dag.nodes[self.visit_stack.pop().unwrap()])
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[derive(Debug, Eq, PartialEq, Hash, Clone)]
    struct TestNode {
        id: &'static str,
        deps: Vec<&'static str>,
    }

    impl GraphNode<String> for TestNode {
        fn id(&self) -> impl Borrow<String> {
            self.id.to_string()
        }

        fn child_ids(&self) -> Vec<impl Borrow<String>> {
            self.deps.iter().map(|s| s.to_string()).collect()
        }
    }

    fn n(id: &'static str, deps: &[&'static str]) -> TestNode {
        TestNode {
            id,
            deps: deps.to_vec(),
        }
    }

    #[test]
    fn linear_chain_levels() {
        let dag = Dag::new([n("a", &[]), n("b", &["a"])]).unwrap();
        assert_eq!(dag.level_of(&"a".to_string()), Some(0));
        assert_eq!(dag.level_of(&"b".to_string()), Some(1));
    }

    #[test]
    fn duplicate_id_rejected() {
        let err = Dag::new([n("a", &[]), n("a", &[])]).unwrap_err();
        assert_eq!(err, DagError::DuplicateId("a".to_string()));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let err = Dag::new([n("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownDependency {
                parent: "a".to_string(),
                child: "ghost".to_string()
            }
        );
    }

    #[test_case(&[("a", &["b"][..]), ("b", &["a"])] ; "two cycle")]
    #[test_case(&[("a", &["a"])] ; "self cycle")]
    fn cycle_rejected(edges: &[(&'static str, &'static [&'static str])]) {
        let nodes: Vec<TestNode> = edges.iter().map(|(id, deps)| n(id, deps)).collect();
        assert!(matches!(Dag::new(nodes).unwrap_err(), DagError::Cycle(_)));
    }

    #[test]
    fn bottom_up_visits_prerequisites_first() {
        let dag = Dag::new([n("a", &[]), n("b", &["a"]), n("c", &["b"])]).unwrap();
        let order: Vec<&str> = dag.bottom_up().map(|node| node.id).collect();
        let pos = |id: &str| order.iter().position(|&x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn with_node_extends_graph() {
        let dag = Dag::new([n("a", &[])]).unwrap();
        let dag = dag.with_node(n("b", &["a"])).unwrap();
        assert_eq!(dag.level_of(&"b".to_string()), Some(1));
        assert!(matches!(
            dag.with_node(n("a", &[])).unwrap_err(),
            DagError::DuplicateId(_)
        ));
    }
}
