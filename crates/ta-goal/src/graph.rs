// graph.rs — DependencyGraph: validation and ordering of a goal's subgoals.
//
// Building the graph is the structural gate for submission. It rejects
// blank or duplicate ids, dependencies on ids outside the goal, and cycles.
// A built graph is immutable and answers the queries the scheduler needs:
// direct dependencies, direct dependents, transitive dependents (for
// cascading failure), and the ready set for a given completed set.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::error::GoalError;

/// Anything that can be placed in a dependency graph.
///
/// Implemented by both `SubGoalSpec` (at submission) and `SubGoal` (when the
/// scheduler rebuilds the graph from a stored record).
pub trait GraphNode {
    fn node_id(&self) -> &str;
    fn node_dependencies(&self) -> &[String];
}

/// A validated, acyclic dependency graph over one goal's subgoals.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Ids in original input order.
    ids: Vec<String>,
    index: HashMap<String, usize>,
    /// dependencies[i] = indices that node i depends on (deduplicated).
    dependencies: Vec<Vec<usize>>,
    /// dependents[i] = indices that depend on node i.
    dependents: Vec<Vec<usize>>,
    /// Topological order (dependencies before dependents).
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Validate the nodes and build the graph.
    ///
    /// Fails with `Validation` for blank/duplicate ids, `UnknownDependency`
    /// when a dependency is not among the nodes, and `CircularDependency`
    /// (naming one offending cycle) when the relation is not acyclic.
    pub fn build<N: GraphNode>(nodes: &[N]) -> Result<Self, GoalError> {
        let mut ids = Vec::with_capacity(nodes.len());
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let id = node.node_id();
            if id.trim().is_empty() {
                return Err(GoalError::Validation(format!(
                    "subgoal at position {} has a blank id",
                    i
                )));
            }
            if index.insert(id.to_string(), i).is_some() {
                return Err(GoalError::Validation(format!(
                    "duplicate subgoal id '{}'",
                    id
                )));
            }
            ids.push(id.to_string());
        }

        let mut dependencies = vec![Vec::new(); nodes.len()];
        let mut dependents = vec![Vec::new(); nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            let mut seen = HashSet::new();
            for dep in node.node_dependencies() {
                let Some(&d) = index.get(dep) else {
                    return Err(GoalError::UnknownDependency {
                        subgoal_id: ids[i].clone(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(d) {
                    dependencies[i].push(d);
                    dependents[d].push(i);
                }
            }
        }

        let order = topological_order(&dependencies, &dependents);
        if order.len() < nodes.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let cycle = find_cycle(&dependencies, &placed)
                .into_iter()
                .map(|i| ids[i].clone())
                .collect();
            return Err(GoalError::CircularDependency { cycle });
        }

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Topological order: every id appears after all of its dependencies.
    ///
    /// Ties between simultaneously available ids break by original input
    /// order. Input positions are unique, so subgoal priority never decides
    /// here; dispatch order among ready subgoals comes from `ScoringWeights`.
    /// This is a scheduling hint only.
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Position of an id in the topological order.
    pub fn rank(&self, id: &str) -> Option<usize> {
        let i = *self.index.get(id)?;
        self.order.iter().position(|&o| o == i)
    }

    /// Direct dependencies of `id` (empty for unknown ids).
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.lookup(id, &self.dependencies)
    }

    /// Direct dependents of `id` (empty for unknown ids).
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.lookup(id, &self.dependents)
    }

    /// Every id that depends on `id` directly or transitively, in
    /// topological order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(id) else {
            return Vec::new();
        };
        let mut reached = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            for &d in &self.dependents[i] {
                if reached.insert(d) {
                    queue.push_back(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|&&i| reached.contains(&i))
            .map(|&i| self.ids[i].as_str())
            .collect()
    }

    /// Ids not yet in `completed` whose dependencies are all in `completed`,
    /// in topological order.
    pub fn ready_set(&self, completed: &HashSet<String>) -> Vec<&str> {
        self.order
            .iter()
            .filter(|&&i| !completed.contains(&self.ids[i]))
            .filter(|&&i| {
                self.dependencies[i]
                    .iter()
                    .all(|&d| completed.contains(&self.ids[d]))
            })
            .map(|&i| self.ids[i].as_str())
            .collect()
    }

    fn lookup<'a>(&'a self, id: &str, edges: &'a [Vec<usize>]) -> Vec<&'a str> {
        match self.index.get(id) {
            Some(&i) => edges[i].iter().map(|&j| self.ids[j].as_str()).collect(),
            None => Vec::new(),
        }
    }
}

/// Kahn's algorithm. The available set is ordered by input index so the
/// result is deterministic for a given input.
fn topological_order(dependencies: &[Vec<usize>], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut available: BTreeSet<usize> = remaining
        .iter()
        .enumerate()
        .filter(|&(_, &n)| n == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(i) = available.pop_first() {
        order.push(i);
        for &d in &dependents[i] {
            remaining[d] -= 1;
            if remaining[d] == 0 {
                available.insert(d);
            }
        }
    }
    order
}

/// Walk dependency edges among unplaced nodes until a node repeats.
///
/// Every node Kahn's algorithm could not place has at least one unplaced
/// dependency, so the walk always closes a cycle.
fn find_cycle(dependencies: &[Vec<usize>], placed: &HashSet<usize>) -> Vec<usize> {
    let Some(start) = (0..dependencies.len()).find(|i| !placed.contains(i)) else {
        return Vec::new();
    };
    let mut path = vec![start];
    let mut position = HashMap::from([(start, 0usize)]);
    let mut current = start;
    loop {
        let Some(&next) = dependencies[current].iter().find(|&&d| !placed.contains(&d)) else {
            return path;
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle = path[at..].to_vec();
            cycle.push(next);
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Node {
        id: String,
        deps: Vec<String>,
    }

    impl GraphNode for Node {
        fn node_id(&self) -> &str {
            &self.id
        }
        fn node_dependencies(&self) -> &[String] {
            &self.deps
        }
    }

    fn node(id: &str, deps: &[&str]) -> Node {
        Node {
            id: id.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn completed(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn assert_respects_edges(graph: &DependencyGraph, nodes: &[Node]) {
        let order = graph.topological_order();
        for n in nodes {
            let at = order.iter().position(|&id| id == n.id).unwrap();
            for dep in &n.deps {
                let dep_at = order.iter().position(|&id| id == dep).unwrap();
                assert!(dep_at < at, "{} must come before {}", dep, n.id);
            }
        }
    }

    #[test]
    fn diamond_orders_dependencies_first() {
        let nodes = vec![
            node("d", &["b", "c"]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("a", &[]),
        ];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.len(), 4);
        assert_respects_edges(&graph, &nodes);
        assert_eq!(graph.topological_order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn independent_nodes_keep_input_order() {
        let nodes = vec![node("z", &[]), node("y", &[]), node("x", &[])];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.topological_order(), vec!["z", "y", "x"]);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let nodes = vec![node("a", &[]), node("b", &["missing"])];
        let err = DependencyGraph::build(&nodes).unwrap_err();
        match err {
            GoalError::UnknownDependency {
                subgoal_id,
                dependency,
            } => {
                assert_eq!(subgoal_id, "b");
                assert_eq!(dependency, "missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cycle_is_rejected_and_named() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a", "d"]),
            node("c", &["b"]),
            node("d", &["c"]),
        ];
        let err = DependencyGraph::build(&nodes).unwrap_err();
        let GoalError::CircularDependency { cycle } = err else {
            panic!("expected a cycle error");
        };
        assert_eq!(cycle.first(), cycle.last());
        for member in &cycle {
            assert!(["b", "c", "d"].contains(&member.as_str()));
        }
        assert!(!cycle.contains(&"a".to_string()));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let nodes = vec![node("a", &["a"])];
        let err = DependencyGraph::build(&nodes).unwrap_err();
        assert!(matches!(
            err,
            GoalError::CircularDependency { ref cycle } if cycle == &["a", "a"]
        ));
        assert!(err.is_structural());
    }

    #[test]
    fn duplicate_and_blank_ids_are_validation_errors() {
        let dup = vec![node("a", &[]), node("a", &[])];
        assert!(matches!(
            DependencyGraph::build(&dup),
            Err(GoalError::Validation(_))
        ));
        let blank = vec![node(" ", &[])];
        assert!(matches!(
            DependencyGraph::build(&blank),
            Err(GoalError::Validation(_))
        ));
    }

    #[test]
    fn duplicate_dependency_entries_are_collapsed() {
        let nodes = vec![node("a", &[]), node("b", &["a", "a"])];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.dependencies("b"), vec!["a"]);
        assert_eq!(graph.dependents("a"), vec!["b"]);
    }

    #[test]
    fn ready_set_follows_completed_ids() {
        let nodes = vec![node("a", &[]), node("b", &["a"]), node("c", &["a"])];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.ready_set(&completed(&[])), vec!["a"]);
        assert_eq!(graph.ready_set(&completed(&["a"])), vec!["b", "c"]);
        assert!(graph.ready_set(&completed(&["a", "b", "c"])).is_empty());
    }

    #[test]
    fn transitive_dependents_cover_the_whole_chain() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("x", &[]),
        ];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.transitive_dependents("a"), vec!["b", "c"]);
        assert!(graph.transitive_dependents("x").is_empty());
        assert!(graph.transitive_dependents("nope").is_empty());
    }

    #[test]
    fn rank_matches_topological_position() {
        let nodes = vec![node("b", &["a"]), node("a", &[])];
        let graph = DependencyGraph::build(&nodes).unwrap();
        assert_eq!(graph.rank("a"), Some(0));
        assert_eq!(graph.rank("b"), Some(1));
        assert_eq!(graph.rank("zzz"), None);
    }
}
