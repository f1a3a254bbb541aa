//! Plan -> DAG compilation

use std::collections::{HashMap, VecDeque};

use crate::domain::Plan;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    #[error("plan contains no plugins")]
    Empty,

    #[error("plugin '{0}' appears more than once in the plan")]
    DuplicateNode(String),

    #[error("plugin '{node}' depends on unknown plugin '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("plugin '{0}' depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

/// One plugin in the compiled graph. Edges are node indices.
#[derive(Debug, Clone, PartialEq)]
pub struct DagNode {
    pub id: String,
    pub hard_deps: Vec<usize>,
    pub soft_deps: Vec<usize>,
    pub dependents: Vec<usize>,
    pub weight: f64,
    pub required: bool,
}

impl DagNode {
    pub fn all_deps(&self) -> impl Iterator<Item = usize> + '_ {
        self.hard_deps.iter().chain(self.soft_deps.iter()).copied()
    }
}

/// Acyclic plugin dependency graph
#[derive(Debug, Clone, PartialEq)]
pub struct Dag {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
}

impl Dag {
    /// Compile a plan, rejecting duplicates, unknown or self dependencies and cycles
    pub fn compile(plan: &Plan) -> Result<Self, PlanError> {
        if plan.plugins.is_empty() {
            return Err(PlanError::Empty);
        }

        let mut index = HashMap::new();
        for (i, entry) in plan.plugins.iter().enumerate() {
            if index.insert(entry.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateNode(entry.id.clone()));
            }
        }

        let resolve = |node: &str, deps: &[String]| -> Result<Vec<usize>, PlanError> {
            let mut out = Vec::new();
            for dep in deps {
                if dep == node {
                    return Err(PlanError::SelfDependency(node.to_string()));
                }
                let idx = *index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    node: node.to_string(),
                    dependency: dep.clone(),
                })?;
                if !out.contains(&idx) {
                    out.push(idx);
                }
            }
            Ok(out)
        };

        let mut nodes = Vec::with_capacity(plan.plugins.len());
        for entry in &plan.plugins {
            let hard_deps = resolve(&entry.id, &entry.depends_on)?;
            let soft_deps: Vec<usize> = resolve(&entry.id, &entry.soft_depends_on)?
                .into_iter()
                .filter(|d| !hard_deps.contains(d))
                .collect();
            nodes.push(DagNode {
                id: entry.id.clone(),
                hard_deps,
                soft_deps,
                dependents: Vec::new(),
                weight: entry.weight,
                required: entry.required,
            });
        }
        for i in 0..nodes.len() {
            let deps: Vec<usize> = nodes[i].all_deps().collect();
            for dep in deps {
                nodes[dep].dependents.push(i);
            }
        }

        let dag = Self { nodes, index };
        if let Some(cycle) = dag.find_cycle() {
            return Err(PlanError::Cycle(cycle));
        }
        Ok(dag)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &DagNode {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Hard and soft dependency ids of a node
    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        self.index_of(id)
            .map(|i| {
                self.nodes[i]
                    .all_deps()
                    .map(|d| self.nodes[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Iterative DFS; returns the first cycle found as a closed path of ids
    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }
        let mut marks = vec![Mark::New; self.nodes.len()];

        for root in 0..self.nodes.len() {
            if marks[root] != Mark::New {
                continue;
            }
            // (node, next dependency position)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::Active;

            while let Some((node, pos)) = stack.last().copied() {
                let deps: Vec<usize> = self.nodes[node].all_deps().collect();
                if pos < deps.len() {
                    let next = deps[pos];
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match marks[next] {
                        Mark::New => {
                            marks[next] = Mark::Active;
                            stack.push((next, 0));
                        }
                        Mark::Active => {
                            let start = stack.iter().position(|(n, _)| *n == next).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|(n, _)| self.nodes[*n].id.clone())
                                .collect();
                            cycle.push(self.nodes[next].id.clone());
                            return Some(cycle);
                        }
                        Mark::Done => {}
                    }
                } else {
                    marks[node] = Mark::Done;
                    stack.pop();
                }
            }
        }
        None
    }

    /// A dependency-respecting order (Kahn's algorithm, plan order on ties)
    pub fn topological_order(&self) -> Vec<&str> {
        let mut indegree: Vec<usize> = self.nodes.iter().map(|n| n.all_deps().count()).collect();
        let mut queue: VecDeque<usize> = (0..self.nodes.len()).filter(|i| indegree[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(i) = queue.pop_front() {
            order.push(self.nodes[i].id.as_str());
            for &d in &self.nodes[i].dependents {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PlanEntry;

    fn plan(entries: Vec<PlanEntry>) -> Plan {
        Plan {
            plugins: entries,
            ..Default::default()
        }
    }

    #[test]
    fn compiles_hard_and_soft_edges() {
        let dag = Dag::compile(&plan(vec![
            PlanEntry::new("recon"),
            PlanEntry::new("zap").depends_on("recon"),
            PlanEntry::new("nuclei").soft_depends_on("recon").depends_on("zap"),
        ]))
        .unwrap();
        let nuclei = dag.node(dag.index_of("nuclei").unwrap());
        assert_eq!(nuclei.hard_deps, vec![1]);
        assert_eq!(nuclei.soft_deps, vec![0]);
        assert_eq!(dag.node(0).dependents, vec![1, 2]);
        assert_eq!(dag.topological_order(), vec!["recon", "zap", "nuclei"]);
        assert_eq!(dag.dependencies_of("nuclei"), vec!["zap", "recon"]);
    }

    #[test]
    fn rejects_cycles_with_path() {
        let err = Dag::compile(&plan(vec![
            PlanEntry::new("a").depends_on("c"),
            PlanEntry::new("b").depends_on("a"),
            PlanEntry::new("c").soft_depends_on("b"),
        ]))
        .unwrap_err();
        match err {
            PlanError::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn rejects_malformed_plans() {
        assert_eq!(Dag::compile(&plan(vec![])).unwrap_err(), PlanError::Empty);
        assert_eq!(
            Dag::compile(&plan(vec![PlanEntry::new("a"), PlanEntry::new("a")])).unwrap_err(),
            PlanError::DuplicateNode("a".into())
        );
        assert_eq!(
            Dag::compile(&plan(vec![PlanEntry::new("a").depends_on("a")])).unwrap_err(),
            PlanError::SelfDependency("a".into())
        );
        assert!(matches!(
            Dag::compile(&plan(vec![PlanEntry::new("a").depends_on("ghost")])).unwrap_err(),
            PlanError::UnknownDependency { .. }
        ));
    }
}
