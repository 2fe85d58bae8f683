//! Workflow graph model. Build this once per published definition.
//!
//! Tasks live in an arena indexed by position; relations are stored once and
//! referenced by index from forward and reverse adjacency lists, so nothing
//! points back at its parent.
//!
//! Rules enforced by [`WorkflowGraph::build`]:
//! 1. Task codes must be unique within the definition.
//! 2. Every relation must reference existing tasks at the stated version.
//! 3. The directed graph must be acyclic (three-colour DFS).

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use db::models::TaskDependType;

use crate::error::ValidationError;
use crate::models::{ConditionType, TaskDefinition, WorkflowDefinition};

/// A relation resolved to arena indices.
#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    condition: ConditionType,
}

/// How a task node was resolved inside one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Ran (or was forced) to success.
    Success {
        branch: Option<String>,
        finished_at: DateTime<Utc>,
    },
    /// Disabled task; successors proceed as if it succeeded.
    Bypassed { at: DateTime<Utc> },
    /// No incoming edge was traversable; the task is validly skipped.
    Pruned,
}

/// Verdict for an unresolved task whose predecessors are all resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Create a task instance, not before the given time if set.
    Ready { not_before: Option<DateTime<Utc>> },
    /// Disabled task: resolve as [`NodeOutcome::Bypassed`].
    Bypass,
    /// Resolve as [`NodeOutcome::Pruned`].
    Pruned,
}

/// The subset of tasks a run covers.
pub type Scope = BTreeSet<usize>;

/// Immutable, validated view of one workflow definition.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: WorkflowDefinition,
    index: HashMap<i64, usize>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    /// Validate the definition and index it.
    ///
    /// # Errors
    /// - [`ValidationError::DuplicateTask`] if two tasks share a code.
    /// - [`ValidationError::UnknownTaskReference`] if a relation names a missing task.
    /// - [`ValidationError::GraphCycle`] if the relations are not acyclic.
    pub fn build(definition: WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut index = HashMap::with_capacity(definition.tasks.len());
        for (position, task) in definition.tasks.iter().enumerate() {
            if index.insert(task.code, position).is_some() {
                return Err(ValidationError::DuplicateTask(task.code));
            }
        }

        let resolve = |code: i64, version: i32, side: &'static str| {
            index
                .get(&code)
                .copied()
                .filter(|&i| definition.tasks[i].version == version)
                .ok_or(ValidationError::UnknownTaskReference { task_code: code, version, side })
        };

        let mut edges = Vec::with_capacity(definition.relations.len());
        let mut outgoing = vec![Vec::new(); definition.tasks.len()];
        let mut incoming = vec![Vec::new(); definition.tasks.len()];

        for relation in &definition.relations {
            let from = resolve(relation.pre_task_code, relation.pre_task_version, "pre")?;
            let to = resolve(relation.post_task_code, relation.post_task_version, "post")?;
            outgoing[from].push(edges.len());
            incoming[to].push(edges.len());
            edges.push(Edge { from, to, condition: relation.condition.clone() });
        }

        let graph = Self { definition, index, edges, outgoing, incoming };
        graph.check_acyclic()?;
        Ok(graph)
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn len(&self) -> usize {
        self.definition.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.tasks.is_empty()
    }

    pub fn task(&self, node: usize) -> &TaskDefinition {
        &self.definition.tasks[node]
    }

    pub fn node_of(&self, task_code: i64) -> Option<usize> {
        self.index.get(&task_code).copied()
    }

    pub fn predecessors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.incoming[node].iter().map(move |&e| self.edges[e].from)
    }

    pub fn successors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        self.outgoing[node].iter().map(move |&e| self.edges[e].to)
    }

    /// Kahn's algorithm over the arena; ties broken by definition order.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut queue: VecDeque<usize> = (0..self.len()).filter(|&n| in_degree[n] == 0).collect();
        let mut sorted = Vec::with_capacity(self.len());

        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for next in self.successors(node) {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        sorted
    }

    /// Select the tasks a run covers.
    ///
    /// An empty `start_codes` covers the whole graph.  Otherwise TASK_ONLY
    /// keeps just the start nodes, TASK_PRE adds every ancestor and
    /// TASK_POST adds every descendant.
    pub fn scope(&self, start_codes: &[i64], depend: TaskDependType) -> Result<Scope, ValidationError> {
        if start_codes.is_empty() {
            return Ok((0..self.len()).collect());
        }

        let mut starts = Vec::with_capacity(start_codes.len());
        for &code in start_codes {
            starts.push(self.node_of(code).ok_or(ValidationError::UnknownStartTask(code))?);
        }

        let mut scope: Scope = starts.iter().copied().collect();
        let mut stack = starts;
        while let Some(node) = stack.pop() {
            let neighbours: Vec<usize> = match depend {
                TaskDependType::TaskOnly => Vec::new(),
                TaskDependType::TaskPre => self.predecessors(node).collect(),
                TaskDependType::TaskPost => self.successors(node).collect(),
            };
            for next in neighbours {
                if scope.insert(next) {
                    stack.push(next);
                }
            }
        }
        Ok(scope)
    }

    /// Every unresolved in-scope task whose in-scope predecessors are all
    /// resolved, with its verdict.  Predecessors outside the scope are
    /// ignored; a failed predecessor is simply absent from `outcomes`, so
    /// its successors never show up here.
    pub fn evaluate(
        &self,
        scope: &Scope,
        outcomes: &BTreeMap<usize, NodeOutcome>,
    ) -> Vec<(usize, Readiness)> {
        let mut verdicts = Vec::new();

        'nodes: for &node in scope {
            if outcomes.contains_key(&node) {
                continue;
            }

            let mut has_incoming = false;
            let mut traversable = false;
            let mut not_before: Option<DateTime<Utc>> = None;

            for &e in &self.incoming[node] {
                let edge = &self.edges[e];
                if !scope.contains(&edge.from) {
                    continue;
                }
                has_incoming = true;

                let Some(outcome) = outcomes.get(&edge.from) else {
                    continue 'nodes;
                };
                let (branch, finished_at) = match outcome {
                    NodeOutcome::Success { branch, finished_at } => (branch.as_deref(), *finished_at),
                    NodeOutcome::Bypassed { at } => (None, *at),
                    NodeOutcome::Pruned => continue,
                };

                match &edge.condition {
                    ConditionType::None => traversable = true,
                    ConditionType::Branch { branch: expected } => {
                        if branch == Some(expected.as_str()) {
                            traversable = true;
                        }
                    }
                    ConditionType::Delay { seconds } => {
                        traversable = true;
                        let due = finished_at + Duration::seconds(*seconds as i64);
                        not_before = Some(not_before.map_or(due, |t| t.max(due)));
                    }
                }
            }

            let verdict = if has_incoming && !traversable {
                Readiness::Pruned
            } else if !self.task(node).is_enabled() {
                Readiness::Bypass
            } else {
                Readiness::Ready { not_before }
            };
            verdicts.push((node, verdict));
        }

        verdicts
    }

    fn check_acyclic(&self) -> Result<(), ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colour = vec![Colour::White; self.len()];

        for root in 0..self.len() {
            if colour[root] != Colour::White {
                continue;
            }
            // (node, next outgoing edge to look at)
            let mut stack = vec![(root, 0usize)];
            colour[root] = Colour::Grey;

            while let Some((node, cursor)) = stack.pop() {
                match self.outgoing[node].get(cursor) {
                    Some(&e) => {
                        stack.push((node, cursor + 1));
                        let next = self.edges[e].to;
                        match colour[next] {
                            Colour::Grey => {
                                return Err(ValidationError::GraphCycle {
                                    task_code: self.task(next).code,
                                })
                            }
                            Colour::White => {
                                colour[next] = Colour::Grey;
                                stack.push((next, 0));
                            }
                            Colour::Black => {}
                        }
                    }
                    None => colour[node] = Colour::Black,
                }
            }
        }
        Ok(())
    }
}
