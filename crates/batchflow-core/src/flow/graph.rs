//! Flow graph model and its validating builder.
//!
//! A `FlowGraph` is immutable once built. `FlowBuilder::build` rejects every
//! structural problem up front (duplicate ids, dangling targets, unreachable
//! nodes, ...) so the executor never discovers them mid-traversal.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use super::transition::{Transition, TransitionAction, sort_by_specificity};

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// What a node does when the executor visits it.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Run a registered step.
    Step { step: String },
    /// Ask a registered decider for the exit code.
    Decision { decider: String },
    /// Run every branch concurrently and join.
    Split { branches: Vec<Arc<FlowGraph>> },
    /// Launch another job and wait for it.
    SubJob {
        job: String,
        parameter_keys: Vec<String>,
    },
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Step { .. } => "step",
            NodeKind::Decision { .. } => "decision",
            NodeKind::Split { .. } => "split",
            NodeKind::SubJob { .. } => "sub_job",
        }
    }
}

/// A graph vertex with its transition table.
///
/// Transitions are sorted most-specific first. An empty table marks the
/// node as an implicit terminal.
#[derive(Debug, Clone)]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    pub transitions: Vec<Transition>,
}

impl FlowNode {
    pub fn is_leaf(&self) -> bool {
        self.transitions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Validated, immutable flow graph.
#[derive(Debug, Clone)]
pub struct FlowGraph {
    name: String,
    entry: String,
    nodes: BTreeMap<String, FlowNode>,
    /// Node ids in declaration order, for display.
    order: Vec<String>,
}

impl FlowGraph {
    pub fn builder(name: impl Into<String>) -> FlowBuilder {
        FlowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&FlowNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ---------------------------------------------------------------------------
// GraphError
// ---------------------------------------------------------------------------

/// Structural problems found while building a graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("flow '{flow}' has no nodes")]
    Empty { flow: String },

    #[error("flow '{flow}' declares node '{node}' more than once")]
    DuplicateNode { flow: String, node: String },

    #[error("flow '{flow}' entry node '{node}' does not exist")]
    UnknownEntry { flow: String, node: String },

    #[error("flow '{flow}' node '{node}' transitions to unknown node '{target}'")]
    UnknownTarget {
        flow: String,
        node: String,
        target: String,
    },

    #[error("flow '{flow}' node '{node}' has an empty transition pattern")]
    EmptyPattern { flow: String, node: String },

    #[error("flow '{flow}' node '{node}' declares pattern '{pattern}' more than once")]
    DuplicatePattern {
        flow: String,
        node: String,
        pattern: String,
    },

    #[error("flow '{flow}' node '{node}' overrides the status on non-terminal pattern '{pattern}'")]
    StatusOnContinue {
        flow: String,
        node: String,
        pattern: String,
    },

    #[error("flow '{flow}' split '{node}' has no branches")]
    EmptySplit { flow: String, node: String },

    #[error("flow '{flow}' split '{node}' has two branches named '{branch}'")]
    DuplicateBranch {
        flow: String,
        node: String,
        branch: String,
    },

    #[error("flow '{flow}' node '{node}' is unreachable from the entry node")]
    Unreachable { flow: String, node: String },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Incremental graph builder. All validation happens in [`FlowBuilder::build`].
#[derive(Debug)]
pub struct FlowBuilder {
    name: String,
    entry: Option<String>,
    nodes: Vec<FlowNode>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            nodes: Vec::new(),
        }
    }

    /// Set the entry node. Defaults to the first node declared.
    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind, transitions: Vec<Transition>) -> Self {
        self.nodes.push(FlowNode {
            id: id.into(),
            kind,
            transitions,
        });
        self
    }

    pub fn step(self, id: impl Into<String>, step: impl Into<String>, transitions: Vec<Transition>) -> Self {
        self.node(id, NodeKind::Step { step: step.into() }, transitions)
    }

    pub fn decision(
        self,
        id: impl Into<String>,
        decider: impl Into<String>,
        transitions: Vec<Transition>,
    ) -> Self {
        self.node(
            id,
            NodeKind::Decision {
                decider: decider.into(),
            },
            transitions,
        )
    }

    pub fn split(self, id: impl Into<String>, branches: Vec<FlowGraph>, transitions: Vec<Transition>) -> Self {
        self.node(
            id,
            NodeKind::Split {
                branches: branches.into_iter().map(Arc::new).collect(),
            },
            transitions,
        )
    }

    pub fn sub_job(
        self,
        id: impl Into<String>,
        job: impl Into<String>,
        parameter_keys: Vec<String>,
        transitions: Vec<Transition>,
    ) -> Self {
        self.node(
            id,
            NodeKind::SubJob {
                job: job.into(),
                parameter_keys,
            },
            transitions,
        )
    }

    /// Validate and freeze the graph. Transition tables are sorted by
    /// specificity here, once.
    pub fn build(self) -> Result<FlowGraph, GraphError> {
        let flow = self.name;
        let Some(first) = self.nodes.first() else {
            return Err(GraphError::Empty { flow });
        };
        let entry = self.entry.unwrap_or_else(|| first.id.clone());

        let mut nodes = BTreeMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for mut node in self.nodes {
            validate_node(&flow, &node)?;
            sort_by_specificity(&mut node.transitions);
            if nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    flow,
                    node: node.id,
                });
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        if !nodes.contains_key(&entry) {
            return Err(GraphError::UnknownEntry { flow, node: entry });
        }

        for node in nodes.values() {
            for transition in &node.transitions {
                if let Some(target) = transition.referenced_node() {
                    if !nodes.contains_key(target) {
                        return Err(GraphError::UnknownTarget {
                            flow,
                            node: node.id.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        let reachable = reachable_from(&entry, &nodes);
        if let Some(orphan) = order.iter().find(|id| !reachable.contains(id.as_str())) {
            return Err(GraphError::Unreachable {
                flow,
                node: orphan.clone(),
            });
        }

        Ok(FlowGraph {
            name: flow,
            entry,
            nodes,
            order,
        })
    }
}

fn validate_node(flow: &str, node: &FlowNode) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for transition in &node.transitions {
        if transition.pattern.is_empty() {
            return Err(GraphError::EmptyPattern {
                flow: flow.to_string(),
                node: node.id.clone(),
            });
        }
        if !seen.insert(transition.pattern.as_str()) {
            return Err(GraphError::DuplicatePattern {
                flow: flow.to_string(),
                node: node.id.clone(),
                pattern: transition.pattern.clone(),
            });
        }
        if transition.status.is_some() && matches!(transition.action, TransitionAction::Continue { .. }) {
            return Err(GraphError::StatusOnContinue {
                flow: flow.to_string(),
                node: node.id.clone(),
                pattern: transition.pattern.clone(),
            });
        }
    }

    if let NodeKind::Split { branches } = &node.kind {
        if branches.is_empty() {
            return Err(GraphError::EmptySplit {
                flow: flow.to_string(),
                node: node.id.clone(),
            });
        }
        let mut names = HashSet::new();
        for branch in branches {
            if !names.insert(branch.name()) {
                return Err(GraphError::DuplicateBranch {
                    flow: flow.to_string(),
                    node: node.id.clone(),
                    branch: branch.name().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Breadth-first walk over continue targets and stop restart targets.
fn reachable_from<'a>(entry: &'a str, nodes: &'a BTreeMap<String, FlowNode>) -> HashSet<&'a str> {
    let mut seen = HashSet::from([entry]);
    let mut queue = VecDeque::from([entry]);
    while let Some(id) = queue.pop_front() {
        let Some(node) = nodes.get(id) else { continue };
        for target in node.transitions.iter().filter_map(|t| t.referenced_node()) {
            if seen.insert(target) {
                queue.push_back(target);
            }
        }
    }
    seen
}
