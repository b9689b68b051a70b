//! Static process graph: nodes, transitions, definitions.
//!
//! A [`ProcessGraph`] is immutable once built. It carries no behavior beyond
//! structural queries; what happens when a token arrives at a node is decided
//! by the agenda dispatch over [`NodeKind`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─── Identifiers ──────────────────────────────────────────────

/// Graph-local node identifier (unique within one definition).
pub type NodeId = String;

/// Graph-local transition identifier.
pub type TransitionId = String;

// ─── Timers ───────────────────────────────────────────────────

/// When a timer becomes due.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TimerDue {
    /// Relative to the moment the timer is created.
    Duration { ms: i64 },
    /// Absolute deadline.
    Date { at: DateTime<Utc> },
    /// Repeating cycle. `repeat = None` means unbounded.
    Cycle { interval_ms: i64, repeat: Option<u32> },
}

// ─── Node kinds ───────────────────────────────────────────────

/// Declared start trigger of a definition ("start this process when ...").
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StartTrigger {
    Signal { event_name: String },
    Message { event_name: String },
    Timer { due: TimerDue },
}

/// What to do when a token arrives at a node. Closed set, dispatched by
/// matching; there is deliberately no behavior trait to implement.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    /// No behavior; the token passes straight through.
    Passthrough,
    StartEvent {
        trigger: Option<StartTrigger>,
    },
    EndEvent,
    /// Ends the entire process instance, cancelling all other tokens.
    TerminateEndEvent,
    /// External wait state; resumed by an explicit trigger.
    UserTask,
    /// `asynchronous` schedules a continuation job instead of advancing
    /// inside the current command.
    ServiceTask {
        asynchronous: bool,
    },
    /// Forks on multiple outgoing transitions, joins on multiple incoming.
    ParallelGateway,
    SignalCatch {
        event_name: String,
        /// Only satisfied by throws scoped to the same process instance.
        instance_scoped: bool,
        /// Deliver through a job in a later command instead of in-command.
        async_delivery: bool,
    },
    MessageCatch {
        event_name: String,
        /// Variable whose value becomes the subscription's correlation key.
        correlation_variable: Option<String>,
        async_delivery: bool,
    },
    SignalThrow {
        event_name: String,
        /// Restrict delivery to subscriptions of the throwing instance.
        instance_scoped: bool,
        async_delivery: bool,
    },
    TimerCatch {
        due: TimerDue,
    },
    /// Scope-creating container; child nodes form the nested graph.
    SubProcess,
}

impl NodeKind {
    pub fn start() -> Self {
        NodeKind::StartEvent { trigger: None }
    }

    pub fn signal_catch(event_name: impl Into<String>) -> Self {
        NodeKind::SignalCatch {
            event_name: event_name.into(),
            instance_scoped: false,
            async_delivery: false,
        }
    }

    pub fn message_catch(event_name: impl Into<String>) -> Self {
        NodeKind::MessageCatch {
            event_name: event_name.into(),
            correlation_variable: None,
            async_delivery: false,
        }
    }

    /// True when a token at this node sits still until something external
    /// (trigger, event, timer) moves it.
    pub fn is_wait_state(&self) -> bool {
        matches!(
            self,
            NodeKind::UserTask
                | NodeKind::SignalCatch { .. }
                | NodeKind::MessageCatch { .. }
                | NodeKind::TimerCatch { .. }
        )
    }

    pub fn creates_scope(&self) -> bool {
        matches!(self, NodeKind::SubProcess)
    }

    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Passthrough => "passthrough",
            NodeKind::StartEvent { .. } => "start-event",
            NodeKind::EndEvent => "end-event",
            NodeKind::TerminateEndEvent => "terminate-end-event",
            NodeKind::UserTask => "user-task",
            NodeKind::ServiceTask { .. } => "service-task",
            NodeKind::ParallelGateway => "parallel-gateway",
            NodeKind::SignalCatch { .. } => "signal-catch",
            NodeKind::MessageCatch { .. } => "message-catch",
            NodeKind::SignalThrow { .. } => "signal-throw",
            NodeKind::TimerCatch { .. } => "timer-catch",
            NodeKind::SubProcess => "sub-process",
        }
    }
}

// ─── Graph structure ──────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Enclosing sub-process node, `None` at root scope.
    pub parent: Option<NodeId>,
    pub incoming: Vec<TransitionId>,
    pub outgoing: Vec<TransitionId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: TransitionId,
    pub source: NodeId,
    pub target: NodeId,
}

/// Immutable, validated process graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessGraph {
    nodes: BTreeMap<NodeId, GraphNode>,
    transitions: BTreeMap<TransitionId, Transition>,
}

impl ProcessGraph {
    pub fn node(&self, id: &str) -> Result<&GraphNode, GraphError> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))
    }

    pub fn transition(&self, id: &str) -> Result<&Transition, GraphError> {
        self.transitions
            .get(id)
            .ok_or_else(|| GraphError::UnknownTransition(id.to_string()))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> + '_ {
        self.nodes.values()
    }

    /// Nodes directly contained in the given scope (`None` = root).
    pub fn nodes_in_scope<'a, 'b>(
        &'a self,
        scope: Option<&'b str>,
    ) -> impl Iterator<Item = &'a GraphNode> + use<'a, 'b> {
        self.nodes
            .values()
            .filter(move |n| n.parent.as_deref() == scope)
    }

    /// The untriggered start event of a scope, if any.
    pub fn initial_start(&self, scope: Option<&str>) -> Option<&GraphNode> {
        self.nodes_in_scope(scope).find(|n| {
            matches!(n.kind, NodeKind::StartEvent { trigger: None })
        })
    }

    /// All start events at root scope carrying a trigger declaration.
    pub fn triggered_starts(&self) -> impl Iterator<Item = (&GraphNode, &StartTrigger)> + '_ {
        self.nodes_in_scope(None).filter_map(|n| match &n.kind {
            NodeKind::StartEvent {
                trigger: Some(trigger),
            } => Some((n, trigger)),
            _ => None,
        })
    }
}

// ─── Process definition ───────────────────────────────────────

/// One deployed, immutable version of a process. Distinct versions of the
/// same key coexist; running instances keep referencing the version they
/// started on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub key: String,
    pub version: i32,
    pub tenant_id: Option<String>,
    pub deployment_id: Uuid,
    pub graph: ProcessGraph,
}

impl ProcessDefinition {
    pub fn new(
        key: impl Into<String>,
        version: i32,
        tenant_id: Option<String>,
        deployment_id: Uuid,
        graph: ProcessGraph,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            key: key.into(),
            version,
            tenant_id,
            deployment_id,
            graph,
        }
    }
}

// ─── Validation ───────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("duplicate node id {0}")]
    DuplicateNode(NodeId),
    #[error("duplicate transition id {0}")]
    DuplicateTransition(TransitionId),
    #[error("unknown node {0}")]
    UnknownNode(NodeId),
    #[error("unknown transition {0}")]
    UnknownTransition(TransitionId),
    #[error("transition {0} crosses scope boundaries")]
    CrossScopeTransition(TransitionId),
    #[error("node {0} nests children but is not a sub-process")]
    ChildrenUnderLeaf(NodeId),
    #[error("sub-process {0} has no child nodes")]
    EmptySubProcess(NodeId),
    #[error("scope {0} has no start event")]
    MissingStart(String),
    #[error("scope {0} has more than one untriggered start event")]
    AmbiguousStart(String),
    #[error("start event {0} must not have incoming transitions")]
    StartWithIncoming(NodeId),
    #[error("end event {0} must not have outgoing transitions")]
    EndWithOutgoing(NodeId),
    #[error("node {0} is unreachable from its scope's start")]
    Unreachable(NodeId),
}

/// Builds and validates a [`ProcessGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<(NodeId, NodeKind, Option<NodeId>)>,
    transitions: Vec<Transition>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.push((id.into(), kind, None));
        self
    }

    /// Add a node nested inside the sub-process `parent`.
    pub fn child_node(
        mut self,
        parent: impl Into<String>,
        id: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        self.nodes.push((id.into(), kind, Some(parent.into())));
        self
    }

    pub fn flow(
        mut self,
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        self.transitions.push(Transition {
            id: id.into(),
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn build(self) -> Result<ProcessGraph, GraphError> {
        let mut nodes: BTreeMap<NodeId, GraphNode> = BTreeMap::new();
        for (id, kind, parent) in self.nodes {
            if nodes.contains_key(&id) {
                return Err(GraphError::DuplicateNode(id));
            }
            nodes.insert(
                id.clone(),
                GraphNode {
                    id,
                    kind,
                    parent,
                    incoming: Vec::new(),
                    outgoing: Vec::new(),
                },
            );
        }

        // Parent references must exist and be sub-processes.
        for node in nodes.values() {
            if let Some(parent_id) = &node.parent {
                match nodes.get(parent_id) {
                    None => return Err(GraphError::UnknownNode(parent_id.clone())),
                    Some(parent) if !parent.kind.creates_scope() => {
                        return Err(GraphError::ChildrenUnderLeaf(parent.id.clone()));
                    }
                    Some(_) => {}
                }
            }
        }

        let mut transitions: BTreeMap<TransitionId, Transition> = BTreeMap::new();
        for t in self.transitions {
            if transitions.contains_key(&t.id) {
                return Err(GraphError::DuplicateTransition(t.id));
            }
            let source_scope = match nodes.get(&t.source) {
                None => return Err(GraphError::UnknownNode(t.source)),
                Some(n) => n.parent.clone(),
            };
            let target_scope = match nodes.get(&t.target) {
                None => return Err(GraphError::UnknownNode(t.target)),
                Some(n) => n.parent.clone(),
            };
            if source_scope != target_scope {
                return Err(GraphError::CrossScopeTransition(t.id));
            }
            nodes
                .get_mut(&t.source)
                .expect("checked above")
                .outgoing
                .push(t.id.clone());
            nodes
                .get_mut(&t.target)
                .expect("checked above")
                .incoming
                .push(t.id.clone());
            transitions.insert(t.id.clone(), t);
        }

        let graph = ProcessGraph { nodes, transitions };
        validate(&graph)?;
        Ok(graph)
    }
}

fn validate(graph: &ProcessGraph) -> Result<(), GraphError> {
    for node in graph.nodes() {
        match &node.kind {
            NodeKind::StartEvent { .. } if !node.incoming.is_empty() => {
                return Err(GraphError::StartWithIncoming(node.id.clone()));
            }
            NodeKind::EndEvent | NodeKind::TerminateEndEvent if !node.outgoing.is_empty() => {
                return Err(GraphError::EndWithOutgoing(node.id.clone()));
            }
            _ => {}
        }
    }

    // Every scope is validated independently: a start exists, at most one
    // untriggered start, and every member is reachable from some start.
    let mut scopes: Vec<Option<&str>> = vec![None];
    scopes.extend(
        graph
            .nodes()
            .filter(|n| n.kind.creates_scope())
            .map(|n| Some(n.id.as_str())),
    );

    for scope in scopes {
        let members: Vec<&GraphNode> = graph.nodes_in_scope(scope).collect();
        let scope_name = scope.unwrap_or("<root>").to_string();
        if members.is_empty() {
            return Err(GraphError::EmptySubProcess(scope_name));
        }

        let starts: Vec<&GraphNode> = members
            .iter()
            .copied()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent { .. }))
            .collect();
        if starts.is_empty() {
            return Err(GraphError::MissingStart(scope_name));
        }
        let untriggered = starts
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::StartEvent { trigger: None }))
            .count();
        if untriggered > 1 {
            return Err(GraphError::AmbiguousStart(scope_name));
        }

        let mut dig: DiGraphMap<&str, ()> = DiGraphMap::new();
        for n in &members {
            dig.add_node(n.id.as_str());
        }
        for t in graph.transitions.values() {
            if dig.contains_node(t.source.as_str()) && dig.contains_node(t.target.as_str()) {
                dig.add_edge(t.source.as_str(), t.target.as_str(), ());
            }
        }

        let mut reached: Vec<&str> = Vec::new();
        for start in &starts {
            let mut dfs = Dfs::new(&dig, start.id.as_str());
            while let Some(nx) = dfs.next(&dig) {
                if !reached.contains(&nx) {
                    reached.push(nx);
                }
            }
        }
        for n in &members {
            // Sub-process container nodes are members of the outer scope;
            // their internals are covered by their own scope pass.
            if !reached.contains(&n.id.as_str()) {
                return Err(GraphError::Unreachable(n.id.clone()));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence() -> Result<ProcessGraph, GraphError> {
        GraphBuilder::new()
            .node("start", NodeKind::start())
            .node("task", NodeKind::UserTask)
            .node("end", NodeKind::EndEvent)
            .flow("f1", "start", "task")
            .flow("f2", "task", "end")
            .build()
    }

    #[test]
    fn builds_simple_sequence() {
        let graph = sequence().unwrap();
        let task = graph.node("task").unwrap();
        assert_eq!(task.incoming, vec!["f1".to_string()]);
        assert_eq!(task.outgoing, vec!["f2".to_string()]);
        assert_eq!(graph.initial_start(None).unwrap().id, "start");
    }

    #[test]
    fn rejects_unreachable_node() {
        let err = GraphBuilder::new()
            .node("start", NodeKind::start())
            .node("island", NodeKind::UserTask)
            .node("end", NodeKind::EndEvent)
            .flow("f1", "start", "end")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::Unreachable("island".to_string()));
    }

    #[test]
    fn rejects_transition_into_subprocess() {
        let err = GraphBuilder::new()
            .node("start", NodeKind::start())
            .node("sub", NodeKind::SubProcess)
            .child_node("sub", "inner_start", NodeKind::start())
            .child_node("sub", "inner_end", NodeKind::EndEvent)
            .flow("f1", "start", "inner_start")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::CrossScopeTransition("f1".to_string()));
    }

    #[test]
    fn rejects_empty_subprocess() {
        let err = GraphBuilder::new()
            .node("start", NodeKind::start())
            .node("sub", NodeKind::SubProcess)
            .node("end", NodeKind::EndEvent)
            .flow("f1", "start", "sub")
            .flow("f2", "sub", "end")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::EmptySubProcess("sub".to_string()));
    }

    #[test]
    fn rejects_second_untriggered_start() {
        let err = GraphBuilder::new()
            .node("a", NodeKind::start())
            .node("b", NodeKind::start())
            .node("end", NodeKind::EndEvent)
            .flow("f1", "a", "end")
            .flow("f2", "b", "end")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphError::AmbiguousStart("<root>".to_string()));
    }

    #[test]
    fn triggered_starts_are_listed_as_declarations() {
        let graph = GraphBuilder::new()
            .node("start", NodeKind::start())
            .node(
                "on_order",
                NodeKind::StartEvent {
                    trigger: Some(StartTrigger::Message {
                        event_name: "order-received".into(),
                    }),
                },
            )
            .node("task", NodeKind::UserTask)
            .node("end", NodeKind::EndEvent)
            .flow("f1", "start", "task")
            .flow("f2", "on_order", "task")
            .flow("f3", "task", "end")
            .build()
            .unwrap();

        let declared: Vec<&str> = graph
            .triggered_starts()
            .map(|(n, _)| n.id.as_str())
            .collect();
        assert_eq!(declared, vec!["on_order"]);
    }
}
