//! Graph node definitions.
//!
//! A node is either a network request or a main-thread CPU task. Both expose
//! start and end timestamps in the trace timebase (microseconds).

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::network::request::{NetworkRequest, Priority, ResourceType};
use crate::trace::TraceEvent;
use crate::types::Microseconds;

/// Discriminant of a node's kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Network,
    Cpu,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Network => "network",
            NodeType::Cpu => "cpu",
        }
    }
}

/// A node wrapping one network request.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkNode {
    pub request: Arc<NetworkRequest>,
}

impl NetworkNode {
    pub fn start_time(&self) -> Microseconds {
        self.request.network_request_time * 1000.0
    }

    pub fn end_time(&self) -> Microseconds {
        self.request.network_end_time * 1000.0
    }

    pub fn origin(&self) -> &str {
        self.request.origin()
    }

    pub fn resource_type(&self) -> ResourceType {
        self.request.resource_type
    }

    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn from_disk_cache(&self) -> bool {
        self.request.from_disk_cache
    }

    pub fn is_non_network_protocol(&self) -> bool {
        self.request.is_non_network_protocol()
    }

    /// Served without opening or holding a connection.
    pub fn is_connectionless(&self) -> bool {
        self.from_disk_cache() || self.is_non_network_protocol()
    }

    pub fn initiator_type(&self) -> &str {
        &self.request.initiator.kind
    }

    /// Whether the browser would block first render on this request.
    pub fn has_render_blocking_priority(&self) -> bool {
        let priority = self.priority();
        let high_script_or_document = priority == Priority::High
            && matches!(self.resource_type(), ResourceType::Script | ResourceType::Document);
        priority == Priority::VeryHigh || high_script_or_document
    }
}

/// A node wrapping one top-level main-thread task and its nested events.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuNode {
    pub event: Arc<TraceEvent>,
    pub child_events: Arc<[TraceEvent]>,
    /// End timestamp clipped to the start of the next task when tasks overlap
    pub corrected_end_ts: Option<Microseconds>,
}

impl CpuNode {
    pub fn start_time(&self) -> Microseconds {
        self.event.ts
    }

    pub fn end_time(&self) -> Microseconds {
        self.corrected_end_ts
            .unwrap_or_else(|| self.event.ts + self.event.duration())
    }

    pub fn duration(&self) -> Microseconds {
        self.end_time() - self.start_time()
    }

    /// Whether any nested event is a layout.
    pub fn did_perform_layout(&self) -> bool {
        self.child_events.iter().any(|e| e.name == "Layout")
    }

    /// URLs of scripts evaluated during this task.
    pub fn evaluate_script_urls(&self) -> BTreeSet<String> {
        self.child_events
            .iter()
            .filter(|e| e.name == "EvaluateScript")
            .filter_map(|e| e.data().and_then(|d| d.url.clone()))
            .collect()
    }
}

/// Network or CPU payload of a node.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    Network(NetworkNode),
    Cpu(CpuNode),
}

/// A node of the page dependency graph.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    /// Unique id: the request id, or `"{tid}.{ts}"` for CPU tasks
    pub id: String,
    pub is_main_document: bool,
    pub kind: NodeKind,
}

impl Node {
    /// Creates a network node identified by the request id.
    pub fn network(request: Arc<NetworkRequest>) -> Self {
        Self {
            id: request.request_id.clone(),
            is_main_document: false,
            kind: NodeKind::Network(NetworkNode { request }),
        }
    }

    /// Creates a CPU node for a top-level task.
    pub fn cpu(event: Arc<TraceEvent>, child_events: Vec<TraceEvent>, corrected_end_ts: Option<Microseconds>) -> Self {
        Self {
            id: format!("{}.{}", event.tid, event.ts),
            is_main_document: false,
            kind: NodeKind::Cpu(CpuNode {
                event,
                child_events: child_events.into(),
                corrected_end_ts,
            }),
        }
    }

    /// Overrides the id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Network(_) => NodeType::Network,
            NodeKind::Cpu(_) => NodeType::Cpu,
        }
    }

    pub fn start_time(&self) -> Microseconds {
        match &self.kind {
            NodeKind::Network(n) => n.start_time(),
            NodeKind::Cpu(c) => c.start_time(),
        }
    }

    pub fn end_time(&self) -> Microseconds {
        match &self.kind {
            NodeKind::Network(n) => n.end_time(),
            NodeKind::Cpu(c) => c.end_time(),
        }
    }

    pub fn as_network(&self) -> Option<&NetworkNode> {
        match &self.kind {
            NodeKind::Network(n) => Some(n),
            NodeKind::Cpu(_) => None,
        }
    }

    pub fn as_cpu(&self) -> Option<&CpuNode> {
        match &self.kind {
            NodeKind::Cpu(c) => Some(c),
            NodeKind::Network(_) => None,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self.kind, NodeKind::Network(_))
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self.kind, NodeKind::Cpu(_))
    }

    /// The wrapped request of a network node.
    pub fn request(&self) -> Option<&Arc<NetworkRequest>> {
        self.as_network().map(|n| &n.request)
    }

    /// A node can only depend on nodes that started no later than itself.
    pub fn can_depend_on(&self, other: &Node) -> bool {
        other.start_time() <= self.start_time()
    }
}
