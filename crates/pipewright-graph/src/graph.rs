mod error;
mod plan;
mod planner;

use ahash::AHashSet;
use smallvec::{smallvec, SmallVec};
use thunderdome::Arena;

use pipewright_core::{CommandTemplate, EdgeKind, EndpointKind, PortPool};

pub use error::{GraphError, PlanError};
pub use plan::{EdgeLog, Entrypoint, LaunchJob, RuntimePlan, WireJob};

/// A globally unique identifier for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) thunderdome::Index);

/// A globally unique identifier for an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub(crate) thunderdome::Index);

/// The endpoints a named port is bound to.
///
/// Exactly one entry as declared. The planner may rewrite the list
/// to several entries (fan-out) or a substitute entry (proxy), and
/// per-edge wiring drains entries one-to-one. The list is never
/// empty while the planner observes it.
pub type PortBinding = SmallVec<[EndpointKind; 2]>;

/// A component process with named inputs and outputs.
pub struct NodeEntry {
    pub id: NodeId,
    pub name: String,
    pub(crate) ingress: Vec<(String, PortBinding)>,
    pub(crate) egress: Vec<(String, PortBinding)>,
    /// The unique ingress declared as `Stdin`, if any.
    pub stdin_name: Option<String>,
    /// The unique egress declared as `Stdout`, if any.
    pub stdout_name: Option<String>,
    pub command: CommandTemplate,
    /// Zero-padded topological index, assigned by the planner and
    /// used in log file names.
    pub(crate) label: String,
    /// The edges connected to this node's ingresses. Built by the
    /// planner.
    pub(crate) incoming: SmallVec<[EdgeId; 4]>,
    /// The edges connected to this node's egresses. Built by the
    /// planner.
    pub(crate) outgoing: SmallVec<[EdgeId; 4]>,
}

impl NodeEntry {
    pub fn ingress_names(&self) -> impl Iterator<Item = &str> {
        self.ingress.iter().map(|(n, _)| n.as_str())
    }

    pub fn egress_names(&self) -> impl Iterator<Item = &str> {
        self.egress.iter().map(|(n, _)| n.as_str())
    }

    pub fn ingress_binding(&self, name: &str) -> Option<&PortBinding> {
        self.ingress.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub fn egress_binding(&self, name: &str) -> Option<&PortBinding> {
        self.egress.iter().find(|(n, _)| n == name).map(|(_, b)| b)
    }

    pub(crate) fn ingress_binding_mut(&mut self, name: &str) -> Option<&mut PortBinding> {
        self.ingress
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    pub(crate) fn egress_binding_mut(&mut self, name: &str) -> Option<&mut PortBinding> {
        self.egress
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b)
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// An [`Edge`] connects one named egress of a source node to one
/// named ingress of a target node.
#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub src_node: NodeId,
    pub src_egress: String,
    pub dst_node: NodeId,
    pub dst_ingress: String,
    pub kind: EdgeKind,
}

impl Edge {
    /// The edge's log id, e.g. `uppercased2toBeLogged`.
    pub fn log_id(&self) -> String {
        format!("{}2{}", self.src_egress, self.dst_ingress)
    }
}

/// A directed multigraph of component processes.
///
/// Nodes and edges are added during assembly; [`PipelineGraph::plan`]
/// consumes the graph and produces the [`RuntimePlan`] the process
/// supervisor executes. The graph cannot be edited afterwards.
pub struct PipelineGraph {
    pub(crate) nodes: Arena<NodeEntry>,
    pub(crate) edges: Arena<Edge>,
    pub(crate) ports: PortPool,
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new(PortPool::default())
    }
}

impl PipelineGraph {
    /// Create a graph whose planner allocates endpoints from the
    /// given pool.
    pub fn new(ports: PortPool) -> Self {
        Self {
            nodes: Arena::new(),
            edges: Arena::new(),
            ports,
        }
    }

    /// Add a component process to the graph.
    ///
    /// `ingress` and `egress` map user port names to their declared
    /// bindings. At most one ingress may bind to
    /// [`EndpointKind::Stdin`] and at most one egress to
    /// [`EndpointKind::Stdout`]; a node with no ports at all is
    /// rejected.
    pub fn add_local_node<'a>(
        &mut self,
        name: impl Into<String>,
        ingress: impl IntoIterator<Item = (&'a str, EndpointKind)>,
        egress: impl IntoIterator<Item = (&'a str, EndpointKind)>,
        command: CommandTemplate,
    ) -> Result<NodeId, GraphError> {
        let name = name.into();

        let mut stdin_name = None;
        let mut seen = AHashSet::new();
        let mut ingress_bindings: Vec<(String, PortBinding)> = Vec::new();
        for (port, kind) in ingress {
            if !seen.insert(port.to_string()) {
                return Err(GraphError::DuplicatePortName {
                    node: name.clone(),
                    port: port.to_string(),
                });
            }
            match kind {
                EndpointKind::Stdout => {
                    return Err(GraphError::IngressBoundToStdout {
                        node: name.clone(),
                        port: port.to_string(),
                    })
                }
                EndpointKind::Stdin => {
                    if stdin_name.replace(port.to_string()).is_some() {
                        return Err(GraphError::MultipleStdinBindings { node: name.clone() });
                    }
                }
                EndpointKind::Port(_) => {}
            }
            ingress_bindings.push((port.to_string(), smallvec![kind]));
        }

        let mut stdout_name = None;
        let mut seen = AHashSet::new();
        let mut egress_bindings: Vec<(String, PortBinding)> = Vec::new();
        for (port, kind) in egress {
            if !seen.insert(port.to_string()) {
                return Err(GraphError::DuplicatePortName {
                    node: name.clone(),
                    port: port.to_string(),
                });
            }
            match kind {
                EndpointKind::Stdin => {
                    return Err(GraphError::EgressBoundToStdin {
                        node: name.clone(),
                        port: port.to_string(),
                    })
                }
                EndpointKind::Stdout => {
                    if stdout_name.replace(port.to_string()).is_some() {
                        return Err(GraphError::MultipleStdoutBindings { node: name.clone() });
                    }
                }
                EndpointKind::Port(_) => {}
            }
            egress_bindings.push((port.to_string(), smallvec![kind]));
        }

        if ingress_bindings.is_empty() && egress_bindings.is_empty() {
            return Err(GraphError::EmptyNode { node: name });
        }

        let idx = self.nodes.insert(NodeEntry {
            id: NodeId(thunderdome::Index::DANGLING),
            name,
            ingress: ingress_bindings,
            egress: egress_bindings,
            stdin_name,
            stdout_name,
            command,
            label: String::new(),
            incoming: SmallVec::new(),
            outgoing: SmallVec::new(),
        });
        let id = NodeId(idx);
        self.nodes[idx].id = id;

        Ok(id)
    }

    /// Add a connection (edge) from `src`'s egress `src_egress` to
    /// `dst`'s ingress `dst_ingress`.
    ///
    /// Several edges may leave the same egress (the planner
    /// duplicates the stream). Several edges targeting the same
    /// ingress are rejected later, at planning time.
    pub fn add_edge(
        &mut self,
        src: NodeId,
        src_egress: &str,
        dst: NodeId,
        dst_ingress: &str,
        kind: EdgeKind,
    ) -> Result<EdgeId, GraphError> {
        let src_entry = self.nodes.get(src.0).ok_or(GraphError::NodeNotFound)?;
        let dst_entry = self.nodes.get(dst.0).ok_or(GraphError::NodeNotFound)?;

        if src_entry.egress_binding(src_egress).is_none() {
            return Err(GraphError::UnknownEgress {
                node: src_entry.name.clone(),
                port: src_egress.to_string(),
            });
        }
        if dst_entry.ingress_binding(dst_ingress).is_none() {
            return Err(GraphError::UnknownIngress {
                node: dst_entry.name.clone(),
                port: dst_ingress.to_string(),
            });
        }

        let idx = self.edges.insert(Edge {
            id: EdgeId(thunderdome::Index::DANGLING),
            src_node: src,
            src_egress: src_egress.to_string(),
            dst_node: dst,
            dst_ingress: dst_ingress.to_string(),
            kind,
        });
        let id = EdgeId(idx);
        self.edges[idx].id = id;

        Ok(id)
    }

    /// Shorthand for [`PipelineGraph::add_edge`] when `src` has a
    /// single egress and `dst` a single ingress.
    pub fn add_simple_edge(
        &mut self,
        src: NodeId,
        dst: NodeId,
        kind: EdgeKind,
    ) -> Result<EdgeId, GraphError> {
        let src_entry = self.nodes.get(src.0).ok_or(GraphError::NodeNotFound)?;
        let dst_entry = self.nodes.get(dst.0).ok_or(GraphError::NodeNotFound)?;

        if src_entry.egress.len() != 1 {
            return Err(GraphError::AmbiguousEgress {
                node: src_entry.name.clone(),
            });
        }
        if dst_entry.ingress.len() != 1 {
            return Err(GraphError::AmbiguousIngress {
                node: dst_entry.name.clone(),
            });
        }

        let src_egress = src_entry.egress[0].0.clone();
        let dst_ingress = dst_entry.ingress[0].0.clone();
        self.add_edge(src, &src_egress, dst, &dst_ingress, kind)
    }

    /// Get info about a node.
    pub fn node(&self, id: NodeId) -> Option<&NodeEntry> {
        self.nodes.get(id.0)
    }

    /// Get a list of all the existing nodes in the graph.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter().map(|(_, n)| n)
    }

    /// Get a list of all the existing edges in the graph.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().map(|(_, e)| e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd() -> CommandTemplate {
        CommandTemplate::new("cat")
    }

    #[test]
    fn empty_node_is_rejected() {
        let mut graph = PipelineGraph::default();
        let err = graph.add_local_node("hollow", [], [], cmd()).unwrap_err();
        assert!(matches!(err, GraphError::EmptyNode { node } if node == "hollow"));
    }

    #[test]
    fn at_most_one_stdin_ingress() {
        let mut graph = PipelineGraph::default();
        let err = graph
            .add_local_node(
                "greedy",
                [("a", EndpointKind::Stdin), ("b", EndpointKind::Stdin)],
                [],
                cmd(),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::MultipleStdinBindings { .. }));
    }

    #[test]
    fn ingress_cannot_bind_stdout() {
        let mut graph = PipelineGraph::default();
        let err = graph
            .add_local_node("backwards", [("in", EndpointKind::Stdout)], [], cmd())
            .unwrap_err();
        assert!(matches!(err, GraphError::IngressBoundToStdout { .. }));
    }

    #[test]
    fn edge_must_reference_declared_ports() {
        let mut graph = PipelineGraph::default();
        let a = graph
            .add_local_node("a", [], [("out", EndpointKind::Stdout)], cmd())
            .unwrap();
        let b = graph
            .add_local_node("b", [("in", EndpointKind::Stdin)], [], cmd())
            .unwrap();

        let err = graph
            .add_edge(a, "nonesuch", b, "in", EdgeKind::Text)
            .unwrap_err();
        assert!(
            matches!(err, GraphError::UnknownEgress { node, port } if node == "a" && port == "nonesuch")
        );

        let err = graph
            .add_edge(a, "out", b, "nonesuch", EdgeKind::Text)
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownIngress { .. }));
    }

    #[test]
    fn simple_edge_requires_unambiguous_ports() {
        let mut graph = PipelineGraph::default();
        let two_out = graph
            .add_local_node(
                "two_out",
                [],
                [("l", EndpointKind::Port(5000)), ("r", EndpointKind::Port(5001))],
                cmd(),
            )
            .unwrap();
        let sink = graph
            .add_local_node("sink", [("in", EndpointKind::Stdin)], [], cmd())
            .unwrap();

        let err = graph.add_simple_edge(two_out, sink, EdgeKind::Text).unwrap_err();
        assert!(matches!(err, GraphError::AmbiguousEgress { node } if node == "two_out"));
    }

    #[test]
    fn edge_log_id_joins_port_names() {
        let mut graph = PipelineGraph::default();
        let a = graph
            .add_local_node("a", [], [("uppercased", EndpointKind::Stdout)], cmd())
            .unwrap();
        let b = graph
            .add_local_node("b", [("toBeLogged", EndpointKind::Stdin)], [], cmd())
            .unwrap();
        let edge = graph
            .add_edge(a, "uppercased", b, "toBeLogged", EdgeKind::Text)
            .unwrap();

        let edge = graph.edges().find(|e| e.id == edge).unwrap();
        assert_eq!(edge.log_id(), "uppercased2toBeLogged");
    }
}
