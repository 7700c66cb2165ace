use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use smallvec::smallvec;
use thunderdome::Arena;

use pipewright_core::{EndpointKind, PortPool};

use super::{
    error::PlanError,
    plan::{EdgeLog, Entrypoint, LaunchJob, RuntimePlan, WireJob},
    Edge, EdgeId, NodeEntry, PipelineGraph,
};

impl PipelineGraph {
    /// Compile the graph into a [`RuntimePlan`].
    ///
    /// Consumes the graph: planning rewrites port bindings in place
    /// and drains them while wiring, so the declaration is not
    /// observable afterwards.
    pub fn plan(self) -> Result<RuntimePlan, PlanError> {
        Ok(PlannerIR::preprocess(self)
            .sanity_check()?
            .label_topologically()
            .insert_proxies()?
            .bridge_stdio()?
            .wire_edges()
            .finish())
    }
}

/// Internal IR used by the planner. Built incrementally via the
/// planner passes.
struct PlannerIR {
    nodes: Arena<NodeEntry>,
    edges: Arena<Edge>,
    ports: PortPool,

    /// Node ids in topological order. Built internally.
    topo: Vec<super::NodeId>,
    wires: Vec<WireJob>,
    launches: Vec<LaunchJob>,
}

impl PlannerIR {
    /// Construct the IR from the graph, building up the adjacency
    /// lists.
    fn preprocess(graph: PipelineGraph) -> Self {
        let PipelineGraph {
            mut nodes,
            edges,
            ports,
        } = graph;

        for (_, node) in nodes.iter_mut() {
            node.incoming.clear();
            node.outgoing.clear();
        }

        for (idx, edge) in edges.iter() {
            nodes[edge.src_node.0].outgoing.push(EdgeId(idx));
            nodes[edge.dst_node.0].incoming.push(EdgeId(idx));
        }

        Self {
            nodes,
            edges,
            ports,
            topo: vec![],
            wires: vec![],
            launches: vec![],
        }
    }

    /// Reject nodes where two or more edges target the same
    /// ingress: an ingress carries exactly one producer's stream.
    fn sanity_check(self) -> Result<Self, PlanError> {
        for (_, node) in self.nodes.iter() {
            if node.incoming.len() < 2 {
                continue;
            }
            let names: AHashSet<&str> = node
                .incoming
                .iter()
                .map(|id| self.edges[id.0].dst_ingress.as_str())
                .collect();
            if names.len() < node.incoming.len() {
                let mut ingresses: Vec<String> = names.into_iter().map(String::from).collect();
                ingresses.sort_unstable();
                return Err(PlanError::MultipleProducersToInput {
                    node: node.name.clone(),
                    ingresses,
                });
            }
        }
        Ok(self)
    }

    /// Sort the nodes topologically using Kahn's algorithm and
    /// assign each a zero-padded label, so that log file listings
    /// approximate dataflow order.
    /// https://www.geeksforgeeks.org/topological-sorting-indegree-based-solution/
    fn label_topologically(mut self) -> Self {
        let mut in_degree: AHashMap<super::NodeId, usize> = self
            .nodes
            .iter()
            .map(|(_, node)| (node.id, node.incoming.len()))
            .collect();
        let mut queue = VecDeque::with_capacity(self.nodes.len());

        // Enqueue vertices with 0 in-degree, in insertion order.
        for (_, node) in self.nodes.iter() {
            if node.incoming.is_empty() {
                queue.push_back(node.id);
            }
        }

        // BFS traversal
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node_id) = queue.pop_front() {
            order.push(node_id);

            // Reduce in-degree of adjacent vertices
            for edge_id in self.nodes[node_id.0].outgoing.clone() {
                let dst = self.edges[edge_id.0].dst_node;
                if let Some(deg) = in_degree.get_mut(&dst) {
                    *deg -= 1;

                    // If in-degree becomes 0, enqueue it
                    if *deg == 0 {
                        queue.push_back(dst);
                    }
                }
            }
        }

        // Nodes not reached sit on a declared cycle. They are
        // labelled after the acyclic part, in insertion order.
        if order.len() != self.nodes.len() {
            let seen: AHashSet<super::NodeId> = order.iter().copied().collect();
            for (_, node) in self.nodes.iter() {
                if !seen.contains(&node.id) {
                    order.push(node.id);
                }
            }
        }

        for (counter, node_id) in order.iter().enumerate() {
            self.nodes[node_id.0].label = format!("{:02}", counter);
        }
        self.topo = order;
        self
    }

    /// If an egress is consumed by more than one ingress, the
    /// stream needs to be duplicated that many times. And if an
    /// egress shares a port with one of the node's own ingresses,
    /// both sides are rerouted through fresh endpoints and bridged
    /// over the shared one.
    fn insert_proxies(mut self) -> Result<Self, PlanError> {
        for node_id in self.topo.clone() {
            // Sampled once per node: a rewrite must not re-trigger
            // on its own fresh ports.
            let in_kinds: Vec<EndpointKind> = self.nodes[node_id.0]
                .ingress
                .iter()
                .flat_map(|(_, binding)| binding.iter().copied())
                .collect();

            // Out-edges grouped by egress name, in first-use order.
            let mut grouped: Vec<(String, usize)> = Vec::new();
            for edge_id in self.nodes[node_id.0].outgoing.clone() {
                let egress = &self.edges[edge_id.0].src_egress;
                match grouped.iter_mut().find(|(name, _)| name == egress) {
                    Some((_, count)) => *count += 1,
                    None => grouped.push((egress.clone(), 1)),
                }
            }

            for (egress_name, count) in grouped {
                let out_kind = self.nodes[node_id.0]
                    .egress_binding(&egress_name)
                    .expect("edge references a declared egress")[0];

                if in_kinds.contains(&out_kind) {
                    // The node reads and writes on one socket it
                    // owns. The proxy accepts the rerouted ingress
                    // stream, bridges it over the shared port, and
                    // fans the result back out.
                    let EndpointKind::Port(bridge) = out_kind else {
                        // Stdin egresses and stdout ingresses are
                        // rejected at declaration time.
                        unreachable!("aliased binding is always a port");
                    };
                    let mut fan_out = Vec::with_capacity(count);
                    for _ in 0..count {
                        fan_out.push(self.ports.acquire()?);
                    }
                    let listen = self.ports.acquire()?;

                    let node = &mut self.nodes[node_id.0];
                    let ingress_name = node
                        .ingress
                        .iter()
                        .find(|(_, binding)| binding.contains(&out_kind))
                        .map(|(name, _)| name.clone())
                        .expect("alias implies a matching ingress");
                    *node
                        .ingress_binding_mut(&ingress_name)
                        .expect("declared ingress") = smallvec![EndpointKind::Port(listen)];
                    *node
                        .egress_binding_mut(&egress_name)
                        .expect("declared egress") =
                        fan_out.iter().map(|p| EndpointKind::Port(*p)).collect();

                    self.wires.push(WireJob::Proxy {
                        listen,
                        bridge,
                        fan_out,
                    });
                } else if count > 1 && out_kind != EndpointKind::Stdout {
                    // Plain fan-out from a declared port. Stdout
                    // fan-out is folded into the launch bridging.
                    let EndpointKind::Port(listen) = out_kind else {
                        unreachable!("fanned-out binding is always a port");
                    };
                    let mut fan_out = Vec::with_capacity(count);
                    for _ in 0..count {
                        fan_out.push(self.ports.acquire()?);
                    }
                    *self.nodes[node_id.0]
                        .egress_binding_mut(&egress_name)
                        .expect("declared egress") =
                        fan_out.iter().map(|p| EndpointKind::Port(*p)).collect();

                    self.wires.push(WireJob::FanOut { listen, fan_out });
                }
            }
        }
        Ok(self)
    }

    /// Make standard streams addressable. A bridged stdin gets an
    /// endpoint the runtime accepts on and feeds into the child; a
    /// bridged stdout is captured from the child and fanned out to
    /// one endpoint per consuming edge.
    fn bridge_stdio(mut self) -> Result<Self, PlanError> {
        for node_id in self.topo.clone() {
            let (name, label, command, stdin_name, stdout_name) = {
                let node = &self.nodes[node_id.0];
                (
                    node.name.clone(),
                    node.label.clone(),
                    node.command.clone(),
                    node.stdin_name.clone(),
                    node.stdout_name.clone(),
                )
            };

            let mut stdin_port = None;
            if let Some(ingress_name) = stdin_name {
                let port = self.ports.acquire()?;
                *self.nodes[node_id.0]
                    .ingress_binding_mut(&ingress_name)
                    .expect("declared ingress") = smallvec![EndpointKind::Port(port)];
                stdin_port = Some(port);
            }

            let mut stdout_ports = Vec::new();
            if let Some(egress_name) = stdout_name {
                let fan = self.nodes[node_id.0]
                    .outgoing
                    .iter()
                    .filter(|id| self.edges[id.0].src_egress == egress_name)
                    .count();
                if fan > 0 {
                    for _ in 0..fan {
                        stdout_ports.push(self.ports.acquire()?);
                    }
                    *self.nodes[node_id.0]
                        .egress_binding_mut(&egress_name)
                        .expect("declared egress") =
                        stdout_ports.iter().map(|p| EndpointKind::Port(*p)).collect();
                }
            }

            self.launches.push(LaunchJob {
                node_name: name.clone(),
                label: label.clone(),
                command,
                stdin_port,
                stdout_ports,
                stderr_file: format!("{}-{}.err", label, name),
            });
        }
        Ok(self)
    }

    /// Emit one wiring job per declared edge, draining the source
    /// and target binding lists one endpoint per edge.
    fn wire_edges(mut self) -> Self {
        let edge_ids: Vec<EdgeId> = self.edges.iter().map(|(idx, _)| EdgeId(idx)).collect();

        for id in edge_ids {
            let (src, src_egress, dst, dst_ingress, kind) = {
                let edge = &self.edges[id.0];
                (
                    edge.src_node,
                    edge.src_egress.clone(),
                    edge.dst_node,
                    edge.dst_ingress.clone(),
                    edge.kind,
                )
            };

            let src_label = self.nodes[src.0].label.clone();
            let dst_label = self.nodes[dst.0].label.clone();

            let listen = self.nodes[src.0]
                .egress_binding_mut(&src_egress)
                .expect("declared egress")
                .pop()
                .expect("egress binding drained before its edge")
                .port()
                .expect("wired egress resolved to a port");
            let connect = self.nodes[dst.0]
                .ingress_binding_mut(&dst_ingress)
                .expect("declared ingress")
                .pop()
                .expect("ingress binding drained before its edge")
                .port()
                .expect("wired ingress resolved to a port");

            let file_name = format!(
                "l_{}-{}-{}2{}.{}",
                src_label,
                dst_label,
                src_egress,
                dst_ingress,
                kind.suffix()
            );
            self.wires.push(WireJob::Edge {
                listen,
                connect,
                log: EdgeLog { file_name, kind },
            });
        }
        self
    }

    /// Surface entrypoints: nodes nothing feeds, that feed others,
    /// and that read standard input. External producers connect to
    /// their bridged stdin endpoints.
    fn finish(self) -> RuntimePlan {
        let mut entrypoints = Vec::new();
        for (_, node) in self.nodes.iter() {
            if !node.incoming.is_empty() || node.outgoing.is_empty() {
                continue;
            }
            let Some(stdin_name) = &node.stdin_name else {
                continue;
            };
            let binding = node.ingress_binding(stdin_name).expect("declared ingress");
            if let Some(EndpointKind::Port(port)) = binding.first() {
                entrypoints.push(Entrypoint {
                    node_name: node.name.clone(),
                    endpoint: *port,
                });
            }
        }

        log::debug!(
            "planned pipeline: {} wiring jobs, {} launches, {} entrypoints",
            self.wires.len(),
            self.launches.len(),
            entrypoints.len()
        );

        RuntimePlan {
            wires: self.wires,
            launches: self.launches,
            entrypoints,
        }
    }
}
