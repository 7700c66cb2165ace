use pipewright_core::PoolExhausted;

/// An error occurred while declaring a node or an edge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// The node declares no ingress and no egress.
    #[error("node `{node}` does not have any input or output")]
    EmptyNode { node: String },
    /// A port name appears twice in the same direction.
    #[error("node `{node}` declares port `{port}` more than once")]
    DuplicatePortName { node: String, port: String },
    /// More than one ingress is bound to stdin.
    #[error("node `{node}` binds more than one input to stdin")]
    MultipleStdinBindings { node: String },
    /// More than one egress is bound to stdout.
    #[error("node `{node}` binds more than one output to stdout")]
    MultipleStdoutBindings { node: String },
    /// An ingress cannot be bound to stdout.
    #[error("node `{node}` binds input `{port}` to stdout")]
    IngressBoundToStdout { node: String, port: String },
    /// An egress cannot be bound to stdin.
    #[error("node `{node}` binds output `{port}` to stdin")]
    EgressBoundToStdin { node: String, port: String },
    /// The referenced node is not in the graph.
    #[error("node not found in the graph")]
    NodeNotFound,
    /// The edge references an egress name the source node did not
    /// declare.
    #[error("node `{node}` does not have an output named `{port}`")]
    UnknownEgress { node: String, port: String },
    /// The edge references an ingress name the target node did not
    /// declare.
    #[error("node `{node}` does not have an input named `{port}`")]
    UnknownIngress { node: String, port: String },
    /// `add_simple_edge` needs a single-output source.
    #[error("node `{node}` has more than one output; use add_edge and name the output")]
    AmbiguousEgress { node: String },
    /// `add_simple_edge` needs a single-input target.
    #[error("node `{node}` has more than one input; use add_edge and name the input")]
    AmbiguousIngress { node: String },
}

/// An error occurred while planning the graph into a runtime plan.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PlanError {
    /// Two or more edges target the same `(node, ingress)` pair.
    #[error(
        "multiple incoming outputs [{}] to an input of node `{node}`; did you mean to use octocat?",
        ingresses.join(" ")
    )]
    MultipleProducersToInput {
        node: String,
        ingresses: Vec<String>,
    },
    /// The endpoint pool was drained mid-plan.
    #[error(transparent)]
    PoolExhausted(#[from] PoolExhausted),
}
