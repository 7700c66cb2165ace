pub mod graph;

pub use graph::{
    Edge, EdgeId, EdgeLog, Entrypoint, GraphError, LaunchJob, NodeEntry, NodeId, PipelineGraph,
    PlanError, PortBinding, RuntimePlan, WireJob,
};
