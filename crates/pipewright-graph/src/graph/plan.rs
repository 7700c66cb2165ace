use std::fmt;

use pipewright_core::{CommandTemplate, EdgeKind, EndpointId};

/// The compiled form of a [`PipelineGraph`](super::PipelineGraph):
/// everything the runtime needs to bring the pipeline up, with all
/// endpoints resolved to concrete ids and all log files named.
///
/// The plan never refers back to the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimePlan {
    /// Byte-moving tasks, in emission order (proxies, then edges).
    pub wires: Vec<WireJob>,
    /// Child processes, in topological order.
    pub launches: Vec<LaunchJob>,
    /// Where external producers should connect.
    pub entrypoints: Vec<Entrypoint>,
}

/// A runtime task that moves bytes between endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireJob {
    /// Break an endpoint alias: a node's egress and ingress were
    /// declared on the same port.
    ///
    /// The aliased node itself owns `bridge` (it reads and writes
    /// on that one socket). The task accepts on `listen`, opens a
    /// single bidirectional connection to `bridge`, feeds accepted
    /// bytes in, and fans whatever comes back out to every
    /// endpoint in `fan_out`.
    Proxy {
        listen: EndpointId,
        bridge: EndpointId,
        fan_out: Vec<EndpointId>,
    },
    /// Duplicate one egress stream to several consumers: accept on
    /// `listen`, copy every byte to each endpoint in `fan_out`.
    FanOut {
        listen: EndpointId,
        fan_out: Vec<EndpointId>,
    },
    /// Carry one declared edge: accept on `listen`, tee to the
    /// edge log, forward to `connect`.
    Edge {
        listen: EndpointId,
        connect: EndpointId,
        log: EdgeLog,
    },
}

/// The on-disk tee of one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLog {
    /// File name relative to the run's log directory, e.g.
    /// `l_00-01-uppercased2toBeLogged.log`.
    pub file_name: String,
    pub kind: EdgeKind,
}

/// A child process to launch, with its bridged streams resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchJob {
    pub node_name: String,
    /// Zero-padded topological index, used in log file names.
    pub label: String,
    pub command: CommandTemplate,
    /// Accept on this endpoint and feed the bytes to the child's
    /// standard input.
    pub stdin_port: Option<EndpointId>,
    /// Capture the child's standard output and fan it out to these
    /// endpoints.
    pub stdout_ports: Vec<EndpointId>,
    /// Stderr log file name relative to the run's log directory.
    pub stderr_file: String,
}

/// A node whose synthetic stdin endpoint is surfaced to external
/// producers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub node_name: String,
    pub endpoint: EndpointId,
}

impl fmt::Display for Entrypoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "# {} entrypoint: [{}]", self.node_name, self.endpoint)
    }
}
