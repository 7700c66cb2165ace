//! Brings a runtime plan up and holds the pipeline until it is
//! interrupted, then tears everything down as one unit.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use pipewright_core::time;
use pipewright_graph::{PipelineGraph, PlanError, RuntimePlan, WireJob};

use crate::child::{self, RunningChild};
use crate::logs::{self, LogRouter};
use crate::wire;

const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root under which each run creates a timestamped directory.
    pub logs_dir: PathBuf,
    /// Suppress the tailing of component stderr files.
    pub silent: bool,
    /// How long children get between the term signal and the
    /// forced kill.
    pub grace: Duration,
    /// How long wiring tasks get to drain after cancellation.
    pub drain: Duration,
    /// Delay between connection attempts to a not-yet-ready
    /// listener.
    pub connect_retry: Duration,
    /// Time-series endpoint for the per-edge throughput sampler.
    #[cfg(feature = "metrics")]
    pub metrics_url: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            logs_dir: PathBuf::from("logs"),
            silent: false,
            grace: Duration::from_secs(3),
            drain: Duration::from_secs(3),
            connect_retry: Duration::from_secs(1),
            #[cfg(feature = "metrics")]
            metrics_url: None,
        }
    }
}

/// An error occurred while bringing the pipeline up.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to create log directory: {0}")]
    CreateLogDir(#[source] io::Error),
    #[error("failed to spawn component `{node}`: {source}")]
    Spawn { node: String, source: io::Error },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Planning or supervision failed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Plan the graph and supervise the resulting pipeline until it
/// is interrupted.
pub async fn create_pipeline(
    graph: PipelineGraph,
    config: SupervisorConfig,
) -> Result<(), PipelineError> {
    let plan = graph.plan()?;
    Supervisor::new(config).run(plan).await?;
    Ok(())
}

pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Bring the plan up and hold the pipeline until interrupted,
    /// then tear everything down.
    pub async fn run(&self, plan: RuntimePlan) -> Result<(), SupervisorError> {
        let mut pipeline = self.bring_up(plan).await?;

        log::info!(
            "container {} is starting, follow logs: {}",
            logs::hostname(),
            pipeline.run_dir.display()
        );

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);
        loop {
            tokio::select! {
                r = &mut ctrl_c => {
                    if let Err(e) = r {
                        log::error!("failed to listen for the interrupt signal: {e}");
                    }
                    break;
                }
                _ = poll.tick() => {
                    // Exits are logged, not recovered.
                    for child in &mut pipeline.children {
                        child.poll_exit();
                    }
                }
            }
        }

        log::info!("interrupt received, shutting the pipeline down");
        pipeline
            .shut_down(self.config.grace, self.config.drain)
            .await;
        Ok(())
    }

    /// Spawn every wiring job and every component of the plan.
    ///
    /// Entrypoint advertisements are printed before anything
    /// starts.
    pub async fn bring_up(&self, plan: RuntimePlan) -> Result<RunningPipeline, SupervisorError> {
        let run_dir = self.config.logs_dir.join(time::run_stamp());
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(SupervisorError::CreateLogDir)?;
        logs::write_info(&self.config.logs_dir, &run_dir).await?;

        for entrypoint in &plan.entrypoints {
            println!("{entrypoint}");
        }

        #[allow(unused_mut)]
        let mut router = LogRouter::new(run_dir.clone());
        #[cfg(feature = "metrics")]
        {
            router = router.with_metrics(self.config.metrics_url.clone());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let retry = self.config.connect_retry;

        let mut wire_tasks = Vec::with_capacity(plan.wires.len());
        for wire_job in plan.wires {
            let shutdown = shutdown_rx.clone();
            let task: JoinHandle<io::Result<()>> = match wire_job {
                WireJob::Proxy {
                    listen,
                    bridge,
                    fan_out,
                } => tokio::spawn(wire::run_proxy(listen, bridge, fan_out, retry, shutdown)),
                WireJob::FanOut { listen, fan_out } => {
                    tokio::spawn(wire::run_fan_out(listen, fan_out, retry, shutdown))
                }
                WireJob::Edge {
                    listen,
                    connect,
                    log,
                } => {
                    let sink = router.edge_sink(&log);
                    tokio::spawn(wire::run_edge(listen, connect, sink, retry, shutdown))
                }
            };
            wire_tasks.push(task);
        }

        let mut children = Vec::with_capacity(plan.launches.len());
        for job in &plan.launches {
            let running = child::launch(job, &router, retry, shutdown_rx.clone())
                .await
                .map_err(|source| SupervisorError::Spawn {
                    node: job.node_name.clone(),
                    source,
                })?;
            children.push(running);
        }

        let tailer = (!self.config.silent)
            .then(|| tokio::spawn(logs::tail_stderr_logs(run_dir.clone(), shutdown_rx)));

        Ok(RunningPipeline {
            run_dir,
            shutdown_tx,
            wire_tasks,
            children,
            tailer,
        })
    }
}

/// A pipeline that has been brought up.
pub struct RunningPipeline {
    pub run_dir: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    wire_tasks: Vec<JoinHandle<io::Result<()>>>,
    children: Vec<RunningChild>,
    tailer: Option<JoinHandle<()>>,
}

impl RunningPipeline {
    /// Cooperative teardown: mark every wiring task draining,
    /// signal every child, and join everything within bounded
    /// windows.
    pub async fn shut_down(mut self, grace: Duration, drain: Duration) {
        let _ = self.shutdown_tx.send(true);

        for child in &mut self.children {
            child.terminate(grace).await;
        }
        for child in &mut self.children {
            child.join_io(drain).await;
        }

        for mut task in self.wire_tasks.drain(..) {
            match tokio::time::timeout(drain, &mut task).await {
                Ok(Ok(Err(e))) => log::warn!("wiring task ended with error: {e}"),
                Ok(_) => {}
                Err(_) => task.abort(),
            }
        }

        if let Some(tailer) = self.tailer.take() {
            let _ = tailer.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_core::{CommandTemplate, EdgeKind, EndpointKind, PortPool};
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    fn config(root: &std::path::Path) -> SupervisorConfig {
        SupervisorConfig {
            logs_dir: root.join("logs"),
            silent: true,
            grace: Duration::from_secs(2),
            drain: Duration::from_secs(2),
            connect_retry: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bring_up_creates_run_directory_and_info() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(dir.path()));

        let plan = RuntimePlan {
            wires: vec![],
            launches: vec![],
            entrypoints: vec![],
        };
        let pipeline = supervisor.bring_up(plan).await.unwrap();

        assert!(pipeline.run_dir.is_dir());
        assert!(dir.path().join("logs").join("INFO").is_file());

        pipeline
            .shut_down(Duration::from_millis(100), Duration::from_millis(100))
            .await;
    }

    // Bytes written into the advertised entrypoint traverse the
    // whole chain unchanged:
    //
    //  ┌──────┐  ┌───────┐  ┌──────┐
    //  │ head ┼──► upper ┼──► sink │
    //  └──────┘  └───────┘  └──────┘
    #[tokio::test]
    async fn bytes_flow_end_to_end_through_a_planned_chain() {
        let dir = tempfile::tempdir().unwrap();
        let out_file = dir.path().join("received.txt");

        let mut graph = PipelineGraph::new(PortPool::new(9150, 9180));
        let head = graph
            .add_local_node(
                "head",
                [("in", EndpointKind::Stdin)],
                [("out", EndpointKind::Stdout)],
                CommandTemplate::new("cat"),
            )
            .unwrap();
        let upper = graph
            .add_local_node(
                "upper",
                [("in", EndpointKind::Stdin)],
                [("out", EndpointKind::Stdout)],
                CommandTemplate::new("tr").arg("a-z").arg("A-Z"),
            )
            .unwrap();
        let sink = graph
            .add_local_node(
                "sink",
                [("in", EndpointKind::Stdin)],
                [],
                CommandTemplate::new("sh")
                    .arg("-c")
                    .arg(format!("cat > {}", out_file.display())),
            )
            .unwrap();
        graph.add_edge(head, "out", upper, "in", EdgeKind::Text).unwrap();
        graph.add_edge(upper, "out", sink, "in", EdgeKind::Text).unwrap();

        let plan = graph.plan().unwrap();
        assert_eq!(plan.entrypoints.len(), 1);
        let entry = plan.entrypoints[0].endpoint;

        let supervisor = Supervisor::new(config(dir.path()));
        let pipeline = supervisor.bring_up(plan).await.unwrap();

        let mut producer = TcpStream::connect((Ipv4Addr::LOCALHOST, entry))
            .await
            .unwrap();
        producer.write_all(b"hello pipeline\n").await.unwrap();
        producer.flush().await.unwrap();

        // The sink file fills in as the bytes ripple through.
        let mut received = String::new();
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(contents) = std::fs::read_to_string(&out_file) {
                if !contents.is_empty() {
                    received = contents;
                    break;
                }
            }
        }
        assert_eq!(received, "HELLO PIPELINE\n");

        let run_dir = pipeline.run_dir.clone();
        pipeline
            .shut_down(Duration::from_secs(2), Duration::from_secs(2))
            .await;

        // One log file per edge, stamped because the edges are
        // text; stderr files for every component.
        let first_edge =
            std::fs::read_to_string(run_dir.join("l_00-01-out2in.log")).unwrap();
        assert!(first_edge.starts_with('['));
        assert!(first_edge.contains("hello pipeline"));
        let second_edge =
            std::fs::read_to_string(run_dir.join("l_01-02-out2in.log")).unwrap();
        assert!(second_edge.contains("HELLO PIPELINE"));
        assert!(run_dir.join("00-head.err").is_file());
        assert!(run_dir.join("01-upper.err").is_file());
        assert!(run_dir.join("02-sink.err").is_file());
    }
}
