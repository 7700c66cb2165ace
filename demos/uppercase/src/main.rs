//! Minimal two-node pipeline: uppercase whatever is written into
//! the advertised entrypoint and save it to /tmp/saved.txt.

use std::path::PathBuf;

use clap::Parser;

use pipewright::{
    create_pipeline, CommandTemplate, EdgeKind, EndpointKind, PipelineGraph, SupervisorConfig,
};

#[derive(Parser, Debug)]
#[command(name = "uppercase")]
struct Args {
    /// Suppress the tailing of component stderr logs.
    #[arg(long)]
    silent: bool,
    /// Where per-run log directories are created.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut graph = PipelineGraph::default();
    let uppercaser = graph.add_local_node(
        "uppercaser",
        [("rawText", EndpointKind::Stdin)],
        [("uppercased", EndpointKind::Stdout)],
        CommandTemplate::new("tr").arg("[:lower:]").arg("[:upper:]"),
    )?;
    let logger = graph.add_local_node(
        "logger",
        [("toBeLogged", EndpointKind::Stdin)],
        [],
        CommandTemplate::new("sh").arg("-c").arg("cat > /tmp/saved.txt"),
    )?;
    graph.add_edge(uppercaser, "uppercased", logger, "toBeLogged", EdgeKind::Text)?;

    let config = SupervisorConfig {
        logs_dir: args.logs_dir,
        silent: args.silent,
        ..Default::default()
    };
    create_pipeline(graph, config).await?;
    Ok(())
}
