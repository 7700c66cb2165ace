//! Launching components with captured streams.
//!
//! A child's bridged stdin reads from its allocated endpoint, its
//! bridged stdout is captured line by line and fanned out to its
//! allocated endpoints, and its stderr always lands in a
//! timestamped `.err` file.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use pipewright_core::CommandTemplate;
use pipewright_graph::LaunchJob;

use crate::logs::{LogRouter, LogSink};
use crate::wire::{bind_retry, connect_retry};

const READ_BUF_SIZE: usize = 8192;

/// A supervised component process, plus the tasks moving bytes in
/// and out of it.
pub struct RunningChild {
    pub node_name: String,
    pub label: String,
    child: Child,
    exited: Option<ExitStatus>,
    io_tasks: Vec<JoinHandle<()>>,
}

pub(crate) fn build_command(template: &CommandTemplate) -> Command {
    let mut command = Command::new(template.program());
    command.args(template.arguments());
    for (key, val) in template.environment() {
        command.env(key, val);
    }
    command
}

/// Components block-buffer when their stdout is a pipe. The
/// pipeline assumes live streams, so a captured stdout is forced
/// to line buffering.
#[cfg(unix)]
fn build_line_buffered(template: &CommandTemplate) -> Command {
    let mut command = Command::new("stdbuf");
    command.arg("-oL").arg(template.program());
    command.args(template.arguments());
    for (key, val) in template.environment() {
        command.env(key, val);
    }
    command
}

#[cfg(not(unix))]
fn build_line_buffered(template: &CommandTemplate) -> Command {
    build_command(template)
}

/// Spawn one component with its bridged streams wired up.
pub async fn launch(
    job: &LaunchJob,
    router: &LogRouter,
    retry: Duration,
    shutdown: watch::Receiver<bool>,
) -> io::Result<RunningChild> {
    let mut command = if job.stdout_ports.is_empty() {
        build_command(&job.command)
    } else {
        build_line_buffered(&job.command)
    };
    command
        .stdin(if job.stdin_port.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(if job.stdout_ports.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        })
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    // Bind the stdin endpoint before spawning so a probing
    // producer never races the child.
    let stdin_listener = match job.stdin_port {
        Some(port) => Some(bind_retry(port, retry).await?),
        None => None,
    };

    let mut child = command.spawn()?;
    let mut io_tasks = Vec::new();

    if let Some(listener) = stdin_listener {
        let stdin = child.stdin.take().expect("stdin was piped");
        io_tasks.push(tokio::spawn(feed_stdin(listener, stdin, shutdown.clone())));
    }

    if !job.stdout_ports.is_empty() {
        let stdout = child.stdout.take().expect("stdout was piped");
        io_tasks.push(tokio::spawn(capture_stdout(
            stdout,
            job.stdout_ports.clone(),
            retry,
            shutdown.clone(),
        )));
    }

    let stderr = child.stderr.take().expect("stderr was piped");
    io_tasks.push(tokio::spawn(route_stderr(
        stderr,
        router.stderr_sink(&job.stderr_file),
    )));

    log::info!(
        "launched component `{}` (pid {})",
        job.node_name,
        child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
    );

    Ok(RunningChild {
        node_name: job.node_name.clone(),
        label: job.label.clone(),
        child,
        exited: None,
        io_tasks,
    })
}

/// Accept on the child's stdin endpoint and stream accepted bytes
/// into the child. Stays accepting across probe connections.
async fn feed_stdin(
    listener: TcpListener,
    mut stdin: ChildStdin,
    mut shutdown: watch::Receiver<bool>,
) {
    let result = tokio::select! {
        r = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let (mut conn, _) = listener.accept().await?;
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            log::warn!("stdin upstream read failed: {e}");
                            break;
                        }
                    };
                    stdin.write_all(&buf[..n]).await?;
                }
            }
        } => r,
        _ = shutdown.changed() => Ok::<(), io::Error>(()),
    };

    if let Err(e) = result {
        log::warn!("stdin bridge ended: {e}");
    }
    let _ = stdin.shutdown().await;
}

/// Capture the child's stdout and fan it out, whole lines at a
/// time, to every allocated endpoint. Streams are assumed live,
/// so nothing is held back beyond the current line.
async fn capture_stdout(
    stdout: ChildStdout,
    ports: Vec<u16>,
    retry: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sinks = Vec::with_capacity(ports.len());
    for port in ports {
        sinks.push(connect_retry(port, retry).await);
    }

    let mut reader = BufReader::new(stdout);
    let mut line = Vec::new();
    let result = tokio::select! {
        r = async {
            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 {
                    break;
                }
                for sink in sinks.iter_mut() {
                    sink.write_all(&line).await?;
                }
            }
            Ok::<(), io::Error>(())
        } => r,
        _ = shutdown.changed() => Ok(()),
    };

    if let Err(e) = result {
        log::warn!("stdout capture ended: {e}");
    }
    for sink in sinks.iter_mut() {
        let _ = sink.shutdown().await;
    }
}

async fn route_stderr(mut stderr: ChildStderr, mut sink: LogSink) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
    sink.finish().await;
}

impl RunningChild {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Poll for an exit without blocking. An abnormal exit is
    /// logged the first time it is observed; it is not recovered.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if let Some(status) = self.exited {
            return Some(status);
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if status.success() {
                    log::info!("component `{}` exited cleanly", self.node_name);
                } else {
                    log::warn!("component `{}` exited: {status}", self.node_name);
                }
                self.exited = Some(status);
                Some(status)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("failed to poll component `{}`: {e}", self.node_name);
                None
            }
        }
    }

    /// Wait for the child to exit on its own.
    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        if let Some(status) = self.exited {
            return Ok(status);
        }
        let status = self.child.wait().await?;
        self.exited = Some(status);
        Ok(status)
    }

    /// Signal the child's process group, wait out the grace
    /// window, then force-kill stragglers.
    pub async fn terminate(&mut self, grace: Duration) {
        if self.exited.is_some() {
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            signal_group(pid, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = self.child.start_kill();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exited = Some(status);
            }
            Ok(Err(e)) => {
                log::warn!("failed to reap component `{}`: {e}", self.node_name);
            }
            Err(_) => {
                log::warn!(
                    "component `{}` ignored the term signal, killing",
                    self.node_name
                );
                #[cfg(unix)]
                if let Some(pid) = self.child.id() {
                    signal_group(pid, libc::SIGKILL);
                }
                let _ = self.child.start_kill();
                if let Ok(status) = self.child.wait().await {
                    self.exited = Some(status);
                }
            }
        }
    }

    /// Join the child's stream tasks, aborting any that outlive
    /// the drain window.
    pub async fn join_io(&mut self, drain: Duration) {
        for mut task in self.io_tasks.drain(..) {
            if tokio::time::timeout(drain, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

/// A negative pid addresses the whole process group.
#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_command_maps_program_args_and_env() {
        let template = CommandTemplate::new("tr")
            .arg("[:lower:]")
            .arg("[:upper:]")
            .env("LC_ALL", "C");
        let command = build_command(&template);
        let std_command = command.as_std();

        assert_eq!(std_command.get_program(), "tr");
        let args: Vec<_> = std_command.get_args().collect();
        assert_eq!(args, ["[:lower:]", "[:upper:]"]);
        assert!(std_command
            .get_envs()
            .any(|(k, v)| k == "LC_ALL" && v == Some("C".as_ref())));
    }

    #[tokio::test]
    async fn stderr_is_routed_to_a_stamped_file() {
        let dir = tempfile::tempdir().unwrap();
        let router = LogRouter::new(dir.path().to_path_buf());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let job = LaunchJob {
            node_name: "whiner".into(),
            label: "00".into(),
            command: CommandTemplate::new("sh").arg("-c").arg("echo oops >&2"),
            stdin_port: None,
            stdout_ports: vec![],
            stderr_file: "00-whiner.err".into(),
        };

        let mut child = launch(&job, &router, Duration::from_millis(50), shutdown_rx)
            .await
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(status.success());
        child.join_io(Duration::from_secs(2)).await;

        let logged =
            std::fs::read_to_string(dir.path().join("00-whiner.err")).unwrap();
        assert!(logged.starts_with('['), "missing stamp in {logged:?}");
        assert!(logged.contains("oops"));
    }

    #[tokio::test]
    async fn terminate_reaps_a_lingering_child() {
        let dir = tempfile::tempdir().unwrap();
        let router = LogRouter::new(dir.path().to_path_buf());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let job = LaunchJob {
            node_name: "sleeper".into(),
            label: "00".into(),
            command: CommandTemplate::new("sleep").arg("30"),
            stdin_port: None,
            stdout_ports: vec![],
            stderr_file: "00-sleeper.err".into(),
        };

        let mut child = launch(&job, &router, Duration::from_millis(50), shutdown_rx)
            .await
            .unwrap();
        assert!(child.poll_exit().is_none());

        child.terminate(Duration::from_secs(2)).await;
        assert!(child.poll_exit().is_some());
        child.join_io(Duration::from_secs(2)).await;
    }
}
