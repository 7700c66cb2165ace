//! One-of-N input selector.
//!
//! Every `*.in` descriptor file in the working directory declares
//! an input (`stdin` or a port to listen on). The `SELECT` file
//! names the input whose bytes are copied to stdout; every input
//! additionally gets a `*.preview` shadow copy. `SELECT` is
//! re-read at every `--interval` boundary, and a change takes
//! effect at the first boundary at which it is observed; bytes
//! queued from the previously active input are discarded at the
//! switch.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const READ_BUF_SIZE: usize = 1024;
const QUEUE_CHUNKS: usize = 1024;

/// Copies the selected input to stdout, shadowing every input
/// into a preview file.
#[derive(Parser, Debug)]
#[command(name = "octocat")]
struct Args {
    /// Seconds between SELECT polls.
    #[arg(long, default_value_t = 0.5)]
    interval: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InputKind {
    Stdin,
    Port(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InputSpec {
    name: String,
    kind: InputKind,
    preview: PathBuf,
}

/// Load `*.in` descriptors, sorted by name so the default input
/// is stable.
fn load_inputs(dir: &Path) -> anyhow::Result<Vec<InputSpec>> {
    let mut inputs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map(|e| e != "in").unwrap_or(true) {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("unusable descriptor name {}", path.display()))?
            .to_string();
        let value = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value = value.lines().next().unwrap_or("").trim();
        let kind = if value == "stdin" {
            InputKind::Stdin
        } else {
            InputKind::Port(
                value
                    .parse()
                    .with_context(|| format!("invalid input descriptor `{value}` for {name}"))?,
            )
        };
        inputs.push(InputSpec {
            preview: dir.join(format!("{name}.preview")),
            name,
            kind,
        });
    }
    inputs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(inputs)
}

/// The input `SELECT` names, falling back to the first input when
/// the file is missing or names nothing we know.
fn read_select(dir: &Path, inputs: &[InputSpec]) -> String {
    if let Ok(contents) = std::fs::read_to_string(dir.join("SELECT")) {
        let wanted = contents.lines().next().unwrap_or("").trim();
        if inputs.iter().any(|i| i.name == wanted) {
            return wanted.to_string();
        }
    }
    inputs[0].name.clone()
}

struct Feed {
    active: Arc<AtomicBool>,
    rx: Option<mpsc::Receiver<Vec<u8>>>,
}

fn spawn_input(spec: &InputSpec) -> Feed {
    let active = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel(QUEUE_CHUNKS);

    match spec.kind {
        InputKind::Stdin => {
            tokio::spawn(run_stdin_input(spec.preview.clone(), active.clone(), tx));
        }
        InputKind::Port(port) => {
            tokio::spawn(run_socket_input(
                port,
                spec.preview.clone(),
                active.clone(),
                tx,
            ));
        }
    }

    Feed {
        active,
        rx: Some(rx),
    }
}

async fn run_socket_input(
    port: u16,
    preview: PathBuf,
    active: Arc<AtomicBool>,
    tx: mpsc::Sender<Vec<u8>>,
) {
    let listener = match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("failed to listen on {port}: {e}");
            return;
        }
    };
    let Ok(mut preview) = tokio::fs::File::create(&preview).await else {
        log::error!("failed to create preview {}", preview.display());
        return;
    };

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let Ok((mut conn, _)) = listener.accept().await else {
            continue;
        };
        loop {
            let n = match conn.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            let _ = preview.write_all(&buf[..n]).await;
            let _ = preview.flush().await;
            if active.load(Ordering::Relaxed) && tx.send(buf[..n].to_vec()).await.is_err() {
                return;
            }
        }
    }
}

async fn run_stdin_input(preview: PathBuf, active: Arc<AtomicBool>, tx: mpsc::Sender<Vec<u8>>) {
    let Ok(mut preview) = tokio::fs::File::create(&preview).await else {
        log::error!("failed to create preview {}", preview.display());
        return;
    };
    let mut stdin = tokio::io::stdin();

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match stdin.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(_) => return,
        };
        let _ = preview.write_all(&buf[..n]).await;
        let _ = preview.flush().await;
        if active.load(Ordering::Relaxed) && tx.send(buf[..n].to_vec()).await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let interval = Duration::from_secs_f64(args.interval);
    let dir = std::env::current_dir()?;

    let inputs = load_inputs(&dir)?;
    anyhow::ensure!(!inputs.is_empty(), "no *.in descriptors found");

    let mut feeds: Vec<(String, Feed)> = inputs
        .iter()
        .map(|spec| (spec.name.clone(), spawn_input(spec)))
        .collect();

    let mut active = read_select(&dir, &inputs);
    let first = feed_mut(&mut feeds, &active);
    first.active.store(true, Ordering::Relaxed);
    let mut rx = first.rx.take().expect("receiver parked in its slot");
    log::info!("selected input `{active}`");

    let mut stdout = tokio::io::stdout();

    loop {
        // Copy the active input until the boundary, then re-read
        // SELECT. A change takes effect right here; the old
        // input's queued bytes never reach stdout.
        let deadline = tokio::time::Instant::now() + interval;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(chunk)) => {
                    stdout.write_all(&chunk).await?;
                    stdout.flush().await?;
                }
                Ok(None) => {
                    // The input ended; idle out the interval.
                    tokio::time::sleep_until(deadline).await;
                    break;
                }
                Err(_) => break,
            }
        }

        let next = read_select(&dir, &inputs);
        if next != active {
            let old = feed_mut(&mut feeds, &active);
            old.active.store(false, Ordering::Relaxed);
            while rx.try_recv().is_ok() {}
            old.rx = Some(rx);

            let new = feed_mut(&mut feeds, &next);
            new.active.store(true, Ordering::Relaxed);
            rx = new.rx.take().expect("receiver parked in its slot");
            log::info!("switched input `{active}` -> `{next}`");
            active = next;
        }
    }
}

fn feed_mut<'a>(feeds: &'a mut [(String, Feed)], name: &str) -> &'a mut Feed {
    feeds
        .iter_mut()
        .find(|(n, _)| n == name)
        .map(|(_, f)| f)
        .expect("selected input exists")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_load_sorted_with_previews() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("remote.in"), "9130\n").unwrap();
        std::fs::write(dir.path().join("console.in"), "stdin\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let inputs = load_inputs(dir.path()).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].name, "console");
        assert_eq!(inputs[0].kind, InputKind::Stdin);
        assert_eq!(inputs[1].name, "remote");
        assert_eq!(inputs[1].kind, InputKind::Port(9130));
        assert!(inputs[1].preview.ends_with("remote.preview"));
    }

    #[test]
    fn bad_descriptor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.in"), "not-a-port\n").unwrap();
        assert!(load_inputs(dir.path()).is_err());
    }

    #[test]
    fn select_falls_back_to_the_first_input() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.in"), "stdin\n").unwrap();
        std::fs::write(dir.path().join("b.in"), "9131\n").unwrap();
        let inputs = load_inputs(dir.path()).unwrap();

        // No SELECT file at all.
        assert_eq!(read_select(dir.path(), &inputs), "a");

        // SELECT names an unknown input.
        std::fs::write(dir.path().join("SELECT"), "zzz\n").unwrap();
        assert_eq!(read_select(dir.path(), &inputs), "a");

        std::fs::write(dir.path().join("SELECT"), "b\n").unwrap();
        assert_eq!(read_select(dir.path(), &inputs), "b");
    }
}
