//! Per-edge and per-component log routing.
//!
//! Every edge's bytes pass through a [`LogSink`] tee on the way to
//! the consumer, and every child's stderr is routed into a
//! timestamped `.err` file. Sinks never block the stream they
//! observe: chunks are queued to a writer task and dropped when
//! the writer falls behind.

use std::collections::HashMap;
use std::io;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use pipewright_core::{time, EdgeKind};
use pipewright_graph::EdgeLog;

const SINK_QUEUE_CHUNKS: usize = 256;
const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Creates the log sinks of one pipeline run, all inside one run
/// directory.
#[derive(Clone)]
pub struct LogRouter {
    dir: PathBuf,
    #[cfg(feature = "metrics")]
    metrics_url: Option<String>,
}

impl LogRouter {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            #[cfg(feature = "metrics")]
            metrics_url: None,
        }
    }

    /// Additionally sample each edge's throughput into the given
    /// time-series endpoint.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, url: Option<String>) -> Self {
        self.metrics_url = url;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The tee sink of one edge. Text edges get per-line
    /// timestamps; binary and plain edges are written verbatim.
    pub fn edge_sink(&self, log: &EdgeLog) -> LogSink {
        #[allow(unused_mut)]
        let mut sink = self.sink(
            self.dir.join(&log.file_name),
            matches!(log.kind, EdgeKind::Text),
        );

        #[cfg(feature = "metrics")]
        if let Some(url) = &self.metrics_url {
            let series = log
                .file_name
                .trim_end_matches(".log")
                .trim_end_matches(".data")
                .to_string();
            sink.sampler = Some(crate::metrics::Sampler::spawn(url.clone(), series));
        }

        sink
    }

    /// The stderr sink of one component; always line-stamped.
    pub fn stderr_sink(&self, file_name: &str) -> LogSink {
        self.sink(self.dir.join(file_name), true)
    }

    fn sink(&self, path: PathBuf, stamped: bool) -> LogSink {
        let (tx, rx) = mpsc::channel(SINK_QUEUE_CHUNKS);
        let writer = tokio::spawn(write_chunks(path, stamped, rx));
        LogSink {
            tx: Some(tx),
            writer,
            dropped: 0,
            #[cfg(feature = "metrics")]
            sampler: None,
        }
    }
}

/// One log file, owned by exactly one task.
pub struct LogSink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    writer: JoinHandle<()>,
    dropped: u64,
    #[cfg(feature = "metrics")]
    sampler: Option<crate::metrics::Sampler>,
}

impl LogSink {
    /// Queue bytes for the log. Never blocks: when the writer
    /// falls behind, the chunk is dropped and counted.
    pub fn write(&mut self, bytes: &[u8]) {
        #[cfg(feature = "metrics")]
        if let Some(sampler) = &self.sampler {
            sampler.record(bytes.len());
        }

        if let Some(tx) = &self.tx {
            if tx.try_send(bytes.to_vec()).is_err() {
                self.dropped += 1;
            }
        }
    }

    /// Close the sink and wait for queued chunks to reach disk.
    pub async fn finish(mut self) {
        if self.dropped > 0 {
            log::warn!(
                "log sink dropped {} chunks under backpressure",
                self.dropped
            );
        }
        self.tx.take();
        let _ = (&mut self.writer).await;
    }
}

async fn write_chunks(path: PathBuf, stamped: bool, mut rx: mpsc::Receiver<Vec<u8>>) {
    let mut file = match fs::File::create(&path).await {
        Ok(f) => f,
        Err(e) => {
            log::error!("failed to create log file {}: {e}", path.display());
            // Keep draining so the sink never backs up.
            while rx.recv().await.is_some() {}
            return;
        }
    };

    if !stamped {
        while let Some(chunk) = rx.recv().await {
            if let Err(e) = file.write_all(&chunk).await {
                log::error!("failed to write log file {}: {e}", path.display());
                while rx.recv().await.is_some() {}
                return;
            }
        }
        let _ = file.flush().await;
        return;
    }

    // Timestamp each completed line. A partial trailing line is
    // held back until its newline arrives or the stream closes.
    let mut partial: Vec<u8> = Vec::new();
    while let Some(chunk) = rx.recv().await {
        let mut rest: &[u8] = &chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = Vec::with_capacity(partial.len() + pos + 24);
            line.extend_from_slice(time::line_stamp().as_bytes());
            line.push(b' ');
            line.append(&mut partial);
            line.extend_from_slice(&rest[..=pos]);
            rest = &rest[pos + 1..];

            if let Err(e) = file.write_all(&line).await {
                log::error!("failed to write log file {}: {e}", path.display());
                while rx.recv().await.is_some() {}
                return;
            }
        }
        partial.extend_from_slice(rest);
    }

    if !partial.is_empty() {
        let mut line = Vec::with_capacity(partial.len() + 24);
        line.extend_from_slice(time::line_stamp().as_bytes());
        line.push(b' ');
        line.append(&mut partial);
        line.push(b'\n');
        let _ = file.write_all(&line).await;
    }
    let _ = file.flush().await;
}

/// Record which container ran the pipeline and where it logs. The
/// `INFO` file sits next to the run directories.
pub async fn write_info(root: &Path, run_dir: &Path) -> io::Result<()> {
    let contents = format!(
        "Last started pipeline was:\nContainer: {}\nLogdir: {}\n",
        hostname(),
        run_dir.display()
    );
    fs::write(root.join("INFO"), contents).await
}

#[cfg(unix)]
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc == 0 {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        String::from_utf8_lossy(&buf[..end]).into_owned()
    } else {
        "unknown".into()
    }
}

#[cfg(not(unix))]
pub fn hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "unknown".into())
}

/// Follow every component stderr file in the run directory,
/// echoing new content to the supervisor's stdout.
pub async fn tail_stderr_logs(dir: PathBuf, mut shutdown: watch::Receiver<bool>) {
    let mut offsets: HashMap<PathBuf, u64> = HashMap::new();
    let mut poll = tokio::time::interval(TAIL_POLL_INTERVAL);
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            _ = poll.tick() => {}
            _ = shutdown.changed() => break,
        }

        let Ok(mut entries) = fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().map(|e| e != "err").unwrap_or(true) {
                continue;
            }
            let offset = offsets.entry(path.clone()).or_insert(0);
            let Ok(len) = entry.metadata().await.map(|m| m.len()) else {
                continue;
            };
            if len <= *offset {
                continue;
            }
            let Ok(mut file) = fs::File::open(&path).await else {
                continue;
            };
            if file.seek(SeekFrom::Start(*offset)).await.is_err() {
                continue;
            }
            let mut fresh = Vec::with_capacity((len - *offset) as usize);
            if file.read_to_end(&mut fresh).await.is_ok() {
                *offset += fresh.len() as u64;
                let _ = stdout.write_all(&fresh).await;
                let _ = stdout.flush().await;
            }
        }
    }
}
