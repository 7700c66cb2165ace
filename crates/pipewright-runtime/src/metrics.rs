//! Optional per-edge throughput sampling.
//!
//! Posts one data point per second, in InfluxDB line protocol, to
//! a time-series endpoint over HTTP. Compiled in only with the
//! `metrics` cargo feature; failures are sampling gaps, never
//! pipeline errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub(crate) struct Sampler {
    bytes: Arc<AtomicU64>,
    poster: JoinHandle<()>,
}

impl Sampler {
    pub(crate) fn spawn(url: String, series: String) -> Self {
        let bytes = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&bytes);

        let poster = tokio::spawn(async move {
            let client = reqwest::Client::new();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let count = counter.swap(0, Ordering::Relaxed);
                let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);
                let body = format!("{series} value={count} {stamp}");
                if let Err(e) = client.post(&url).body(body).send().await {
                    log::debug!("throughput sample for {series} not delivered: {e}");
                }
            }
        });

        Self { bytes, poster }
    }

    pub(crate) fn record(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::Relaxed);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.poster.abort();
    }
}
