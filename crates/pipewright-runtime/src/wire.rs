//! Byte-moving primitives: listeners, retrying connectors, and the
//! per-edge and fan-out pumps built from them.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use pipewright_core::EndpointId;

use crate::logs::LogSink;

const READ_BUF_SIZE: usize = 8192;
const BIND_ATTEMPTS: u32 = 5;

/// Bind a listener on the loopback endpoint, retrying a bounded
/// number of times (the port may linger in TIME_WAIT from an
/// earlier run).
pub(crate) async fn bind_retry(
    port: EndpointId,
    retry: Duration,
) -> io::Result<TcpListener> {
    let mut attempt = 0;
    loop {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                attempt += 1;
                if attempt >= BIND_ATTEMPTS {
                    return Err(e);
                }
                log::warn!("endpoint {port} not bindable yet: {e}");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// Connect to a loopback endpoint, polling until a listener
/// answers. Producers wait for consumers, never the other way
/// around.
pub(crate) async fn connect_retry(port: EndpointId, retry: Duration) -> TcpStream {
    loop {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => return stream,
            Err(e) => {
                log::debug!("endpoint {port} not ready yet: {e}");
                tokio::time::sleep(retry).await;
            }
        }
    }
}

/// Carry one edge: accept on `listen`, tee every chunk to the edge
/// log, forward to `connect`.
pub async fn run_edge(
    listen: EndpointId,
    connect: EndpointId,
    log: LogSink,
    retry: Duration,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = bind_retry(listen, retry).await?;
    let downstream = connect_retry(connect, retry).await;
    serve_edge(listener, downstream, log, shutdown).await
}

/// Duplicate one stream: accept on `listen`, copy every chunk to
/// each endpoint in `fan_out`.
pub async fn run_fan_out(
    listen: EndpointId,
    fan_out: Vec<EndpointId>,
    retry: Duration,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = bind_retry(listen, retry).await?;
    let mut sinks = Vec::with_capacity(fan_out.len());
    for port in fan_out {
        sinks.push(connect_retry(port, retry).await);
    }
    serve_fan_out(listener, sinks, shutdown).await
}

/// Break an endpoint alias: accept on `listen`, bridge the bytes
/// through the shared endpoint (owned by the aliased component,
/// which reads and writes on that one socket), and fan whatever
/// comes back out to each endpoint in `fan_out`.
pub async fn run_proxy(
    listen: EndpointId,
    bridge: EndpointId,
    fan_out: Vec<EndpointId>,
    retry: Duration,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let listener = bind_retry(listen, retry).await?;
    let bridge = connect_retry(bridge, retry).await;
    let mut sinks = Vec::with_capacity(fan_out.len());
    for port in fan_out {
        sinks.push(connect_retry(port, retry).await);
    }
    serve_proxy(listener, bridge, sinks, shutdown).await
}

pub(crate) async fn serve_edge<W>(
    listener: TcpListener,
    mut downstream: W,
    mut sink: LogSink,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        r = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            // Stays accepting: a probe that connects and closes
            // without sending anything is replaced by the next
            // accept.
            loop {
                let (mut conn, _) = listener.accept().await?;
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            log::warn!("upstream read failed: {e}");
                            break;
                        }
                    };
                    // The log sink only buffers or drops, so the
                    // consumer copy is never blocked by it.
                    sink.write(&buf[..n]);
                    downstream.write_all(&buf[..n]).await?;
                }
            }
        } => r,
        _ = shutdown.changed() => Ok(()),
    };

    sink.finish().await;
    let _ = downstream.shutdown().await;
    result
}

pub(crate) async fn serve_fan_out<W>(
    listener: TcpListener,
    mut sinks: Vec<W>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
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
                            log::warn!("upstream read failed: {e}");
                            break;
                        }
                    };
                    for sink in sinks.iter_mut() {
                        sink.write_all(&buf[..n]).await?;
                    }
                }
            }
        } => r,
        _ = shutdown.changed() => Ok(()),
    };

    for sink in sinks.iter_mut() {
        let _ = sink.shutdown().await;
    }
    result
}

pub(crate) async fn serve_proxy<B, W>(
    listener: TcpListener,
    bridge: B,
    mut sinks: Vec<W>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()>
where
    B: AsyncRead + AsyncWrite + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut bridge_rx, mut bridge_tx) = tokio::io::split(bridge);

    let result = tokio::select! {
        // Accepted bytes flow into the shared endpoint.
        r = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let (mut conn, _) = listener.accept().await?;
                loop {
                    let n = match conn.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            log::warn!("proxy upstream read failed: {e}");
                            break;
                        }
                    };
                    bridge_tx.write_all(&buf[..n]).await?;
                }
            }
        } => r,
        // Whatever comes back fans out to the rerouted consumers.
        r = async {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                let n = bridge_rx.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                for sink in sinks.iter_mut() {
                    sink.write_all(&buf[..n]).await?;
                }
            }
        } => r,
        _ = shutdown.changed() => Ok(()),
    };

    let _ = bridge_tx.shutdown().await;
    for sink in sinks.iter_mut() {
        let _ = sink.shutdown().await;
    }
    result
}
