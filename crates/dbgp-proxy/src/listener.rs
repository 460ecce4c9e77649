//! The listener pool (component E): one accept loop per bound address,
//! plain or TLS, for both the command-facing (IDE) and engine-facing
//! sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handlers;
use crate::registry::Registry;
use crate::session::{self, SpliceConfig};
use crate::wire::{command, framing};

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Runs the IDE-facing command listener: one command in, one reply out,
/// connection closed.
pub async fn run_command_listener(
    name: &'static str,
    bind_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    proxy_registry: Arc<Registry>,
    cloud_registry: Arc<Registry>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%name, %bind_addr, "command listener bound");
    let tasks = TaskTracker::new();

    loop {
        match accept_with_deadline(&listener, &shutdown).await {
            AcceptResult::Shutdown => break,
            AcceptResult::Timeout => continue,
            AcceptResult::Accepted(stream, peer) => {
                metrics::counter!("dbgp_proxy_command_connections_total", "listener" => name)
                    .increment(1);
                let tls = tls.clone();
                let proxy = proxy_registry.clone();
                let cloud = cloud_registry.clone();
                tasks.spawn(async move {
                    if let Err(err) = serve_command(stream, peer, tls, &proxy, &cloud).await {
                        tracing::warn!(%peer, error = %err, "command connection ended with an error");
                    }
                });
            }
        }
    }

    tasks.close();
    tasks.wait().await;
    tracing::info!(%name, "command listener stopped");
    Ok(())
}

async fn serve_command(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    proxy: &Registry,
    cloud: &Registry,
) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let remote_ip = peer.ip().to_string();

    if let Some(tls) = tls {
        let acceptor = tokio_rustls::TlsAcceptor::from(tls);
        let mut tls_stream = acceptor.accept(stream).await?;
        let line = framing::read_command(&mut tls_stream).await?;
        let reply = dispatch(&line, &remote_ip, proxy, cloud);
        framing::write_response(&mut tls_stream, reply.as_bytes()).await?;
    } else {
        let mut stream = stream;
        let line = framing::read_command(&mut stream).await?;
        let reply = dispatch(&line, &remote_ip, proxy, cloud);
        framing::write_response(&mut stream, reply.as_bytes()).await?;
    }
    Ok(())
}

fn dispatch(line: &[u8], remote_ip: &str, proxy: &Registry, cloud: &Registry) -> String {
    let text = String::from_utf8_lossy(line);
    match command::parse(&text) {
        Ok(cmd) => handlers::handle(cmd, remote_ip, proxy, cloud),
        Err(err) => {
            tracing::warn!(%remote_ip, error = %err, "malformed command");
            format!("<?xml version=\"1.0\"?><error message=\"{err}\"/>")
        }
    }
}

/// Runs the engine-facing listener: every accepted connection enters the
/// splice engine directly.
pub async fn run_engine_listener(
    name: &'static str,
    bind_addr: SocketAddr,
    tls: Option<Arc<rustls::ServerConfig>>,
    proxy_registry: Arc<Registry>,
    splice_config: SpliceConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(%name, %bind_addr, "engine listener bound");
    let tasks = TaskTracker::new();

    loop {
        match accept_with_deadline(&listener, &shutdown).await {
            AcceptResult::Shutdown => break,
            AcceptResult::Timeout => continue,
            AcceptResult::Accepted(stream, peer) => {
                metrics::counter!("dbgp_proxy_engine_connections_total", "listener" => name)
                    .increment(1);
                let _ = stream.set_nodelay(true);
                let tls = tls.clone();
                let registry = proxy_registry.clone();
                let config = splice_config.clone();
                let child = shutdown.child_token();
                tasks.spawn(async move {
                    let boxed: crate::stream::BoxedStream = match tls {
                        Some(tls) => {
                            let acceptor = tokio_rustls::TlsAcceptor::from(tls);
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => Box::new(tls_stream),
                                Err(err) => {
                                    tracing::warn!(%peer, error = %err, "TLS handshake failed");
                                    return;
                                }
                            }
                        }
                        None => Box::new(stream),
                    };
                    metrics::gauge!("dbgp_proxy_active_splices").increment(1.0);
                    let result = session::run(boxed, peer, registry, config, child).await;
                    metrics::gauge!("dbgp_proxy_active_splices").decrement(1.0);
                    if let Err(err) = result {
                        tracing::info!(%peer, "splice ended: {err}");
                    }
                });
            }
        }
    }

    tasks.close();
    tasks.wait().await;
    tracing::info!(%name, "engine listener stopped");
    Ok(())
}

enum AcceptResult {
    Accepted(TcpStream, SocketAddr),
    Timeout,
    Shutdown,
}

async fn accept_with_deadline(listener: &TcpListener, shutdown: &CancellationToken) -> AcceptResult {
    tokio::select! {
        _ = shutdown.cancelled() => AcceptResult::Shutdown,
        result = tokio::time::timeout(ACCEPT_POLL_INTERVAL, listener.accept()) => {
            match result {
                Ok(Ok((stream, peer))) => AcceptResult::Accepted(stream, peer),
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, "accept failed");
                    AcceptResult::Timeout
                }
                Err(_) => AcceptResult::Timeout,
            }
        }
    }
}
