//! Cloud client mode (component G): rather than listening for engine
//! connections directly, the proxy dials a shared upstream aggregator and
//! receives engine sessions multiplexed over that one connection.

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;
use crate::session::SpliceConfig;
use crate::stream::BoxedStream;
use crate::tls;
use crate::wire::framing::{self, ReadOutcome};
use crate::wire::xml::{CloudInit, Init};

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub user_id: String,
    pub domain: String,
    pub port: u16,
}

/// `chr((crc32(user) & 0x0f) + 'a' - 1) + "." + domain`. Identical inputs
/// must always resolve to the identical upstream host.
pub fn upstream_host(user_id: &str, domain: &str) -> String {
    let hash = crc32fast::hash(user_id.as_bytes());
    let letter = ((hash & 0x0f) as u8 + b'a' - 1) as char;
    format!("{letter}.{domain}")
}

/// Connects to the upstream aggregator, performs the `cloudinit` handshake,
/// then loops accepting multiplexed `init` frames until shutdown, issuing a
/// best-effort `cloudstop` on the way out.
pub async fn run(
    config: CloudConfig,
    proxy_registry: Arc<Registry>,
    splice_config: SpliceConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let host = upstream_host(&config.user_id, &config.domain);
    let addr = format!("{host}:{}", config.port);
    tracing::info!(user = %config.user_id, %addr, "dialing cloud upstream");

    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("dialing cloud upstream at {addr}"))?;
    let connector = tls::client_connector();
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| anyhow::anyhow!("invalid upstream hostname {host}"))?;
    let mut upstream = connector
        .connect(server_name, tcp)
        .await
        .with_context(|| format!("TLS handshake with cloud upstream at {addr}"))?;

    let handshake = format!("cloudinit -i 1 -u {}", config.user_id);
    framing::write_command(&mut upstream, handshake.as_bytes()).await?;
    let reply = framing::read_response(&mut upstream).await?;
    if !CloudInit::is_success(&reply) {
        anyhow::bail!("cloud upstream rejected cloudinit for user {}", config.user_id);
    }
    tracing::info!(user = %config.user_id, "cloud session established, awaiting engine traffic");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = framing::read_response_timeout(&mut upstream, splice_config.registration_wait) => {
                match outcome? {
                    ReadOutcome::TimedOut => continue,
                    ReadOutcome::Message(payload) => {
                        if let Err(err) = relay_one(&mut upstream, payload, &proxy_registry, &splice_config).await {
                            tracing::warn!(user = %config.user_id, error = %err, "multiplexed session ended with an error");
                        }
                    }
                }
            }
        }
    }

    let goodbye = format!("cloudstop -i 1 -u {}", config.user_id);
    let _ = framing::write_command(&mut upstream, goodbye.as_bytes()).await;
    Ok(())
}

async fn relay_one(
    upstream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    init_payload: Vec<u8>,
    registry: &Registry,
    config: &SpliceConfig,
) -> anyhow::Result<()> {
    let init = Init::parse(&init_payload)?;
    let key = init.routing_key()?.to_string();
    let info = registry
        .find(&key)
        .with_context(|| format!("no IDE registered for cloud key {key}"))?;
    let _claim = registry
        .claim(&key)
        .with_context(|| format!("key {key} already claimed"))?;

    let result = dial_and_pump(upstream, &init_payload, &info, config).await;
    let _ = registry.unclaim(&key);
    result
}

async fn dial_and_pump(
    upstream: &mut (impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin),
    init_payload: &[u8],
    info: &crate::registry::EndpointInfo,
    config: &SpliceConfig,
) -> anyhow::Result<()> {
    let mut ide: BoxedStream = dial_ide(info).await?;
    framing::write_response(&mut ide, init_payload).await?;

    loop {
        tokio::select! {
            from_ide = framing::read_response_timeout(&mut ide, config.reverse_read_tick) => {
                match from_ide? {
                    ReadOutcome::TimedOut => continue,
                    ReadOutcome::Message(payload) => {
                        let terminator = crate::wire::xml::terminator(&payload);
                        framing::write_response(upstream, &payload).await?;
                        if terminator.is_some() {
                            return Ok(());
                        }
                    }
                }
            }
            from_upstream = framing::read_response_timeout(upstream, config.reverse_read_tick) => {
                match from_upstream? {
                    ReadOutcome::TimedOut => continue,
                    ReadOutcome::Message(payload) => {
                        framing::write_response(&mut ide, &payload).await?;
                    }
                }
            }
        }
    }
}

async fn dial_ide(info: &crate::registry::EndpointInfo) -> anyhow::Result<BoxedStream> {
    let addr = format!("{}:{}", info.host, info.port);
    let tcp = TcpStream::connect(&addr)
        .await
        .with_context(|| format!("dialing IDE at {addr}"))?;
    if info.ssl {
        let connector = tls::client_connector();
        let server_name = rustls::pki_types::ServerName::try_from(info.host.clone())
            .map_err(|_| anyhow::anyhow!("invalid IDE hostname {}", info.host))?;
        let tls = connector.connect(server_name, tcp).await?;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(tcp))
    }
}
