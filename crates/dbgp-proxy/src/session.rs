//! The splice engine (component F): given a freshly accepted engine
//! connection, resolve its routing key, dial the registered IDE, and pump
//! bytes both ways until a terminator, a close, or an eviction ends the
//! dialogue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::errors::{FramingError, SpliceError};
use crate::registry::{EndpointInfo, Registry};
use crate::stream::BoxedStream;
use crate::tls;
use crate::wire::framing::{self, ReadOutcome};
use crate::wire::xml::{Detach, Init};

/// Tunables for the splice loop; defaults mirror the spec's suggested
/// timeout scale (seconds, not milliseconds — these are idle ticks, not
/// request latencies).
#[derive(Debug, Clone)]
pub struct SpliceConfig {
    pub registration_wait: Duration,
    pub reverse_read_tick: Duration,
}

impl Default for SpliceConfig {
    fn default() -> Self {
        Self {
            registration_wait: Duration::from_secs(2),
            reverse_read_tick: Duration::from_secs(2),
        }
    }
}

/// Drives one engine connection end to end. Never panics on protocol
/// errors — every failure path degrades to a `detach` toward the engine
/// (or a silent close, if the engine can no longer be written to) and an
/// `Err` is returned purely for logging/metrics at the call site.
pub async fn run(
    mut engine: BoxedStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    config: SpliceConfig,
    shutdown: CancellationToken,
) -> Result<(), SpliceError> {
    let init_payload = match read_init(&mut engine, &config, &shutdown).await? {
        Some(payload) => payload,
        None => return Ok(()), // shutdown observed before any message arrived
    };

    let init = Init::parse(&init_payload)?;
    let key = init.routing_key()?.to_string();

    let info = match registry.find(&key) {
        Ok(info) => info,
        Err(_) => {
            metrics::counter!("dbgp_proxy_no_such_ide").increment(1);
            tracing::warn!(%key, %peer, "no IDE registered for this key");
            send_detach(&mut engine, "no IDE is registered for this key").await;
            return Err(SpliceError::NoSuchIde(key));
        }
    };

    let claim = match registry.claim(&key) {
        Ok(claim) => claim,
        Err(err) => {
            metrics::counter!("dbgp_proxy_claim_conflicts").increment(1);
            tracing::warn!(%key, %peer, "claim conflict: {err}");
            send_detach(&mut engine, "this IDE is already in an active session").await;
            return Err(err.into());
        }
    };

    tracing::info!(%key, %peer, ide = %info.host, "splicing engine connection");
    let result = splice(engine, &init_payload, &info, &config, &claim.evict, &shutdown).await;

    let _ = registry.unclaim(&key);
    if is_stale_registration(&result) {
        tracing::warn!(%key, "IDE connection closed unexpectedly; evicting stale registration");
        let _ = registry.remove(&key);
        metrics::counter!("dbgp_proxy_stale_removals").increment(1);
    }
    metrics::gauge!("dbgp_proxy_registry_size").set(registry.len() as f64);

    result
}

/// A dial failure means the registration was already stale going in; an
/// `Incomplete` framing error surfacing from the reverse leg means the IDE
/// dropped its socket mid-session without sending a `stop`/`detach`
/// terminator. Either way the registry entry no longer points at a live IDE
/// and must not be left behind to misroute the next engine connection.
fn is_stale_registration(result: &Result<(), SpliceError>) -> bool {
    matches!(
        result,
        Err(SpliceError::Dial { .. }) | Err(SpliceError::Framing(FramingError::Incomplete))
    )
}

async fn read_init(
    engine: &mut BoxedStream,
    config: &SpliceConfig,
    shutdown: &CancellationToken,
) -> Result<Option<Vec<u8>>, SpliceError> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            outcome = framing::read_response_timeout(engine, config.registration_wait) => {
                match outcome? {
                    ReadOutcome::Message(payload) => return Ok(Some(payload)),
                    ReadOutcome::TimedOut => continue,
                }
            }
        }
    }
}

async fn send_detach(engine: &mut BoxedStream, reason: &str) {
    if let Ok(xml) = Detach::new(reason).to_xml() {
        let _ = framing::write_response(engine, xml.as_bytes()).await;
    }
}

async fn dial_ide(info: &EndpointInfo) -> Result<BoxedStream, SpliceError> {
    let addr = format!("{}:{}", info.host, info.port);
    let tcp = TcpStream::connect(&addr)
        .await
        .map_err(|source| SpliceError::Dial {
            host: info.host.clone(),
            port: info.port,
            source,
        })?;
    if info.ssl {
        let connector = tls::client_connector();
        let domain = rustls::pki_types::ServerName::try_from(info.host.clone())
            .map_err(|_| SpliceError::Dial {
                host: info.host.clone(),
                port: info.port,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad server name"),
            })?;
        let tls = connector
            .connect(domain, tcp)
            .await
            .map_err(|source| SpliceError::Dial {
                host: info.host.clone(),
                port: info.port,
                source,
            })?;
        Ok(Box::new(tls))
    } else {
        Ok(Box::new(tcp))
    }
}

async fn splice(
    engine: BoxedStream,
    init_payload: &[u8],
    info: &EndpointInfo,
    config: &SpliceConfig,
    evict: &tokio::sync::Notify,
    shutdown: &CancellationToken,
) -> Result<(), SpliceError> {
    let mut ide = dial_ide(info).await?;
    framing::write_response(&mut ide, init_payload).await?;

    let (mut engine_read, mut engine_write) = tokio::io::split(engine);
    let (mut ide_read, mut ide_write) = tokio::io::split(ide);

    let forward_done = CancellationToken::new();
    let forward_token = forward_token_clone(&forward_done);
    let forward = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut engine_read, &mut ide_write).await;
        forward_token.cancel();
    });

    let outcome = reverse_loop(
        &mut ide_read,
        &mut engine_write,
        config,
        evict,
        shutdown,
        &forward_done,
    )
    .await;

    forward.abort();
    let _ = engine_write.shutdown().await;

    outcome
}

fn forward_token_clone(token: &CancellationToken) -> CancellationToken {
    token.clone()
}

async fn reverse_loop(
    ide_read: &mut (impl tokio::io::AsyncRead + Unpin),
    engine_write: &mut (impl tokio::io::AsyncWrite + Unpin),
    config: &SpliceConfig,
    evict: &tokio::sync::Notify,
    shutdown: &CancellationToken,
    forward_done: &CancellationToken,
) -> Result<(), SpliceError> {
    loop {
        tokio::select! {
            _ = evict.notified() => {
                tracing::info!("splice evicted by registry");
                return Err(SpliceError::Evicted);
            }
            _ = shutdown.cancelled() => {
                return Ok(());
            }
            _ = forward_done.cancelled() => {
                return Ok(());
            }
            outcome = framing::read_response_timeout(ide_read, config.reverse_read_tick) => {
                match outcome? {
                    ReadOutcome::TimedOut => continue,
                    ReadOutcome::Message(payload) => {
                        if let Some(term) = crate::wire::xml::terminator(&payload) {
                            let _ = framing::write_response(engine_write, &payload).await;
                            return Err(SpliceError::Terminated(term.to_string()));
                        }
                        framing::write_response(engine_write, &payload).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EndpointKind;

    #[test]
    fn ide_eof_without_terminator_is_a_stale_registration() {
        let result: Result<(), SpliceError> = Err(SpliceError::Framing(FramingError::Incomplete));
        assert!(is_stale_registration(&result));
    }

    #[test]
    fn clean_terminator_is_not_a_stale_registration() {
        let result: Result<(), SpliceError> = Err(SpliceError::Terminated("stop".into()));
        assert!(!is_stale_registration(&result));
    }

    #[tokio::test]
    async fn dial_failure_is_reported() {
        let info = EndpointInfo {
            key: "KEY1".into(),
            host: "127.0.0.1".into(),
            port: 1, // reserved, nothing should be listening
            ssl: false,
            kind: EndpointKind::ProxyRegistered,
            session_id: uuid::Uuid::new_v4(),
        };
        let err = dial_ide(&info).await.unwrap_err();
        assert!(matches!(err, SpliceError::Dial { .. }));
    }
}
