use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser};
use dbgp_proxy::logging::LogFormat;
use dbgp_proxy::registry::Registry;
use dbgp_proxy::session::SpliceConfig;
use dbgp_proxy::{cloud, listener, logging, metrics_server, supervisor, tls};
use tokio_util::sync::CancellationToken;

/// A registration proxy and splice router for the DBGp debugger protocol.
#[derive(Debug, Parser)]
#[command(about, version)]
pub struct Cli {
    /// Address the engine-side listener binds, in plain mode.
    #[arg(long, default_value = "0.0.0.0:9003", env = "ENGINE_ADDR")]
    engine_addr: SocketAddr,
    /// Address the engine-side listener binds, in TLS mode.
    #[arg(long, default_value = "0.0.0.0:9013", env = "ENGINE_TLS_ADDR")]
    engine_tls_addr: SocketAddr,
    /// Address the IDE-side (registration) listener binds, in plain mode.
    #[arg(long, default_value = "0.0.0.0:9001", env = "IDE_ADDR")]
    ide_addr: SocketAddr,
    /// Address the IDE-side (registration) listener binds, in TLS mode.
    #[arg(long, default_value = "0.0.0.0:9011", env = "IDE_TLS_ADDR")]
    ide_tls_addr: SocketAddr,
    /// Address the Prometheus metrics endpoint binds.
    #[arg(long, default_value = "0.0.0.0:9090", env = "METRICS_ADDR")]
    metrics_addr: SocketAddr,

    /// Disables the plain (non-TLS) engine and IDE listeners.
    #[arg(long, action(clap::ArgAction::SetTrue))]
    tls_only: bool,
    #[command(flatten)]
    tls: Option<TlsArgs>,

    /// How long the engine-side splice waits for the initial `init` packet,
    /// or the IDE-side listener waits for a command, before re-checking
    /// shutdown.
    #[arg(long, default_value = "2s", env = "REGISTRATION_TIMEOUT")]
    registration_timeout: humantime::Duration,
    /// How long the reverse (IDE -> engine) copy loop waits for the next
    /// response before re-checking shutdown/eviction.
    #[arg(long, default_value = "2s", env = "REVERSE_READ_TICK")]
    reverse_read_tick: humantime::Duration,

    #[command(flatten)]
    cloud: Option<CloudArgs>,

    /// Default level used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Args)]
pub struct TlsArgs {
    /// Path to a PEM certificate chain for the TLS listeners.
    #[arg(long, env = "TLS_CERT")]
    cert_path: Option<PathBuf>,
    /// Path to the PEM private key matching `--cert-path`.
    #[arg(long, env = "TLS_KEY")]
    key_path: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CloudArgs {
    /// Cloud user id to register with the upstream aggregator. Presence of
    /// this flag switches the proxy into cloud client mode instead of
    /// running its own engine-side listener.
    #[arg(long, env = "CLOUD_USER")]
    cloud_user: String,
    /// Domain the per-user upstream host is a subdomain of.
    #[arg(long, default_value = "cloud.xdebug.org", env = "CLOUD_DOMAIN")]
    cloud_domain: String,
    /// Port of the upstream aggregator.
    #[arg(long, default_value_t = 9021, env = "CLOUD_PORT")]
    cloud_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::install(&cli.log_level, cli.log_format);

    let proxy_registry = Arc::new(Registry::new());
    let cloud_registry = Arc::new(Registry::new_force_replace());
    let shutdown = CancellationToken::new();
    supervisor::install_signal_handler(shutdown.clone());

    let splice_config = SpliceConfig {
        registration_wait: cli.registration_timeout.into(),
        reverse_read_tick: cli.reverse_read_tick.into(),
    };

    let tls_server_config = match &cli.tls {
        Some(TlsArgs {
            cert_path: Some(cert),
            key_path: Some(key),
        }) => Some(tls::server_config(cert, key).context("loading TLS cert/key")?),
        _ => None,
    };

    let mut tasks = Vec::new();

    if !cli.tls_only {
        tasks.push(tokio::spawn(listener::run_command_listener(
            "ide",
            cli.ide_addr,
            None,
            proxy_registry.clone(),
            cloud_registry.clone(),
            shutdown.clone(),
        )));
    }
    if let Some(tls_config) = tls_server_config.clone() {
        tasks.push(tokio::spawn(listener::run_command_listener(
            "ide-tls",
            cli.ide_tls_addr,
            Some(tls_config),
            proxy_registry.clone(),
            cloud_registry.clone(),
            shutdown.clone(),
        )));
    }

    match cli.cloud {
        Some(cloud_args) => {
            let config = cloud::CloudConfig {
                user_id: cloud_args.cloud_user,
                domain: cloud_args.cloud_domain,
                port: cloud_args.cloud_port,
            };
            let registry = proxy_registry.clone();
            let splice_config = splice_config.clone();
            let child = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                cloud::run(config, registry, splice_config, child).await
            }));
        }
        None => {
            if !cli.tls_only {
                tasks.push(tokio::spawn(listener::run_engine_listener(
                    "engine",
                    cli.engine_addr,
                    None,
                    proxy_registry.clone(),
                    splice_config.clone(),
                    shutdown.clone(),
                )));
            }
            if let Some(tls_config) = tls_server_config {
                tasks.push(tokio::spawn(listener::run_engine_listener(
                    "engine-tls",
                    cli.engine_tls_addr,
                    Some(tls_config),
                    proxy_registry.clone(),
                    splice_config.clone(),
                    shutdown.clone(),
                )));
            }
        }
    }

    let metrics_router = metrics_server::build_router();
    let metrics_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(cli.metrics_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::error!(error = %err, "failed to bind metrics listener");
                return;
            }
        };
        let serve = axum::serve(listener, metrics_router).with_graceful_shutdown(async move {
            metrics_shutdown.cancelled().await;
        });
        if let Err(err) = serve.await {
            tracing::error!(error = %err, "metrics server exited with an error");
        }
    });

    supervisor::drain(tasks).await;
    Ok(())
}
