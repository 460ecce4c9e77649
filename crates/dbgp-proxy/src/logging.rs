//! Structured logging bootstrap: a `tracing_subscriber` `EnvFilter` + `fmt`
//! layering, with a text/JSON format switch.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Installs a global `tracing` subscriber. `default_level` is used when
/// `RUST_LOG` is unset; otherwise `RUST_LOG` takes precedence entirely.
pub fn install(default_level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(
            default_level
                .parse()
                .unwrap_or(tracing::level_filters::LevelFilter::INFO.into()),
        )
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
