//! Structured logging setup.
//!
//! Console output in `pretty`, `json` or `compact` format, optionally
//! mirrored to a daily-rotated file under `[logging].directory`.
//! `RUST_LOG` takes precedence over `[logging].level`.
//!
//! Audit events for query attempts use the `pq::audit` target, so they
//! can be routed on their own, e.g. `RUST_LOG=warn,pq::audit=info`.

use anyhow::{Context, Result};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "pq.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
    Compact,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File,
    Both,
}

impl LogOutput {
    pub fn parse(value: &str) -> Self {
        match value {
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            _ => LogOutput::Stdout,
        }
    }
}

fn env_filter(level: &str) -> Result<EnvFilter> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid logging.level '{}'", level))?,
    };

    Ok(filter
        .add_directive("hyper=warn".parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("reqwest=warn".parse()?)
        .add_directive("tower=warn".parse()?))
}

/// Install the global subscriber. Console output goes to stderr so that
/// command output on stdout stays machine-readable.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let format = LogFormat::parse(&config.format);
    let output = LogOutput::parse(&config.output);
    let filter = env_filter(&config.level)?;

    let console = match format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .boxed(),
    };

    let file = match output {
        LogOutput::Stdout => None,
        LogOutput::File | LogOutput::Both => {
            std::fs::create_dir_all(&config.directory).with_context(|| {
                format!(
                    "failed to create log directory {}",
                    config.directory.display()
                )
            })?;
            let appender =
                RollingFileAppender::new(Rotation::DAILY, &config.directory, LOG_FILE_PREFIX);
            Some(
                fmt::layer()
                    .with_writer(appender)
                    .with_ansi(false)
                    .boxed(),
            )
        }
    };

    let console = match output {
        LogOutput::File => None,
        LogOutput::Stdout | LogOutput::Both => Some(console),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("logging already initialized")?;

    tracing::debug!(format = ?format, output = ?output, "logging initialized");
    Ok(())
}
