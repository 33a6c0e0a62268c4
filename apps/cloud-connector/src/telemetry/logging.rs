//! Logging bootstrap for the connector binary.

use std::fs::OpenOptions;
use std::path::PathBuf;

use clap::ValueEnum;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum LogInitError {
    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Installs the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) -> Result<(), LogInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_filter()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogInitError::OpenFile {
                    path: path.display().to_string(),
                    source,
                })?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Arc::new(file))
                .try_init()
                .map_err(|err| LogInitError::Install(err.to_string()))
        }
        None => builder
            .try_init()
            .map_err(|err| LogInitError::Install(err.to_string())),
    }
}
