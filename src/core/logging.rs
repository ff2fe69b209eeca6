//! Process-wide `tracing` subscriber setup.
//!
//! Logs go to stderr (stdout carries JSON command envelopes) or to an
//! append-only file. `--log-level` wins over `RUST_LOG`; both fall back to
//! `info`.

use crate::core::error::CustodesError;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub level: Option<String>,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

pub fn build_filter(level: Option<&str>) -> EnvFilter {
    match level {
        Some(l) => EnvFilter::try_new(l).unwrap_or_else(|_| EnvFilter::new("info")),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

pub fn init_logging(opts: &LogOptions) -> Result<(), CustodesError> {
    let filter = build_filter(opts.level.as_deref());

    let writer = match &opts.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = opts.file.is_none();

    let (json_layer, text_layer) = match opts.format {
        LogFormat::Json => (
            Some(tracing_subscriber::fmt::layer().json().with_writer(writer)),
            None,
        ),
        LogFormat::Text => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(ansi)
                    .with_writer(writer),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CustodesError::ConfigError(format!("logging already initialized: {}", e)))
}
