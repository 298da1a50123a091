//! Logging setup
//!
//! Two sinks: a coloured console layer and a daily rolling file under
//! `logger.dir`, pruned to the newest `logger.max_files` files. Each has its
//! own level. `RUST_LOG`, when set, overrides the console level.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggerConfig;
use crate::error::{Error, Result};

/// File name prefix of the rolling log
pub const LOG_FILE_PREFIX: &str = "relay.log";

/// Parse a level name
///
/// Case-insensitive. Accepts the tracing names plus `WARNING`, `SUCCESS`
/// (info) and `CRITICAL` (error).
pub fn parse_level(name: &str) -> Result<LevelFilter> {
    match name.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Ok(LevelFilter::TRACE),
        "DEBUG" => Ok(LevelFilter::DEBUG),
        "INFO" | "SUCCESS" => Ok(LevelFilter::INFO),
        "WARN" | "WARNING" => Ok(LevelFilter::WARN),
        "ERROR" | "CRITICAL" => Ok(LevelFilter::ERROR),
        "OFF" => Ok(LevelFilter::OFF),
        _ => Err(Error::config(format!("unknown log level `{name}`"))),
    }
}

/// Install the global subscriber
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init(config: &LoggerConfig) -> Result<WorkerGuard> {
    let console_level = parse_level(&config.level.console)?;
    let file_level = parse_level(&config.level.file)?;

    let appender = file_appender(config)?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .from_env_lossy();

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(console_filter);

    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_filter(file_level);

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;

    Ok(guard)
}

/// Daily rolling file under `config.dir`, keeping `config.max_files` files
pub fn file_appender(config: &LoggerConfig) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(&config.dir)?;

    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .max_log_files(config.max_files)
        .build(&config.dir)
        .map_err(|e| Error::Logging(e.to_string()))
}
