//! Logging subsystem
//!
//! Structured logging via tracing with support for JSON (production) and
//! plaintext (development) output formats. Every event is also captured by
//! [`buffer::LogBufferLayer`], which backs the `get-logs` event.
//!
//! # Log Targets
//!
//! - `gateway` - event routing and handlers
//! - `ws` - WebSocket connections
//! - `auth` - handshake verdicts
//! - `chunks` - chunk assembly and expiry
//! - `supervisor` - listener liveness checks
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `BRIDGEGATE_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter
//! - `BRIDGEGATE_DEV` - When `1`, use the development preset

pub mod buffer;

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }
}

impl LogConfig {
    /// Plaintext to stdout, debug level
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
        }
    }

    /// JSON to stdout, info level
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
        }
    }

    /// Pick a preset from `BRIDGEGATE_DEV`.
    pub fn from_env() -> Self {
        match std::env::var("BRIDGEGATE_DEV").as_deref() {
            Ok("1") | Ok("true") => Self::development(),
            _ => Self::production(),
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from BRIDGEGATE_LOG, then RUST_LOG, then the default level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("BRIDGEGATE_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let default_filter = format!(
        "{level},gateway={level},ws={level},auth={level},chunks={level},supervisor={level},config={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

fn make_writer(output: &LogOutput) -> Result<BoxMakeWriter, LoggingError> {
    Ok(match output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
        LogOutput::File(path) => BoxMakeWriter::new(Mutex::new(File::create(path)?)),
    })
}

fn fmt_layer(
    config: &LogConfig,
    filter: EnvFilter,
) -> Result<Box<dyn Layer<Registry> + Send + Sync>, LoggingError> {
    let writer = make_writer(&config.output)?;
    let timer = UtcTime::rfc_3339();

    let layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_target(true)
            .with_current_span(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Plaintext => tracing_subscriber::fmt::layer()
            .with_timer(timer)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    };
    Ok(layer)
}

/// Initialize the logging subsystem. Call once at startup; later calls fail.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = build_env_filter(config.default_level)?;
    let layer = fmt_layer(&config, filter)?;
    let buffer_layer =
        buffer::LogBufferLayer::new().with_filter(LevelFilter::from_level(config.default_level));

    tracing_subscriber::registry()
        .with(layer)
        .with(buffer_layer)
        .try_init()?;

    Ok(())
}

/// Initialize logging for tests. Safe to call from many tests.
pub fn init_test_logging() {
    let _ = init_logging(LogConfig::development());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    /// Serializes tests that touch env vars.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_log_config_presets() {
        let dev = LogConfig::development();
        assert_eq!(dev.format, LogFormat::Plaintext);
        assert_eq!(dev.default_level, Level::DEBUG);

        let prod = LogConfig::production();
        assert_eq!(prod.format, LogFormat::Json);
        assert_eq!(prod.output, LogOutput::Stdout);
        assert_eq!(prod.default_level, Level::INFO);
    }

    #[test]
    fn test_from_env_dev_flag() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("BRIDGEGATE_DEV", "1");
        assert_eq!(LogConfig::from_env().format, LogFormat::Plaintext);
        std::env::remove_var("BRIDGEGATE_DEV");
        assert_eq!(LogConfig::from_env().format, LogFormat::Json);
    }

    #[test]
    fn test_env_filter_default() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::remove_var("BRIDGEGATE_LOG");
        std::env::remove_var("RUST_LOG");
        assert!(build_env_filter(Level::INFO).is_ok());
    }

    #[test]
    fn test_env_filter_primary_var() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("BRIDGEGATE_LOG", "gateway=debug,ws=info,chunks=warn");
        assert!(build_env_filter(Level::INFO).is_ok());
        std::env::remove_var("BRIDGEGATE_LOG");
    }

    #[test]
    fn test_env_filter_rejects_garbage() {
        let _lock = TEST_LOCK.lock().unwrap();
        std::env::set_var("BRIDGEGATE_LOG", "gateway=notalevel");
        let result = build_env_filter(Level::INFO);
        std::env::remove_var("BRIDGEGATE_LOG");
        assert!(matches!(result, Err(LoggingError::FilterParse(_))));
    }

    #[test]
    fn test_file_writer_creates_file() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        make_writer(&LogOutput::File(path.clone())).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_json_layer_builds() {
        let config = LogConfig::production();
        let filter = EnvFilter::try_new("info").unwrap();
        assert!(fmt_layer(&config, filter).is_ok());
    }

    #[test]
    fn test_logging_error_display() {
        assert_eq!(
            LoggingError::AlreadyInitialized.to_string(),
            "logging already initialized"
        );
    }
}
