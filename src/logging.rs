//! Logging setup on tracing + tracing-subscriber
//!
//! Console output goes to stderr so command output on stdout stays parseable.
//! An optional log file rolls over on a fixed schedule. `RUST_LOG` still
//! overrides levels per module.

use std::fs;
use std::path::Path;

use tracing::Level;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingSettings;
use crate::error::{Error, Result};

/// Flushes the log file when dropped. Hold it until the process is done.
pub struct LogGuards {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber for a full command run.
pub fn init_logging(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Result<LogGuards> {
    let level = determine_level(settings, verbose, quiet);

    let (file_layer, file_guard) = match settings.file {
        Some(ref log_file) => {
            let (writer, guard) = file_writer(log_file, &settings.rotation, settings.max_files)?;
            (Some(format_layer(writer, settings.json_format, false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_env_filter(level)?)
        .with(format_layer(std::io::stderr, settings.json_format, true))
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(
        level = %level,
        file = ?settings.file,
        rotation = %settings.rotation,
        json = settings.json_format,
        "Logging initialized"
    );

    Ok(LogGuards {
        _file_guard: file_guard,
    })
}

/// `--quiet` wins, then `-v`/`-vv`, then the configured level
fn determine_level(settings: &LoggingSettings, verbose: u8, quiet: bool) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => parse_level(&settings.level),
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Map a `logging.rotation` value to an appender schedule
pub fn parse_rotation(rotation: &str) -> Result<Rotation> {
    match rotation.to_lowercase().as_str() {
        "hourly" => Ok(Rotation::HOURLY),
        "daily" => Ok(Rotation::DAILY),
        "never" => Ok(Rotation::NEVER),
        other => Err(Error::Config(format!(
            "Invalid log rotation '{}'. Must be one of: hourly, daily, never",
            other
        ))),
    }
}

fn directive(s: &str) -> Result<Directive> {
    s.parse()
        .map_err(|e| Error::Config(format!("Invalid log directive '{}': {}", s, e)))
}

fn build_env_filter(level: Level) -> Result<EnvFilter> {
    let base = level.to_string().to_lowercase();

    Ok(EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&base))
        .add_directive(directive(&format!("simphoni={}", base))?)
        // HTTP client internals
        .add_directive(directive("hyper=warn")?)
        .add_directive(directive("reqwest=warn")?)
        .add_directive(directive("rustls=warn")?))
}

/// One fmt layer, compact or JSON, over any writer
fn format_layer<S, W>(writer: W, json: bool, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_target(true);
    if json {
        Box::new(layer.with_ansi(false).json())
    } else {
        Box::new(layer.with_ansi(ansi).compact())
    }
}

/// Non-blocking writer over a rolling file next to `log_file`
fn file_writer(log_file: &str, rotation: &str, max_files: u32) -> Result<(NonBlocking, WorkerGuard)> {
    let path = Path::new(log_file);
    let directory = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(directory).map_err(|e| {
        Error::Config(format!(
            "Failed to create log directory '{}': {}",
            directory.display(),
            e
        ))
    })?;

    let prefix = path
        .file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("simphoni");

    let mut builder = RollingFileAppender::builder()
        .rotation(parse_rotation(rotation)?)
        .filename_prefix(prefix)
        .filename_suffix("log");
    if max_files > 0 {
        builder = builder.max_log_files(max_files as usize);
    }
    let appender = builder
        .build(directory)
        .map_err(|e| Error::Config(format!("Failed to create log file appender: {}", e)))?;

    Ok(tracing_appender::non_blocking(appender))
}

/// Stderr-only logging for commands that never open the store
pub fn init_simple(level: Level) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init()
        .map_err(|e| Error::Config(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("TRACE"), Level::TRACE);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("invalid"), Level::INFO);
    }

    #[test]
    fn test_determine_level() {
        let mut settings = LoggingSettings::default();
        assert_eq!(determine_level(&settings, 0, true), Level::ERROR);
        assert_eq!(determine_level(&settings, 0, false), Level::INFO);
        assert_eq!(determine_level(&settings, 1, false), Level::DEBUG);
        assert_eq!(determine_level(&settings, 2, false), Level::TRACE);

        settings.level = "warn".to_string();
        assert_eq!(determine_level(&settings, 0, false), Level::WARN);
    }

    #[test]
    fn test_parse_rotation() {
        assert!(parse_rotation("daily").is_ok());
        assert!(parse_rotation("Hourly").is_ok());
        assert!(parse_rotation("never").is_ok());
        let err = parse_rotation("weekly").unwrap_err();
        assert!(err.to_string().contains("weekly"));
    }

    #[test]
    fn test_build_env_filter() {
        assert!(build_env_filter(Level::INFO).is_ok());
        assert!(build_env_filter(Level::TRACE).is_ok());
    }

    #[test]
    fn test_file_writer_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("logs").join("simphoni.log");

        let result = file_writer(&log_path.to_string_lossy(), "never", 3);
        assert!(result.is_ok());
        assert!(temp_dir.path().join("logs").exists());
    }
}
