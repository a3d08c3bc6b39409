//! Logging configuration for Stratum
//!
//! The library crates only emit `tracing` events. This module installs a
//! subscriber for applications that do not bring their own: level
//! filtering through `RUST_LOG` or an explicit directive, stdout output,
//! and daily-rotated files written by a background worker.

use std::path::{Path, PathBuf};
use stratum_core::{Error, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to a file with daily rotation
    File(PathBuf),
    /// Output to both stdout and file
    Both(PathBuf),
}

/// Log format style
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line format
    Pretty,
    /// Compact single-line format
    Compact,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is not set, e.g. `"info"` or
    /// `"stratum_storage=debug,info"`
    pub level: String,
    /// Output destination
    pub output: LogOutput,
    /// Format style
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stdout,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Info level, stdout
    pub fn info() -> Self {
        Self::default()
    }

    /// Debug level, stdout; shows allocator growth, splits and batches
    pub fn debug() -> Self {
        Self::default().with_level("debug")
    }

    /// Warn level, stdout
    pub fn warn() -> Self {
        Self::default().with_level("warn")
    }

    /// Write to a daily-rotated file instead of stdout
    pub fn with_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::File(path.into());
        self
    }

    /// Write to stdout and a daily-rotated file
    pub fn with_both<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.output = LogOutput::Both(path.into());
        self
    }

    /// Set log format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Set the filter directive
    pub fn with_level<S: Into<String>>(mut self, level: S) -> Self {
        self.level = level.into();
        self
    }

    /// Install the global subscriber.
    ///
    /// Returns the file writer's guard when a file is involved; keep it
    /// alive for as long as logs should be flushed. Fails if the level
    /// directive does not parse or a global subscriber is already set.
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use stratum::logging::LogConfig;
    ///
    /// let _guard = LogConfig::info().init()?;
    /// # Ok::<(), stratum::Error>(())
    /// ```
    pub fn init(self) -> Result<Option<WorkerGuard>> {
        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                Error::InvalidConfig(format!("invalid log level {:?}: {}", self.level, e))
            })?,
        };
        let registry = tracing_subscriber::registry().with(env_filter);

        let installed = match (&self.output, self.format) {
            (LogOutput::Stdout, LogFormat::Pretty) => {
                registry.with(fmt::layer().pretty()).try_init().map(|_| None)
            }
            (LogOutput::Stdout, LogFormat::Compact) => {
                registry.with(fmt::layer().compact()).try_init().map(|_| None)
            }
            (LogOutput::File(path), format) => {
                let (writer, guard) = file_writer(path);
                match format {
                    LogFormat::Pretty => registry
                        .with(fmt::layer().with_writer(writer).with_ansi(false).pretty())
                        .try_init(),
                    LogFormat::Compact => registry
                        .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                        .try_init(),
                }
                .map(|_| Some(guard))
            }
            (LogOutput::Both(path), format) => {
                let (writer, guard) = file_writer(path);
                match format {
                    LogFormat::Pretty => registry
                        .with(fmt::layer().pretty())
                        .with(fmt::layer().with_writer(writer).with_ansi(false).pretty())
                        .try_init(),
                    LogFormat::Compact => registry
                        .with(fmt::layer().compact())
                        .with(fmt::layer().with_writer(writer).with_ansi(false).compact())
                        .try_init(),
                }
                .map(|_| Some(guard))
            }
        };
        installed.map_err(|e| Error::InvalidState(format!("cannot install log subscriber: {}", e)))
    }
}

fn file_writer(path: &Path) -> (NonBlocking, WorkerGuard) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("stratum.log");
    tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.output, LogOutput::Stdout);
        assert_eq!(config.format, LogFormat::Pretty);
    }

    #[test]
    fn test_log_config_builders() {
        let config = LogConfig::debug()
            .with_file("/tmp/stratum-test.log")
            .with_format(LogFormat::Compact);
        assert_eq!(config.level, "debug");
        assert!(matches!(config.output, LogOutput::File(_)));
        assert_eq!(config.format, LogFormat::Compact);

        let config = LogConfig::warn().with_both("logs/db.log");
        assert_eq!(config.level, "warn");
        assert_eq!(config.output, LogOutput::Both(PathBuf::from("logs/db.log")));
    }

    // The only test in this binary that installs the global subscriber
    #[test]
    fn test_init_with_stdout_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let guard = LogConfig::warn()
            .with_both(dir.path().join("stratum.log"))
            .with_format(LogFormat::Compact)
            .init()
            .unwrap();
        assert!(guard.is_some());
        tracing::warn!("logging to stdout and file");

        assert!(matches!(
            LogConfig::info().init(),
            Err(Error::InvalidState(_))
        ));
        drop(guard);
    }
}
