use std::{fs, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{
    filter::LevelFilter,
    fmt,
    layer::{Layer, SubscriberExt},
    registry::Registry,
    util::{SubscriberInitExt, TryInitError},
};

/// Error type used in logging configuration
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Log destination I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Unable to install global subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Logging configuration
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LoggingConfig {
    /// Overall format for logging output
    #[serde(default)]
    pub format: LoggingFormat,
    /// Flatten event metadata fields into object, JSON format only
    #[serde(default)]
    pub flatten_metadata: bool,
    /// Minimum severity level to include in output
    #[serde(default)]
    pub level: LoggingLevel,
    /// Use ANSI escape sequences for output colors and formatting
    #[serde(default)]
    pub color: bool,
    /// Print thread names, useful to tell stress tasks apart
    #[serde(default = "default_true")]
    pub thread_name: bool,
    /// Maximum buffered lines to store before dropping new ones
    #[serde(default = "LoggingConfig::default_buffer_lines")]
    pub buffer_lines: usize,
    /// Log destination configuration
    #[serde(default)]
    pub output: LoggingDestination,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LoggingFormat::default(),
            flatten_metadata: false,
            level: LoggingLevel::default(),
            color: false,
            thread_name: true,
            buffer_lines: Self::default_buffer_lines(),
            output: LoggingDestination::default(),
        }
    }
}

impl LoggingConfig {
    /// Default value for [`Self::buffer_lines`]
    #[must_use]
    #[inline]
    fn default_buffer_lines() -> usize {
        128_000
    }

    /// Install global subscriber built from configuration
    ///
    /// Logging works until the returned guard is dropped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if log destination cannot be opened, or if a global subscriber is already
    /// installed.
    pub fn init(&self) -> Result<WorkerGuard, LoggingError> {
        let (layer, guard) = self.make_layer()?;
        Registry::default().with(layer).try_init()?;
        Ok(guard)
    }

    /// Make [`tracing_subscriber::Layer`] from configuration
    pub fn make_layer(
        &self,
    ) -> Result<(Box<dyn Layer<Registry> + Send + Sync>, WorkerGuard), LoggingError> {
        let builder = NonBlockingBuilder::default()
            .buffered_lines_limit(self.buffer_lines)
            .lossy(true);
        let (writer, guard) = self.output.make_writer(builder)?;
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(self.color)
            .with_thread_names(self.thread_name);
        let boxed_layer = match self.format {
            LoggingFormat::Full => layer.boxed(),
            LoggingFormat::Compact => layer.compact().boxed(),
            LoggingFormat::Pretty => layer.pretty().boxed(),
            LoggingFormat::Json => layer.json().flatten_event(self.flatten_metadata).boxed(),
        }
        .with_filter(LevelFilter::from(self.level))
        .boxed();
        Ok((boxed_layer, guard))
    }
}

fn default_true() -> bool {
    true
}

/// Format for logging output
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingFormat {
    /// Format which prints span context before log message
    #[default]
    Full,
    /// More compact format, span names are hidden
    Compact,
    /// Verbose multiline format
    Pretty,
    /// Newline-delimited JSON objects
    Json,
}

///
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LoggingLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LoggingLevel> for LevelFilter {
    fn from(value: LoggingLevel) -> Self {
        match value {
            LoggingLevel::Off => LevelFilter::OFF,
            LoggingLevel::Error => LevelFilter::ERROR,
            LoggingLevel::Warn => LevelFilter::WARN,
            LoggingLevel::Info => LevelFilter::INFO,
            LoggingLevel::Debug => LevelFilter::DEBUG,
            LoggingLevel::Trace => LevelFilter::TRACE,
        }
    }
}

///
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum LoggingDestination {
    #[default]
    StdOut,
    StdErr,
    /// Append to a file
    File {
        ///
        path: String,
    },
}

impl LoggingDestination {
    fn make_writer(
        &self,
        builder: NonBlockingBuilder,
    ) -> Result<(NonBlocking, WorkerGuard), LoggingError> {
        Ok(match self {
            Self::StdOut => builder.finish(io::stdout()),
            Self::StdErr => builder.finish(io::stderr()),
            Self::File { path } => {
                let file = fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)?;
                builder.finish(file)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_value, json};

    use super::*;

    #[test]
    fn defaults() {
        let cfg: LoggingConfig = from_value(json!({})).unwrap();
        assert_eq!(cfg, LoggingConfig::default());
        assert_eq!(cfg.format, LoggingFormat::Full);
        assert_eq!(cfg.output, LoggingDestination::StdOut);
        assert!(cfg.thread_name);
    }

    #[test]
    fn json_to_file() {
        let cfg: LoggingConfig = from_value(json!({
            "format": "json",
            "flatten_metadata": true,
            "level": "DEBUG",
            "output": {"type": "file", "path": "/tmp/stress.log"},
        }))
        .unwrap();
        assert_eq!(cfg.format, LoggingFormat::Json);
        assert!(cfg.flatten_metadata);
        assert_eq!(LevelFilter::from(cfg.level), LevelFilter::DEBUG);
        assert_eq!(
            cfg.output,
            LoggingDestination::File {
                path: "/tmp/stress.log".into()
            }
        );
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(from_value::<LoggingConfig>(json!({"level": "LOUD"})).is_err());
    }

    #[test]
    fn layer_for_stderr() {
        let cfg: LoggingConfig = from_value(json!({
            "format": "compact",
            "output": {"type": "stderr"},
        }))
        .unwrap();
        assert!(cfg.make_layer().is_ok());
    }
}
