//! Structured logging shared by `engine-server` and `http-adapter`.
//!
//! Thin wrapper around `slog` + `sloggers`, in the spirit of the teacher's
//! `flux::logging` module: callers get a `Logger` built from a small config
//! rather than touching `slog_term`/`slog_async` directly.

pub use slog::{self, debug, error, info, o, warn, Logger};

use serde::{Deserialize, Serialize};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::{Format, Severity};
use sloggers::Build;

/// Logging configuration loaded alongside each binary's own `Config`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: LogLevel::Info,
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl From<LogLevel> for Severity {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Severity::Trace,
            LogLevel::Debug => Severity::Debug,
            LogLevel::Info => Severity::Info,
            LogLevel::Warning => Severity::Warning,
            LogLevel::Error => Severity::Error,
        }
    }
}

/// Build a root logger for the given component name (`"engine-server"`,
/// `"http-adapter"`), tagged with it via `o!("component" => name)`.
pub fn init(component: &'static str, config: &LogConfig) -> Logger {
    let mut builder = TerminalLoggerBuilder::new();
    builder.level(config.level.into());
    builder.destination(Destination::Stderr);
    builder.format(if config.json { Format::Json } else { Format::Full });

    let root = builder
        .build()
        .expect("failed to initialize terminal logger");
    root.new(o!("component" => component))
}
