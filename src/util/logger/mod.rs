//! Logger setup
//!
//! Plain `LEVEL message` lines: no timestamps, no targets, no colors.
//!
//! # Usage
//!
//! ```rust
//! use jobloom::util::logger;
//!
//! logger::init();
//! tracing::info!("office {} ready", "orders");
//! ```

use std::str::FromStr;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

static INSTALLED: OnceCell<LogLevel> = OnceCell::new();

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Initialize logger with default configuration (INFO level)
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// Initialize logger with a custom level.
///
/// Only the first call installs a subscriber; later calls (and calls made
/// after another subscriber was set globally) are no-ops.
pub fn init_with_level(level: LogLevel) {
    INSTALLED.get_or_init(|| {
        let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());
        let layer = tracing_subscriber::fmt::layer()
            .without_time()
            .with_target(false)
            .with_level(true)
            .with_ansi(false)
            .compact()
            .with_filter(filter);

        let _ = Registry::default().with(layer).try_init();
        level
    });
}

/// Initialize logger for debugging (DEBUG level)
pub fn init_debug() {
    init_with_level(LogLevel::Debug);
}

/// Level installed by the first initialization, if any.
pub fn installed_level() -> Option<LogLevel> {
    INSTALLED.get().copied()
}
