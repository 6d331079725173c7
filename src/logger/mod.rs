//! Structured logging for dipwatch
//!
//! Tagged, levelled logging with colored console output and a daily log file.
//!
//! ```rust,ignore
//! use dipwatch::logger::{self, LogTag};
//!
//! logger::info(LogTag::Analyzer, "Evaluated 12 pending signals");
//! logger::debug(LogTag::Prune, "Plan: 140 bars");   // only with --debug prune
//! logger::verbose(LogTag::Storage, "PRAGMA ...");    // only with --verbose
//! ```
//!
//! Call `logger::init` once at startup, before anything logs.

mod config;
mod core;
mod file;
mod format;
mod levels;
mod tags;

pub use config::{get_logger_config, set_logger_config, LoggerConfig};
pub use levels::LogLevel;
pub use tags::LogTag;

/// Install the logger configuration and open the log file (if enabled)
pub fn init(config: LoggerConfig) {
    let file_dir = config.file_dir.clone();
    config::set_logger_config(config);
    file::init_file_logging(file_dir);
}

/// Log at ERROR level (always shown)
pub fn error(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Error, message);
}

/// Log at WARNING level
pub fn warning(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Warning, message);
}

/// Log at INFO level (standard operations)
pub fn info(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Info, message);
}

/// Log at DEBUG level
///
/// Only shown when `--debug <tag>` names this tag, or when the threshold is
/// debug or higher (`--verbose`, `logging.level = "debug"`).
pub fn debug(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Debug, message);
}

/// Log at VERBOSE level (only with `--verbose`)
pub fn verbose(tag: LogTag, message: &str) {
    core::log_internal(tag, LogLevel::Verbose, message);
}

/// Force flush pending file writes. Call during shutdown.
pub fn flush() {
    file::flush_file_logging();
}
