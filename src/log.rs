//! Structured logging for taskflow.
//!
//! The crate emits `tracing` events; this module installs a subscriber for
//! applications that do not bring their own.
//!
//! Log levels:
//! - WARN: retries, stalled tasks, best-effort saves that failed
//! - INFO: session boundaries, pipelines, run summaries
//! - DEBUG: per-task transitions and component bookkeeping
//! - TRACE: queue scoring, dropped events, write-back conflicts
//!
//! `RUST_LOG` always wins. Otherwise debug mode is enabled with the `debug`
//! argument or `TASKFLOW_DEBUG=1`, and the default level is `info`.

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;
use crate::error::Result;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable enabling debug mode.
pub const DEBUG_ENV: &str = "TASKFLOW_DEBUG";

/// Log file name inside the taskflow directory.
pub const LOG_FILE: &str = "taskflow.log";

/// Initialize logging to stderr.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging to stderr with explicit debug mode setting.
///
/// Does nothing if a global subscriber is already installed.
pub fn init_with_debug(debug: bool) {
    let filter = filter(resolve_debug(debug, env_debug()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

/// Initialize logging to `~/.taskflow/taskflow.log`, truncated on startup.
///
/// Returns the log file path.
pub fn init_file(debug: bool) -> Result<PathBuf> {
    let dir = Config::taskflow_dir()?;
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(LOG_FILE);
    let file = File::create(&path)?;

    let filter = filter(resolve_debug(debug, env_debug()));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true)
        .try_init();
    Ok(path)
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn resolve_debug(flag: bool, env: bool) -> bool {
    let enabled = flag || env;
    DEBUG_ENABLED.store(enabled, Ordering::SeqCst);
    enabled
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive(debug)))
}
