//! Structured logging for the orchestrator.
//!
//! Every line carries a component tag (`zone`, `gate`, `task`, ...) so a
//! single log file can be filtered per subsystem:
//!
//! ```text
//! [14:02:11.532] [INFO] [zone] robot_a entered waiting_split_area_transfer
//! ```
//!
//! Debug mode can be enabled with `--debug` or `LABFLOW_DEBUG=1`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static MIRROR_STDERR: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// Parse a level name as written in the config file.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

/// Initialize logging to ~/.labflow/labflow.log.
pub fn init(debug: bool, mirror_stderr: bool) {
    let env_debug = std::env::var("LABFLOW_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false);

    let level = if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    set_level(level);
    MIRROR_STDERR.store(mirror_stderr, Ordering::SeqCst);

    if let Some(dir) = dirs::home_dir().map(|h| h.join(".labflow")) {
        init_file(&dir.join("labflow.log"));
    }
}

/// Direct log output to an explicit file, truncating it.
///
/// Only the first call wins; later calls keep the original path.
pub fn init_file(path: &Path) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, "");
    LOG_PATH.set(path.to_path_buf()).ok();
}

/// Set the minimum log level for output.
pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

/// Get the current log level.
pub fn get_level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Format one log line. Split out so the layout is testable.
pub fn format_line(level: LogLevel, component: &str, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    format!("[{}] [{}] [{}] {}", timestamp, level.as_str(), component, msg)
}

/// Log a message at the specified level.
pub fn log_at(level: LogLevel, component: &str, msg: &str) {
    if level > get_level() {
        return;
    }

    let line = format_line(level, component, msg);

    if MIRROR_STDERR.load(Ordering::Relaxed) {
        eprintln!("{}", line);
    }

    if let Some(path) = LOG_PATH.get() {
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", line);
        }
    }
}

pub fn error(component: &str, msg: &str) {
    log_at(LogLevel::Error, component, msg);
}

pub fn warn(component: &str, msg: &str) {
    log_at(LogLevel::Warn, component, msg);
}

pub fn info(component: &str, msg: &str) {
    log_at(LogLevel::Info, component, msg);
}

pub fn debug(component: &str, msg: &str) {
    log_at(LogLevel::Debug, component, msg);
}

pub fn trace(component: &str, msg: &str) {
    log_at(LogLevel::Trace, component, msg);
}

/// Log at INFO level: `flog!("zone", "{} entered {}", agent, zone)`.
#[macro_export]
macro_rules! flog {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::info($component, &format!($($arg)*))
    };
}

/// Log macro for ERROR level.
#[macro_export]
macro_rules! flog_error {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::error($component, &format!($($arg)*))
    };
}

/// Log macro for WARN level.
#[macro_export]
macro_rules! flog_warn {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::warn($component, &format!($($arg)*))
    };
}

/// Log macro for DEBUG level (only logs when debug mode is enabled).
#[macro_export]
macro_rules! flog_debug {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::debug($component, &format!($($arg)*))
    };
}

/// Log macro for TRACE level.
#[macro_export]
macro_rules! flog_trace {
    ($component:expr, $($arg:tt)*) => {
        $crate::log::trace($component, &format!($($arg)*))
    };
}
