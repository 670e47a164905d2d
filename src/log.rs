//! Leveled file logging for control-plane passes.
//!
//! Log levels:
//! - ERROR: the pass cannot read or write its core state
//! - WARN: a section degraded (unparseable signal source, failed probe, ...)
//! - INFO: pass milestones (selection, promotions, hook summary)
//! - DEBUG: per-item decisions (gate rejections, dedup matches, timeouts)
//! - TRACE: raw subprocess output excerpts
//!
//! `--debug` or `KEEL_DEBUG=1` raises the level to DEBUG; `KEEL_LOG=<level>`
//! sets it explicitly and wins over both. The log file is `keel.log` inside
//! the state directory and is truncated on every start.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

pub const LOG_FILE: &str = "keel.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

const LEVELS: [LogLevel; 5] = [
    LogLevel::Error,
    LogLevel::Warn,
    LogLevel::Info,
    LogLevel::Debug,
    LogLevel::Trace,
];

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
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LEVELS
            .iter()
            .copied()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level: {}", s))
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Level chosen from the debug flag and the environment.
fn startup_level(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("KEEL_LOG").ok().and_then(|v| v.parse().ok()) {
        return level;
    }
    if debug || env_flag("KEEL_DEBUG") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Start logging into `<state_dir>/keel.log`.
///
/// An unwritable state directory leaves the logger disabled rather than
/// failing the command.
pub fn init_with_debug(state_dir: &Path, debug: bool) {
    set_level(startup_level(debug));
    if std::fs::create_dir_all(state_dir).is_err() {
        return;
    }
    let path = state_dir.join(LOG_FILE);
    if std::fs::write(&path, "").is_ok() {
        LOG_PATH.set(path).ok();
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    let raw = LOG_LEVEL.load(Ordering::Relaxed) as usize;
    LEVELS[raw.min(LEVELS.len() - 1)]
}

pub fn enabled(level: LogLevel) -> bool {
    level <= self::level()
}

/// Append one line at `level`; a no-op before init or when filtered out.
pub fn write(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let _ = writeln!(file, "[{}] [{:<5}] {}", timestamp, level.as_str(), msg);
    }
}

#[macro_export]
macro_rules! klog {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Info, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Error, &format!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::log::write($crate::log::LogLevel::Warn, &format!($($arg)*))
    };
}

/// Formatting is skipped entirely when DEBUG is filtered out.
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Debug) {
            $crate::log::write($crate::log::LogLevel::Debug, &format!($($arg)*))
        }
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        if $crate::log::enabled($crate::log::LogLevel::Trace) {
            $crate::log::write($crate::log::LogLevel::Trace, &format!($($arg)*))
        }
    };
}
