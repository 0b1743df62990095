//! Kernel log macros.
//!
//! Messages are formatted as `<LEVEL> <message>` and handed to the sink
//! installed with [`init`]. Until a sink is installed, messages are dropped.

use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

use spin::Once;

macro_rules! log {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::log($level, format_args!($($arg)*))
    };
}

macro_rules! trace {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

#[expect(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

macro_rules! info {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[expect(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        log!($crate::log::LogLevel::Error, $($arg)*)
    };
}

/// Destination of formatted log lines, typically the kernel console.
pub trait LogSink: Sync {
    fn write_line(&self, line: fmt::Arguments<'_>);
}

static SINK: Once<&'static dyn LogSink> = Once::new();
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Installs the log sink. Only the first call has an effect.
pub fn init(sink: &'static dyn LogSink) {
    SINK.call_once(|| sink);
}

/// Sets the most verbose level that is still forwarded to the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

#[must_use]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 >= MAX_LEVEL.load(Ordering::Relaxed)
}

#[track_caller]
pub fn log(level: LogLevel, message: fmt::Arguments) {
    if !enabled(level) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write_line(format_args!("{} {}", LevelFormat(level), message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

struct LevelFormat(LogLevel);

impl fmt::Display for LevelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let color = match self.0 {
            LogLevel::Trace => 35,
            LogLevel::Debug => 34,
            LogLevel::Info => 32,
            LogLevel::Warn => 33,
            LogLevel::Error => 31,
        };
        let msg = match self.0 {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => " INFO",
            LogLevel::Warn => " WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "\x1B[{color};1m{msg}\x1B[0m")
    }
}
