//! Kernel log
//!
//! Every line is written through [`HAL::debug_write`] as
//! `"[LEVEL] [subsystem] message"` and the tail of the log is kept in
//! memory so it can be read back after boot (`dmesg`-style).

use alloc::collections::VecDeque;
use alloc::string::String;
use core::fmt;

use lumen_hal::HAL;

/// Bytes of log history kept in memory
pub const LOG_BUFFER_SIZE: usize = 4096;

/// Log severity, ordered from most to least verbose
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn tag(&self) -> &'static str {
        match self {
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Info => "[INFO] ",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Error => "[ERROR]",
        }
    }
}

/// Level-filtered logger with an in-memory history ring
pub struct Logger {
    level: LogLevel,
    history: VecDeque<u8>,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            history: VecDeque::new(),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn set_level(&mut self, level: LogLevel) {
        self.level = level;
    }

    /// Format and emit one line if `level` passes the filter
    pub fn log<H: HAL>(
        &mut self,
        hal: &H,
        level: LogLevel,
        subsystem: &str,
        args: fmt::Arguments<'_>,
    ) {
        if level < self.level {
            return;
        }
        let line = alloc::format!("{} [{}] {}", level.tag(), subsystem, args);
        hal.debug_write(&line);
        self.record(&line);
    }

    fn record(&mut self, line: &str) {
        self.history.extend(line.bytes());
        self.history.push_back(b'\n');
        if self.history.len() <= LOG_BUFFER_SIZE {
            return;
        }
        let excess = self.history.len() - LOG_BUFFER_SIZE;
        self.history.drain(..excess);
        // Drop the partial line left at the front.
        while let Some(b) = self.history.pop_front() {
            if b == b'\n' {
                break;
            }
        }
    }

    /// Everything still held in the history ring, oldest line first
    pub fn contents(&self) -> String {
        let bytes: alloc::vec::Vec<u8> = self.history.iter().copied().collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Log through a [`Logger`] with `format!`-style arguments.
///
/// ```ignore
/// klog!(self.log, &self.hal, Info, "sched", "created {} (PID {})", name, pid);
/// ```
#[macro_export]
macro_rules! klog {
    ($logger:expr, $hal:expr, $level:ident, $subsystem:expr, $($arg:tt)*) => {
        $logger.log($hal, $crate::log::LogLevel::$level, $subsystem, format_args!($($arg)*))
    };
}
