//! Process-wide logger: an `env_logger` implementation registered once at
//! startup, plus an error counter the process exit code is derived from.
//!
//! Grounded on the teacher workspace's own `log` + `env_logger` pairing
//! (every binary in the wider workspace initializes logging this way); the
//! error-counting wrapper and `--profile` resource snapshot are this
//! crate's own addition to satisfy the ambient-stack requirement.

use std::sync::atomic::{AtomicU32, Ordering};

use sysinfo::{Pid, System};

/// Verbosity requested on the command line, translated into a `log`
/// filter level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    Default,
    Verbose,
    Debug,
}

impl Verbosity {
    fn filter(self) -> log::LevelFilter {
        match self {
            Verbosity::Default => log::LevelFilter::Info,
            Verbosity::Verbose => log::LevelFilter::Debug,
            Verbosity::Debug => log::LevelFilter::Trace,
        }
    }
}

/// Counts `error`/`fatal` calls made during one process run so `main`'s
/// exit path can surface them as an exit code (§8 property 9).
pub struct Logger {
    errors: AtomicU32,
}

impl Logger {
    /// Initializes the global `env_logger` backend and returns a handle for
    /// counting errors. Must be called exactly once per process.
    pub fn init(verbosity: Verbosity) -> Logger {
        env_logger::Builder::new()
            .filter_level(verbosity.filter())
            .format_timestamp_millis()
            .init();
        Logger {
            errors: AtomicU32::new(0),
        }
    }

    pub fn error(&self, message: impl std::fmt::Display) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        log::error!("{message}");
    }

    /// Logs at error level, counts the error, and is meant for the caller
    /// to immediately unwind out of the current command — naming makes the
    /// call sites read as "this operation cannot continue" rather than a
    /// routine warning.
    pub fn fatal(&self, message: impl std::fmt::Display) {
        self.error(message);
    }

    pub fn error_count(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    /// Exit code: error count clipped to a `u8`, 0 when clean.
    pub fn exit_code(&self) -> u8 {
        self.error_count().min(u8::MAX as u32) as u8
    }
}

/// Snapshots this process's CPU usage and resident memory; used around a
/// command's execution under `--profile` to log the delta at verbose
/// level.
pub struct ResourceSnapshot {
    memory_bytes: u64,
    cpu_percent: f32,
}

impl ResourceSnapshot {
    pub fn capture() -> ResourceSnapshot {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);
        let (memory_bytes, cpu_percent) = system
            .process(pid)
            .map(|p| (p.memory(), p.cpu_usage()))
            .unwrap_or((0, 0.0));
        ResourceSnapshot {
            memory_bytes,
            cpu_percent,
        }
    }

    pub fn log_delta(&self, after: &ResourceSnapshot, label: &str) {
        log::debug!(
            "{label}: memory {} KiB -> {} KiB, cpu {:.1}% -> {:.1}%",
            self.memory_bytes / 1024,
            after.memory_bytes / 1024,
            self.cpu_percent,
            after.cpu_percent,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn exit_code_tracks_error_count() {
        let logger = Logger {
            errors: AtomicU32::new(0),
        };
        assert_eq!(logger.exit_code(), 0);
        logger.error("first");
        logger.fatal("second");
        assert_eq!(logger.error_count(), 2);
        assert_eq!(logger.exit_code(), 2);
    }

    #[test]
    fn exit_code_clips_to_u8() {
        let logger = Logger {
            errors: AtomicU32::new(1000),
        };
        assert_eq!(logger.exit_code(), u8::MAX);
    }
}
