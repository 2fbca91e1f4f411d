//! Minimal stderr logger behind the `log` facade.
//!
//! The level filter comes from the `NANDSIM_LOG` environment variable
//! (error/warn/info/debug/trace); the default is `info`.

use std::io::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

static LOGGER: StderrLogger = StderrLogger;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = match record.level() {
            // Plain output for the normal progress lines, tagged output for
            // anything that warrants attention.
            Level::Info => writeln!(handle, "{}", record.args()),
            level => writeln!(handle, "[{}] {}", level, record.args()),
        };
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

/// Install the logger. Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = match std::env::var("NANDSIM_LOG").as_deref() {
        Ok("error") => LevelFilter::Error,
        Ok("warn") => LevelFilter::Warn,
        Ok("debug") => LevelFilter::Debug,
        Ok("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(filter);
    }
}
