//! A basic logger implementation for the driver applications.
//!
//! This enables every driver crate to use the `log` crate's macros anywhere.
//! Log statements are written to stderr, one line per record.

use log::{Level, LevelFilter, Log, Metadata, Record, set_logger, set_max_level};
use spin::{Mutex, Once};
use std::io::{self, Write};

/// The system-wide logger, which writes to stderr.
pub struct StderrLogger {
    /// Serializes whole lines so that records from different threads don't interleave.
    output: Mutex<io::Stderr>,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut out = self.output.lock();
        // result is discarded, there's nowhere else to report it
        let _ = writeln!(
            out,
            "{}{} - [{}] {}",
            level_prefix(record.level()),
            record.level(),
            record.target(),
            record.args(),
        );
    }

    fn flush(&self) {
        let _ = self.output.lock().flush();
    }
}

/// Pads the shorter level names so that messages line up.
fn level_prefix(level: Level) -> &'static str {
    match level {
        Level::Info | Level::Warn => " ",
        _ => "",
    }
}

static LOGGER: Once<StderrLogger> = Once::new();

/// Initializes the logger and sets it as the system-wide logger for the `log` crate.
///
/// Calling this again only changes the maximum level.
pub fn init(max_level: LevelFilter) -> Result<(), &'static str> {
    set_max_level(max_level);
    let mut newly_created = false;
    let logger = LOGGER.call_once(|| {
        newly_created = true;
        StderrLogger { output: Mutex::new(io::stderr()) }
    });
    if newly_created {
        set_logger(logger).map_err(|_| "logger: couldn't set logger, another one is already installed")?;
    }
    Ok(())
}

/// Returns the maximum level for the given verbosity count from the command line.
pub fn level_for_verbosity(verbosity: usize) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
