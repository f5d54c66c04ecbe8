//! Colored stderr backend for the `log` facade.

use colored::*;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

struct ColoredLogger {
    level: LevelFilter,
}

impl Log for ColoredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "error".red().bold(),
            Level::Warn => "warn ".yellow().bold(),
            Level::Info => "info ".green(),
            Level::Debug => "debug".blue(),
            Level::Trace => "trace".dimmed(),
        };
        let thread = std::thread::current();
        eprintln!(
            "{} {} {}: {}",
            level,
            thread.name().unwrap_or("?").dimmed(),
            record.target().dimmed(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// `verbosity` 0 shows warnings and errors; each step adds a level.
pub fn init(verbosity: u8) -> Result<(), SetLoggerError> {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    log::set_boxed_logger(Box::new(ColoredLogger { level }))?;
    log::set_max_level(level);
    Ok(())
}
