use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Logger printing `<time> [LEVEL] message` lines to stdout, warnings and
/// errors to stderr.
pub struct SimpleLogger;

static LOGGER: SimpleLogger = SimpleLogger;

impl SimpleLogger {
    /// Installs the logger process-wide at `level`.
    pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(level);
        Ok(())
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} [{}] {}",
            Utc::now().format("%H:%M:%S%.3f"),
            record.level(),
            record.args()
        );
        if record.level() <= log::Level::Warn {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn flush(&self) {}
}
