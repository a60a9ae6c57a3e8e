//! Kernel log sink.
//!
//! Records from the `log` facade are written to the serial port as
//! `[LEVEL] target: message`, one record at a time.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

#[cfg(debug_assertions)]
const MAX_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const MAX_LEVEL: LevelFilter = LevelFilter::Info;

pub static LOGGER: SerialLogger = SerialLogger::new();

/// Serialises records so lines from different cores never interleave.
pub struct SerialLogger {
    line: Mutex<()>,
}

impl SerialLogger {
    pub const fn new() -> Self {
        Self {
            line: Mutex::new(()),
        }
    }
}

impl Default for SerialLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _line = self.line.lock();
        crate::serial_println!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Installs the logger. Only core 0 does so, and only the first call counts.
pub fn init(cpu_id: u32) {
    if cpu_id == 0 && log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(MAX_LEVEL);
    }
}
