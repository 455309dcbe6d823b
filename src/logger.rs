//! Kernel logger.
//!
//! Implements `log::Log`, formatting records as `[LEVEL] message` and
//! handing each line to a console sink supplied by the port. The sink must
//! not call back into the kernel: it can run with interrupts masked and
//! with scheduler state locked.

use core::fmt;

use log::{LevelFilter, Metadata, Record, SetLoggerError};
use spin::Once;

/// Writes one formatted line to the console.
pub type Sink = fn(fmt::Arguments<'_>);

static LOGGER: KernelLogger = KernelLogger;
static SINK: Once<Sink> = Once::new();

struct KernelLogger;

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            sink(format_args!("[{}] {}", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger with `sink` as its console.
///
/// The level is applied on every call. The logger and its sink can only be
/// installed once per program; later calls return the error from
/// `log::set_logger` and keep the first sink.
pub fn init(max_level: LevelFilter, sink: Sink) -> Result<(), SetLoggerError> {
    log::set_max_level(max_level);
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER)
}
