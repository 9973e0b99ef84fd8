//! [`log`] backend that writes to a kernel provided sink, usually the UART.

use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use owo_colors::OwoColorize;
use spin::Mutex;

type Sink = &'static mut (dyn Write + Send);

static LOGGER: KernelLogger = KernelLogger {
    sink: Mutex::new(None),
};

/// Logger that formats every record as `[ LEVEL ] [module] message`.
pub struct KernelLogger {
    sink: Mutex<Option<Sink>>,
}

impl Log for KernelLogger {
    #[allow(unused_variables)]
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        #[cfg(any(debug_assertions, feature = "logging"))]
        return true;
        #[cfg(all(not(debug_assertions), not(feature = "logging")))]
        return metadata.level() <= Level::Info;
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if let Some(sink) = self.sink.lock().as_mut() {
            // there is nowhere to report a failing sink to
            let _ = write_record(&mut **sink, record);
        }
    }

    fn flush(&self) {}
}

/// Write a single record to `out`.
pub fn write_record(out: &mut dyn Write, record: &Record<'_>) -> fmt::Result {
    let module = record
        .module_path_static()
        .or_else(|| record.module_path())
        .unwrap_or("<n/a>");

    write!(out, "[ ")?;
    match record.level() {
        level @ Level::Error => write!(out, "{:>5}", level.red())?,
        level @ Level::Warn => write!(out, "{:>5}", level.yellow())?,
        level @ Level::Info => write!(out, "{:>5}", level.cyan())?,
        level @ Level::Debug => write!(out, "{:>5}", level.magenta())?,
        level @ Level::Trace => write!(out, "{:>5}", level.dimmed())?,
    }
    writeln!(out, " ] [{}] {}", module, record.args())
}

/// Install the kernel logger, which writes all records into `sink`.
///
/// Calling this again only replaces the sink.
pub fn init(sink: Sink) -> Result<(), SetLoggerError> {
    *LOGGER.sink.lock() = Some(sink);
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}
