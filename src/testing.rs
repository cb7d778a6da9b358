//! Test-only helpers shared across modules.

use std::sync::Once;
use std::thread::{self, ThreadId};

use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;

struct CapturedLog {
    thread: ThreadId,
    level: Level,
    target: String,
    message: String,
}

struct CaptureLogger;

static RECORDS: Mutex<Vec<CapturedLog>> = parking_lot::const_mutex(Vec::new());
static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL: Once = Once::new();

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS.lock().push(CapturedLog {
            thread: thread::current().id(),
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        });
    }

    fn flush(&self) {}
}

/// Routes `log` output into memory. Records are kept per thread so parallel
/// tests do not see each other's lines.
pub(crate) fn capture_logs() {
    INSTALL.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Trace);
        }
    });
}

/// Lines logged so far by the calling thread from modules under `target`.
pub(crate) fn logged_by_current_thread(target: &str) -> Vec<(Level, String)> {
    logged_by_thread(thread::current().id(), target)
}

/// Lines logged so far by `thread` from modules under `target`.
pub(crate) fn logged_by_thread(thread: ThreadId, target: &str) -> Vec<(Level, String)> {
    RECORDS
        .lock()
        .iter()
        .filter(|record| record.thread == thread && record.target.starts_with(target))
        .map(|record| (record.level, record.message.clone()))
        .collect()
}
