//! This module contains a log sink for unit tests that assert on emitted
//! records

use std::sync::{Mutex, Once};

use log::{Level, Log, Metadata, Record};

/// Records captured since the last [`capture`] began: level and message.
static RECORDS: Mutex<Vec<(Level, String)>> = Mutex::new(Vec::new());

/// Serializes tests that assert on captured logs.
static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// One-time logger installation.
static INIT: Once = Once::new();

/// Sink storing every record it sees.
struct CaptureLogger;

impl Log for CaptureLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        RECORDS
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// Runs `scope` with log capture active and returns the records it emitted.
///
/// Capturing tests share one sink, so they serialize on a lock to keep
/// records from bleeding between tests.
pub(crate) fn capture(scope: impl FnOnce()) -> Vec<(Level, String)> {
    INIT.call_once(|| {
        log::set_boxed_logger(Box::new(CaptureLogger)).ok();
        log::set_max_level(log::LevelFilter::Trace);
    });

    let guard = CAPTURE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    RECORDS.lock().unwrap().clear();
    scope();
    let records = RECORDS.lock().unwrap().clone();
    drop(guard);
    records
}
