//! Caller-facing progress logging
//!
//! Engines report human-readable progress through a single write-line
//! capability supplied by the caller. Developer diagnostics go through the
//! `log` crate instead; the two never mix, and neither ever shares a byte
//! stream with the protocol traffic.

use std::fmt;
use std::sync::Arc;

/// The write-line capability provided by the caller.
pub type LogSink = dyn Fn(&str) + Send + Sync;

/// Cheap, cloneable handle threaded into every engine.
///
/// When `verbose` is off all calls are discarded, sink or not.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<Arc<LogSink>>,
    verbose: bool,
}

impl Logger {
    pub fn new(sink: Option<Arc<LogSink>>, verbose: bool) -> Self {
        Logger { sink, verbose }
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Logger::default()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn write_line(&self, line: &str) {
        if !self.verbose {
            return;
        }
        if let Some(sink) = &self.sink {
            sink(line);
        }
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("sink", &self.sink.is_some())
            .field("verbose", &self.verbose)
            .finish()
    }
}
