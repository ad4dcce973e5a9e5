use std::io::{self, Write};

use parking_lot::Mutex;
use tracing::debug;

/// Destination for the host's user-facing text.
///
/// Sinks are written from callback threads the host does not own, so implementations
/// must be thread-safe and must not block for long.
pub trait OutputSink: Send + Sync {
    fn write(&self, text: &str);

    fn line(&self, text: &str) {
        self.write(&format!("{}\n", text));
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StdoutSink;

impl OutputSink for StdoutSink {
    fn write(&self, text: &str) {
        let mut out = io::stdout().lock();
        if let Err(err) = out.write_all(text.as_bytes()).and_then(|_| out.flush()) {
            debug!(error = %err, "stdout write failed");
        }
    }
}

/// Keeps everything written to it, one element per `write` call.
#[derive(Debug, Default)]
pub struct MemorySink {
    writes: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn contents(&self) -> String {
        self.writes.lock().concat()
    }
}

impl OutputSink for MemorySink {
    fn write(&self, text: &str) {
        self.writes.lock().push(text.to_owned());
    }
}
