use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

/// Buffered per-operation timing log.
///
/// Entries accumulate in memory and hit the disk only on `flush`, which the
/// admin surface (`flush_perf_log`, graceful termination) triggers. Without
/// a configured path the log swallows entries.
pub struct PerfLog {
    path: Option<PathBuf>,
    entries: Mutex<Vec<String>>,
}

impl PerfLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Records one completed operation.
    pub fn record(&self, method: &str, elapsed: Duration) {
        if self.path.is_none() {
            return;
        }
        let line = format!("{}\t{}", method, elapsed.as_micros());
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(line);
        }
    }

    /// Appends all buffered entries to the log file and clears the buffer.
    pub fn flush(&self) -> std::io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let drained: Vec<String> = {
            let mut entries = self
                .entries
                .lock()
                .map_err(|_| std::io::Error::other("perf log lock poisoned"))?;
            std::mem::take(&mut *entries)
        };
        if drained.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in &drained {
            writeln!(file, "{}", line)?;
        }
        file.flush()?;
        info!(entries = drained.len(), path = %path.display(), "performance log flushed");
        Ok(())
    }
}
