//! Optional phase-event tracing. When a stats file is configured, every
//! phase a thread executes is appended as one CSV row; nothing here is
//! required for correctness and the whole module is bypassed when the
//! option is empty.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

lazy_static! {
    static ref EPOCH: Instant = Instant::now();
}

/// Nanoseconds since the first call in this process.
pub fn now_nanos() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

pub struct Stats {
    writer: Mutex<BufWriter<File>>,
}

impl Stats {
    pub fn open(path: &str) -> std::io::Result<Stats> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "event,worker,start_ns,duration_ns")?;
        Ok(Stats {
            writer: Mutex::new(writer),
        })
    }

    /// Append one event row. IO errors are logged and dropped; tracing
    /// never takes the process down.
    pub fn record(&self, event: &str, worker: usize, start_ns: u64, duration_ns: u64) {
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writeln!(writer, "{},{},{},{}", event, worker, start_ns, duration_ns) {
            warn!("stats write failed: {}", e);
        }
    }

    pub fn flush(&self) {
        let mut writer = self.writer.lock().unwrap();
        if let Err(e) = writer.flush() {
            warn!("stats flush failed: {}", e);
        }
    }
}

/// Time a closure and report the window to `record`.
pub fn timed<R>(f: impl FnOnce() -> R) -> (R, u64, u64) {
    let start = now_nanos();
    let result = f();
    (result, start, now_nanos() - start)
}
