// Result-log sink. Measurement output is a deliverable file, distinct from
// the tracing diagnostics: every run creates a fresh wall-clock-tagged
// directory holding `result.log`, and each appended line carries the
// nanoseconds elapsed since the log was opened.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::util::Timer;

pub struct Logger {
    file: File,
    path: PathBuf,
    timer: Timer,
}

impl Logger {
    /// Create `<output_dir>/<wall_clock_tag>/result.log` and start the
    /// elapsed-time reference.
    pub fn open(output_dir: &Path) -> Result<Self> {
        let dir = output_dir.join(Timer::wall_clock_tag());
        fs::create_dir_all(&dir)?;
        let path = dir.join("result.log");
        let file = File::create(&path)?;
        tracing::info!(path = %path.display(), "opened result log");
        Ok(Self {
            file,
            path,
            timer: Timer::new(),
        })
    }

    /// Append one timestamped line, teed to stdout.
    pub fn append(&mut self, message: &str) {
        let line = format!("[{}]{}", self.timer.elapsed_ns(), message);
        println!("{line}");
        if let Err(err) = writeln!(self.file, "{line}") {
            tracing::warn!(%err, "failed to write result log line");
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) {
        let _ = self.file.flush();
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}
