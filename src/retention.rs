use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{buffer::SegmentBuffer, errors::DaclError, shutdown::Shutdown};

/// Outcome of one pass over the buffer directory.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub kept_in_buffer: usize,
    pub failed: usize,
}

/// Deletes files in the buffer directory once they are older than `max_age`.
///
/// Files the segment buffer still references are never touched, even when old.
pub struct RetentionSweeper {
    dir: PathBuf,
    max_age: Duration,
    interval: Duration,
    buffer: Option<Arc<SegmentBuffer>>,
}

impl RetentionSweeper {
    pub fn new(dir: &Path, max_age: Duration, interval: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_age,
            interval,
            buffer: None,
        }
    }

    pub fn with_buffer(mut self, buffer: Arc<SegmentBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn sweep(&self) -> Result<SweepReport, DaclError> {
        self.sweep_with(|path| fs::remove_file(path))
    }

    /// Sweeps using `remove` to delete each expired file.
    pub fn sweep_with<F>(&self, mut remove: F) -> Result<SweepReport, DaclError>
    where
        F: FnMut(&Path) -> io::Result<()>,
    {
        let entries = fs::read_dir(&self.dir).map_err(|e| DaclError::FileOperationError {
            operation: "read_dir".to_string(),
            path: self.dir.clone(),
            source: e,
        })?;

        let now = SystemTime::now();
        let mut report = SweepReport::default();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Unable to read entry in {}: {}", self.dir.display(), e);
                    report.failed += 1;
                    continue;
                }
            };
            let path = entry.path();
            let modified = match entry.metadata().and_then(|meta| {
                if meta.is_file() {
                    meta.modified().map(Some)
                } else {
                    Ok(None)
                }
            }) {
                Ok(Some(modified)) => modified,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Unable to stat {}: {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };
            report.scanned += 1;

            let expired = now
                .duration_since(modified)
                .map(|age| age > self.max_age)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            if self.buffer.as_ref().is_some_and(|b| b.holds(&path)) {
                debug!("Keeping {}, still buffered", path.display());
                report.kept_in_buffer += 1;
                continue;
            }

            match remove(&path) {
                Ok(()) => {
                    debug!("Swept {}", path.display());
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!("Unable to sweep {}: {}", path.display(), e);
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Sweeps every `interval` until shutdown.
    pub fn run(&self, shutdown: &Shutdown) {
        info!(
            "Retention sweeper watching {} (max age {:?}, every {:?})",
            self.dir.display(),
            self.max_age,
            self.interval
        );
        loop {
            match self.sweep() {
                Ok(report) if report.deleted > 0 || report.failed > 0 => info!(
                    "Sweep removed {} of {} files ({} failures)",
                    report.deleted, report.scanned, report.failed
                ),
                Ok(_) => {}
                Err(e) => error!("Sweep failed, retrying next interval: {}", e),
            }
            if shutdown.sleep(self.interval) {
                break;
            }
        }
        info!("Retention sweeper stopped");
    }
}
