use std::{
    collections::{HashMap, VecDeque},
    fs,
    io::ErrorKind,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::{Duration, SystemTime},
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::errors::DaclError;

/// File extensions a previous run may have left behind in the buffer directory.
pub const SEGMENT_EXTENSIONS: [&str; 3] = ["mp4", "h264", "part"];

/// One recorded video segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub path: PathBuf,
    pub sequence: u64,
    pub created_at: SystemTime,
}

impl Segment {
    pub fn new(path: PathBuf, sequence: u64) -> Self {
        Self {
            path,
            sequence,
            created_at: SystemTime::now(),
        }
    }

    fn is_older_than(&self, max_age: Duration, now: SystemTime) -> bool {
        now.duration_since(self.created_at)
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct BufferState {
    segments: VecDeque<Segment>,
    /// Lease count per segment sequence number
    pins: HashMap<u64, usize>,
    /// Evicted segments whose files are still leased
    deferred: Vec<Segment>,
}

/// Bounded ring of recorded segments, oldest first.
///
/// Appending past capacity (or past `max_age`) evicts from the head and deletes the file.
/// Segments handed out through [`SegmentBuffer::lease`] are only dropped from the ring
/// while leased; their files are deleted once the last lease is released. All file
/// deletion happens after the lock is released.
#[derive(Debug)]
pub struct SegmentBuffer {
    state: Mutex<BufferState>,
    capacity: usize,
    segment_duration: Duration,
    max_age: Option<Duration>,
}

impl SegmentBuffer {
    pub fn new(capacity: usize, segment_duration: Duration, max_age: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            capacity: capacity.max(1),
            segment_duration,
            max_age,
        }
    }

    /// Number of segments needed to keep `buffer` worth of video.
    pub fn capacity_for(buffer: Duration, segment_duration: Duration) -> usize {
        if segment_duration.is_zero() {
            return 1;
        }
        ((buffer.as_millis() / segment_duration.as_millis()) as usize).max(1)
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn segment_duration(&self) -> Duration {
        self.segment_duration
    }

    pub fn len(&self) -> usize {
        self.lock().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a segment, evicting from the head as needed. Returns the evicted segments.
    pub fn append(&self, segment: Segment) -> Vec<Segment> {
        let now = SystemTime::now();
        let mut evicted = Vec::new();
        let mut to_delete = Vec::new();
        {
            let mut state = self.lock();
            state.segments.push_back(segment);

            while state.segments.len() > self.capacity {
                if let Some(head) = state.segments.pop_front() {
                    evicted.push(head);
                }
            }
            if let Some(max_age) = self.max_age {
                while state.segments.len() > 1
                    && state
                        .segments
                        .front()
                        .is_some_and(|head| head.is_older_than(max_age, now))
                {
                    if let Some(head) = state.segments.pop_front() {
                        evicted.push(head);
                    }
                }
            }

            for segment in &evicted {
                if state.pins.contains_key(&segment.sequence) {
                    debug!(
                        "Segment {} is leased, deferring delete",
                        segment.sequence
                    );
                    state.deferred.push(segment.clone());
                } else {
                    to_delete.push(segment.path.clone());
                }
            }
        }

        for path in &to_delete {
            remove_segment_file(path);
        }
        evicted
    }

    fn select(state: &BufferState, count: usize) -> Vec<Segment> {
        let skip = state.segments.len().saturating_sub(count);
        state.segments.iter().skip(skip).cloned().collect()
    }

    fn count_for(&self, duration_back: Duration) -> usize {
        if self.segment_duration.is_zero() {
            return usize::MAX;
        }
        (duration_back.as_millis() / self.segment_duration.as_millis()) as usize
    }

    /// The most recent `duration_back / segment_duration` segments, oldest first.
    pub fn window(&self, duration_back: Duration) -> Vec<Segment> {
        let count = self.count_for(duration_back);
        Self::select(&self.lock(), count)
    }

    /// Same selection as [`SegmentBuffer::window`], with the files kept on disk until the
    /// lease is dropped.
    pub fn lease(&self, duration_back: Duration) -> SegmentLease<'_> {
        let count = self.count_for(duration_back);
        let mut state = self.lock();
        let segments = Self::select(&state, count);
        for segment in &segments {
            *state.pins.entry(segment.sequence).or_insert(0) += 1;
        }
        SegmentLease {
            buffer: self,
            segments,
        }
    }

    fn release(&self, segments: &[Segment]) {
        let mut to_delete = Vec::new();
        {
            let mut state = self.lock();
            for segment in segments {
                if let Some(count) = state.pins.get_mut(&segment.sequence) {
                    *count -= 1;
                    if *count == 0 {
                        state.pins.remove(&segment.sequence);
                    }
                }
            }
            let BufferState { pins, deferred, .. } = &mut *state;
            deferred.retain(|segment| {
                if pins.contains_key(&segment.sequence) {
                    true
                } else {
                    to_delete.push(segment.path.clone());
                    false
                }
            });
        }

        for path in &to_delete {
            remove_segment_file(path);
        }
    }

    /// Whether `path` is still referenced by the ring or by a lease.
    pub fn holds(&self, path: &Path) -> bool {
        let state = self.lock();
        state.segments.iter().any(|s| s.path == path)
            || state.deferred.iter().any(|s| s.path == path)
    }

    /// Number of evicted segments still waiting on a lease.
    pub fn deferred_len(&self) -> usize {
        self.lock().deferred.len()
    }
}

/// Pinned pre-trigger segments. Dereferences to the selected segments.
#[derive(Debug)]
pub struct SegmentLease<'a> {
    buffer: &'a SegmentBuffer,
    segments: Vec<Segment>,
}

impl SegmentLease<'_> {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.segments.iter().map(|s| s.path.clone()).collect()
    }
}

impl Deref for SegmentLease<'_> {
    type Target = [Segment];

    fn deref(&self) -> &Self::Target {
        &self.segments
    }
}

impl Drop for SegmentLease<'_> {
    fn drop(&mut self) {
        self.buffer.release(&self.segments);
    }
}

/// Deletes a temporary or leftover file. A missing file is fine; any other failure is
/// logged so leaked files are visible to the operator.
pub(crate) fn discard_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Unable to remove {}: {}", path.display(), e),
    }
}

fn remove_segment_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Evicted segment {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Evicted segment {} was already gone", path.display())
        }
        Err(e) => warn!("Unable to delete segment {}: {}", path.display(), e),
    }
}

fn is_segment_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SEGMENT_EXTENSIONS.contains(&ext))
}

/// Deletes segment files left in `dir` by a previous run. Creates `dir` if missing.
pub fn purge_stale_segments(dir: &Path) -> Result<usize, DaclError> {
    fs::create_dir_all(dir).map_err(|e| DaclError::FileOperationError {
        operation: "create_dir".to_string(),
        path: dir.to_path_buf(),
        source: e,
    })?;
    let entries = fs::read_dir(dir).map_err(|e| DaclError::FileOperationError {
        operation: "read_dir".to_string(),
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_segment_file(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Unable to purge {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        info!("Purged {} stale segments from {}", removed, dir.display());
    }
    Ok(removed)
}
