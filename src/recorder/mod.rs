pub mod encoder;

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{
    archive::sanitize_label,
    buffer::{Segment, SegmentBuffer, SegmentLease, discard_file},
    errors::DaclError,
    shutdown::Shutdown,
    telemetry::TelemetryStore,
};
pub use encoder::{CommandEncoder, Encoder, EncoderCommandBuilder};

/// Pause after a failed cycle so a broken camera does not spin the recorder.
const FAILED_CYCLE_BACKOFF: Duration = Duration::from_secs(1);

/// File name of a buffered segment.
pub fn segment_file_name(timestamp: &str, sequence: u64) -> String {
    format!("video_{timestamp}_{sequence:06}.mp4")
}

/// Opaque reference to a post-trigger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Result of a post-trigger session that collected all its segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedSession {
    pub id: u64,
    pub label: String,
    /// The last segment copied into the session
    pub collected: Option<PathBuf>,
    pub segments_copied: usize,
}

#[derive(Debug)]
struct PostTriggerSession {
    label: String,
    remaining: usize,
    target: PathBuf,
    collected: Option<PathBuf>,
    copied: usize,
}

impl PostTriggerSession {
    fn finish(self, id: u64) -> CompletedSession {
        CompletedSession {
            id,
            label: self.label,
            collected: self.collected,
            segments_copied: self.copied,
        }
    }
}

#[derive(Debug, Default)]
struct SessionTable {
    collecting: HashMap<u64, PostTriggerSession>,
    completed: HashMap<u64, CompletedSession>,
    /// Set once the recorder loop has exited; no segment will arrive anymore
    stopped: bool,
}

/// Drives the capture loop and feeds post-trigger sessions.
pub struct Recorder {
    buffer: Arc<SegmentBuffer>,
    telemetry: Arc<TelemetryStore>,
    encoder: Arc<dyn Encoder>,
    buffer_dir: PathBuf,
    sessions: Mutex<SessionTable>,
    session_done: Condvar,
    next_sequence: AtomicU64,
    next_session: AtomicU64,
}

impl Recorder {
    pub fn new(
        buffer: Arc<SegmentBuffer>,
        telemetry: Arc<TelemetryStore>,
        encoder: Arc<dyn Encoder>,
        buffer_dir: &Path,
    ) -> Self {
        Self {
            buffer,
            telemetry,
            encoder,
            buffer_dir: buffer_dir.to_path_buf(),
            sessions: Mutex::new(SessionTable::default()),
            session_done: Condvar::new(),
            next_sequence: AtomicU64::new(0),
            next_session: AtomicU64::new(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn buffer(&self) -> &Arc<SegmentBuffer> {
        &self.buffer
    }

    /// Records one segment, appends it to the buffer and hands it to collecting sessions.
    pub fn run_cycle(&self, shutdown: &Shutdown) -> Result<Segment, DaclError> {
        let timestamp = self.telemetry.snapshot().timestamp();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let path = self
            .buffer_dir
            .join(segment_file_name(&timestamp, sequence));
        let partial = path.with_extension("mp4.part");

        if let Err(e) =
            self.encoder
                .encode(&partial, self.buffer.segment_duration(), shutdown)
        {
            discard_file(&partial);
            return Err(e);
        }
        fs::rename(&partial, &path).map_err(|e| DaclError::FileOperationError {
            operation: "rename".to_string(),
            path: partial.clone(),
            source: e,
        })?;

        let segment = Segment::new(path, sequence);
        self.buffer.append(segment.clone());
        self.feed_sessions(&segment);
        Ok(segment)
    }

    fn feed_sessions(&self, segment: &Segment) {
        let targets: Vec<(u64, PathBuf)> = self
            .table()
            .collecting
            .iter()
            .map(|(id, session)| (*id, session.target.clone()))
            .collect();
        if targets.is_empty() {
            return;
        }

        // copies run without the lock held
        let results: Vec<(u64, PathBuf, bool)> = targets
            .into_iter()
            .map(|(id, target)| match fs::copy(&segment.path, &target) {
                Ok(_) => (id, target, true),
                Err(e) => {
                    warn!(
                        "Unable to copy {} into session {}: {}",
                        segment.path.display(),
                        id,
                        e
                    );
                    (id, target, false)
                }
            })
            .collect();

        let mut table = self.table();
        let mut finished = false;
        for (id, target, copied) in results {
            let Some(session) = table.collecting.get_mut(&id) else {
                // abandoned while we were copying
                discard_file(&target);
                continue;
            };
            if copied {
                session.collected = Some(target);
                session.copied += 1;
            }
            session.remaining = session.remaining.saturating_sub(1);
            debug!(
                "Session {} took segment {}, {} remaining",
                id, segment.sequence, session.remaining
            );
            if session.remaining == 0
                && let Some(session) = table.collecting.remove(&id)
            {
                info!("Post-trigger session {} ({}) complete", id, session.label);
                table.completed.insert(id, session.finish(id));
                finished = true;
            }
        }
        if finished {
            self.session_done.notify_all();
        }
    }

    /// Records segments until shutdown. Failed cycles are logged and skipped.
    pub fn run(&self, shutdown: &Shutdown) {
        info!(
            "Recorder started, {:?} segments into {}",
            self.buffer.segment_duration(),
            self.buffer_dir.display()
        );
        while !shutdown.is_triggered() {
            match self.run_cycle(shutdown) {
                Ok(segment) => debug!("Recorded {}", segment.path.display()),
                Err(DaclError::ShutdownRequested) => break,
                Err(e) => {
                    error!("Recording cycle failed: {}", e);
                    shutdown.sleep(FAILED_CYCLE_BACKOFF);
                }
            }
        }
        self.stop_sessions();
        info!("Recorder stopped");
    }

    fn stop_sessions(&self) {
        self.table().stopped = true;
        self.session_done.notify_all();
    }

    /// Starts collecting the next `duration_forward` of segments, at least one.
    pub fn begin_post_trigger(&self, duration_forward: Duration, label: &str) -> SessionHandle {
        let segment_ms = self.buffer.segment_duration().as_millis().max(1);
        let remaining = ((duration_forward.as_millis() / segment_ms) as usize).max(1);
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let target = self
            .buffer_dir
            .join(format!("posttrigger_{id:04}_{}.mp4", sanitize_label(label)));

        info!(
            "Post-trigger session {} ({}) collecting {} segments",
            id, label, remaining
        );
        self.table().collecting.insert(
            id,
            PostTriggerSession {
                label: label.to_string(),
                remaining,
                target,
                collected: None,
                copied: 0,
            },
        );
        SessionHandle(id)
    }

    /// Pins the last `duration_back` of segments and opens a post-trigger session for one
    /// event.
    ///
    /// The session is registered before the lease is taken, so every segment recorded
    /// around the trigger lands in at least one of the two windows.
    pub fn open_event(
        &self,
        duration_back: Duration,
        duration_forward: Duration,
        label: &str,
    ) -> (SegmentLease<'_>, SessionHandle) {
        let session = self.begin_post_trigger(duration_forward, label);
        let lease = self.buffer.lease(duration_back);
        (lease, session)
    }

    /// Blocks until the session completes or `timeout` elapses.
    ///
    /// On timeout, or when the recorder stops first, the session is abandoned and the
    /// error carries whatever had been collected.
    pub fn wait_for_completion(
        &self,
        handle: SessionHandle,
        timeout: Duration,
    ) -> Result<CompletedSession, DaclError> {
        let id = handle.id();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut table = self.table();
        loop {
            if let Some(done) = table.completed.remove(&id) {
                return Ok(done);
            }
            if !table.collecting.contains_key(&id) {
                return Err(DaclError::UnknownSession { session: id });
            }

            let now = Instant::now();
            if now >= deadline || table.stopped {
                let collected = table
                    .collecting
                    .remove(&id)
                    .and_then(|session| session.collected);
                warn!("Post-trigger session {} abandoned", id);
                return Err(DaclError::SessionTimeout {
                    session: id,
                    waited_ms: started.elapsed().as_millis(),
                    collected,
                });
            }
            table = match self.session_done.wait_timeout(table, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Number of sessions still collecting.
    pub fn active_sessions(&self) -> usize {
        self.table().collecting.len()
    }

    pub fn buffered_segments(&self, duration_back: Duration) -> Vec<Segment> {
        self.buffer.window(duration_back)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    /// Writes the requested path without recording anything.
    struct StubEncoder {
        fail: bool,
    }

    impl Encoder for StubEncoder {
        fn encode(
            &self,
            output: &Path,
            duration: Duration,
            _shutdown: &Shutdown,
        ) -> Result<(), DaclError> {
            if self.fail {
                return Err(DaclError::EncoderFailed {
                    program: "stub".to_string(),
                    status: "exit status: 1".to_string(),
                });
            }
            fs::write(output, format!("{}ms", duration.as_millis())).unwrap();
            Ok(())
        }
    }

    /// Writes the path it was asked for, so copies can be traced back to their segment.
    struct PathEncoder;

    impl Encoder for PathEncoder {
        fn encode(&self, output: &Path, _: Duration, shutdown: &Shutdown) -> Result<(), DaclError> {
            if shutdown.sleep(Duration::from_millis(1)) {
                return Err(DaclError::ShutdownRequested);
            }
            fs::write(output, output.to_string_lossy().as_bytes()).unwrap();
            Ok(())
        }
    }

    fn sequence_written_to(path: &Path) -> u64 {
        let content = fs::read_to_string(path).unwrap();
        let name = content.trim_end_matches(".mp4.part");
        name.rsplit('_').next().unwrap().parse().unwrap()
    }

    fn recorder(dir: &TempDir, capacity: usize, fail: bool) -> Recorder {
        Recorder::new(
            Arc::new(SegmentBuffer::new(capacity, Duration::from_secs(60), None)),
            Arc::new(TelemetryStore::new()),
            Arc::new(StubEncoder { fail }),
            dir.path(),
        )
    }

    #[test]
    fn test_cycle_renames_and_appends() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, false);

        let segment = recorder.run_cycle(&Shutdown::new()).unwrap();
        let name = segment.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("video_"));
        assert!(name.ends_with("_000000.mp4"));
        assert!(segment.path.exists());
        assert!(!segment.path.with_extension("mp4.part").exists());
        assert_eq!(recorder.buffered_segments(Duration::from_secs(600)).len(), 1);
    }

    #[test]
    fn test_failed_cycle_is_not_appended() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, true);

        assert!(recorder.run_cycle(&Shutdown::new()).is_err());
        assert!(recorder.buffer().is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_session_collects_requested_segments() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, false);
        let shutdown = Shutdown::new();

        let handle = recorder.begin_post_trigger(Duration::from_secs(120), "Engine Fault");
        recorder.run_cycle(&shutdown).unwrap();
        assert_eq!(recorder.active_sessions(), 1);
        recorder.run_cycle(&shutdown).unwrap();
        assert_eq!(recorder.active_sessions(), 0);

        let done = recorder
            .wait_for_completion(handle, Duration::from_secs(1))
            .unwrap();
        assert_eq!(done.segments_copied, 2);
        assert_eq!(done.label, "Engine Fault");
        let collected = done.collected.unwrap();
        assert!(collected.exists());
        assert!(
            collected
                .file_name()
                .unwrap()
                .to_string_lossy()
                .contains("Engine_Fault")
        );
    }

    #[test]
    fn test_short_window_waits_for_one_segment() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, false);

        let handle = recorder.begin_post_trigger(Duration::ZERO, "x");
        recorder.run_cycle(&Shutdown::new()).unwrap();
        let done = recorder
            .wait_for_completion(handle, Duration::from_secs(1))
            .unwrap();
        assert_eq!(done.segments_copied, 1);
    }

    #[test]
    fn test_overlapping_sessions_are_independent() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, false);
        let shutdown = Shutdown::new();

        let first = recorder.begin_post_trigger(Duration::from_secs(120), "A");
        recorder.run_cycle(&shutdown).unwrap();
        let second = recorder.begin_post_trigger(Duration::from_secs(60), "B");
        recorder.run_cycle(&shutdown).unwrap();

        let a = recorder.wait_for_completion(first, Duration::from_secs(1)).unwrap();
        let b = recorder.wait_for_completion(second, Duration::from_secs(1)).unwrap();
        assert_ne!(a.collected, b.collected);
        assert_eq!(a.segments_copied, 2);
        assert_eq!(b.segments_copied, 1);
    }

    #[test]
    fn test_wait_times_out_with_partial_collection() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, false);

        let handle = recorder.begin_post_trigger(Duration::from_secs(300), "slow");
        recorder.run_cycle(&Shutdown::new()).unwrap();
        let err = recorder
            .wait_for_completion(handle, Duration::from_millis(50))
            .unwrap_err();
        match err {
            DaclError::SessionTimeout { collected, .. } => assert!(collected.is_some()),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(recorder.active_sessions(), 0);
        assert!(matches!(
            recorder.wait_for_completion(handle, Duration::from_millis(1)),
            Err(DaclError::UnknownSession { .. })
        ));
    }

    #[test]
    fn test_waiter_wakes_on_completion() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(recorder(&dir, 5, false));
        let handle = recorder.begin_post_trigger(Duration::from_secs(60), "wake");

        let waiter = recorder.clone();
        let join = thread::spawn(move || waiter.wait_for_completion(handle, Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(20));
        recorder.run_cycle(&Shutdown::new()).unwrap();

        assert!(join.join().unwrap().is_ok());
    }

    #[test]
    fn test_stopped_recorder_releases_waiters() {
        let dir = TempDir::new().unwrap();
        let recorder = recorder(&dir, 5, true);
        let shutdown = Shutdown::new();
        let handle = recorder.begin_post_trigger(Duration::from_secs(60), "stop");

        shutdown.trigger();
        recorder.run(&shutdown);
        let started = Instant::now();
        assert!(matches!(
            recorder.wait_for_completion(handle, Duration::from_secs(30)),
            Err(DaclError::SessionTimeout { collected: None, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_open_event_leaves_no_gap_between_windows() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(Recorder::new(
            Arc::new(SegmentBuffer::new(50, Duration::from_secs(60), None)),
            Arc::new(TelemetryStore::new()),
            Arc::new(PathEncoder),
            dir.path(),
        ));
        let shutdown = Shutdown::new();
        let cycles = {
            let recorder = recorder.clone();
            let shutdown = shutdown.clone();
            thread::spawn(move || recorder.run(&shutdown))
        };
        while recorder.buffer().len() < 2 {
            thread::sleep(Duration::from_millis(1));
        }

        for _ in 0..20 {
            let (lease, handle) =
                recorder.open_event(Duration::from_secs(60), Duration::ZERO, "gap");
            let last_pre = lease.last().unwrap().sequence;
            drop(lease);
            let done = recorder
                .wait_for_completion(handle, Duration::from_secs(5))
                .unwrap();
            let first_post = sequence_written_to(&done.collected.unwrap());
            assert!(
                first_post <= last_pre + 1,
                "pre window ended at {last_pre} but post window started at {first_post}"
            );
        }

        shutdown.trigger();
        cycles.join().unwrap();
    }
}
