pub mod sources;

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    archive::{ArchiveSuffix, AuditLog, AuditRecord, EventStatus, FileArchiver, OverlayRenderer},
    buffer::discard_file,
    errors::DaclError,
    recorder::Recorder,
    shutdown::Shutdown,
    telemetry::{TelemetrySnapshot, TelemetryStore},
};
pub use sources::{
    ButtonInput, CanWarningDetector, ConsoleDetector, GpioDetector, SysfsButton,
};

/// Where a trigger came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerSource {
    #[serde(rename = "CAN")]
    CanWarning,
    #[serde(rename = "GPIO_BUTTON")]
    Gpio,
    #[serde(rename = "CONSOLE")]
    Console,
}

impl TriggerSource {
    /// Name used in the audit log.
    pub fn audit_name(&self) -> &'static str {
        match self {
            TriggerSource::CanWarning => "CAN",
            TriggerSource::Gpio => "GPIO_BUTTON",
            TriggerSource::Console => "CONSOLE",
        }
    }
}

/// A detected trigger together with the vehicle state at the moment it fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub source: TriggerSource,
    pub warning_label: String,
    pub telemetry: TelemetrySnapshot,
    pub timestamp: String,
}

/// One independently polled trigger input.
pub trait TriggerDetector: Send {
    fn source(&self) -> TriggerSource;

    /// Returns the event label when the trigger condition is met.
    fn poll(&mut self, shutdown: &Shutdown) -> Result<Option<String>, DaclError>;

    fn poll_interval(&self) -> Duration;

    /// Runs after an event was handled, before polling resumes.
    fn after_fire(&mut self, _shutdown: &Shutdown) {}
}

/// Video windows around a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerWindows {
    pub pre: Duration,
    pub post: Duration,
    /// Longest wait for the post-trigger session
    pub session_timeout: Duration,
}

/// Turns detected triggers into archived events.
pub struct TriggerCoordinator {
    recorder: Arc<Recorder>,
    telemetry: Arc<TelemetryStore>,
    overlay: Arc<dyn OverlayRenderer>,
    archiver: FileArchiver,
    audit: Arc<AuditLog>,
    windows: TriggerWindows,
}

impl TriggerCoordinator {
    pub fn new(
        recorder: Arc<Recorder>,
        telemetry: Arc<TelemetryStore>,
        overlay: Arc<dyn OverlayRenderer>,
        archiver: FileArchiver,
        audit: Arc<AuditLog>,
        windows: TriggerWindows,
    ) -> Self {
        Self {
            recorder,
            telemetry,
            overlay,
            archiver,
            audit,
            windows,
        }
    }

    /// Captures, archives and logs one event. Blocks until the post-trigger window has
    /// been recorded or the session timed out.
    pub fn handle_trigger(
        &self,
        source: TriggerSource,
        label: &str,
    ) -> Result<AuditRecord, DaclError> {
        let telemetry = self.telemetry.snapshot();
        let event = TriggerEvent {
            source,
            warning_label: label.to_string(),
            timestamp: telemetry.timestamp(),
            telemetry,
        };
        info!(
            "{} trigger {:?} at {} ({} km/h)",
            source.audit_name(),
            label,
            event.timestamp,
            telemetry.speed_kph
        );

        let (lease, session) =
            self.recorder
                .open_event(self.windows.pre, self.windows.post, label);

        let overlay = match self.overlay.render(&telemetry, label, &event.timestamp) {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Overlay rendering failed, archiving without it: {}", e);
                None
            }
        };

        let pre_files = self.archiver.archive(
            &lease.paths(),
            label,
            &event.timestamp,
            overlay.as_deref(),
            ArchiveSuffix::PreTrigger,
        );
        drop(lease);

        let (collected, mut status) = match self
            .recorder
            .wait_for_completion(session, self.windows.session_timeout)
        {
            Ok(done) => (done.collected, EventStatus::Complete),
            Err(DaclError::SessionTimeout {
                session, collected, ..
            }) => {
                warn!("Post-trigger session {} incomplete for {:?}", session, label);
                (collected, EventStatus::Incomplete)
            }
            Err(e) => {
                warn!("Post-trigger session lost for {:?}: {}", label, e);
                (None, EventStatus::Incomplete)
            }
        };

        let post_file = match &collected {
            Some(path) => {
                let archived = self.archiver.archive(
                    std::slice::from_ref(path),
                    label,
                    &event.timestamp,
                    overlay.as_deref(),
                    ArchiveSuffix::PostTrigger,
                );
                discard_file(path);
                archived.into_iter().next()
            }
            None => None,
        };
        if post_file.is_none() {
            status = EventStatus::Incomplete;
        }
        if let Some(overlay) = &overlay {
            discard_file(overlay);
        }

        let record = AuditRecord {
            timestamp: event.timestamp,
            source,
            warning_label: event.warning_label,
            speed_kph: telemetry.speed_kph,
            pre_files,
            post_file,
            status,
            telemetry,
        };
        self.audit.append(&record)?;
        info!(
            "Event {} {:?} archived ({})",
            record.timestamp,
            label,
            record.status.as_str()
        );
        Ok(record)
    }

    /// Polls one detector until shutdown, handling every event it reports.
    pub fn run_detector(&self, detector: &mut dyn TriggerDetector, shutdown: &Shutdown) {
        let source = detector.source();
        info!("{} trigger armed", source.audit_name());
        while !shutdown.is_triggered() {
            match detector.poll(shutdown) {
                Ok(Some(label)) => {
                    if let Err(e) = self.handle_trigger(source, &label) {
                        error!("Failed to record {} event: {}", source.audit_name(), e);
                    }
                    detector.after_fire(shutdown);
                }
                Ok(None) => {}
                Err(e) if e.is_fatal() => {
                    error!("{} trigger disabled: {}", source.audit_name(), e);
                    break;
                }
                Err(e) => warn!("{} trigger poll failed: {}", source.audit_name(), e),
            }
            if shutdown.sleep(detector.poll_interval()) {
                break;
            }
        }
        info!("{} trigger stopped", source.audit_name());
    }

    /// Starts one polling thread per detector.
    pub fn spawn(
        self: &Arc<Self>,
        detectors: Vec<Box<dyn TriggerDetector>>,
        shutdown: &Shutdown,
    ) -> Vec<JoinHandle<()>> {
        detectors
            .into_iter()
            .map(|mut detector| {
                let coordinator = Arc::clone(self);
                let shutdown = shutdown.clone();
                thread::spawn(move || coordinator.run_detector(detector.as_mut(), &shutdown))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        archive::SvgOverlayRenderer,
        buffer::SegmentBuffer,
        recorder::Encoder,
    };
    use std::{fs, path::Path};
    use tempfile::TempDir;

    struct StubEncoder;

    impl Encoder for StubEncoder {
        fn encode(&self, output: &Path, _: Duration, _: &Shutdown) -> Result<(), DaclError> {
            fs::write(output, b"segment").unwrap();
            Ok(())
        }
    }

    fn coordinator(dir: &TempDir, timeout: Duration) -> (Arc<TriggerCoordinator>, Arc<Recorder>) {
        let buffer_dir = dir.path().join("buffer");
        fs::create_dir_all(&buffer_dir).unwrap();
        let telemetry = Arc::new(TelemetryStore::new());
        let recorder = Arc::new(Recorder::new(
            Arc::new(SegmentBuffer::new(10, Duration::from_secs(60), None)),
            telemetry.clone(),
            Arc::new(StubEncoder),
            &buffer_dir,
        ));
        let coordinator = Arc::new(TriggerCoordinator::new(
            recorder.clone(),
            telemetry,
            Arc::new(SvgOverlayRenderer::new(dir.path(), 640, 480)),
            FileArchiver::new(&dir.path().join("events"), Shutdown::new()),
            Arc::new(AuditLog::new(&dir.path().join("logs").join("events.csv"))),
            TriggerWindows {
                pre: Duration::from_secs(120),
                post: Duration::from_secs(60),
                session_timeout: timeout,
            },
        ));
        (coordinator, recorder)
    }

    #[test]
    fn test_source_names() {
        assert_eq!(TriggerSource::CanWarning.audit_name(), "CAN");
        assert_eq!(
            serde_json::to_string(&TriggerSource::Gpio).unwrap(),
            "\"GPIO_BUTTON\""
        );
    }

    #[test]
    fn test_handle_trigger_archives_both_windows() {
        let dir = TempDir::new().unwrap();
        let (coordinator, recorder) = coordinator(&dir, Duration::from_secs(10));
        let shutdown = Shutdown::new();
        for _ in 0..3 {
            recorder.run_cycle(&shutdown).unwrap();
        }

        let feeder = recorder.clone();
        let feed = thread::spawn(move || {
            while feeder.active_sessions() == 0 {
                thread::sleep(Duration::from_millis(5));
            }
            feeder.run_cycle(&Shutdown::new()).unwrap();
        });
        let record = coordinator
            .handle_trigger(TriggerSource::CanWarning, "Engine Fault")
            .unwrap();
        feed.join().unwrap();

        assert_eq!(record.status, EventStatus::Complete);
        assert_eq!(record.pre_files.len(), 2);
        let post = record.post_file.unwrap();
        assert!(post.to_string_lossy().contains("Engine_Fault_posttrigger_0"));
        assert!(post.exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("buffer"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("posttrigger_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_timeout_is_logged_incomplete() {
        let dir = TempDir::new().unwrap();
        let (coordinator, recorder) = coordinator(&dir, Duration::from_millis(50));
        recorder.run_cycle(&Shutdown::new()).unwrap();

        let record = coordinator
            .handle_trigger(TriggerSource::Console, sources::CONSOLE_LABEL)
            .unwrap();
        assert_eq!(record.status, EventStatus::Incomplete);
        assert_eq!(record.pre_files.len(), 1);
        assert!(record.post_file.is_none());

        let csv = fs::read_to_string(dir.path().join("logs").join("events.csv")).unwrap();
        assert!(csv.lines().nth(1).unwrap().contains(",CONSOLE,Manual Terminal,0,"));
        assert!(csv.trim_end().ends_with(",incomplete"));
    }
}
