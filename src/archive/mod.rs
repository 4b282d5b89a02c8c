pub mod audit;
pub mod overlay;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    buffer::discard_file,
    errors::DaclError,
    recorder::encoder::{check_output, run_bounded},
    shutdown::Shutdown,
};
pub use audit::{AuditLog, AuditRecord, EventStatus};
pub use overlay::{OverlayRenderer, SvgOverlayRenderer};

/// Longest a single burn-in may run before it is killed.
const BURN_IN_LIMIT: Duration = Duration::from_secs(300);
/// Disambiguated names tried before an archive copy gives up.
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Makes a warning label safe to embed in a file name.
pub fn sanitize_label(label: &str) -> String {
    let sanitized: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "event".to_string()
    } else {
        sanitized
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveSuffix {
    PreTrigger,
    PostTrigger,
}

impl ArchiveSuffix {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveSuffix::PreTrigger => "pretrigger",
            ArchiveSuffix::PostTrigger => "posttrigger",
        }
    }
}

/// Arguments that burn `overlay` into `input`, writing `output`.
pub fn burn_in_args(input: &Path, overlay: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-i".to_string(),
        overlay.to_string_lossy().into_owned(),
        "-filter_complex".to_string(),
        "overlay=0:0".to_string(),
        "-codec:a".to_string(),
        "copy".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Copies segments into the event directory, optionally burning in the overlay.
#[derive(Debug, Clone)]
pub struct FileArchiver {
    event_dir: PathBuf,
    burn_in_program: Option<String>,
    shutdown: Shutdown,
}

impl FileArchiver {
    pub fn new(event_dir: &Path, shutdown: Shutdown) -> Self {
        Self {
            event_dir: event_dir.to_path_buf(),
            burn_in_program: None,
            shutdown,
        }
    }

    /// Burns overlays in with `program` (ffmpeg compatible) after copying.
    pub fn with_burn_in(mut self, program: &str) -> Self {
        self.burn_in_program = Some(program.to_string());
        self
    }

    pub fn event_dir(&self) -> &Path {
        &self.event_dir
    }

    pub fn archive_name(timestamp: &str, label: &str, suffix: ArchiveSuffix, index: usize) -> String {
        format!(
            "{}_{}_{}_{}.mp4",
            timestamp,
            sanitize_label(label),
            suffix.as_str(),
            index
        )
    }

    /// Copies every segment, best effort. Returns the archived files; failures are logged
    /// and skipped.
    pub fn archive(
        &self,
        segments: &[PathBuf],
        label: &str,
        timestamp: &str,
        overlay: Option<&Path>,
        suffix: ArchiveSuffix,
    ) -> Vec<PathBuf> {
        if let Err(e) = fs::create_dir_all(&self.event_dir) {
            warn!(
                "Unable to create event directory {}: {}",
                self.event_dir.display(),
                e
            );
            return Vec::new();
        }

        let mut archived = Vec::with_capacity(segments.len());
        for (index, source) in segments.iter().enumerate() {
            let name = Self::archive_name(timestamp, label, suffix, index);
            match self.copy_unique(source, &name) {
                Ok(dest) => {
                    debug!("Archived {} as {}", source.display(), dest.display());
                    if let (Some(program), Some(overlay)) = (&self.burn_in_program, overlay)
                        && let Err(e) = self.burn_in(program, &dest, overlay)
                    {
                        warn!(
                            "Overlay burn-in failed for {}, keeping plain copy: {}",
                            dest.display(),
                            e
                        );
                    }
                    archived.push(dest);
                }
                Err(e) => warn!("Unable to archive {}: {}", source.display(), e),
            }
        }
        info!(
            "Archived {}/{} {} segments for {}",
            archived.len(),
            segments.len(),
            suffix.as_str(),
            label
        );
        archived
    }

    /// Copies `source` to `name` in the event directory. An existing archive is never
    /// overwritten: a taken name gets a `_1`, `_2`, ... disambiguator instead.
    fn copy_unique(&self, source: &Path, name: &str) -> io::Result<PathBuf> {
        let mut input = File::open(source)?;
        let stem = name.strip_suffix(".mp4").unwrap_or(name);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let dest = match attempt {
                0 => self.event_dir.join(name),
                n => self.event_dir.join(format!("{stem}_{n}.mp4")),
            };
            let mut output = match OpenOptions::new().write(true).create_new(true).open(&dest) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            };
            if attempt > 0 {
                warn!("{} already archived, writing {} instead", name, dest.display());
            }
            if let Err(e) = io::copy(&mut input, &mut output) {
                drop(output);
                discard_file(&dest);
                return Err(e);
            }
            return Ok(dest);
        }
        Err(io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free archive name for {name}"),
        ))
    }

    fn burn_in(&self, program: &str, dest: &Path, overlay: &Path) -> Result<(), DaclError> {
        let tmp = dest.with_extension("overlay.mp4");
        let result = run_bounded(
            program,
            &burn_in_args(dest, overlay, &tmp),
            BURN_IN_LIMIT,
            &self.shutdown,
        )
        .and_then(|_| check_output(&tmp))
        .and_then(|_| {
            fs::rename(&tmp, dest).map_err(|e| DaclError::FileOperationError {
                operation: "rename".to_string(),
                path: tmp.clone(),
                source: e,
            })
        });
        if result.is_err() {
            discard_file(&tmp);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("Engine Fault"), "Engine_Fault");
        assert_eq!(sanitize_label("Manual Trigger"), "Manual_Trigger");
        assert_eq!(sanitize_label("../etc/passwd"), "___etc_passwd");
        assert_eq!(sanitize_label("  "), "event");
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(
            FileArchiver::archive_name("20240309_140507", "Brake Warn", ArchiveSuffix::PostTrigger, 0),
            "20240309_140507_Brake_Warn_posttrigger_0.mp4"
        );
    }

    #[test]
    fn test_burn_in_args() {
        let args = burn_in_args(
            Path::new("ev/a.mp4"),
            Path::new("/tmp/o.svg"),
            Path::new("ev/a.overlay.mp4"),
        );
        assert_eq!(args[0], "-y");
        assert_eq!(args[2], "ev/a.mp4");
        assert_eq!(args[4], "/tmp/o.svg");
        assert_eq!(args[6], "overlay=0:0");
        assert_eq!(args.last().unwrap(), "ev/a.overlay.mp4");
    }

    #[test]
    fn test_archive_copies_and_skips_missing() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("video_1.mp4");
        let missing = dir.path().join("video_2.mp4");
        let third = dir.path().join("video_3.mp4");
        fs::write(&first, b"one").unwrap();
        fs::write(&third, b"three").unwrap();

        let archiver = FileArchiver::new(&dir.path().join("events"), Shutdown::new());
        let archived = archiver.archive(
            &[first, missing, third],
            "EngineFault",
            "20240309_140507",
            None,
            ArchiveSuffix::PreTrigger,
        );

        assert_eq!(archived.len(), 2);
        assert!(archived[0].ends_with("20240309_140507_EngineFault_pretrigger_0.mp4"));
        assert!(archived[1].ends_with("20240309_140507_EngineFault_pretrigger_2.mp4"));
        assert_eq!(fs::read(&archived[1]).unwrap(), b"three");
    }

    #[test]
    fn test_failed_burn_in_keeps_plain_copy() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("video_1.mp4");
        let overlay = dir.path().join("overlay.svg");
        fs::write(&source, b"video").unwrap();
        fs::write(&overlay, b"<svg/>").unwrap();

        let archiver = FileArchiver::new(&dir.path().join("events"), Shutdown::new())
            .with_burn_in("dacl-no-such-ffmpeg");
        let archived = archiver.archive(
            &[source],
            "x",
            "t",
            Some(&overlay),
            ArchiveSuffix::PostTrigger,
        );

        assert_eq!(archived.len(), 1);
        assert_eq!(fs::read(&archived[0]).unwrap(), b"video");
        assert!(!archived[0].with_extension("overlay.mp4").exists());
    }

    #[test]
    fn test_archive_never_overwrites_earlier_event() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("video_1.mp4");
        let second = dir.path().join("video_2.mp4");
        fs::write(&first, b"first event").unwrap();
        fs::write(&second, b"second event").unwrap();

        // vehicle clock frozen, same label twice
        let archiver = FileArchiver::new(&dir.path().join("events"), Shutdown::new());
        let earlier = archiver.archive(
            &[first],
            "Manual Trigger",
            "20240309_140507",
            None,
            ArchiveSuffix::PreTrigger,
        );
        let later = archiver.archive(
            &[second],
            "Manual Trigger",
            "20240309_140507",
            None,
            ArchiveSuffix::PreTrigger,
        );

        assert!(earlier[0].ends_with("20240309_140507_Manual_Trigger_pretrigger_0.mp4"));
        assert!(later[0].ends_with("20240309_140507_Manual_Trigger_pretrigger_0_1.mp4"));
        assert_eq!(fs::read(&earlier[0]).unwrap(), b"first event");
        assert_eq!(fs::read(&later[0]).unwrap(), b"second event");
    }

    #[test]
    fn test_missing_source_leaves_no_empty_archive() {
        let dir = TempDir::new().unwrap();
        let archiver = FileArchiver::new(&dir.path().join("events"), Shutdown::new());
        let archived = archiver.archive(
            &[dir.path().join("gone.mp4")],
            "x",
            "t",
            None,
            ArchiveSuffix::PreTrigger,
        );

        assert!(archived.is_empty());
        assert_eq!(fs::read_dir(dir.path().join("events")).unwrap().count(), 0);
    }
}
