use std::{
    fs,
    path::Path,
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use log::{debug, warn};

use crate::{errors::DaclError, shutdown::Shutdown};

const POLL_INTERVAL_MS: u64 = 50;
/// Extra time an encoder gets on top of the requested duration before it counts as stalled.
pub const ENCODER_GRACE: Duration = Duration::from_secs(10);

/// Produces one video segment of a fixed duration.
pub trait Encoder: Send + Sync {
    /// Records `duration` of video into `output`. The file must exist and be non-empty
    /// when this returns `Ok`.
    fn encode(&self, output: &Path, duration: Duration, shutdown: &Shutdown)
    -> Result<(), DaclError>;
}

/// Argument list for the camera encoder.
#[derive(Debug, Clone)]
pub struct EncoderCommandBuilder {
    program: String,
    width: u32,
    height: u32,
    framerate: u32,
    codec: String,
    container: String,
}

impl EncoderCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            width: 1456,
            height: 1088,
            framerate: 15,
            codec: "libav".to_string(),
            container: "mp4".to_string(),
        }
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_framerate(mut self, framerate: u32) -> Self {
        self.framerate = framerate;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn build(&self, output: &Path, duration: Duration) -> Vec<String> {
        vec![
            "--nopreview".to_string(),
            "-t".to_string(),
            duration.as_millis().to_string(),
            "-o".to_string(),
            output.to_string_lossy().into_owned(),
            "--codec".to_string(),
            self.codec.clone(),
            "--libav-format".to_string(),
            self.container.clone(),
            "--width".to_string(),
            self.width.to_string(),
            "--height".to_string(),
            self.height.to_string(),
            "--framerate".to_string(),
            self.framerate.to_string(),
        ]
    }
}

/// Runs an external program, killing it on shutdown or once `limit` has elapsed.
pub(crate) fn run_bounded(
    program: &str,
    args: &[String],
    limit: Duration,
    shutdown: &Shutdown,
) -> Result<(), DaclError> {
    debug!("Running {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| DaclError::EncoderSpawnError {
            program: program.to_string(),
            source: e,
        })?;

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) if status.success() => return Ok(()),
            Ok(Some(status)) => {
                return Err(DaclError::EncoderFailed {
                    program: program.to_string(),
                    status: status.to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => warn!("Unable to poll {}: {}", program, e),
        }

        let stop = shutdown.sleep(Duration::from_millis(POLL_INTERVAL_MS));
        let stalled = started.elapsed() > limit;
        if stop || stalled {
            if let Err(e) = child.kill() {
                warn!("Unable to kill {}: {}", program, e);
            }
            let _ = child.wait();
            return Err(if stop {
                DaclError::ShutdownRequested
            } else {
                DaclError::EncoderStalled {
                    program: program.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                }
            });
        }
    }
}

/// Verifies an external program left a non-empty file behind.
pub(crate) fn check_output(path: &Path) -> Result<(), DaclError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(DaclError::EncoderOutputMissing {
            path: path.to_path_buf(),
        }),
    }
}

/// Encoder backed by an external capture process such as `libcamera-vid`.
#[derive(Debug, Clone)]
pub struct CommandEncoder {
    builder: EncoderCommandBuilder,
    grace: Duration,
}

impl CommandEncoder {
    pub fn new(builder: EncoderCommandBuilder) -> Self {
        Self {
            builder,
            grace: ENCODER_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl Encoder for CommandEncoder {
    fn encode(
        &self,
        output: &Path,
        duration: Duration,
        shutdown: &Shutdown,
    ) -> Result<(), DaclError> {
        let args = self.builder.build(output, duration);
        run_bounded(self.builder.program(), &args, duration + self.grace, shutdown)?;
        check_output(output)
    }
}
