use std::{
    collections::VecDeque,
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
    sync::Arc,
    time::Duration,
};

use log::{debug, error, info, warn};

use super::{CanFrame, WarningTable, decode_telemetry};
use crate::{
    errors::DaclError,
    shutdown::Shutdown,
    telemetry::{TelemetryStore, WarningMailbox},
};

/// How long a single receive may block before the loop re-checks for shutdown.
pub const READ_TIMEOUT_MS: u64 = 200;
/// Back-off after a receive error so a flapping interface does not spin the CPU.
const READ_ERROR_BACKOFF_MS: u64 = 500;

/// Anything frames can be received from.
pub trait FrameSource {
    /// Opens the underlying device. Failure is fatal for the listener.
    fn open(&mut self) -> Result<(), DaclError>;

    /// Waits for the next frame. `Ok(None)` means the read timed out.
    fn next_frame(&mut self) -> Result<Option<CanFrame>, DaclError>;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<(), DaclError> {
        (**self).open()
    }

    fn next_frame(&mut self) -> Result<Option<CanFrame>, DaclError> {
        (**self).next_frame()
    }
}

/// Raw SocketCAN interface such as `can0` or `vcan0`.
#[cfg(target_os = "linux")]
pub struct SocketCanSource {
    iface: String,
    socket: Option<socketcan::CanSocket>,
}

#[cfg(target_os = "linux")]
impl SocketCanSource {
    pub fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            socket: None,
        }
    }
}

#[cfg(target_os = "linux")]
impl FrameSource for SocketCanSource {
    fn open(&mut self) -> Result<(), DaclError> {
        use socketcan::Socket;

        let socket = socketcan::CanSocket::open(&self.iface).map_err(|e| {
            DaclError::CanSocketError {
                iface: self.iface.clone(),
                source: e,
            }
        })?;
        socket
            .set_read_timeout(Duration::from_millis(READ_TIMEOUT_MS))
            .map_err(|e| DaclError::CanSocketError {
                iface: self.iface.clone(),
                source: e,
            })?;
        info!("Listening on CAN interface {}", self.iface);
        self.socket = Some(socket);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<CanFrame>, DaclError> {
        use socketcan::{EmbeddedFrame, Frame, Socket};
        use std::io::ErrorKind;

        let Some(socket) = self.socket.as_ref() else {
            return Err(DaclError::CanReadError {
                source: std::io::Error::new(ErrorKind::NotConnected, "socket not open"),
            });
        };
        match socket.read_frame() {
            Ok(frame) => Ok(Some(CanFrame::new(frame.raw_id(), frame.data()))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(DaclError::CanReadError { source: e }),
        }
    }
}

/// Opens the platform CAN bus for `iface`.
#[cfg(target_os = "linux")]
pub fn bus_source(iface: &str) -> Box<dyn FrameSource + Send> {
    Box::new(SocketCanSource::new(iface))
}

/// Opens the platform CAN bus for `iface`.
#[cfg(not(target_os = "linux"))]
pub fn bus_source(_iface: &str) -> Box<dyn FrameSource + Send> {
    Box::new(UnsupportedSource)
}

#[cfg(not(target_os = "linux"))]
struct UnsupportedSource;

#[cfg(not(target_os = "linux"))]
impl FrameSource for UnsupportedSource {
    fn open(&mut self) -> Result<(), DaclError> {
        Err(DaclError::CanUnsupported)
    }

    fn next_frame(&mut self) -> Result<Option<CanFrame>, DaclError> {
        Err(DaclError::CanUnsupported)
    }
}

/// Replays a fixed list of frames, for tests and for driving the recorder without a bus.
///
/// Once the frames are exhausted every read behaves like a timeout.
pub struct ReplayFrameSource {
    frames: VecDeque<CanFrame>,
    interval: Duration,
    idle: Duration,
}

impl ReplayFrameSource {
    pub fn from_frames(frames: Vec<CanFrame>) -> Self {
        Self {
            frames: frames.into(),
            interval: Duration::ZERO,
            idle: Duration::from_millis(10),
        }
    }

    /// Delay between replayed frames.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Loads a log written by `candump -l`.
    ///
    /// Each line looks like `(1700000000.123456) can0 0FD#0000000034210000`. Lines that do
    /// not parse are skipped with a warning.
    pub fn from_candump_file(path: &Path) -> Result<Self, DaclError> {
        let file = File::open(path).map_err(|e| DaclError::FileOperationError {
            operation: "open".to_string(),
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut frames = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| DaclError::FileOperationError {
                operation: "read".to_string(),
                path: path.to_path_buf(),
                source: e,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_candump_line(&line) {
                Some(frame) => frames.push(frame),
                None => warn!("Skipping line {} of {}: {:?}", number + 1, path.display(), line),
            }
        }
        debug!("Loaded {} frames from {}", frames.len(), path.display());
        Ok(Self::from_frames(frames))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for ReplayFrameSource {
    fn open(&mut self) -> Result<(), DaclError> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<CanFrame>, DaclError> {
        match self.frames.pop_front() {
            Some(frame) => {
                if !self.interval.is_zero() {
                    std::thread::sleep(self.interval);
                }
                Ok(Some(frame))
            }
            None => {
                std::thread::sleep(self.idle);
                Ok(None)
            }
        }
    }
}

fn parse_candump_line(line: &str) -> Option<CanFrame> {
    let frame = line.split_whitespace().last()?;
    let (id, data) = frame.split_once('#')?;
    let id = u32::from_str_radix(id, 16).ok()?;
    if data.len() % 2 != 0 || data.len() > 16 || !data.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let payload = data
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        })
        .collect::<Option<Vec<u8>>>()?;
    Some(CanFrame::new(id, &payload))
}

/// Counters kept by the listener loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListenerStats {
    pub frames: u64,
    pub warnings: u64,
    pub decode_errors: u64,
    pub read_errors: u64,
}

/// Feeds the telemetry store and the warning mailbox from a CAN bus.
pub struct CanListener {
    warnings: WarningTable,
    telemetry: Arc<TelemetryStore>,
    mailbox: Arc<WarningMailbox>,
}

impl CanListener {
    pub fn new(
        warnings: WarningTable,
        telemetry: Arc<TelemetryStore>,
        mailbox: Arc<WarningMailbox>,
    ) -> Self {
        Self {
            warnings,
            telemetry,
            mailbox,
        }
    }

    /// Handles a single received frame.
    pub fn handle_frame(&self, frame: &CanFrame, stats: &mut ListenerStats) {
        stats.frames += 1;

        if let Some(label) = self.warnings.get(&frame.id) {
            info!("CAN warning 0x{:X}: {}", frame.id, label);
            self.mailbox.post(label);
            stats.warnings += 1;
        }

        if let Err(e) = decode_telemetry(frame, &self.telemetry) {
            warn!("Skipping frame: {}", e);
            stats.decode_errors += 1;
        }
    }

    /// Receives frames until shutdown.
    ///
    /// Only a failure to open the source is returned; per-frame problems are logged and
    /// the loop carries on.
    pub fn run<S: FrameSource + ?Sized>(
        &self,
        source: &mut S,
        shutdown: &Shutdown,
    ) -> Result<ListenerStats, DaclError> {
        source.open()?;
        info!(
            "CAN listener started with {} warning IDs",
            self.warnings.len()
        );

        let mut stats = ListenerStats::default();
        while !shutdown.is_triggered() {
            match source.next_frame() {
                Ok(Some(frame)) => self.handle_frame(&frame, &mut stats),
                Ok(None) => {}
                Err(e) => {
                    error!("CAN receive failed: {}", e);
                    stats.read_errors += 1;
                    shutdown.sleep(Duration::from_millis(READ_ERROR_BACKOFF_MS));
                }
            }
        }

        info!(
            "CAN listener stopped after {} frames ({} warnings, {} decode errors)",
            stats.frames, stats.warnings, stats.decode_errors
        );
        Ok(stats)
    }
}
