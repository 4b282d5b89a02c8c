// Error types for dacl

use snafu::Snafu;
use std::{io, path::PathBuf};

/// Coarse error classes used to decide how far a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad configuration, fatal at startup
    Config,
    /// CAN socket or GPIO could not be opened, fatal for that subsystem only
    Device,
    /// A single frame could not be decoded, the frame is skipped
    Decode,
    /// A single segment could not be encoded, the cycle is skipped
    Encode,
    /// Copy or delete failure, archival continues best-effort
    Filesystem,
    /// A post-trigger session did not complete in time
    Timeout,
    /// Cooperative shutdown interrupted the operation
    Shutdown,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DaclError {
    // Config management errors
    #[snafu(display("Invalid value {value:?} for config key {key}: {reason}"))]
    InvalidConfigValue {
        key: String,
        value: String,
        reason: String,
    },
    #[snafu(display("Error reading config file {}", path.display()))]
    ConfigIOError { path: PathBuf, source: io::Error },
    #[snafu(display("Error serializing config"))]
    ConfigSerializeError { source: serde_json::Error },

    // Device errors
    #[snafu(display("Unable to open CAN interface {iface}"))]
    CanSocketError { iface: String, source: io::Error },
    #[snafu(display("CAN bus is not supported on this platform"))]
    CanUnsupported,
    #[snafu(display("Unable to read GPIO value from {}", path.display()))]
    GpioError { path: PathBuf, source: io::Error },

    // Decode errors
    #[snafu(display("Invalid signal layout: {reason}"))]
    InvalidSignal { reason: String },
    #[snafu(display("Malformed frame 0x{id:X}: {reason}"))]
    MalformedFrame { id: u32, reason: String },
    #[snafu(display("Error receiving CAN frame"))]
    CanReadError { source: io::Error },

    // Encode errors
    #[snafu(display("Unable to start encoder {program}"))]
    EncoderSpawnError { program: String, source: io::Error },
    #[snafu(display("Encoder {program} exited with {status}"))]
    EncoderFailed { program: String, status: String },
    #[snafu(display("Encoder {program} did not finish within {waited_ms}ms"))]
    EncoderStalled { program: String, waited_ms: u128 },
    #[snafu(display("Encoder reported success but {} is missing or empty", path.display()))]
    EncoderOutputMissing { path: PathBuf },

    // Filesystem errors
    #[snafu(display("File operation {operation} failed on {}", path.display()))]
    FileOperationError {
        operation: String,
        path: PathBuf,
        source: io::Error,
    },

    // Session errors
    #[snafu(display("Post-trigger session {session} did not complete within {waited_ms}ms"))]
    SessionTimeout {
        session: u64,
        waited_ms: u128,
        collected: Option<PathBuf>,
    },
    #[snafu(display("Unknown post-trigger session {session}"))]
    UnknownSession { session: u64 },

    #[snafu(display("Shutdown requested"))]
    ShutdownRequested,
}

impl DaclError {
    pub fn class(&self) -> ErrorClass {
        match self {
            DaclError::InvalidConfigValue { .. }
            | DaclError::ConfigIOError { .. }
            | DaclError::ConfigSerializeError { .. } => ErrorClass::Config,
            DaclError::CanSocketError { .. }
            | DaclError::CanUnsupported
            | DaclError::GpioError { .. } => ErrorClass::Device,
            DaclError::InvalidSignal { .. }
            | DaclError::MalformedFrame { .. }
            | DaclError::CanReadError { .. } => ErrorClass::Decode,
            DaclError::EncoderSpawnError { .. }
            | DaclError::EncoderFailed { .. }
            | DaclError::EncoderStalled { .. }
            | DaclError::EncoderOutputMissing { .. } => ErrorClass::Encode,
            DaclError::FileOperationError { .. } => ErrorClass::Filesystem,
            DaclError::SessionTimeout { .. } | DaclError::UnknownSession { .. } => {
                ErrorClass::Timeout
            }
            DaclError::ShutdownRequested => ErrorClass::Shutdown,
        }
    }

    /// Fatal errors stop the subsystem that raised them instead of skipping one unit of work.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Config | ErrorClass::Device)
    }
}
