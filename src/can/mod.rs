pub mod listener;
pub mod signal;
pub mod warnings;

use log::debug;

use crate::{
    errors::DaclError,
    telemetry::{TelemetryField, TelemetryStore},
};
use signal::{SignalSpec, extract_signal};

pub use listener::{CanListener, FrameSource, ReplayFrameSource};
#[cfg(target_os = "linux")]
pub use listener::SocketCanSource;
pub use warnings::{WarningTable, parse_can_warnings};

/// Vehicle speed, 0.01 km/h per bit.
pub const SPEED_FRAME_ID: u32 = 0x0FD;
/// Trip counter, 0.1 km per bit.
pub const TRIP_FRAME_ID: u32 = 0x6B4;
/// Odometer, 1 km per bit.
pub const ODOMETER_FRAME_ID: u32 = 0x6B7;
/// Instrument cluster date and time.
pub const CLOCK_FRAME_ID: u32 = 0x6B6;

/// A classic CAN frame with its payload padded to 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanFrame {
    pub id: u32,
    pub data: [u8; 8],
    /// Number of payload bytes actually carried by the frame
    pub len: u8,
}

impl CanFrame {
    /// Builds a frame from a raw payload, truncating anything past 8 bytes.
    pub fn new(id: u32, payload: &[u8]) -> Self {
        let len = payload.len().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&payload[..len]);
        Self {
            id,
            data,
            len: len as u8,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

/// One telemetry field carried by a well-known frame.
#[derive(Debug, Clone, Copy)]
pub struct TelemetrySignal {
    pub frame_id: u32,
    pub field: TelemetryField,
    pub spec: SignalSpec,
}

/// Frame layouts of the telemetry the recorder tags events with.
pub const TELEMETRY_SIGNALS: [TelemetrySignal; 9] = [
    TelemetrySignal {
        frame_id: SPEED_FRAME_ID,
        field: TelemetryField::SpeedKph,
        spec: SignalSpec::little_endian(32, 16, 0.01, 0.),
    },
    TelemetrySignal {
        frame_id: TRIP_FRAME_ID,
        field: TelemetryField::TripMileageKm,
        spec: SignalSpec::little_endian(0, 16, 0.1, 0.),
    },
    TelemetrySignal {
        frame_id: ODOMETER_FRAME_ID,
        field: TelemetryField::TotalMileageKm,
        spec: SignalSpec::little_endian(0, 20, 1., 0.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Year,
        spec: SignalSpec::little_endian(0, 7, 1., 2000.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Month,
        spec: SignalSpec::little_endian(8, 4, 1., 0.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Day,
        spec: SignalSpec::little_endian(16, 5, 1., 0.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Hour,
        spec: SignalSpec::little_endian(24, 5, 1., 0.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Minute,
        spec: SignalSpec::little_endian(32, 6, 1., 0.),
    },
    TelemetrySignal {
        frame_id: CLOCK_FRAME_ID,
        field: TelemetryField::Second,
        spec: SignalSpec::little_endian(40, 6, 1., 0.),
    },
];

/// Decodes every telemetry signal carried by `frame` into `store`.
///
/// Returns the number of fields updated. Frames with unknown IDs update nothing. A frame
/// too short for one of its signals is rejected as a whole so a truncated clock frame
/// never leaves the store with a half-updated date.
pub fn decode_telemetry(frame: &CanFrame, store: &TelemetryStore) -> Result<usize, DaclError> {
    let signals: Vec<&TelemetrySignal> = TELEMETRY_SIGNALS
        .iter()
        .filter(|signal| signal.frame_id == frame.id)
        .collect();

    if let Some(short) = signals
        .iter()
        .find(|signal| signal.spec.required_len() > frame.len as usize)
    {
        return Err(DaclError::MalformedFrame {
            id: frame.id,
            reason: format!(
                "dlc {} too short for {:?}, need {}",
                frame.len,
                short.field,
                short.spec.required_len()
            ),
        });
    }

    let mut decoded = Vec::with_capacity(signals.len());
    for signal in &signals {
        decoded.push((signal.field, extract_signal(&frame.data, &signal.spec)?));
    }
    for (field, value) in &decoded {
        debug!("Frame 0x{:X}: {:?} = {}", frame.id, field, value);
        store.update(*field, *value);
    }
    Ok(decoded.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_layouts_are_valid() {
        for signal in TELEMETRY_SIGNALS.iter() {
            signal.spec.validate().unwrap();
        }
    }

    #[test]
    fn test_decode_speed_frame() {
        let store = TelemetryStore::new();
        // 0x2134 = 8500 raw -> 85 km/h
        let frame = CanFrame::new(SPEED_FRAME_ID, &[0, 0, 0, 0, 0x34, 0x21, 0, 0]);
        assert_eq!(decode_telemetry(&frame, &store).unwrap(), 1);
        assert_eq!(store.get(TelemetryField::SpeedKph), 85);
    }

    #[test]
    fn test_decode_clock_frame() {
        let store = TelemetryStore::new();
        let frame = CanFrame::new(CLOCK_FRAME_ID, &[24, 3, 9, 14, 5, 7]);
        assert_eq!(decode_telemetry(&frame, &store).unwrap(), 6);
        assert_eq!(store.snapshot().timestamp(), "20240309_140507");
    }

    #[test]
    fn test_decode_mileage_frames() {
        let store = TelemetryStore::new();
        decode_telemetry(&CanFrame::new(ODOMETER_FRAME_ID, &[0x40, 0xE2, 0x01]), &store).unwrap();
        // 1234 raw -> 123.4 km
        decode_telemetry(&CanFrame::new(TRIP_FRAME_ID, &[0xD2, 0x04]), &store).unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.total_mileage_km, 123_456);
        assert_eq!(snapshot.trip_mileage_km, 123);
    }

    #[test]
    fn test_unknown_frame_is_ignored() {
        let store = TelemetryStore::new();
        let frame = CanFrame::new(0x123, &[0xFF; 8]);
        assert_eq!(decode_telemetry(&frame, &store).unwrap(), 0);
        assert_eq!(store.snapshot(), crate::telemetry::TelemetrySnapshot::default());
    }

    #[test]
    fn test_short_frame_is_rejected_without_partial_update() {
        let store = TelemetryStore::new();
        let frame = CanFrame::new(CLOCK_FRAME_ID, &[24, 3, 9]);
        let err = decode_telemetry(&frame, &store).unwrap_err();
        assert!(matches!(err, DaclError::MalformedFrame { id: CLOCK_FRAME_ID, .. }));
        assert_eq!(store.get(TelemetryField::Year), 0);
    }

    #[test]
    fn test_frame_payload_is_truncated_to_eight_bytes() {
        let frame = CanFrame::new(0x1, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(frame.len, 8);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
