pub(crate) mod mailbox;

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub use mailbox::WarningMailbox;

/// Format used for every timestamp that ends up in a file name or the audit log.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Vehicle values fed by the CAN listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryField {
    SpeedKph,
    TripMileageKm,
    TotalMileageKm,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}

impl TelemetryField {
    pub const ALL: [TelemetryField; 9] = [
        TelemetryField::SpeedKph,
        TelemetryField::TripMileageKm,
        TelemetryField::TotalMileageKm,
        TelemetryField::Year,
        TelemetryField::Month,
        TelemetryField::Day,
        TelemetryField::Hour,
        TelemetryField::Minute,
        TelemetryField::Second,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Point-in-time copy of the telemetry store, taken when a trigger fires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub speed_kph: i64,
    pub trip_mileage_km: i64,
    pub total_mileage_km: i64,
    pub year: i64,
    pub month: i64,
    pub day: i64,
    pub hour: i64,
    pub minute: i64,
    pub second: i64,
}

impl TelemetrySnapshot {
    /// Date and time reported by the vehicle, if the clock fields form a valid instant.
    pub fn vehicle_clock(&self) -> Option<NaiveDateTime> {
        let year = i32::try_from(self.year).ok()?;
        if year <= 0 {
            return None;
        }
        NaiveDate::from_ymd_opt(
            year,
            u32::try_from(self.month).ok()?,
            u32::try_from(self.day).ok()?,
        )?
        .and_hms_opt(
            u32::try_from(self.hour).ok()?,
            u32::try_from(self.minute).ok()?,
            u32::try_from(self.second).ok()?,
        )
    }

    /// `YYYYMMDD_HHMMSS` from the vehicle clock, falling back to the local wall clock
    /// while no date/time frame has been received yet.
    pub fn timestamp(&self) -> String {
        match self.vehicle_clock() {
            Some(clock) => clock.format(TIMESTAMP_FORMAT).to_string(),
            None => Local::now().format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

/// Latest vehicle telemetry, one atomic per field.
///
/// Fields are written independently by the CAN listener, so a snapshot may combine values
/// from slightly different frames. Readers only ever need "most recent write wins".
#[derive(Debug, Default)]
pub struct TelemetryStore {
    fields: [AtomicI64; 9],
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, field: TelemetryField, value: i64) {
        self.fields[field.index()].store(value, Ordering::Relaxed);
    }

    pub fn get(&self, field: TelemetryField) -> i64 {
        self.fields[field.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            speed_kph: self.get(TelemetryField::SpeedKph),
            trip_mileage_km: self.get(TelemetryField::TripMileageKm),
            total_mileage_km: self.get(TelemetryField::TotalMileageKm),
            year: self.get(TelemetryField::Year),
            month: self.get(TelemetryField::Month),
            day: self.get(TelemetryField::Day),
            hour: self.get(TelemetryField::Hour),
            minute: self.get(TelemetryField::Minute),
            second: self.get(TelemetryField::Second),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_update_and_snapshot() {
        let store = TelemetryStore::new();
        store.update(TelemetryField::SpeedKph, 87);
        store.update(TelemetryField::TotalMileageKm, 123_456);
        store.update(TelemetryField::SpeedKph, 90);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.speed_kph, 90);
        assert_eq!(snapshot.total_mileage_km, 123_456);
        assert_eq!(snapshot.trip_mileage_km, 0);
    }

    #[test]
    fn test_field_indices_are_distinct() {
        let store = TelemetryStore::new();
        for (i, field) in TelemetryField::ALL.iter().enumerate() {
            store.update(*field, i as i64 + 1);
        }
        for (i, field) in TelemetryField::ALL.iter().enumerate() {
            assert_eq!(store.get(*field), i as i64 + 1);
        }
    }

    #[test]
    fn test_timestamp_uses_vehicle_clock() {
        let snapshot = TelemetrySnapshot {
            year: 2024,
            month: 3,
            day: 9,
            hour: 14,
            minute: 5,
            second: 7,
            ..Default::default()
        };
        assert_eq!(snapshot.timestamp(), "20240309_140507");
    }

    #[test]
    fn test_timestamp_falls_back_to_wall_clock() {
        let snapshot = TelemetrySnapshot {
            year: 2024,
            month: 13,
            day: 1,
            ..Default::default()
        };
        assert!(snapshot.vehicle_clock().is_none());

        let timestamp = TelemetrySnapshot::default().timestamp();
        assert_eq!(timestamp.len(), "YYYYMMDD_HHMMSS".len());
        assert!(NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).is_ok());
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let store = Arc::new(TelemetryStore::new());
        let writer_store = store.clone();
        let writer = thread::spawn(move || {
            for speed in 0..1000 {
                writer_store.update(TelemetryField::SpeedKph, speed);
            }
        });
        for _ in 0..1000 {
            let speed = store.snapshot().speed_kph;
            assert!((0..1000).contains(&speed));
        }
        writer.join().unwrap();
        assert_eq!(store.get(TelemetryField::SpeedKph), 999);
    }
}
