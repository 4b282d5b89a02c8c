// Library interface for dacl
// This allows integration tests and benches to access internal modules

pub mod archive;
pub mod buffer;
pub mod can;
pub mod config;
pub mod errors;
pub mod recorder;
pub mod retention;
pub mod shutdown;
pub mod telemetry;
pub mod trigger;

// Re-export commonly used types
pub use buffer::{Segment, SegmentBuffer, SegmentLease};
pub use config::Config;
pub use errors::{DaclError, ErrorClass};
pub use recorder::{CompletedSession, Recorder, SessionHandle};
pub use shutdown::Shutdown;
pub use telemetry::{TelemetryField, TelemetrySnapshot, TelemetryStore, WarningMailbox};
pub use trigger::{TriggerCoordinator, TriggerEvent, TriggerSource, TriggerWindows};
