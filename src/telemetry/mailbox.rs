use std::sync::Mutex;

/// Single-slot handoff for the most recent CAN warning.
///
/// Posting overwrites whatever is pending; taking clears the slot. A second warning that
/// arrives before the trigger poller consumes the first one replaces it. There must be a
/// single consumer.
#[derive(Debug, Default)]
pub struct WarningMailbox {
    pending: Mutex<Option<String>>,
}

impl WarningMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self, label: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some(label.to_string());
    }

    /// Returns the pending warning, if any, and clears the slot.
    pub fn take(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
