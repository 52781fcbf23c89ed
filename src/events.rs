//! Best-effort provisioning event fan-out.
//!
//! Long-running operations (launch, stop, destroy, install) publish progress
//! here so observers can follow along. Delivery is best-effort: a subscriber
//! that falls behind or goes away is dropped, and publishing never blocks
//! the operation that produced the event.

use std::sync::Mutex;
use std::time::SystemTime;

use tokio::sync::mpsc;

/// Per-subscriber channel capacity before the subscriber is dropped.
const SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Progress,
    Error,
    Complete,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Progress => "progress",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisioningEvent {
    pub timestamp: String,
    pub kind: EventKind,
    pub message: String,
}

impl ProvisioningEvent {
    pub fn progress(message: impl Into<String>) -> Self {
        Self::new(EventKind::Progress, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(EventKind::Error, message)
    }

    pub fn complete(message: impl Into<String>) -> Self {
        Self::new(EventKind::Complete, message)
    }

    fn new(kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: utc_timestamp(),
            kind,
            message: message.into(),
        }
    }
}

/// Fan-out bus for [`ProvisioningEvent`]s.
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<ProvisioningEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber. Events published after this call are
    /// delivered to the returned receiver until it lags or is dropped.
    pub fn subscribe(&self) -> mpsc::Receiver<ProvisioningEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber. Subscribers whose channel
    /// is full or closed are removed.
    pub fn publish(&self, event: ProvisioningEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| tx.try_send(event.clone()).is_ok());
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Format the current UTC time as `YYYY-MM-DDTHH:MM:SSZ` without any
/// external datetime dependency.
fn utc_timestamp() -> String {
    let dur = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = dur.as_secs();

    let days = (secs / 86400) as i64;
    let time_of_day = secs % 86400;
    let hours = time_of_day / 3600;
    let minutes = (time_of_day % 3600) / 60;
    let seconds = time_of_day % 60;

    // Algorithm from Howard Hinnant's civil_from_days
    let z = days + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = if m <= 2 { y + 1 } else { y };

    format!("{y:04}-{m:02}-{d:02}T{hours:02}:{minutes:02}:{seconds:02}Z")
}
