//! Event Reporters
//!
//! Implements the `EventReporter` port for logs and for tests.

use crate::domain::events::{DiscoveryEvent, EventType};
use crate::domain::ports::EventReporter;
use tracing::{info, warn};

/// Writes discovery events to the tracing log
#[derive(Debug, Clone, Default)]
pub struct LoggingEventReporter {
    /// Object the events are recorded against, e.g. `LocalVolumeSet/ns/name`
    involved_object: Option<String>,
}

impl LoggingEventReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_object(involved_object: impl Into<String>) -> Self {
        Self {
            involved_object: Some(involved_object.into()),
        }
    }
}

impl EventReporter for LoggingEventReporter {
    fn report(&self, event: DiscoveryEvent) {
        let object = self.involved_object.as_deref().unwrap_or("-");
        let device = event.device().unwrap_or("-");
        match event.event_type() {
            EventType::Normal => info!(
                reason = event.reason(),
                object,
                device,
                "{}",
                event.message()
            ),
            EventType::Warning => warn!(
                reason = event.reason(),
                object,
                device,
                "{}",
                event.message()
            ),
        }
    }
}

/// Collects events in memory for later inspection
#[derive(Debug, Default)]
pub struct InMemoryEventReporter {
    events: parking_lot::RwLock<Vec<DiscoveryEvent>>,
}

impl InMemoryEventReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DiscoveryEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Events with the given reason
    pub fn events_with_reason(&self, reason: &str) -> Vec<DiscoveryEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.reason() == reason)
            .cloned()
            .collect()
    }
}

impl EventReporter for InMemoryEventReporter {
    fn report(&self, event: DiscoveryEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_reporter() {
        let reporter = LoggingEventReporter::for_object("LocalVolumeSet/default/fast");
        // Should not panic
        reporter.report(DiscoveryEvent::ErrorRunningBlockList {
            message: "lsblk failed".into(),
        });
        reporter.report(DiscoveryEvent::DiscoveredNewDevice {
            kname: "sdb".into(),
            min_age_secs: 60,
        });
    }

    #[test]
    fn test_in_memory_reporter() {
        let reporter = InMemoryEventReporter::new();
        assert!(reporter.is_empty());

        reporter.report(DiscoveryEvent::DiscoveredNewDevice {
            kname: "sdb".into(),
            min_age_secs: 60,
        });
        reporter.report(DiscoveryEvent::DeviceIdNotFound { kname: "sdc".into() });

        assert_eq!(reporter.len(), 2);
        assert_eq!(reporter.events_with_reason("DiscoveredNewDevice").len(), 1);

        reporter.clear();
        assert!(reporter.is_empty());
    }
}
