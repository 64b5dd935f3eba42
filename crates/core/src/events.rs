//! Progress Event Bus
//!
//! One shared broadcast stream carries the install progress of every
//! package; subscribers receive all events and filter by package name.

use tokio::sync::broadcast;
use tracing::trace;

use crate::step::InstallInfo;

/// Broadcast channel depth. Subscribers that fall further behind than
/// this lose the oldest events.
const BUS_CAPACITY: usize = 256;

/// One event on the shared bus
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Package identifier the event belongs to
    pub package: String,
    /// Step and optional session snapshot
    pub info: InstallInfo,
}

/// Shared broadcast bus for install progress
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    /// Create a new bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    /// Subscribe to all progress events
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns the number of subscribers it reached
    pub fn publish(&self, package: &str, info: InstallInfo) -> usize {
        trace!("progress {:?} for {}", info.step, package);
        self.sender
            .send(ProgressEvent {
                package: package.to_string(),
                info,
            })
            .unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::InstallStep;

    #[tokio::test]
    async fn test_all_subscribers_receive_events() {
        let bus = ProgressBus::new();
        let mut sub1 = bus.subscribe();
        let mut sub2 = bus.subscribe();

        assert_eq!(bus.subscriber_count(), 2);

        let delivered = bus.publish("com.example.ext", InstallInfo::new(InstallStep::Pending));
        assert_eq!(delivered, 2);

        let event = sub1.recv().await.unwrap();
        assert_eq!(event.package, "com.example.ext");
        assert_eq!(event.info.step, InstallStep::Pending);
        assert!(sub2.recv().await.is_ok());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = ProgressBus::new();
        let delivered = bus.publish("com.example.ext", InstallInfo::new(InstallStep::Error));
        assert_eq!(delivered, 0);
    }
}
