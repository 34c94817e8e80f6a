//! Broadcast hub
//!
//! Thread-safe fan-out of pipeline events to subscribed clients. Events
//! are serialized once and handed to every subscriber through a bounded
//! per-subscriber queue; a subscriber that cannot accept a frame (gone
//! or backlogged) is detached on the spot. Producers never wait for
//! consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::models::TelemetryRecord;

/// Serialized event shared by every subscriber queue.
pub type Frame = Arc<str>;

/// Handle identifying an attached subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Events published into the hub.
///
/// The JSON tag and field names are the wire protocol; subscribers see
/// these objects verbatim.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HubEvent {
    /// Raw console line, emitted for every line regardless of parsing.
    #[serde(rename = "console_data")]
    Console {
        port: String,
        data: String,
        timestamp: f64,
    },

    /// Parsed (and possibly fusion-enriched) telemetry record.
    #[serde(rename = "telemetry_data")]
    Telemetry {
        port: String,
        data: TelemetryRecord,
        timestamp: f64,
    },
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<Frame>,
}

/// Fan-out point between the pipeline and connected clients.
///
/// Publish is callable from reader threads; the subscriber list lock is
/// held only for the non-blocking `try_send` pass, never across I/O.
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastHub {
    /// Create a hub whose subscribers each buffer up to `queue_capacity`
    /// frames before being considered backlogged.
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
        }
    }

    /// Attach a new subscriber, returning its id and the frame stream.
    pub fn attach(&self) -> (SubscriberId, mpsc::Receiver<Frame>) {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.push(Subscriber { id, tx });
        info!(subscriber = id.0, total = subscribers.len(), "subscriber attached");

        (id, rx)
    }

    /// Detach a subscriber; detaching twice is a no-op.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() < before;
        if removed {
            info!(subscriber = id.0, total = subscribers.len(), "subscriber detached");
        }
        removed
    }

    /// Serialize the event once and deliver it to every subscriber.
    ///
    /// Best-effort and non-blocking: a full or closed queue counts as a
    /// send failure and detaches that subscriber without affecting the
    /// others. Events published from one thread reach each subscriber
    /// in publish order.
    pub fn publish(&self, event: &HubEvent) {
        let frame: Frame = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(e) => {
                error!("failed to serialize hub event: {e}");
                return;
            }
        };

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|s| match s.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = s.id.0, "subscriber backlogged, detaching");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = s.id.0, "subscriber gone, detaching");
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Detach every subscriber, closing their frame streams.
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn console_event(n: usize) -> HubEvent {
        HubEvent::Console {
            port: "/dev/ttyUSB0".to_string(),
            data: format!("line {n}"),
            timestamp: n as f64,
        }
    }

    #[tokio::test]
    async fn delivers_frames_in_publish_order() {
        let hub = BroadcastHub::new(16);
        let (_id, mut rx) = hub.attach();

        for n in 0..5 {
            hub.publish(&console_event(n));
        }

        for n in 0..5 {
            let frame = rx.recv().await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["type"], "console_data");
            assert_eq!(value["data"], format!("line {n}"));
        }
    }

    #[tokio::test]
    async fn failed_subscriber_is_detached_others_keep_receiving() {
        let hub = BroadcastHub::new(16);
        let (_healthy_id, mut healthy_rx) = hub.attach();
        let (_failing_id, failing_rx) = hub.attach();
        assert_eq!(hub.subscriber_count(), 2);

        // The failing subscriber's receiver is gone before the publish
        drop(failing_rx);
        hub.publish(&console_event(0));

        assert_eq!(hub.subscriber_count(), 1);
        assert!(healthy_rx.recv().await.is_some());

        // A second publish still reaches the healthy subscriber only
        hub.publish(&console_event(1));
        assert!(healthy_rx.recv().await.is_some());
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn backlogged_subscriber_is_dropped() {
        let hub = BroadcastHub::new(2);
        let (_id, mut rx) = hub.attach();

        // Two frames fill the queue, the third overflows it
        hub.publish(&console_event(0));
        hub.publish(&console_event(1));
        hub.publish(&console_event(2));

        assert_eq!(hub.subscriber_count(), 0);
        // Frames accepted before the overflow are still readable
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let hub = BroadcastHub::new(16);
        let (id, _rx) = hub.attach();

        assert!(hub.detach(id));
        assert!(!hub.detach(id));
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn close_detaches_everyone() {
        let hub = BroadcastHub::new(16);
        let (_a, mut rx_a) = hub.attach();
        let (_b, _rx_b) = hub.attach();

        hub.close();
        assert_eq!(hub.subscriber_count(), 0);
        assert!(rx_a.recv().await.is_none());
    }

    #[test]
    fn telemetry_event_serializes_record_inline() {
        let mut record = TelemetryRecord::new();
        record.insert("altitude_m", 0.95);
        let event = HubEvent::Telemetry {
            port: "COM3".to_string(),
            data: record,
            timestamp: 1.0,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "telemetry_data");
        assert_eq!(value["data"]["altitude_m"], 0.95);
        assert_eq!(value["port"], "COM3");
    }
}
