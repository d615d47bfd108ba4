//! Native event source abstraction and the callback glue that runs on the
//! source's thread.
//!
//! The source owns a thread this crate does not control (on Windows, the
//! message pump). The only thing that thread does with the rest of the
//! system is push events through an [`EventSink`].

pub mod manual;

pub use manual::*;

use crate::error::SessionError;
use crate::event::Event;
use crate::relay::{DeliveryMode, Envelope, RelayStats};
use chrono::Utc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

/// A producer of raw session events running on its own thread.
///
/// The relay calls `start` once, then `stop` and `release` exactly once each
/// during teardown. The handle is owned by the relay for its whole lifetime.
pub trait NativeEventSource: Send + 'static {
    /// Opaque identifier for the running native thread.
    type Handle: Send + 'static;

    /// Starts the native thread and registers for notifications.
    ///
    /// Every relevant message must be passed to `sink.deliver`.
    fn start(&mut self, sink: EventSink) -> Result<Self::Handle, SessionError>;

    /// Unregisters and asks the native thread to exit.
    fn stop(&mut self, handle: &Self::Handle);

    /// Releases the OS resource behind the handle.
    fn release(&mut self, handle: Self::Handle) -> Result<(), SessionError>;
}

/// Callback glue handed to a native source.
///
/// Cheap to clone. `deliver` is the sole interaction between the native
/// thread and the relay.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Envelope>,
    delivery: DeliveryMode,
    stats: Arc<RelayStats>,
}

impl EventSink {
    pub(crate) fn new(
        tx: mpsc::Sender<Envelope>,
        delivery: DeliveryMode,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            tx,
            delivery,
            stats,
        }
    }

    /// Pushes a raw message into the relay buffer.
    ///
    /// Blocks while the buffer is full. In acknowledged mode, also blocks
    /// until the relay has finished with the event (the subscriber acked,
    /// dropped the token, or the ack timed out).
    ///
    /// Returns `false` if the bridge has been torn down and the event was
    /// not delivered. In acknowledged mode this includes events that were
    /// buffered but discarded by teardown before reaching the subscriber.
    ///
    /// # Panics
    /// Must not be called from within an async runtime. Native threads
    /// never are.
    pub fn deliver(&self, kind: u32, parameter: u32) -> bool {
        let event = Event::new(kind, parameter);
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let (completion, done) = match self.delivery {
            DeliveryMode::Acknowledged => {
                let (tx, rx) = oneshot::channel();
                (Some(tx), Some(rx))
            }
            DeliveryMode::FireAndForget => (None, None),
        };

        let envelope = Envelope {
            event,
            received_at: Utc::now(),
            completion,
        };

        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                self.stats.saturated.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    kind = event.kind,
                    parameter = event.parameter,
                    capacity = self.tx.max_capacity(),
                    "Relay buffer full, blocking native thread"
                );
                if self.tx.blocking_send(envelope).is_err() {
                    return self.closed(event);
                }
            }
            Err(TrySendError::Closed(_)) => return self.closed(event),
        }

        if let Some(done) = done {
            // Err means the envelope was dropped without being forwarded;
            // the relay has already counted it as discarded.
            if done.blocking_recv().is_err() {
                tracing::trace!(
                    kind = event.kind,
                    parameter = event.parameter,
                    "Relay discarded event before forwarding"
                );
                return false;
            }
        }

        true
    }

    fn closed(&self, event: Event) -> bool {
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            kind = event.kind,
            parameter = event.parameter,
            "Relay closed, dropping native event"
        );
        false
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("delivery", &self.delivery)
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(capacity: usize, delivery: DeliveryMode) -> (EventSink, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink::new(tx, delivery, Arc::new(RelayStats::default())), rx)
    }

    #[test]
    fn test_fire_and_forget_enqueues_without_waiting() {
        let (sink, mut rx) = sink(4, DeliveryMode::FireAndForget);
        assert!(sink.deliver(0x2B1, 0x7));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.event, Event::new(0x2B1, 0x7));
        assert!(envelope.completion.is_none());
        assert_eq!(sink.stats.received.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_deliver_after_close_reports_failure() {
        let (sink, rx) = sink(4, DeliveryMode::Acknowledged);
        drop(rx);

        assert!(!sink.deliver(0x2B1, 0x8));
        assert_eq!(sink.stats.discarded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_acknowledged_deliver_waits_for_completion() {
        let (sink, mut rx) = sink(4, DeliveryMode::Acknowledged);

        let consumer = std::thread::spawn(move || {
            let envelope = rx.blocking_recv().unwrap();
            std::thread::sleep(std::time::Duration::from_millis(50));
            let _ = envelope.completion.unwrap().send(());
        });

        let started = std::time::Instant::now();
        assert!(sink.deliver(0x11, 0));
        assert!(started.elapsed() >= std::time::Duration::from_millis(50));
        consumer.join().unwrap();
    }

    #[test]
    fn test_acknowledged_discard_reports_failure() {
        let (sink, mut rx) = sink(4, DeliveryMode::Acknowledged);

        // Drop the envelope unforwarded, as teardown does with buffered events.
        let consumer = std::thread::spawn(move || drop(rx.blocking_recv().unwrap()));

        assert!(!sink.deliver(0x2B1, 0x7));
        consumer.join().unwrap();
    }

    #[test]
    fn test_full_buffer_counts_saturation() {
        let (sink, mut rx) = sink(1, DeliveryMode::FireAndForget);
        assert!(sink.deliver(0x2B1, 0x1));

        let producer = {
            let sink = sink.clone();
            std::thread::spawn(move || sink.deliver(0x2B1, 0x2))
        };

        // Wait until the second delivery hits the full buffer.
        while sink.stats.saturated.load(Ordering::Relaxed) == 0 {
            std::thread::yield_now();
        }

        assert_eq!(rx.blocking_recv().unwrap().event.parameter, 0x1);
        assert!(producer.join().unwrap());
        assert_eq!(rx.blocking_recv().unwrap().event.parameter, 0x2);
    }
}
