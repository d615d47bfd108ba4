//! Event relay between the native callback thread and the subscriber.
//!
//! The native callback writes into a bounded buffer; a dedicated relay
//! thread drains it and forwards each event to the subscriber's queue,
//! optionally waiting for the subscriber's acknowledgment before moving on.
//!
//! # Ordering
//!
//! One buffer, one consumer: events reach the subscriber in the order the
//! native callback observed them.

use crate::error::SessionError;
use crate::event::{AckToken, Event, Notification};
use crate::native::{EventSink, NativeEventSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot};

/// Default capacity of the internal buffer between callback and relay.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// How the relay hands events to the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Wait for each event's [`AckToken`] before forwarding the next one.
    /// The native callback also waits until the event is finished.
    #[default]
    Acknowledged,
    /// Forward and continue immediately. Ack tokens are inert.
    FireAndForget,
}

/// Configuration for an event relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Slots in the internal buffer (default: 1000). Zero is treated as one.
    pub buffer_capacity: usize,

    /// Acknowledgment behavior (default: acknowledged).
    pub delivery: DeliveryMode,

    /// Upper bound on waiting for an ack. `None` waits indefinitely.
    pub ack_timeout: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            delivery: DeliveryMode::Acknowledged,
            ack_timeout: None,
        }
    }
}

impl RelayConfig {
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = Some(timeout);
        self
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Lock-free counters shared by the native callback and the relay thread.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Events handed to the sink by the native source.
    pub(crate) received: AtomicU64,
    /// Events placed on the subscriber's queue.
    pub(crate) forwarded: AtomicU64,
    /// Times the native callback found the buffer full.
    pub(crate) saturated: AtomicU64,
    /// Acks that did not arrive within the configured timeout.
    pub(crate) ack_timeouts: AtomicU64,
    /// Events dropped because the bridge was closed or closing.
    pub(crate) discarded: AtomicU64,
}

impl RelayStats {
    /// Reads all counters without resetting them.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            saturated: self.saturated.load(Ordering::Relaxed),
            ack_timeouts: self.ack_timeouts.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RelayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub forwarded: u64,
    pub saturated: u64,
    pub ack_timeouts: u64,
    pub discarded: u64,
}

/// An event in the internal buffer.
pub(crate) struct Envelope {
    pub(crate) event: Event,
    pub(crate) received_at: DateTime<Utc>,
    /// Signaled when the relay is done with the event (acknowledged mode).
    pub(crate) completion: Option<oneshot::Sender<()>>,
}

// ============================================================================
// Relay
// ============================================================================

/// Owns the buffer, the native source and its handle for one subscription.
///
/// Dropping a relay that was never torn down stops the source and releases
/// the handle.
pub struct EventRelay<S: NativeEventSource> {
    id: u64,
    source: S,
    handle: Option<S::Handle>,
    buffer: mpsc::Receiver<Envelope>,
    inbound: mpsc::Sender<Notification>,
    unsubscribe: oneshot::Receiver<()>,
    config: RelayConfig,
    stats: Arc<RelayStats>,
}

impl<S: NativeEventSource> EventRelay<S> {
    /// Creates the buffer and starts the native source against it.
    pub(crate) fn start(
        id: u64,
        mut source: S,
        inbound: mpsc::Sender<Notification>,
        unsubscribe: oneshot::Receiver<()>,
        config: RelayConfig,
        stats: Arc<RelayStats>,
    ) -> Result<Self, SessionError> {
        let (tx, buffer) = mpsc::channel(config.buffer_capacity.max(1));
        let sink = EventSink::new(tx, config.delivery, Arc::clone(&stats));

        let handle = source.start(sink)?;
        tracing::info!(
            subscription = id,
            capacity = config.buffer_capacity.max(1),
            delivery = ?config.delivery,
            "Native source started"
        );

        Ok(Self {
            id,
            source,
            handle: Some(handle),
            buffer,
            inbound,
            unsubscribe,
            config,
            stats,
        })
    }

    /// Runs the relay loop to completion on the calling thread.
    ///
    /// Returns the result of tearing down the native source.
    pub(crate) fn run(self, runtime: Runtime) -> Result<(), SessionError> {
        runtime.block_on(self.relay_loop())
    }

    async fn relay_loop(mut self) -> Result<(), SessionError> {
        tracing::debug!(subscription = self.id, "Relay loop started");

        loop {
            tokio::select! {
                biased;

                // Fires on an explicit signal or when the sender is dropped.
                _ = &mut self.unsubscribe => {
                    tracing::info!(subscription = self.id, "Unsubscribe requested");
                    break;
                }

                envelope = self.buffer.recv() => match envelope {
                    Some(envelope) => {
                        if !self.forward(envelope).await {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(subscription = self.id, "Native source went away");
                        break;
                    }
                },
            }
        }

        self.teardown().await
    }

    /// Hands one event to the subscriber.
    ///
    /// Returns `false` if the subscriber's queue is closed.
    async fn forward(&mut self, envelope: Envelope) -> bool {
        let Envelope {
            event,
            received_at,
            completion,
        } = envelope;

        let (ack, acked) = AckToken::pair();
        let notification = Notification {
            event,
            received_at,
            ack,
        };

        if self.inbound.send(notification).await.is_err() {
            self.stats.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                subscription = self.id,
                "Subscriber queue closed, tearing down"
            );
            return false;
        }
        self.stats.forwarded.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            subscription = self.id,
            kind = event.kind,
            parameter = event.parameter,
            "Event forwarded"
        );

        if self.config.delivery == DeliveryMode::Acknowledged {
            self.await_ack(event, acked).await;
        }

        if let Some(completion) = completion {
            // The native thread may have gone away already.
            let _ = completion.send(());
        }

        true
    }

    async fn await_ack(&self, event: Event, acked: oneshot::Receiver<()>) {
        let signaled = match self.config.ack_timeout {
            Some(limit) => match tokio::time::timeout(limit, acked).await {
                Ok(result) => result.is_ok(),
                Err(_) => {
                    self.stats.ack_timeouts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = self.id,
                        kind = event.kind,
                        parameter = event.parameter,
                        timeout_ms = limit.as_millis() as u64,
                        "Subscriber did not acknowledge in time, continuing"
                    );
                    return;
                }
            },
            None => acked.await.is_ok(),
        };

        if !signaled {
            tracing::debug!(
                subscription = self.id,
                kind = event.kind,
                "Ack token dropped, treating as acknowledged"
            );
        }
    }

    /// Closes the buffer, stops the source and releases the handle.
    ///
    /// No-op if already torn down.
    async fn teardown(&mut self) -> Result<(), SessionError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        // Closing unblocks any callback waiting for buffer space. `recv`
        // yields `None` only once no callback still holds a send permit, so
        // every envelope is dropped here and no callback is left waiting on
        // completion when the source is stopped.
        self.buffer.close();
        let mut discarded = 0u64;
        while self.buffer.recv().await.is_some() {
            discarded += 1;
        }
        self.record_discarded(discarded);

        self.shutdown_source(handle)
    }

    fn record_discarded(&self, discarded: u64) {
        if discarded > 0 {
            self.stats.discarded.fetch_add(discarded, Ordering::Relaxed);
            tracing::debug!(
                subscription = self.id,
                discarded,
                "Discarded buffered events on teardown"
            );
        }
    }

    /// Stops the source and releases the handle, once each.
    fn shutdown_source(&mut self, handle: S::Handle) -> Result<(), SessionError> {
        self.source.stop(&handle);
        let result = self.source.release(handle);

        match &result {
            Ok(()) => tracing::info!(subscription = self.id, "Native source released"),
            Err(e) => tracing::error!(
                subscription = self.id,
                error = %e,
                "Failed to release native source"
            ),
        }

        result
    }
}

impl<S: NativeEventSource> Drop for EventRelay<S> {
    /// Only reached when the relay never ran its loop (e.g. the relay
    /// runtime could not be built). Drains without awaiting.
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        tracing::warn!(subscription = self.id, "Relay dropped before teardown");

        self.buffer.close();
        let mut discarded = 0u64;
        while self.buffer.try_recv().is_ok() {
            discarded += 1;
        }
        self.record_discarded(discarded);

        // Errors are logged by shutdown_source.
        let _ = self.shutdown_source(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::ManualSource;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.buffer_capacity, 1000);
        assert_eq!(config.delivery, DeliveryMode::Acknowledged);
        assert!(config.ack_timeout.is_none());
    }

    #[test]
    fn test_relay_config_builders() {
        let config = RelayConfig::default()
            .with_buffer_capacity(8)
            .with_delivery(DeliveryMode::FireAndForget)
            .with_ack_timeout(Duration::from_millis(250));
        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.delivery, DeliveryMode::FireAndForget);
        assert_eq!(config.ack_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_stats_snapshot_reads_counters() {
        let stats = RelayStats::default();
        stats.received.store(3, Ordering::Relaxed);
        stats.forwarded.store(2, Ordering::Relaxed);
        stats.saturated.store(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 3);
        assert_eq!(snapshot.forwarded, 2);
        assert_eq!(snapshot.saturated, 1);
        assert_eq!(snapshot.ack_timeouts, 0);
        assert_eq!(snapshot.discarded, 0);
    }

    #[test]
    fn test_dropped_relay_releases_source() {
        let source = ManualSource::new();
        let (inbound, _rx) = mpsc::channel(4);
        let (_unsubscribe, unsubscribed) = oneshot::channel();

        let relay = EventRelay::start(
            0,
            source.clone(),
            inbound,
            unsubscribed,
            RelayConfig::default(),
            Arc::new(RelayStats::default()),
        )
        .unwrap();
        assert!(source.is_running());

        drop(relay);
        assert_eq!(source.stop_count(), 1);
        assert_eq!(source.release_count(), 1);
        assert!(!source.is_running());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let source = ManualSource::new();
        let (inbound, _rx) = mpsc::channel(4);
        let (_unsubscribe, unsubscribed) = oneshot::channel();

        let relay = EventRelay::start(
            0,
            source.clone(),
            inbound,
            unsubscribed,
            RelayConfig::default()
                .with_buffer_capacity(0)
                .with_delivery(DeliveryMode::FireAndForget),
            Arc::new(RelayStats::default()),
        )
        .unwrap();

        // One slot is available even though zero was requested.
        assert!(source.inject(0x2B1, 0x7));
        drop(relay);
        assert_eq!(source.release_count(), 1);
    }
}
