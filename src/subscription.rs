//! Public subscription handle.
//!
//! Each call to [`subscribe`] builds an independent bridge: one native
//! source, one relay thread, one buffer. Nothing is shared between
//! subscriptions.

use crate::error::SessionError;
use crate::event::Notification;
use crate::native::NativeEventSource;
use crate::relay::{EventRelay, RelayConfig, RelayStats, StatsSnapshot};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::{mpsc, oneshot};

/// Source of process-unique subscription ids (used in logs and thread names).
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Starts `source` and relays its events into `inbound`.
///
/// The caller owns the receiving half of `inbound` and must keep draining
/// it; a full subscriber queue stalls the relay. In acknowledged mode each
/// [`Notification`] must also be acked (or dropped) before the next one is
/// delivered.
///
/// # Errors
/// Returns [`SessionError::Registration`] if the native source fails to
/// start and [`SessionError::Runtime`] if the relay thread cannot be
/// created.
///
/// # Example
/// ```no_run
/// use sessionwatch::{subscribe, ManualSource, RelayConfig};
/// use tokio::sync::mpsc;
///
/// let (tx, mut rx) = mpsc::channel(16);
/// let subscription = subscribe(ManualSource::new(), tx, RelayConfig::default())?;
///
/// while let Some(notification) = rx.blocking_recv() {
///     println!("{:?}", notification.event.classify());
///     notification.ack.ack();
/// }
///
/// subscription.close()?;
/// # Ok::<(), sessionwatch::SessionError>(())
/// ```
pub fn subscribe<S: NativeEventSource>(
    source: S,
    inbound: mpsc::Sender<Notification>,
    config: RelayConfig,
) -> Result<Subscription, SessionError> {
    let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
    let stats = Arc::new(RelayStats::default());

    let (unsubscribe, unsubscribed) = oneshot::channel();
    let relay = EventRelay::start(
        id,
        source,
        inbound,
        unsubscribed,
        config,
        Arc::clone(&stats),
    )?;

    // The runtime is built and dropped on the relay thread only, so no
    // error path drops it inside a caller's async context. On spawn failure
    // the closure is dropped, and the relay with it, which stops and
    // releases the source.
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let relay = thread::Builder::new()
        .name(format!("session-relay-{}", id))
        .spawn(move || run_relay(relay, ready_tx))
        .map_err(|e| SessionError::Runtime(e.to_string()))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            let _ = relay.join();
            return Err(SessionError::Runtime(reason));
        }
        Err(_) => {
            let _ = relay.join();
            return Err(SessionError::RelayPanicked);
        }
    }

    tracing::info!(subscription = id, "Subscribed to session notifications");

    Ok(Subscription {
        id,
        unsubscribe: Some(unsubscribe),
        relay: Some(relay),
        stats,
    })
}

/// Body of the relay thread.
///
/// Reports whether the runtime could be built through `ready`, then runs
/// the relay loop to completion.
fn run_relay<S: NativeEventSource>(
    relay: EventRelay<S>,
    ready: std::sync::mpsc::Sender<Result<(), String>>,
) -> Result<(), SessionError> {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            // Tear down before reporting so the source is stopped by the
            // time the caller sees the error.
            drop(relay);
            let reason = e.to_string();
            let _ = ready.send(Err(reason.clone()));
            return Err(SessionError::Runtime(reason));
        }
    };

    let _ = ready.send(Ok(()));
    relay.run(runtime)
}

/// Subscribes to the current session's notifications on Windows.
#[cfg(windows)]
pub fn subscribe_session_notifications(
    inbound: mpsc::Sender<Notification>,
    config: RelayConfig,
) -> Result<Subscription, SessionError> {
    subscribe(
        crate::winapi_utils::SessionNotificationSource::new(),
        inbound,
        config,
    )
}

/// Handle to a running bridge.
///
/// Dropping the handle requests teardown without waiting for it.
/// Unsubscribing consumes the handle, so it can only happen once.
pub struct Subscription {
    id: u64,
    unsubscribe: Option<oneshot::Sender<()>>,
    relay: Option<JoinHandle<Result<(), SessionError>>>,
    stats: Arc<RelayStats>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current relay counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns true while the relay thread is still running.
    pub fn is_active(&self) -> bool {
        self.relay
            .as_ref()
            .is_some_and(|relay| !relay.is_finished())
    }

    /// Requests teardown and returns immediately.
    ///
    /// The relay observes the request between events; an event waiting for
    /// its ack is finished first.
    pub fn unsubscribe(mut self) {
        self.signal_unsubscribe();
    }

    /// Requests teardown and waits for it to complete.
    ///
    /// # Errors
    /// Returns the native source's release error, or
    /// [`SessionError::RelayPanicked`]. Either way the subscription is closed.
    pub fn close(mut self) -> Result<(), SessionError> {
        self.signal_unsubscribe();
        match self.relay.take() {
            Some(relay) => relay.join().map_err(|_| SessionError::RelayPanicked)?,
            None => Ok(()),
        }
    }

    fn signal_unsubscribe(&mut self) {
        if let Some(tx) = self.unsubscribe.take() {
            // Err means the relay already exited on its own.
            let _ = tx.send(());
            tracing::debug!(subscription = self.id, "Unsubscribe signaled");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.signal_unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
