//! Synthetic native source driven by the caller.
//!
//! Stands in for the OS message pump: whatever thread calls
//! [`ManualSource::inject`] plays the role of the foreign pump thread.
//! Clones share state, so keep one clone to inject while the relay owns
//! the other.

use super::{EventSink, NativeEventSource};
use crate::error::SessionError;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct ManualState {
    sink: Mutex<Option<EventSink>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    releases: AtomicUsize,
    fail_start: AtomicBool,
    fail_release: AtomicBool,
    next_handle: AtomicU64,
}

/// A [`NativeEventSource`] whose messages are injected by hand.
#[derive(Clone, Default)]
pub struct ManualSource {
    state: Arc<ManualState>,
}

/// Handle issued by [`ManualSource::start`].
#[derive(Debug, PartialEq, Eq)]
pub struct ManualHandle(u64);

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `start` fail with a registration error.
    pub fn fail_start(&self) {
        self.state.fail_start.store(true, Ordering::SeqCst);
    }

    /// Makes `release` fail with a handle-release error.
    pub fn fail_release(&self) {
        self.state.fail_release.store(true, Ordering::SeqCst);
    }

    /// Simulates the native pump receiving `(kind, parameter)`.
    ///
    /// Returns `false` if the source is not running or the relay is gone.
    pub fn inject(&self, kind: u32, parameter: u32) -> bool {
        // Clone out so a blocked delivery doesn't hold the lock against `stop`.
        let sink = match self.state.sink.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => return false,
        };
        match sink {
            Some(sink) => sink.deliver(kind, parameter),
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state
            .sink
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    pub fn start_count(&self) -> usize {
        self.state.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }
}

impl NativeEventSource for ManualSource {
    type Handle = ManualHandle;

    fn start(&mut self, sink: EventSink) -> Result<ManualHandle, SessionError> {
        self.state.starts.fetch_add(1, Ordering::SeqCst);

        if self.state.fail_start.swap(false, Ordering::SeqCst) {
            return Err(SessionError::Registration(
                "manual source configured to fail".into(),
            ));
        }

        if let Ok(mut guard) = self.state.sink.lock() {
            *guard = Some(sink);
        }

        let id = self.state.next_handle.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(handle = id, "Manual source started");
        Ok(ManualHandle(id))
    }

    fn stop(&mut self, handle: &ManualHandle) {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut guard) = self.state.sink.lock() {
            guard.take();
        }
        tracing::debug!(handle = handle.0, "Manual source stopped");
    }

    fn release(&mut self, handle: ManualHandle) -> Result<(), SessionError> {
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_release.load(Ordering::SeqCst) {
            return Err(SessionError::HandleRelease(format!(
                "manual handle {} configured to fail",
                handle.0
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{DeliveryMode, RelayStats};
    use tokio::sync::mpsc;

    #[test]
    fn test_inject_before_start_is_rejected() {
        let source = ManualSource::new();
        assert!(!source.is_running());
        assert!(!source.inject(0x2B1, 0x7));
    }

    #[test]
    fn test_start_stop_release_are_counted() {
        let mut source = ManualSource::new();
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(tx, DeliveryMode::FireAndForget, Arc::new(RelayStats::default()));

        let handle = source.start(sink).unwrap();
        assert!(source.is_running());
        assert!(source.inject(0x2B1, 0x7));
        assert_eq!(rx.try_recv().unwrap().event.parameter, 0x7);

        source.stop(&handle);
        assert!(!source.inject(0x2B1, 0x8));
        source.release(handle).unwrap();

        assert_eq!(source.start_count(), 1);
        assert_eq!(source.stop_count(), 1);
        assert_eq!(source.release_count(), 1);
    }

    #[test]
    fn test_fail_start_is_one_shot() {
        let mut source = ManualSource::new();
        source.fail_start();

        let (tx, _rx) = mpsc::channel(1);
        let stats = Arc::new(RelayStats::default());
        let sink = EventSink::new(tx, DeliveryMode::FireAndForget, stats);

        assert!(matches!(
            source.start(sink.clone()),
            Err(SessionError::Registration(_))
        ));
        assert!(source.start(sink).is_ok());
    }
}
