//! Session notification source backed by a Windows message pump.
//!
//! # Threading
//!
//! The window procedure runs on the pump thread, inside `DispatchMessageW`.
//! It only ever hands the message to the [`EventSink`] stored in that
//! thread's local slot; every pump thread has its own slot, so independent
//! subscriptions never see each other's events.

use super::message_loop::{current_thread_id, post_quit_message, run_message_loop};
use super::window::{create_hidden_window, destroy_window};
use crate::error::SessionError;
use crate::event::{WM_QUERYENDSESSION, WM_WTSSESSION_CHANGE};
use crate::native::{EventSink, NativeEventSource};
use std::cell::RefCell;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use windows::Win32::Foundation::{HWND, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::RemoteDesktop::{
    WTSRegisterSessionNotification, WTSUnRegisterSessionNotification, NOTIFY_FOR_THIS_SESSION,
};
use windows::Win32::UI::WindowsAndMessaging::DefWindowProcW;

thread_local! {
    /// Sink for the pump running on this thread.
    static PUMP_SINK: RefCell<Option<EventSink>> = const { RefCell::new(None) };
}

/// Window procedure for the notification window.
///
/// # Safety
/// Called by Windows from the pump thread's message dispatch.
pub(crate) unsafe extern "system" fn session_window_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        WM_WTSSESSION_CHANGE => {
            relay_to_sink(msg, wparam.0 as u32);
            LRESULT(0)
        }
        WM_QUERYENDSESSION => {
            // Flags live in lParam. By the time this returns the subscriber
            // has finished (acknowledged mode), so the session may end.
            relay_to_sink(msg, lparam.0 as u32);
            LRESULT(1)
        }
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

fn relay_to_sink(kind: u32, parameter: u32) {
    // Clone out so the slot is not borrowed while the delivery blocks.
    let sink = PUMP_SINK.with(|slot| slot.borrow().clone());
    match sink {
        Some(sink) => {
            sink.deliver(kind, parameter);
        }
        None => tracing::trace!(kind, parameter, "No sink on pump thread, dropping message"),
    }
}

/// Native source for the current session's notifications.
#[derive(Debug, Default)]
pub struct SessionNotificationSource;

impl SessionNotificationSource {
    pub fn new() -> Self {
        Self
    }
}

/// The running pump thread.
#[derive(Debug)]
pub struct PumpHandle {
    thread_id: u32,
    thread: JoinHandle<()>,
}

impl PumpHandle {
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }
}

impl NativeEventSource for SessionNotificationSource {
    type Handle = PumpHandle;

    fn start(&mut self, sink: EventSink) -> Result<PumpHandle, SessionError> {
        let (ready_tx, ready_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("session-pump".into())
            .spawn(move || run_pump(sink, ready_tx))
            .map_err(|e| SessionError::Registration(format!("spawn pump thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(thread_id)) => {
                tracing::info!(thread_id, "Registered for session notifications");
                Ok(PumpHandle { thread_id, thread })
            }
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(SessionError::Registration(reason))
            }
            Err(_) => {
                let _ = thread.join();
                Err(SessionError::Registration(
                    "pump thread exited during startup".into(),
                ))
            }
        }
    }

    fn stop(&mut self, handle: &PumpHandle) {
        if let Err(e) = post_quit_message(handle.thread_id, 0) {
            tracing::error!(thread_id = handle.thread_id, ?e, "Failed to stop message pump");
        }
    }

    fn release(&mut self, handle: PumpHandle) -> Result<(), SessionError> {
        let thread_id = handle.thread_id;
        handle.thread.join().map_err(|_| {
            SessionError::HandleRelease(format!("pump thread {} panicked", thread_id))
        })
    }
}

/// Body of the pump thread.
///
/// Reports the thread ID (or the startup failure) through `ready`, then
/// pumps until WM_QUIT.
fn run_pump(sink: EventSink, ready: mpsc::Sender<Result<u32, String>>) {
    PUMP_SINK.with(|slot| *slot.borrow_mut() = Some(sink));

    let hwnd = match create_hidden_window() {
        Ok(hwnd) => hwnd,
        Err(e) => {
            PUMP_SINK.with(|slot| slot.borrow_mut().take());
            let _ = ready.send(Err(format!("create notification window: {}", e)));
            return;
        }
    };

    if let Err(e) = unsafe { WTSRegisterSessionNotification(hwnd, NOTIFY_FOR_THIS_SESSION) } {
        destroy_window(hwnd);
        PUMP_SINK.with(|slot| slot.borrow_mut().take());
        let _ = ready.send(Err(format!("WTSRegisterSessionNotification: {}", e)));
        return;
    }

    let _ = ready.send(Ok(current_thread_id()));

    run_message_loop();

    // Drop the sink first so nothing more can be delivered while unwinding.
    PUMP_SINK.with(|slot| slot.borrow_mut().take());
    if let Err(e) = unsafe { WTSUnRegisterSessionNotification(hwnd) } {
        tracing::warn!(?e, "Failed to unregister session notifications");
    }
    destroy_window(hwnd);

    tracing::debug!("Session pump thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::DeliveryMode;
    use crate::subscription::subscribe;
    use crate::RelayConfig;
    use tokio::sync::mpsc as tokio_mpsc;

    #[test]
    fn test_window_proc_without_sink_is_harmless() {
        // No sink is installed on the test thread.
        relay_to_sink(WM_WTSSESSION_CHANGE, 0x7);
    }

    #[test]
    fn test_subscribe_and_close_real_pump() {
        let (tx, _rx) = tokio_mpsc::channel(16);
        let config = RelayConfig::default().with_delivery(DeliveryMode::FireAndForget);

        let subscription = subscribe(SessionNotificationSource::new(), tx, config)
            .expect("session notification registration failed");
        assert!(subscription.is_active());

        subscription.close().unwrap();
    }
}
