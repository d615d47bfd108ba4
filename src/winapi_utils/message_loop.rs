//! Windows message loop utilities.
//!
//! Provides functions for running and stopping a per-thread message pump.
//! Each pump is addressed by the ID of the thread that runs it, so several
//! pumps can coexist in one process.

use windows::Win32::Foundation::{LPARAM, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::WindowsAndMessaging::{
    DispatchMessageW, GetMessageW, PostThreadMessageW, TranslateMessage, MSG, WM_QUIT,
};

/// Returns the ID of the calling thread.
pub fn current_thread_id() -> u32 {
    unsafe { GetCurrentThreadId() }
}

/// Runs the Windows message loop until a WM_QUIT message is received.
///
/// Blocks the calling thread. Windows created on this thread only receive
/// messages while this loop runs.
pub fn run_message_loop() {
    let thread_id = current_thread_id();
    tracing::debug!(thread_id, "Message loop starting");

    let mut msg = MSG::default();

    unsafe {
        // GetMessageW returns:
        // - Positive: message retrieved
        // - 0: WM_QUIT received
        // - -1: error occurred
        while GetMessageW(&mut msg, None, 0, 0).0 > 0 {
            let _ = TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }
    }

    tracing::debug!(thread_id, "Message loop exited");
}

/// Posts a WM_QUIT message to the message loop running on `thread_id`.
///
/// Safe to call from any thread. Fails if the target thread has no
/// message queue (it exited, or never created a window).
pub fn post_quit_message(thread_id: u32, exit_code: i32) -> windows::core::Result<()> {
    unsafe {
        PostThreadMessageW(
            thread_id,
            WM_QUIT,
            WPARAM(exit_code as usize),
            LPARAM(0),
        )?;
    }

    tracing::debug!(exit_code, thread_id, "Posted quit message");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_quit_to_unknown_thread_fails() {
        // Thread ID 0 never has a message queue.
        assert!(post_quit_message(0, 0).is_err());
    }

    #[test]
    fn test_quit_message_ends_loop() {
        let (tx, rx) = std::sync::mpsc::channel();
        let pump = std::thread::spawn(move || {
            // Any window-less call that touches user32 creates the queue;
            // peeking is enough.
            let mut msg = MSG::default();
            unsafe {
                let _ = windows::Win32::UI::WindowsAndMessaging::PeekMessageW(
                    &mut msg,
                    None,
                    0,
                    0,
                    windows::Win32::UI::WindowsAndMessaging::PM_NOREMOVE,
                );
            }
            tx.send(current_thread_id()).unwrap();
            run_message_loop();
        });

        let thread_id = rx.recv().unwrap();
        post_quit_message(thread_id, 0).unwrap();
        pump.join().unwrap();
    }
}
