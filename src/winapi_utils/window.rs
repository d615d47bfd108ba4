//! Hidden notification window.
//!
//! The window is top-level (not message-only) because `WM_QUERYENDSESSION`
//! is only sent to top-level windows. It is never shown.

use super::session::session_window_proc;
use once_cell::sync::OnceCell;
use windows::core::{w, PCWSTR};
use windows::Win32::Foundation::{HINSTANCE, HWND};
use windows::Win32::System::LibraryLoader::GetModuleHandleW;
use windows::Win32::UI::WindowsAndMessaging::{
    CreateWindowExW, DestroyWindow, RegisterClassW, CW_USEDEFAULT, WINDOW_EX_STYLE, WNDCLASSW,
    WS_OVERLAPPEDWINDOW,
};

const CLASS_NAME: PCWSTR = w!("SessionWatchNotificationWindow");

/// Class atom, registered once per process.
static WINDOW_CLASS: OnceCell<u16> = OnceCell::new();

fn module_instance() -> windows::core::Result<HINSTANCE> {
    let module = unsafe { GetModuleHandleW(None)? };
    Ok(HINSTANCE(module.0))
}

/// Registers the notification window class on first use.
fn register_class() -> windows::core::Result<()> {
    WINDOW_CLASS.get_or_try_init(|| {
        let class = WNDCLASSW {
            lpfnWndProc: Some(session_window_proc),
            hInstance: module_instance()?,
            lpszClassName: CLASS_NAME,
            ..Default::default()
        };

        let atom = unsafe { RegisterClassW(&class) };
        if atom == 0 {
            return Err(windows::core::Error::from_win32());
        }

        tracing::debug!(atom, "Notification window class registered");
        Ok(atom)
    })?;
    Ok(())
}

/// Creates a hidden notification window on the calling thread.
///
/// Messages for the window are only dispatched while the calling thread
/// runs a message loop.
pub fn create_hidden_window() -> windows::core::Result<HWND> {
    register_class()?;

    let hwnd = unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE::default(),
            CLASS_NAME,
            CLASS_NAME,
            WS_OVERLAPPEDWINDOW,
            CW_USEDEFAULT,
            CW_USEDEFAULT,
            100,
            100,
            None,
            None,
            module_instance()?,
            None,
        )?
    };

    tracing::debug!(hwnd = ?hwnd.0, "Notification window created");
    Ok(hwnd)
}

/// Destroys a window created by [`create_hidden_window`].
///
/// Must be called on the thread that created it.
pub fn destroy_window(hwnd: HWND) {
    if let Err(e) = unsafe { DestroyWindow(hwnd) } {
        tracing::warn!(?e, "Failed to destroy notification window");
    }
}
