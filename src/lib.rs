//! Session change notifications, relayed off the native message pump.
//!
//! A native source (on Windows, a hidden window registered with
//! `WTSRegisterSessionNotification`) runs its own thread and pushes raw
//! messages into a bounded buffer. A relay thread drains the buffer and
//! hands each event to the subscriber's queue, optionally waiting for an
//! acknowledgment so the subscriber can finish pre-shutdown work before
//! the pump moves on.
//!
//! ```text
//! pump thread -> EventSink -> buffer (1000) -> relay thread -> subscriber queue
//!                                                 ^                 |
//!                                                 +----- AckToken --+
//! ```

pub mod error;
pub mod event;
pub mod native;
pub mod relay;
pub mod subscription;

#[cfg(windows)]
pub mod winapi_utils;

pub use error::SessionError;
pub use event::*;
pub use native::{EventSink, ManualHandle, ManualSource, NativeEventSource};
pub use relay::{DeliveryMode, RelayConfig, RelayStats, StatsSnapshot, DEFAULT_BUFFER_CAPACITY};
pub use subscription::*;
