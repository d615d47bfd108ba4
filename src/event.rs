//! Session event vocabulary.
//!
//! Message kinds and reason codes are the values Windows uses for
//! `WM_WTSSESSION_CHANGE` and `WM_QUERYENDSESSION`, reproduced bit-exact so
//! events coming off a real message pump can be matched directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

// ============================================================================
// Message Kinds
// ============================================================================

/// Message kind for session-change notifications.
pub const WM_WTSSESSION_CHANGE: u32 = 0x2B1;

/// Message kind for the end-session query sent before logoff or shutdown.
pub const WM_QUERYENDSESSION: u32 = 0x11;

// ============================================================================
// Session-Change Reason Codes
// ============================================================================

pub const WTS_CONSOLE_CONNECT: u32 = 0x1;
pub const WTS_CONSOLE_DISCONNECT: u32 = 0x2;
pub const WTS_REMOTE_CONNECT: u32 = 0x3;
pub const WTS_REMOTE_DISCONNECT: u32 = 0x4;
pub const WTS_SESSION_LOGON: u32 = 0x5;
pub const WTS_SESSION_LOGOFF: u32 = 0x6;
pub const WTS_SESSION_LOCK: u32 = 0x7;
pub const WTS_SESSION_UNLOCK: u32 = 0x8;
pub const WTS_SESSION_REMOTE_CONTROL: u32 = 0x9;
pub const WTS_SESSION_CREATE: u32 = 0xA;
pub const WTS_SESSION_TERMINATE: u32 = 0xB;

// ============================================================================
// End-Session Flags
// ============================================================================

pub const ENDSESSION_CLOSEAPP: u32 = 0x0000_0001;
pub const ENDSESSION_CRITICAL: u32 = 0x4000_0000;
pub const ENDSESSION_LOGOFF: u32 = 0x8000_0000;

/// A raw event observed on the native message pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Event {
    /// Message kind (e.g. `WM_WTSSESSION_CHANGE`).
    pub kind: u32,
    /// Reason code for session changes, flag bits for end-session queries.
    pub parameter: u32,
}

impl Event {
    pub const fn new(kind: u32, parameter: u32) -> Self {
        Self { kind, parameter }
    }

    /// Interprets the raw pair against the known vocabulary.
    pub fn classify(&self) -> SessionEvent {
        match self.kind {
            WM_WTSSESSION_CHANGE => match SessionChange::from_code(self.parameter) {
                Some(change) => SessionEvent::Change(change),
                None => SessionEvent::Other {
                    kind: self.kind,
                    parameter: self.parameter,
                },
            },
            WM_QUERYENDSESSION => SessionEvent::QueryEndSession(EndSessionFlags(self.parameter)),
            _ => SessionEvent::Other {
                kind: self.kind,
                parameter: self.parameter,
            },
        }
    }

    /// Returns true for the pre-shutdown query.
    pub fn is_query_end_session(&self) -> bool {
        self.kind == WM_QUERYENDSESSION
    }
}

/// Reason carried by a session-change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionChange {
    ConsoleConnect,
    ConsoleDisconnect,
    RemoteConnect,
    RemoteDisconnect,
    Logon,
    Logoff,
    Lock,
    Unlock,
    RemoteControl,
    Create,
    Terminate,
}

impl SessionChange {
    pub fn from_code(code: u32) -> Option<Self> {
        let change = match code {
            WTS_CONSOLE_CONNECT => Self::ConsoleConnect,
            WTS_CONSOLE_DISCONNECT => Self::ConsoleDisconnect,
            WTS_REMOTE_CONNECT => Self::RemoteConnect,
            WTS_REMOTE_DISCONNECT => Self::RemoteDisconnect,
            WTS_SESSION_LOGON => Self::Logon,
            WTS_SESSION_LOGOFF => Self::Logoff,
            WTS_SESSION_LOCK => Self::Lock,
            WTS_SESSION_UNLOCK => Self::Unlock,
            WTS_SESSION_REMOTE_CONTROL => Self::RemoteControl,
            WTS_SESSION_CREATE => Self::Create,
            WTS_SESSION_TERMINATE => Self::Terminate,
            _ => return None,
        };
        Some(change)
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::ConsoleConnect => WTS_CONSOLE_CONNECT,
            Self::ConsoleDisconnect => WTS_CONSOLE_DISCONNECT,
            Self::RemoteConnect => WTS_REMOTE_CONNECT,
            Self::RemoteDisconnect => WTS_REMOTE_DISCONNECT,
            Self::Logon => WTS_SESSION_LOGON,
            Self::Logoff => WTS_SESSION_LOGOFF,
            Self::Lock => WTS_SESSION_LOCK,
            Self::Unlock => WTS_SESSION_UNLOCK,
            Self::RemoteControl => WTS_SESSION_REMOTE_CONTROL,
            Self::Create => WTS_SESSION_CREATE,
            Self::Terminate => WTS_SESSION_TERMINATE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConsoleConnect => "console_connect",
            Self::ConsoleDisconnect => "console_disconnect",
            Self::RemoteConnect => "remote_connect",
            Self::RemoteDisconnect => "remote_disconnect",
            Self::Logon => "logon",
            Self::Logoff => "logoff",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::RemoteControl => "remote_control",
            Self::Create => "create",
            Self::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for SessionChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flag bits carried by `WM_QUERYENDSESSION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndSessionFlags(pub u32);

impl EndSessionFlags {
    /// The application is being asked to close (e.g. for an update), not a full shutdown.
    pub fn close_app(&self) -> bool {
        self.0 & ENDSESSION_CLOSEAPP != 0
    }

    /// The shutdown is forced; the application cannot veto it.
    pub fn critical(&self) -> bool {
        self.0 & ENDSESSION_CRITICAL != 0
    }

    /// The user is logging off. When unset, the system is shutting down.
    pub fn logoff(&self) -> bool {
        self.0 & ENDSESSION_LOGOFF != 0
    }
}

/// Interpreted form of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SessionEvent {
    Change(SessionChange),
    QueryEndSession(EndSessionFlags),
    Other { kind: u32, parameter: u32 },
}

/// Single-use acknowledgment paired with a delivered event.
///
/// The relay waits on the paired receiver before forwarding the next event
/// (in acknowledged delivery mode). Call [`AckToken::ack`] once processing
/// is finished, e.g. after persisting state for an end-session query.
/// Dropping the token without calling `ack` releases the relay as well.
#[derive(Debug)]
pub struct AckToken {
    tx: Option<oneshot::Sender<()>>,
}

impl AckToken {
    /// Creates a token and the receiver the relay waits on.
    pub(crate) fn pair() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Signals that the paired event has been fully processed.
    pub fn ack(mut self) {
        if let Some(tx) = self.tx.take() {
            // The relay may have timed out and moved on already.
            let _ = tx.send(());
        }
    }
}

impl Drop for AckToken {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!("Ack token dropped without explicit ack");
        }
    }
}

/// An event as handed to the subscriber.
#[derive(Debug)]
pub struct Notification {
    pub event: Event,
    /// When the native callback observed the event.
    pub received_at: DateTime<Utc>,
    pub ack: AckToken,
}

impl Notification {
    /// Acknowledges the notification, returning the event and its timestamp.
    pub fn ack(self) -> (Event, DateTime<Utc>) {
        self.ack.ack();
        (self.event, self.received_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlock_classifies_as_session_change() {
        let event = Event::new(0x2B1, 0x8);
        assert_eq!(event.classify(), SessionEvent::Change(SessionChange::Unlock));
        assert!(!event.is_query_end_session());
    }

    #[test]
    fn test_session_change_codes_are_bit_exact() {
        let expected = [
            (0x1, SessionChange::ConsoleConnect),
            (0x2, SessionChange::ConsoleDisconnect),
            (0x3, SessionChange::RemoteConnect),
            (0x4, SessionChange::RemoteDisconnect),
            (0x5, SessionChange::Logon),
            (0x6, SessionChange::Logoff),
            (0x7, SessionChange::Lock),
            (0x8, SessionChange::Unlock),
            (0x9, SessionChange::RemoteControl),
            (0xA, SessionChange::Create),
            (0xB, SessionChange::Terminate),
        ];
        for (code, change) in expected {
            assert_eq!(SessionChange::from_code(code), Some(change));
            assert_eq!(change.code(), code);
        }
        assert_eq!(SessionChange::from_code(0), None);
        assert_eq!(SessionChange::from_code(0xC), None);
    }

    #[test]
    fn test_unknown_reason_is_other() {
        let event = Event::new(WM_WTSSESSION_CHANGE, 0x42);
        assert_eq!(
            event.classify(),
            SessionEvent::Other {
                kind: WM_WTSSESSION_CHANGE,
                parameter: 0x42
            }
        );
    }

    #[test]
    fn test_end_session_flags() {
        let event = Event::new(WM_QUERYENDSESSION, ENDSESSION_LOGOFF | ENDSESSION_CRITICAL);
        let SessionEvent::QueryEndSession(flags) = event.classify() else {
            panic!("expected an end-session query");
        };
        assert!(flags.logoff());
        assert!(flags.critical());
        assert!(!flags.close_app());
        assert!(event.is_query_end_session());
    }

    #[test]
    fn test_ack_token_signals_receiver() {
        let (token, mut rx) = AckToken::pair();
        token.ack();
        assert_eq!(rx.try_recv(), Ok(()));
    }

    #[test]
    fn test_dropped_ack_token_closes_receiver() {
        let (token, mut rx) = AckToken::pair();
        drop(token);
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_event_serializes_as_json() {
        let json = serde_json::to_string(&Event::new(0x2B1, 0x7)).unwrap();
        assert_eq!(json, r#"{"kind":689,"parameter":7}"#);

        let json = serde_json::to_value(SessionEvent::Change(SessionChange::Lock)).unwrap();
        assert_eq!(json["type"], "change");
    }
}
