//! Error types for the session notification bridge.

/// Errors that can occur while setting up or tearing down a subscription.
#[derive(Debug)]
pub enum SessionError {
    /// The native event source failed to start or register for notifications.
    Registration(String),
    /// Releasing the native handle failed during teardown.
    ///
    /// The subscription is still considered closed when this is returned.
    HandleRelease(String),
    /// The relay runtime or relay thread could not be created.
    Runtime(String),
    /// The relay thread panicked before teardown completed.
    RelayPanicked,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Registration(e) => write!(f, "Registration failed: {}", e),
            SessionError::HandleRelease(e) => write!(f, "Failed to release native handle: {}", e),
            SessionError::Runtime(e) => write!(f, "Relay runtime error: {}", e),
            SessionError::RelayPanicked => write!(f, "Relay thread panicked"),
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_cause() {
        let err = SessionError::Registration("class already exists".into());
        assert_eq!(err.to_string(), "Registration failed: class already exists");

        let err = SessionError::HandleRelease("pump thread panicked".into());
        assert!(err.to_string().contains("pump thread panicked"));
    }
}
