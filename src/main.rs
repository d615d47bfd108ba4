//! sessionwatch - prints session change notifications as JSON lines.
//!
//! Environment:
//! - `RUST_LOG`: log filter (default `sessionwatch=info`)
//! - `SESSIONWATCH_ACK_TIMEOUT_MS`: give up waiting for an ack after this long
//! - `SESSIONWATCH_FIRE_AND_FORGET`: set to `1` to disable ack gating

use sessionwatch::{DeliveryMode, RelayConfig};
use std::time::Duration;

/// Builds the relay configuration from environment values.
fn relay_config(ack_timeout_ms: Option<String>, fire_and_forget: Option<String>) -> RelayConfig {
    let mut config = RelayConfig::default();

    if let Some(raw) = ack_timeout_ms {
        match raw.trim().parse::<u64>() {
            Ok(ms) => config = config.with_ack_timeout(Duration::from_millis(ms)),
            Err(e) => tracing::warn!(value = %raw, ?e, "Ignoring invalid SESSIONWATCH_ACK_TIMEOUT_MS"),
        }
    }

    if matches!(fire_and_forget.as_deref().map(str::trim), Some("1" | "true" | "yes")) {
        config = config.with_delivery(DeliveryMode::FireAndForget);
    }

    config
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sessionwatch=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(windows)]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use sessionwatch::subscribe_session_notifications;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    init_logging();

    let config = relay_config(
        std::env::var("SESSIONWATCH_ACK_TIMEOUT_MS").ok(),
        std::env::var("SESSIONWATCH_FIRE_AND_FORGET").ok(),
    );
    tracing::info!(?config, "Starting session watch");

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let subscription = subscribe_session_notifications(tx, config)?;
    let subscription = Arc::new(Mutex::new(Some(subscription)));

    // Closing the subscription closes the queue, which ends the loop below.
    let on_ctrlc = Arc::clone(&subscription);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received");
        let taken = on_ctrlc.lock().ok().and_then(|mut guard| guard.take());
        if let Some(subscription) = taken {
            match subscription.close() {
                Ok(()) => tracing::info!("Unsubscribed"),
                Err(e) => tracing::error!(error = %e, "Teardown failed"),
            }
        }
    })?;

    while let Some(notification) = rx.blocking_recv() {
        let event = notification.event;
        let classified = event.classify();

        tracing::info!(
            kind = event.kind,
            parameter = event.parameter,
            event = ?classified,
            "Session event"
        );

        let line = serde_json::json!({
            "event": classified,
            "raw": event,
            "received_at": notification.received_at.to_rfc3339(),
        });
        println!("{}", line);

        if event.is_query_end_session() {
            // Make sure the line is out before the session ends.
            let _ = std::io::stdout().flush();
        }

        notification.ack.ack();
    }

    tracing::info!("Session watch exited");
    Ok(())
}

#[cfg(not(windows))]
fn main() {
    init_logging();
    let config = relay_config(None, None);
    tracing::error!(?config, "Session notifications are only available on Windows");
    std::process::exit(1);
}
