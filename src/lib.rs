//! virtlink - agentless remote hypervisor sessions
//!
//! Pooled SSH connections to hypervisor hosts, a WebSocket bridge for
//! terminal and VNC consoles, and an offline VM migration relay.

pub mod bridge;
pub mod config;
pub mod ssh;
pub mod vm;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Calling it twice is harmless; the second call leaves the first subscriber.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
