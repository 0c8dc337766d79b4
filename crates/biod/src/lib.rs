//! Biometric Authentication Daemon
//!
//! Wires the fingerprint engine and the face pipeline behind one
//! service facade and exposes it to local PAM callers over a Unix
//! socket.

pub mod config;
pub mod ipc;
mod service;

pub use config::DaemonConfig;
pub use service::{BiometricsService, ServiceError, ServiceEvent};

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Initialize logging
pub fn init_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
