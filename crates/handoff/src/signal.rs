//! OS signal conventions.
//!
//! - `SIGTERM` / `SIGINT` → graceful stop
//! - `SIGQUIT` / `SIGHUP` → graceful restart

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

/// Signal indicating why shutdown was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Drain and exit.
    Terminate,
    /// Hand the listeners to a new generation, then drain and exit.
    Restart,
}

/// Registered handlers for the stop and restart signals.
pub struct SignalListener {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
    sighup: Signal,
}

impl SignalListener {
    /// Install the handlers. Must be called from within a Tokio runtime.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigquit: signal(SignalKind::quit())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next stop or restart signal.
    pub async fn recv(&mut self) -> ShutdownSignal {
        tokio::select! {
            _ = self.sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = self.sigint.recv() => {
                info!("Received SIGINT, initiating graceful shutdown");
                ShutdownSignal::Terminate
            }
            _ = self.sigquit.recv() => {
                info!("Received SIGQUIT, initiating graceful restart");
                ShutdownSignal::Restart
            }
            _ = self.sighup.recv() => {
                info!("Received SIGHUP, initiating graceful restart");
                ShutdownSignal::Restart
            }
        }
    }
}
