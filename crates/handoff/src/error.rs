//! Error taxonomy for the handoff protocol.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Result alias used throughout the crate.
pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

/// Errors raised while registering, acquiring, handing off or draining listeners.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// A listener with this name was already registered in this generation.
    #[error("listener '{name}' is already registered")]
    DuplicateName { name: String },

    /// Listener names end up inside environment variable keys.
    #[error("invalid listener name {name:?}: must be non-empty and contain no '=' or NUL")]
    InvalidName { name: String },

    /// Only stream sockets over TCP can be handed off.
    #[error("unsupported network '{network}' (expected tcp, tcp4 or tcp6)")]
    UnsupportedNetwork { network: String },

    /// Cold-start bind failed (address in use, permission denied, unresolvable).
    #[error("failed to bind listener '{name}' on {address}: {source}")]
    Bind {
        name: String,
        address: String,
        #[source]
        source: io::Error,
    },

    /// No registry entry or inherited slot exists for this name.
    #[error("no listener named '{name}' (registry or inherited environment)")]
    NotFound { name: String },

    /// A protocol variable carried a value that is not a decimal index.
    #[error("malformed handoff variable {key}={value:?}: {source}")]
    HandoffDecode {
        key: String,
        value: String,
        #[source]
        source: std::num::ParseIntError,
    },

    /// The inherited slot is closed or is not a socket.
    #[error("inherited fd {fd} for listener '{name}' is not a valid socket")]
    InvalidDescriptor { name: String, fd: i32 },

    /// In-flight work outlived the grace period on at least one server.
    #[error("drain exceeded {grace:?} grace period on {servers:?}")]
    ShutdownTimeout { servers: Vec<String>, grace: Duration },

    /// The accept loop of a server ended with a fatal error.
    #[error("server '{name}' ({addr:?}) failed: {message}")]
    Serve {
        name: String,
        addr: Option<SocketAddr>,
        message: String,
    },

    /// The next generation could not be started.
    #[error("failed to spawn {}: {source}", exe.display())]
    Spawn {
        exe: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A child generation could not find its listeners among the inherited
    /// ones. Respawning the same binary would fail the same way.
    #[error("child generation rejected the inherited listeners ({status})")]
    DeploymentMismatch { status: ExitStatus },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HandoffError {
    /// Whether this error means the previous generation handed over a
    /// different listener set than this binary expects.
    pub fn is_deployment_mismatch(&self) -> bool {
        matches!(
            self,
            HandoffError::NotFound { .. }
                | HandoffError::InvalidDescriptor { .. }
                | HandoffError::DeploymentMismatch { .. }
        )
    }
}
