//! # handoff
//!
//! Hot restart for network services: replace a running process with a new
//! version of itself without closing its listening sockets.
//!
//! ## Overview
//!
//! 1. At startup every listener is acquired through [`Startup::acquire`]:
//!    bound fresh on a cold start, or adopted from an inherited fd on a warm
//!    start. Each one is recorded in a named descriptor registry.
//! 2. The top-level process runs a [`Supervisor`], which spawns the current
//!    binary as a child, passing every registered listener at fds 3..N and
//!    `<prefix><name>_idx=<index>` environment variables naming them.
//! 3. The child serves through a [`Coordinator`]. A restart request drains
//!    its connections within a grace period and exits; the supervisor then
//!    spawns the next generation on the same sockets.
//!
//! Generations do not overlap. The next child is spawned only after the
//! previous one has exited, which can take up to the grace period. The
//! sockets stay open in the supervisor throughout, so new connections are
//! never refused; they queue in the kernel backlog until the next
//! generation starts accepting.
//!
//! A child that cannot find its listeners among the inherited ones should
//! exit with [`DEPLOYMENT_MISMATCH_EXIT_CODE`]. The supervisor then gives up
//! instead of respawning the same mismatched binary.
//!
//! ## Signal Conventions
//!
//! - `SIGTERM` / `SIGINT`: graceful stop (drain connections, then exit)
//! - `SIGQUIT` / `SIGHUP`: graceful restart (drain, exit, parent respawns)
//!
//! ## Environment Variables
//!
//! - `<prefix><name>_idx`: handoff index of listener `name` (fd = index + 3);
//!   the default prefix is `__graceful__`
//! - `HANDOFF_DRAIN_TIMEOUT_SECS`: drain grace period in seconds (default: 30)
//! - `HANDOFF_RESPAWN_BACKOFF_MS`: delay before respawning a failed child (default: 1000)
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("handoff requires a Unix platform (Linux or macOS)");

mod codec;
mod config;
mod error;
mod generation;
mod listener;
mod registry;
mod respawn;
mod serve;
mod shutdown;
mod signal;

pub use codec::{encode, idx_key, HandoffEnv, IDX_SUFFIX, LISTEN_FDS_START};
pub use config::{HandoffConfig, DEFAULT_DRAIN_TIMEOUT_SECS, DEFAULT_ENV_PREFIX, DEFAULT_RESPAWN_BACKOFF_MS};
pub use error::{HandoffError, Result};
pub use generation::{Generation, Startup};
pub use listener::Network;
pub use registry::{DescriptorEntry, DescriptorKind, Registry, RegistryBuilder};
pub use respawn::{
    run_supervised, self_executable, Supervisor, SupervisorHandle, DEPLOYMENT_MISMATCH_EXIT_CODE,
};
pub use serve::Serve;
pub use shutdown::{Coordinator, ServerState, ServerStatus};
pub use signal::{ShutdownSignal, SignalListener};
