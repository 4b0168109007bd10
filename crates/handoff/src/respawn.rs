//! Respawn loop.
//!
//! The top-level process keeps every registered listener open and runs the
//! current binary as a child generation, passing the listeners at fds 3..N
//! and their indices in the environment. When the child exits the loop
//! spawns the next one, until a stop is requested. Because the parent holds
//! the sockets throughout, connections that arrive between generations wait
//! in the kernel backlog instead of being refused.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::LISTEN_FDS_START;
use crate::error::{HandoffError, Result};
use crate::generation::Generation;
use crate::signal::{ShutdownSignal, SignalListener};

/// Exit code of a child generation whose inherited listeners do not match
/// the ones it asks for (`EX_CONFIG`). The respawn loop ends instead of
/// retrying.
pub const DEPLOYMENT_MISMATCH_EXIT_CODE: i32 = 78;

/// Lowest fd used for the temporary duplicates made before spawning.
const TEMP_FD_FLOOR: RawFd = 100;

/// Absolute path of the running executable, as reported by the OS
/// (`/proc/self/exe` on Linux). Resolve it once at startup, before the
/// binary on disk can be replaced by a new version.
pub fn self_executable() -> io::Result<PathBuf> {
    std::env::current_exe()
}

/// Stop and restart requests for a running [`Supervisor`].
#[derive(Clone, Default)]
pub struct SupervisorHandle {
    control: Arc<Control>,
}

#[derive(Default)]
struct Control {
    stop: CancellationToken,
    restart: AtomicBool,
    restart_notify: Notify,
}

impl SupervisorHandle {
    /// End the loop: the live child gets `SIGTERM` and is not respawned.
    pub fn stop(&self) {
        self.control.stop.cancel();
    }

    /// Replace the live child: it gets `SIGTERM` and the loop spawns the
    /// next generation when it exits.
    ///
    /// The request is a level-triggered flag. Requests made while a respawn
    /// is already in flight have no additional effect.
    pub fn restart(&self) {
        self.control.restart.store(true, Ordering::SeqCst);
        self.control.restart_notify.notify_one();
    }

    pub fn is_stopping(&self) -> bool {
        self.control.stop.is_cancelled()
    }
}

/// Runs successive child generations of one binary.
pub struct Supervisor {
    generation: Generation,
    exe: PathBuf,
    args: Vec<OsString>,
    handle: SupervisorHandle,
}

impl Supervisor {
    /// Supervise `exe`, replaying the generation's original arguments.
    pub fn new(generation: Generation, exe: impl Into<PathBuf>) -> Self {
        let args = generation.args().to_vec();
        Self {
            generation,
            exe: exe.into(),
            args,
            handle: SupervisorHandle::default(),
        }
    }

    pub fn with_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    /// Route `SIGTERM`/`SIGINT` to [`SupervisorHandle::stop`] and
    /// `SIGQUIT`/`SIGHUP` to [`SupervisorHandle::restart`].
    pub fn handle_signals(&self) -> io::Result<JoinHandle<()>> {
        let mut signals = SignalListener::new()?;
        let handle = self.handle();
        Ok(tokio::spawn(async move {
            loop {
                match signals.recv().await {
                    ShutdownSignal::Terminate => {
                        handle.stop();
                        break;
                    }
                    ShutdownSignal::Restart => handle.restart(),
                }
            }
        }))
    }

    /// Spawn one child generation carrying every registered listener.
    ///
    /// 1. Dups each registered fd to a temporary slot above the target range
    ///    (so placing one cannot clobber another), close-on-exec set
    /// 2. In the child, before exec, `dup2`s temporary slot `i` onto fd `3 + i`,
    ///    which clears close-on-exec on the target
    /// 3. Replaces the environment with system variables plus fresh indices
    pub fn spawn_generation(&self) -> Result<Child> {
        let spawn_error = |source: io::Error| HandoffError::Spawn {
            exe: self.exe.clone(),
            source,
        };

        let entries = self.generation.registry().all();
        let floor = TEMP_FD_FLOOR.max(LISTEN_FDS_START + entries.len() as RawFd);
        let temps: Vec<OwnedFd> = entries
            .iter()
            .map(|entry| dup_above(entry.raw_fd(), floor))
            .collect::<io::Result<_>>()
            .map_err(spawn_error)?;
        let sources: Vec<RawFd> = temps.iter().map(AsRawFd::as_raw_fd).collect();

        let mut command = Command::new(&self.exe);
        command
            .args(&self.args)
            .env_clear()
            .envs(self.generation.child_env());

        // SAFETY: the closure only calls dup2, which is async-signal-safe, on
        // descriptors that stay open in the parent until spawn returns.
        unsafe {
            command.pre_exec(move || {
                for (i, &source) in sources.iter().enumerate() {
                    let target = LISTEN_FDS_START + i as RawFd;
                    if libc::dup2(source, target) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(spawn_error)?;
        drop(temps);

        debug!(
            pid = child.id(),
            fds = ?(0..entries.len()).map(|i| LISTEN_FDS_START + i as RawFd).collect::<Vec<_>>(),
            names = ?entries.iter().map(|e| e.name()).collect::<Vec<_>>(),
            "Passed listeners to child"
        );
        Ok(child)
    }

    /// Run generations until stopped; returns the last child's exit status.
    ///
    /// A spawn failure ends the loop with [`HandoffError::Spawn`]: without a
    /// runnable child there is nothing to hand the listeners to. A child
    /// exiting with [`DEPLOYMENT_MISMATCH_EXIT_CODE`] ends it with
    /// [`HandoffError::DeploymentMismatch`]. Other failed exits are respawned
    /// after the configured backoff.
    pub async fn run(self) -> Result<ExitStatus> {
        info!(
            exe = %self.exe.display(),
            args = ?self.args,
            listeners = self.generation.registry().len(),
            "Starting respawn loop"
        );

        let control = &self.handle.control;
        let mut generation: u64 = 0;

        loop {
            // Requests made before this spawn are satisfied by it.
            control.restart.store(false, Ordering::SeqCst);

            let mut child = self.spawn_generation()?;
            generation += 1;
            let pid = child.id();
            info!(pid, generation, "Spawned child generation");

            let mut stop_sent = false;
            let mut restart_sent = false;
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status?,
                    _ = control.stop.cancelled(), if !stop_sent => {
                        info!(pid, "Stopping child generation");
                        terminate(&child);
                        stop_sent = true;
                    }
                    _ = control.restart_notify.notified(), if !stop_sent && !restart_sent => {
                        if control.restart.swap(false, Ordering::SeqCst) {
                            info!(pid, "Restarting child generation");
                            terminate(&child);
                            restart_sent = true;
                        }
                    }
                }
            };

            if control.stop.is_cancelled() {
                info!(pid, %status, "Child exited, respawn loop stopped");
                return Ok(status);
            }

            if !restart_sent && status.code() == Some(DEPLOYMENT_MISMATCH_EXIT_CODE) {
                error!(pid, %status, "Child rejected the inherited listeners, ending respawn loop");
                return Err(HandoffError::DeploymentMismatch { status });
            }

            if status.success() || restart_sent {
                info!(pid, %status, "Child exited, respawning");
                continue;
            }

            let backoff = self.generation.config().respawn_backoff;
            warn!(pid, %status, backoff_ms = backoff.as_millis() as u64, "Child failed, respawning after backoff");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = control.stop.cancelled() => {
                    info!("Respawn loop stopped during backoff");
                    return Ok(status);
                }
            }
        }
    }
}

/// Run the respawn loop for `exe` with `args`, wiring OS signals to it.
pub async fn run_supervised<I>(generation: Generation, exe: impl Into<PathBuf>, args: I) -> Result<ExitStatus>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    let supervisor = Supervisor::new(generation, exe).with_args(args);
    let signals = supervisor.handle_signals()?;
    let result = supervisor.run().await;
    signals.abort();
    if let Err(e) = &result {
        error!(error = %e, "Respawn loop terminated");
    }
    result
}

/// Duplicate `fd` to the lowest free slot >= `floor`, with close-on-exec.
fn dup_above(fd: RawFd, floor: RawFd) -> io::Result<OwnedFd> {
    let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, floor) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned this fresh descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(dup) })
}

fn terminate(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
        warn!(pid, error = %io::Error::last_os_error(), "Failed to signal child");
    }
}
