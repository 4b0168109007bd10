//! Lifecycle coordinator.
//!
//! Each server started through [`Coordinator::start`] runs as two tasks: the
//! accept loop and a watcher. The watcher waits for the stop broadcast or
//! for the accept loop to end, then drains the server within the grace
//! period and leaves the join barrier. Per server the states are
//! `Starting → Serving → Draining → Stopped`.
//!
//! The stop broadcast is a `CancellationToken`, so a watcher that starts
//! after the broadcast still observes it. The stop flag is a
//! compare-and-swap; only the first [`Coordinator::request_stop`] caller
//! broadcasts, and every caller waits for the same drained state.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HandoffError, Result};
use crate::serve::Serve;
use crate::signal::{ShutdownSignal, SignalListener};

/// Lifecycle state of one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServerState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Starting => write!(f, "starting"),
            ServerState::Serving => write!(f, "serving"),
            ServerState::Draining => write!(f, "draining"),
            ServerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of one server as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub name: String,
    pub addr: Option<SocketAddr>,
    pub state: ServerState,
    /// Times the server entered `Draining`; at most one.
    pub drains: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Drained,
    TimedOut,
    Failed(String),
}

struct ServerSlot {
    name: String,
    addr: Option<SocketAddr>,
    state: Mutex<ServerState>,
    drains: AtomicUsize,
    outcome: Mutex<Option<Outcome>>,
}

impl ServerSlot {
    fn new(name: String, addr: Option<SocketAddr>) -> Self {
        Self {
            name,
            addr,
            state: Mutex::new(ServerState::Starting),
            drains: AtomicUsize::new(0),
            outcome: Mutex::new(None),
        }
    }

    /// Move forward to `next`. States never go backwards.
    fn transition(&self, next: ServerState) {
        let mut state = lock(&self.state);
        if next <= *state {
            return;
        }
        if next == ServerState::Draining {
            self.drains.fetch_add(1, Ordering::SeqCst);
        }
        debug!(server = %self.name, from = %*state, to = %next, "Server state change");
        *state = next;
    }

    fn finish(&self, outcome: Outcome) {
        *lock(&self.outcome) = Some(outcome);
        self.transition(ServerState::Stopped);
    }

    fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name.clone(),
            addr: self.addr,
            state: *lock(&self.state),
            drains: self.drains.load(Ordering::SeqCst),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counts in-flight supervising tasks.
///
/// Each member holds a [`BarrierGuard`]; [`JoinBarrier::wait`] resolves once
/// every guard has dropped.
#[derive(Clone, Default)]
pub(crate) struct JoinBarrier {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

pub(crate) struct BarrierGuard {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.notify.notify_waiters();
        }
    }
}

impl JoinBarrier {
    pub(crate) fn enter(&self) -> BarrierGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        BarrierGuard {
            count: Arc::clone(&self.count),
            notify: Arc::clone(&self.notify),
        }
    }

    pub(crate) fn active(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait(&self) {
        loop {
            // Register interest before checking so a wakeup between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Owns the stop broadcast and the join barrier for one process generation.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    stop: CancellationToken,
    stopping: AtomicBool,
    barrier: JoinBarrier,
    grace_period: Duration,
    supervised: bool,
    servers: Mutex<Vec<Arc<ServerSlot>>>,
}

impl Coordinator {
    /// `supervised` is true when a parent respawn loop is waiting on this
    /// process's exit, i.e. the listeners were inherited.
    pub fn new(grace_period: Duration, supervised: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                stop: CancellationToken::new(),
                stopping: AtomicBool::new(false),
                barrier: JoinBarrier::default(),
                grace_period,
                supervised,
                servers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.inner.grace_period
    }

    pub fn is_supervised(&self) -> bool {
        self.inner.supervised
    }

    /// Whether a stop has been requested.
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// A token cancelled when the stop broadcast fires.
    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    /// Number of servers not yet `Stopped`.
    pub fn active_servers(&self) -> usize {
        self.inner.barrier.active()
    }

    pub fn servers(&self) -> Vec<ServerStatus> {
        lock(&self.inner.servers).iter().map(|s| s.status()).collect()
    }

    /// Start serving `listener` with `service`.
    ///
    /// The server joins the barrier before this returns, so a stop requested
    /// afterwards always waits for it. Must be called from within a Tokio
    /// runtime.
    pub fn start<S: Serve>(&self, name: impl Into<String>, listener: TcpListener, service: S) {
        let name = name.into();
        let addr = listener.local_addr().ok();
        let slot = Arc::new(ServerSlot::new(name, addr));
        lock(&self.inner.servers).push(Arc::clone(&slot));
        let guard = self.inner.barrier.enter();

        let server_shutdown = CancellationToken::new();
        let accept = tokio::spawn(service.serve(listener, server_shutdown.clone()));
        slot.transition(ServerState::Serving);
        info!(server = %slot.name, addr = ?addr, "Server started");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _guard = guard;
            inner.supervise(&slot, accept, server_shutdown).await;
        });
    }

    /// Stop every server and wait until all are `Stopped`.
    ///
    /// Idempotent: only the first call broadcasts. Every caller waits for the
    /// barrier and gets the same result: `ShutdownTimeout` if any server
    /// outlived the grace period, `Serve` if an accept loop failed.
    pub async fn request_stop(&self) -> Result<()> {
        if self.inner.begin_stop() {
            info!(
                servers = self.active_servers(),
                grace_period = ?self.inner.grace_period,
                "Stopping servers"
            );
        }
        self.inner.barrier.wait().await;
        self.inner.summary()
    }

    /// Restart this generation.
    ///
    /// Under a respawn loop this is a stop: the parent spawns the next
    /// generation once this process exits. Without a parent there is nothing
    /// to hand the listeners to and the request is ignored (`Ok(false)`).
    pub async fn request_restart(&self) -> Result<bool> {
        if !self.inner.supervised {
            warn!("Restart requested but no respawn loop supervises this process; ignoring");
            return Ok(false);
        }
        info!("Restart requested, draining so the parent can respawn");
        self.request_stop().await?;
        Ok(true)
    }

    /// Block until a stop has been broadcast and every server has stopped.
    pub async fn wait(&self) -> Result<()> {
        self.inner.stop.cancelled().await;
        self.inner.barrier.wait().await;
        self.inner.summary()
    }

    /// Route OS signals to [`Coordinator::request_stop`] and
    /// [`Coordinator::request_restart`].
    pub fn handle_signals(&self) -> io::Result<JoinHandle<()>> {
        let mut signals = SignalListener::new()?;
        let coordinator = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let stopping = match signals.recv().await {
                    ShutdownSignal::Terminate => coordinator.request_stop().await.map(|()| true),
                    ShutdownSignal::Restart => coordinator.request_restart().await,
                };
                match stopping {
                    Ok(false) => continue,
                    Ok(true) => break,
                    Err(e) => {
                        error!(error = %e, "Shutdown finished with errors");
                        break;
                    }
                }
            }
        }))
    }
}

impl Inner {
    /// Set the stop flag and broadcast. Returns true for the first caller only.
    fn begin_stop(&self) -> bool {
        let first = self
            .stopping
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if first {
            self.stop.cancel();
        }
        first
    }

    async fn supervise(
        &self,
        slot: &ServerSlot,
        mut accept: JoinHandle<io::Result<()>>,
        server_shutdown: CancellationToken,
    ) {
        let ended = tokio::select! {
            _ = self.stop.cancelled() => None,
            result = &mut accept => Some(result),
        };

        slot.transition(ServerState::Draining);

        let outcome = match ended {
            Some(result) => {
                // The accept loop ended without being asked to. The registry
                // cannot be rebuilt for one server, so take the process down.
                let outcome = outcome_of(result);
                match &outcome {
                    Outcome::Failed(message) => {
                        error!(server = %slot.name, error = %message, "Accept loop failed, stopping process")
                    }
                    _ => warn!(server = %slot.name, "Accept loop exited unexpectedly, stopping process"),
                }
                self.begin_stop();
                outcome
            }
            None => {
                info!(server = %slot.name, "Draining server");
                server_shutdown.cancel();
                match tokio::time::timeout(self.grace_period, &mut accept).await {
                    Ok(result) => outcome_of(result),
                    Err(_) => {
                        warn!(
                            server = %slot.name,
                            timeout_secs = self.grace_period.as_secs_f64(),
                            "Drain timeout expired, aborting in-flight work"
                        );
                        accept.abort();
                        Outcome::TimedOut
                    }
                }
            }
        };

        if outcome == Outcome::Drained {
            info!(server = %slot.name, "Server drained cleanly");
        }
        slot.finish(outcome);
    }

    fn summary(&self) -> Result<()> {
        let servers = lock(&self.servers);

        for slot in servers.iter() {
            if let Some(Outcome::Failed(message)) = lock(&slot.outcome).as_ref() {
                return Err(HandoffError::Serve {
                    name: slot.name.clone(),
                    addr: slot.addr,
                    message: message.clone(),
                });
            }
        }

        let timed_out: Vec<String> = servers
            .iter()
            .filter(|slot| lock(&slot.outcome).as_ref() == Some(&Outcome::TimedOut))
            .map(|slot| slot.name.clone())
            .collect();
        if !timed_out.is_empty() {
            return Err(HandoffError::ShutdownTimeout {
                servers: timed_out,
                grace: self.grace_period,
            });
        }

        Ok(())
    }
}

fn outcome_of(result: std::result::Result<io::Result<()>, JoinError>) -> Outcome {
    match result {
        Ok(Ok(())) => Outcome::Drained,
        Ok(Err(e)) => Outcome::Failed(e.to_string()),
        Err(e) => Outcome::Failed(format!("accept task failed: {e}")),
    }
}
