//! Serving side of a generation: one axum server per acquired listener.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use handoff::{Generation, Serve};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::routes::{self, AppState};

/// Runs an axum router until the coordinator cancels `shutdown`, then lets
/// in-flight requests finish.
pub struct HttpService {
    router: Router,
}

impl HttpService {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

impl Serve for HttpService {
    fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> impl Future<Output = io::Result<()>> + Send + 'static {
        async move {
            axum::serve(listener, self.router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    }
}

/// Serve every listener until a stop or restart drains this generation.
pub async fn run(generation: Generation, listeners: Vec<(String, TcpListener)>, sleep: Duration) -> Result<()> {
    let coordinator = generation.coordinator();
    let signals = coordinator
        .handle_signals()
        .context("failed to install signal handlers")?;

    let state = Arc::new(AppState::new(coordinator.clone(), generation.is_warm(), sleep));
    for (name, listener) in listeners {
        coordinator.start(name, listener, HttpService::new(routes::router(state.clone())));
    }

    info!(
        pid = std::process::id(),
        servers = coordinator.active_servers(),
        warm = generation.is_warm(),
        "Generation serving"
    );

    let result = coordinator.wait().await;
    signals.abort();
    result.context("generation did not shut down cleanly")?;

    info!(pid = std::process::id(), "Generation drained");
    Ok(())
}
