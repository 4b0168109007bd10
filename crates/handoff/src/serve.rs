//! The transport seam: what the coordinator needs from a server.

use std::future::Future;
use std::io;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// A server that can run an accept loop on a listener it is given.
///
/// `serve` runs until the listener is closed or a fatal error occurs. Once
/// `shutdown` is cancelled it must stop accepting and resolve after its
/// in-flight work completes. The coordinator bounds that wait by the grace
/// period and aborts the future if it is exceeded.
pub trait Serve: Send + 'static {
    fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> impl Future<Output = io::Result<()>> + Send + 'static;
}

impl<F, Fut> Serve for F
where
    F: FnOnce(TcpListener, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = io::Result<()>> + Send + 'static,
{
    fn serve(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> impl Future<Output = io::Result<()>> + Send + 'static {
        self(listener, shutdown)
    }
}
