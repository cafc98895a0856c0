//! Primary listener accept loop and signal handling.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{error, info, warn};

/// Bound on draining a connection after shutdown is signalled.
pub const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Accept connections on `listener` until `shutdown` is cancelled.
///
/// Each connection is served with HTTP/1.1 or cleartext HTTP/2 (prior
/// knowledge) by `service`. Accept errors are logged and the loop keeps going.
/// After cancellation, open connections get [`CONNECTION_DRAIN_TIMEOUT`] to
/// finish their in-flight requests before this returns.
pub async fn serve<S, B>(listener: TcpListener, service: S, shutdown: CancellationToken)
where
    S: tower::Service<http::Request<Body>, Response = http::Response<B>, Error = std::convert::Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Primary listener serving");
    }

    let connections = TaskTracker::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let service = service.clone();
                        let conn_shutdown = shutdown.clone();
                        connections.spawn(async move {
                            handle_connection(stream, peer_addr, service, conn_shutdown).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    drop(listener);
    connections.close();
    info!(open = connections.len(), "Draining connections");
    if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, connections.wait()).await.is_err() {
        warn!(open = connections.len(), "Connections still open after drain timeout");
    }
}

async fn handle_connection<S, B>(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: S,
    shutdown: CancellationToken,
) where
    S: tower::Service<http::Request<Body>, Response = http::Response<B>, Error = std::convert::Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    B: hyper::body::Body<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req: http::Request<Incoming>| {
        service.clone().oneshot(req.map(Body::new))
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(io, svc_fn);

    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, conn).await.is_err() {
                warn!(peer = %peer_addr, "Connection did not drain in time");
            }
        }
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
pub fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating shutdown");
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        let shutdown_sigterm = shutdown;
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown_sigterm.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }
}
