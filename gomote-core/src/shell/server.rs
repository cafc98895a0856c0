//! Shell listener accept loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::ShellCredentials;
use crate::remote::SessionPool;

/// Identification string sent before the connection is dropped.
const SSH_IDENT: &[u8] = b"SSH-2.0-gomote\r\n";

/// Runs the SSH protocol on an accepted connection.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// Serve one client connection until it ends.
    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        credentials: Arc<ShellCredentials>,
    );
}

/// Handler used when no SSH protocol engine is wired in.
///
/// Announces itself, logs the attempt, and closes the connection.
pub struct DisconnectingSessionHandler {
    pool: Arc<SessionPool>,
}

impl DisconnectingSessionHandler {
    /// Handler reporting against `pool`.
    #[must_use]
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionHandler for DisconnectingSessionHandler {
    async fn handle(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        _credentials: Arc<ShellCredentials>,
    ) {
        tracing::info!(
            peer = %peer,
            active_sessions = self.pool.len(),
            "SSH connection refused: no session engine configured"
        );
        if let Err(e) = stream.write_all(SSH_IDENT).await {
            tracing::debug!(peer = %peer, error = %e, "Failed to write SSH identification");
        }
        let _ = stream.shutdown().await;
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Accept connections until cancelled or the listener fails.
///
/// Returns `Ok(())` on cancellation. Open sessions are aborted before
/// returning either way.
pub(crate) async fn serve(
    listener: TcpListener,
    credentials: Arc<ShellCredentials>,
    handler: Arc<dyn SessionHandler>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut sessions = JoinSet::new();

    let result = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "SSH connection accepted");
                    let handler = handler.clone();
                    let credentials = credentials.clone();
                    sessions.spawn(async move {
                        handler.handle(stream, peer, credentials).await;
                    });
                }
                Err(e) if is_transient(&e) => {
                    tracing::warn!(error = %e, "Failed to accept SSH connection");
                }
                Err(e) => break Err(e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            _ = shutdown.cancelled() => break Ok(()),
        }
    };

    if !sessions.is_empty() {
        tracing::info!(open_sessions = sessions.len(), "Aborting open SSH sessions");
    }
    sessions.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::{CertificateAuthority, ShellKeyPair};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl SessionHandler for Counting {
        async fn handle(&self, _: TcpStream, _: SocketAddr, _: Arc<ShellCredentials>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn credentials() -> Arc<ShellCredentials> {
        Arc::new(ShellCredentials {
            host: ShellKeyPair::generate().unwrap(),
            ca: Arc::new(CertificateAuthority::generate().unwrap()),
            ephemeral: true,
        })
    }

    #[tokio::test]
    async fn test_connections_reach_handler_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(serve(
            listener,
            credentials(),
            counting.clone(),
            shutdown.clone(),
        ));

        for _ in 0..3 {
            TcpStream::connect(addr).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while counting.0.load(Ordering::SeqCst) < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
