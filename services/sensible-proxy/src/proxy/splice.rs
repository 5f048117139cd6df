//! Bidirectional byte relay between client and upstream.
//!
//! Each direction runs as its own task and nobody waits on them. When a
//! direction sees EOF or an error it shuts its destination down and tells the
//! other direction to stop, so both sockets are dropped together.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, Instrument};

use super::stats::ActiveConnection;
use crate::access_log::AccessLog;
use crate::error::{is_peer_disconnect, ProxyError};

/// Start relaying between the client halves and `upstream`. Returns at once.
pub fn splice<R, W>(
    client_read: R,
    client_write: W,
    upstream: TcpStream,
    log: Arc<AccessLog>,
    active: Arc<ActiveConnection>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (upstream_read, upstream_write) = upstream.into_split();
    let closed = Arc::new(Notify::new());

    tokio::spawn(
        copy_and_close(
            client_read,
            upstream_write,
            Arc::clone(&log),
            Arc::clone(&active),
            Arc::clone(&closed),
        )
        .instrument(tracing::debug_span!("relay", direction = "upstream")),
    );
    tokio::spawn(
        copy_and_close(upstream_read, client_write, log, active, closed)
            .instrument(tracing::debug_span!("relay", direction = "downstream")),
    );
}

/// Copy `src` into `dst` until EOF, error or `closed` fires, then shut `dst`
/// down and fire `closed` for the other direction.
async fn copy_and_close<R, W>(
    mut src: R,
    mut dst: W,
    log: Arc<AccessLog>,
    _active: Arc<ActiveConnection>,
    closed: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy(&mut src, &mut dst) => match result {
            Ok(bytes) => debug!(bytes, "Relay finished"),
            // Either side may hang up whenever it likes.
            Err(e) if is_peer_disconnect(&e) => debug!(error = %e, "Relay ended by peer"),
            Err(e) => log.error(
                &ProxyError::network("Error during copy between connections", e).to_string(),
                "",
                None,
            ),
        },
        _ = closed.notified() => debug!("Relay closed by the other direction"),
    }

    if let Err(e) = dst.shutdown().await {
        if !is_peer_disconnect(&e) {
            log.debug(&ProxyError::Resource(e).to_string(), "", None);
        }
    }

    // Stores a permit if the other direction is not waiting yet.
    closed.notify_one();
}
