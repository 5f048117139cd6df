//! TCP listener and accept loop.
//!
//! One listener per port, each bound to a single [`Protocol`]. Every accepted
//! connection is handled on its own task; the loop itself never waits on them.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info, Instrument};

use super::handler::{Protocol, ProxyHandler};

/// Pause after a failed accept so persistent errors don't spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener for one protocol.
pub struct Listener {
    listener: TcpListener,
    protocol: Protocol,
    handler: Arc<ProxyHandler>,
}

impl Listener {
    /// Bind `bind_addr`. Failing here is the one process-fatal error.
    pub async fn bind(
        bind_addr: SocketAddr,
        protocol: Protocol,
        handler: Arc<ProxyHandler>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            protocol = protocol.as_str(),
            "Listener bound"
        );

        Ok(Self {
            listener,
            protocol,
            handler,
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever.
    pub async fn run(self) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            bind_addr = %local_addr,
            protocol = self.protocol.as_str(),
            "Started proxy"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.handler
                        .stats()
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);

                    let handler = Arc::clone(&self.handler);
                    let protocol = self.protocol;

                    tokio::spawn(
                        async move {
                            handler.handle(protocol, stream).await;
                        }
                        .instrument(tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            protocol = protocol.as_str()
                        )),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }
}
