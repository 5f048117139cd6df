//! Per-connection orchestration.
//!
//! ```text
//! sniff -> whitelist check -> dial www.<host>:<port> -> replay sniffed bytes -> splice
//! ```
//!
//! Any failure closes the client connection (and the upstream, if one was
//! opened) and writes exactly one ERROR line. A successful hand-off to the
//! relay writes exactly one ACCESS line. Nothing is retried.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::dialer::Dialer;
use super::http::sniff_host;
use super::sni::sniff_client_hello;
use super::splice::splice;
use super::stats::{ActiveConnection, ProxyStats};
use crate::access_log::AccessLog;
use crate::error::{is_peer_disconnect, ProxyError};
use crate::whitelist::WhitelistStore;

/// Prefix prepended to every sniffed hostname to form the upstream host.
pub const UPSTREAM_HOST_PREFIX: &str = "www.";

/// Default deadline for reading the HTTP head or TLS ClientHello.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_secs(30);

/// Logged when replaying the sniffed HTTP lines fails.
const HTTP_REPLAY_CONTEXT: &str = "Error while proxying initial request to backend";

/// Logged when replaying each TLS record chunk fails, in replay order.
const TLS_REPLAY_CONTEXTS: [&str; 4] = [
    "Error while proxying first byte to backend",
    "Error while proxying versionBytes to backend",
    "Error while proxying restLengthBytes to backend",
    "Error while proxying rest to backend",
];

/// SNI value that would make the proxy dial itself.
const LOOPBACK_HOSTNAME: &str = "127.0.0.1";

/// Which protocol a listener speaks, fixed per port at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Plain HTTP; hostname from the `Host: ` header.
    Http,
    /// TLS passthrough; hostname from the ClientHello SNI.
    Https,
}

impl Protocol {
    /// Port dialed on the upstream, independent of the listen port.
    pub fn upstream_port(self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

/// Upstream address for a sniffed hostname. The hostname is used verbatim.
pub fn upstream_addr(hostname: &str, protocol: Protocol) -> String {
    format!(
        "{UPSTREAM_HOST_PREFIX}{hostname}:{}",
        protocol.upstream_port()
    )
}

/// Shared, long-lived proxy state handed to every connection task.
pub struct ProxyHandler {
    whitelist: Arc<WhitelistStore>,
    log: Arc<AccessLog>,
    dialer: Arc<dyn Dialer>,
    stats: Arc<ProxyStats>,
    sniff_timeout: Option<Duration>,
}

impl ProxyHandler {
    pub fn new(
        whitelist: Arc<WhitelistStore>,
        log: Arc<AccessLog>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            whitelist,
            log,
            dialer,
            stats: Arc::new(ProxyStats::default()),
            sniff_timeout: Some(DEFAULT_SNIFF_TIMEOUT),
        }
    }

    /// Override the sniffing deadline. `None` waits indefinitely.
    pub fn with_sniff_timeout(mut self, sniff_timeout: Option<Duration>) -> Self {
        self.sniff_timeout = sniff_timeout;
        self
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn whitelist(&self) -> &Arc<WhitelistStore> {
        &self.whitelist
    }

    /// Empty whitelist allows everything; otherwise the SHA-1 must be listed.
    pub fn is_whitelisted(&self, hostname: &str) -> bool {
        self.whitelist.is_whitelisted(hostname)
    }

    /// Handle one accepted connection. Returns true when it reached the relay.
    pub async fn handle(&self, protocol: Protocol, stream: TcpStream) -> bool {
        match protocol {
            Protocol::Http => self.handle_http(stream).await,
            Protocol::Https => self.handle_tls(stream).await,
        }
    }

    /// Proxy a plain HTTP connection by its `Host: ` header.
    ///
    /// A missing Host header leaves the hostname empty and the dial of
    /// `www.:80` fails on its own.
    pub async fn handle_http(&self, stream: TcpStream) -> bool {
        let remote = stream.peer_addr().ok();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let head = match self.sniff(sniff_host(&mut reader)).await {
            Ok(head) => head,
            Err(err) => return self.reject(err, "", remote, &mut write_half).await,
        };
        debug!(hostname = %head.hostname, lines = head.lines.len(), "Host header sniffed");

        let replay = head.replay_bytes();
        let upstream = match self
            .open_upstream(
                Protocol::Http,
                &head.hostname,
                &[(HTTP_REPLAY_CONTEXT, replay.as_slice())],
            )
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => return self.reject(err, &head.hostname, remote, &mut write_half).await,
        };

        self.hand_off(reader, write_half, upstream, &head.hostname, remote)
    }

    /// Proxy a TLS connection by its ClientHello SNI without terminating TLS.
    pub async fn handle_tls(&self, stream: TcpStream) -> bool {
        let remote = stream.peer_addr().ok();
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = match self.sniff(sniff_client_hello(&mut read_half)).await {
            Ok(hello) => hello,
            Err(err) => return self.reject(err, "", remote, &mut write_half).await,
        };
        debug!(hostname = %hello.hostname, "SNI extracted");

        if hello.hostname.is_empty() || hello.hostname == LOOPBACK_HOSTNAME {
            let err = ProxyError::Policy("TLS header parsing problem - no hostname found.");
            return self
                .reject(err, &hello.hostname, remote, &mut write_half)
                .await;
        }

        let chunks = hello.record.chunks();
        let replay: Vec<(&'static str, &[u8])> =
            TLS_REPLAY_CONTEXTS.into_iter().zip(chunks).collect();
        let upstream = match self
            .open_upstream(Protocol::Https, &hello.hostname, &replay)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => {
                return self
                    .reject(err, &hello.hostname, remote, &mut write_half)
                    .await
            }
        };

        self.hand_off(read_half, write_half, upstream, &hello.hostname, remote)
    }

    /// Run a sniffer under the sniffing deadline.
    async fn sniff<T, F>(&self, sniffer: F) -> Result<T, ProxyError>
    where
        F: std::future::Future<Output = Result<T, ProxyError>>,
    {
        match self.sniff_timeout {
            Some(limit) => match timeout(limit, sniffer).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::network(
                    "Couldn't read client preamble",
                    std::io::Error::new(std::io::ErrorKind::TimedOut, "sniff timeout"),
                )),
            },
            None => sniffer.await,
        }
    }

    /// Whitelist check, dial, then write `replay` upstream chunk by chunk.
    /// Each chunk carries the phrase logged if writing it fails.
    ///
    /// On error the upstream (if any) is dropped here, which closes it.
    async fn open_upstream(
        &self,
        protocol: Protocol,
        hostname: &str,
        replay: &[(&'static str, &[u8])],
    ) -> Result<TcpStream, ProxyError> {
        if !self.is_whitelisted(hostname) {
            return Err(ProxyError::Policy("Hostname is not whitelisted"));
        }

        let addr = upstream_addr(hostname, protocol);
        let mut upstream = self
            .dialer
            .dial(&addr)
            .await
            .map_err(|e| ProxyError::network("Couldn't connect to backend", e))?;
        debug!(upstream = %addr, "Connected to backend");

        write_replay(&mut upstream, replay).await?;
        Ok(upstream)
    }

    /// Start the relay and log the access.
    fn hand_off<R>(
        &self,
        client_read: R,
        client_write: tokio::net::tcp::OwnedWriteHalf,
        upstream: TcpStream,
        hostname: &str,
        remote: Option<SocketAddr>,
    ) -> bool
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let active = ActiveConnection::start(Arc::clone(&self.stats));
        splice(
            client_read,
            client_write,
            upstream,
            Arc::clone(&self.log),
            active,
        );

        self.stats
            .connections_proxied
            .fetch_add(1, Ordering::Relaxed);
        self.log.access(hostname, remote);
        true
    }

    /// Log the failure, then close the client connection. Always false.
    async fn reject<W: AsyncWrite + Unpin>(
        &self,
        err: ProxyError,
        hostname: &str,
        remote: Option<SocketAddr>,
        client: &mut W,
    ) -> bool {
        debug!(reason = err.kind(), error = %err, "Connection rejected");
        self.log.error(&err.to_string(), hostname, remote);
        self.close(client).await;
        self.stats
            .connections_rejected
            .fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Best-effort shutdown. Failures are only worth a DEBUG line.
    async fn close<W: AsyncWrite + Unpin>(&self, conn: &mut W) {
        if let Err(e) = conn.shutdown().await {
            if !is_peer_disconnect(&e) {
                self.log.debug(&ProxyError::Resource(e).to_string(), "", None);
            }
        }
    }
}

/// Write sniffed chunks in order, stopping at the first failure.
async fn write_replay<W: AsyncWrite + Unpin>(
    upstream: &mut W,
    replay: &[(&'static str, &[u8])],
) -> Result<(), ProxyError> {
    for &(context, chunk) in replay {
        upstream
            .write_all(chunk)
            .await
            .map_err(|e| ProxyError::network(context, e))?;
    }
    Ok(())
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("log", &self.log)
            .field("stats", &self.stats)
            .field("sniff_timeout", &self.sniff_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access_log::MemorySink;
    use crate::proxy::dialer::TcpDialer;
    use crate::proxy::test_io::BrokenWriter;
    use crate::whitelist::hostname_digest;

    fn handler(whitelist: Vec<String>) -> ProxyHandler {
        ProxyHandler::new(
            Arc::new(WhitelistStore::with_entries(whitelist)),
            Arc::new(AccessLog::new(MemorySink::new(), false)),
            Arc::new(TcpDialer::default()),
        )
    }

    #[test]
    fn test_upstream_addr() {
        assert_eq!(
            upstream_addr("example.com", Protocol::Http),
            "www.example.com:80"
        );
        assert_eq!(
            upstream_addr("example.com", Protocol::Https),
            "www.example.com:443"
        );
        assert_eq!(upstream_addr("", Protocol::Http), "www.:80");
    }

    #[test]
    fn test_is_whitelisted_empty_allows_all() {
        let handler = handler(Vec::new());
        assert!(handler.is_whitelisted("example.com"));
        assert!(handler.is_whitelisted("anything.invalid"));
    }

    #[test]
    fn test_is_whitelisted_by_digest() {
        let handler = handler(vec![hostname_digest("example.com")]);
        assert!(handler.is_whitelisted("example.com"));
        assert!(!handler.is_whitelisted("other.com"));

        // Fail-open once a refresh comes back empty.
        handler.whitelist().set(Vec::new());
        assert!(handler.is_whitelisted("other.com"));
    }

    #[test]
    fn test_protocol_ports() {
        assert_eq!(Protocol::Http.upstream_port(), 80);
        assert_eq!(Protocol::Https.upstream_port(), 443);
        assert_eq!(Protocol::Https.as_str(), "https");
    }

    #[tokio::test]
    async fn test_tls_replay_failure_names_the_chunk() {
        let record: [&[u8]; 4] = [&[0x16], &[0x03, 0x01], &[0x00, 0x02], &[0x01, 0x00]];
        let replay: Vec<(&'static str, &[u8])> =
            TLS_REPLAY_CONTEXTS.into_iter().zip(record).collect();

        // Room for the first byte only.
        let mut upstream = BrokenWriter::with_budget(1);
        let err = write_replay(&mut upstream, &replay).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Error while proxying versionBytes to backend: write refused"
        );
        assert_eq!(upstream.written, vec![0x16]);

        let mut upstream = BrokenWriter::with_budget(5);
        let err = write_replay(&mut upstream, &replay).await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Error while proxying rest to backend"));

        let mut upstream = BrokenWriter::with_budget(7);
        write_replay(&mut upstream, &replay).await.unwrap();
        assert_eq!(upstream.written, [0x16, 0x03, 0x01, 0x00, 0x02, 0x01, 0x00]);
    }

    #[tokio::test]
    async fn test_http_replay_failure() {
        let mut upstream = BrokenWriter::with_budget(0);
        let err = write_replay(&mut upstream, &[(HTTP_REPLAY_CONTEXT, &b"GET / HTTP/1.0\n"[..])])
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("Error while proxying initial request to backend"));
        assert_eq!(err.kind(), "network_error");
    }

    #[tokio::test]
    async fn test_reject_logs_close_failure_at_debug() {
        let sink = MemorySink::new();
        let handler = ProxyHandler::new(
            Arc::new(WhitelistStore::new()),
            Arc::new(AccessLog::new(sink.clone(), true)),
            Arc::new(TcpDialer::default()),
        );

        let mut client = BrokenWriter::default();
        let proxied = handler
            .reject(
                ProxyError::Policy("Hostname is not whitelisted"),
                "example.com",
                None,
                &mut client,
            )
            .await;

        assert!(!proxied);
        let contents = sink.contents();
        assert!(contents.contains(" example.com ERROR: Hostname is not whitelisted"));
        assert!(contents.contains(" - - DEBUG: Error when closing connection: shutdown refused"));
        assert_eq!(handler.stats().rejected(), 1);
    }
}
