//! Protocol-sniffing TCP proxy.
//!
//! This module provides:
//! - HTTP Host header and TLS ClientHello SNI sniffing
//! - Per-connection orchestration (whitelist, dial, replay)
//! - Bidirectional relaying
//! - TCP listener management
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Sniffer (Host / SNI) -> Whitelist -> Dialer (www.<host>) -> Splice
//!                                                                 |
//!                                                     replay of sniffed bytes
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Listener, Protocol, ProxyHandler, TcpDialer};
//!
//! let handler = Arc::new(ProxyHandler::new(whitelist, access_log, Arc::new(TcpDialer::default())));
//! let listener = Listener::bind("0.0.0.0:443".parse()?, Protocol::Https, handler).await?;
//! listener.run().await?;
//! ```

mod dialer;
mod handler;
mod http;
mod listener;
mod sni;
mod splice;
mod stats;
#[cfg(test)]
mod test_io;

pub use dialer::{Dialer, TcpDialer, DEFAULT_CONNECT_TIMEOUT};
pub use handler::{
    upstream_addr, Protocol, ProxyHandler, DEFAULT_SNIFF_TIMEOUT, UPSTREAM_HOST_PREFIX,
};
pub use http::{sniff_host, HttpHead, HOST_PREFIX, MAX_LINE_BYTES};
pub use listener::Listener;
pub use sni::{parse_client_hello, sniff_client_hello, ClientHello, TlsRecord};
pub use splice::splice;
pub use stats::{ActiveConnection, ProxyStats};
