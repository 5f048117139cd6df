//! Error types for per-connection proxying.
//!
//! Every variant is connection-scoped: it ends the offending connection and
//! nothing else. The `Display` output is the message written to the access log.

use std::io;

use thiserror::Error;

/// Per-connection proxy errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Client sent something that is not a usable HTTP head or TLS ClientHello.
    #[error("{0}")]
    Protocol(&'static str),

    /// Read, write or dial failure on either socket.
    #[error("{context}: {source}")]
    Network {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Hostname refused before any upstream dial.
    #[error("{0}")]
    Policy(&'static str),

    /// Failure while closing a socket.
    #[error("Error when closing connection: {0}")]
    Resource(#[source] io::Error),
}

impl ProxyError {
    /// Wrap an I/O failure with the phase it happened in.
    pub fn network(context: &'static str, source: io::Error) -> Self {
        ProxyError::Network { context, source }
    }

    /// Get the standardized reason code for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Protocol(_) => "protocol_error",
            ProxyError::Network { .. } => "network_error",
            ProxyError::Policy(_) => "policy_error",
            ProxyError::Resource(_) => "resource_error",
        }
    }
}

/// I/O errors that just mean the other side hung up first.
pub fn is_peer_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_log_message() {
        let err = ProxyError::network(
            "Couldn't connect to backend",
            io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        );
        assert_eq!(
            err.to_string(),
            "Couldn't connect to backend: connection refused"
        );
        assert_eq!(err.kind(), "network_error");

        let err = ProxyError::Policy("Hostname is not whitelisted");
        assert_eq!(err.to_string(), "Hostname is not whitelisted");
        assert_eq!(err.kind(), "policy_error");
    }

    #[test]
    fn test_peer_disconnect_classification() {
        assert!(is_peer_disconnect(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(is_peer_disconnect(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(!is_peer_disconnect(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
    }
}
