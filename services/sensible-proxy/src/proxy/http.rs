//! HTTP Host header sniffing.
//!
//! Reads request lines off the client until the `Host: ` header or the end of
//! the header block. Every line read is kept so it can be replayed upstream;
//! the request is never rebuilt.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::error::ProxyError;

/// Header prefix that carries the hostname. Matched case-sensitively.
pub const HOST_PREFIX: &[u8] = b"Host: ";

/// Longest single request line accepted while sniffing.
pub const MAX_LINE_BYTES: usize = 8192;

/// Result of sniffing an HTTP request head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHead {
    /// Value of the `Host: ` line, byte for byte; empty when the headers
    /// ended without one.
    pub hostname: String,
    /// Lines consumed, in order, with their line terminators stripped.
    pub lines: Vec<Vec<u8>>,
}

impl HttpHead {
    /// Bytes to send upstream before relaying: each line plus `\n`.
    pub fn replay_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.lines.iter().map(|l| l.len() + 1).sum());
        for line in &self.lines {
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        out
    }
}

/// Read lines until a `Host: ` line or a blank line.
///
/// Bytes buffered in `reader` past the last consumed line stay there and must
/// be relayed from the same reader.
pub async fn sniff_host<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HttpHead, ProxyError> {
    let mut head = HttpHead::default();

    loop {
        let line = read_line(reader).await?;

        if line.is_empty() {
            head.lines.push(line);
            break;
        }

        if let Some(host) = line.strip_prefix(HOST_PREFIX) {
            head.hostname = String::from_utf8(host.to_vec())
                .map_err(|_| ProxyError::Protocol("Host header is not valid UTF-8"))?;
            head.lines.push(line);
            break;
        }

        head.lines.push(line);
    }

    Ok(head)
}

/// Read one line, dropping the trailing `\n` or `\r\n`.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, ProxyError> {
    let mut line = Vec::new();
    let n = reader
        .take(MAX_LINE_BYTES as u64 + 1)
        .read_until(b'\n', &mut line)
        .await
        .map_err(|e| ProxyError::network("Couldn't read request headers", e))?;

    if n == 0 {
        return Err(ProxyError::network(
            "Couldn't read request headers",
            std::io::ErrorKind::UnexpectedEof.into(),
        ));
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > MAX_LINE_BYTES {
        return Err(ProxyError::Protocol("Request header line too long"));
    }

    Ok(line)
}
