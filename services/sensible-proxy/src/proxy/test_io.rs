//! Writers that fail on demand, for exercising error paths.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncWrite;

/// Accepts `budget` bytes, then refuses every write. Shutdown always fails.
#[derive(Debug, Default)]
pub struct BrokenWriter {
    pub budget: usize,
    pub written: Vec<u8>,
}

impl BrokenWriter {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget,
            written: Vec::new(),
        }
    }
}

impl AsyncWrite for BrokenWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.budget == 0 {
            return Poll::Ready(Err(io::Error::other("write refused")));
        }
        let n = buf.len().min(self.budget);
        self.budget -= n;
        self.written.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("shutdown refused")))
    }
}
