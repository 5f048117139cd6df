//! Connection counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one proxy instance.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections handed off to the relay.
    pub connections_proxied: AtomicU64,
    /// Connections closed before reaching the relay.
    pub connections_rejected: AtomicU64,
    /// Connections currently being relayed.
    pub connections_active: AtomicU64,
}

impl ProxyStats {
    pub fn accepted(&self) -> u64 {
        self.connections_accepted.load(Ordering::Relaxed)
    }

    pub fn proxied(&self) -> u64 {
        self.connections_proxied.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }
}

/// Counts one relayed connection as active until the last clone is dropped.
///
/// Each relay direction holds a clone, so the gauge drops only when both
/// directions are done.
#[derive(Debug)]
pub struct ActiveConnection(Arc<ProxyStats>);

impl ActiveConnection {
    pub fn start(stats: Arc<ProxyStats>) -> Arc<Self> {
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self(stats))
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}
