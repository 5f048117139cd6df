//! Allowed-domain store.
//!
//! Holds the current whitelist snapshot: SHA-1 hex digests of the hostnames
//! that may be proxied. An empty snapshot means "allow everything".
//!
//! Snapshots are immutable and replaced wholesale, so a reader always sees
//! one complete list, never a half-applied refresh.

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use sha1::{Digest, Sha1};
use tracing::debug;

/// Length of a hex-encoded SHA-1 digest.
pub const DIGEST_HEX_LEN: usize = 40;

/// SHA-1 of `hostname`, lowercase hex.
pub fn hostname_digest(hostname: &str) -> String {
    hex::encode(Sha1::digest(hostname.as_bytes()))
}

/// Immutable whitelist contents.
#[derive(Debug, Default)]
pub struct WhitelistSnapshot {
    /// Digests in the order they were fetched.
    entries: Vec<String>,
    /// Lookup index over `entries`.
    index: HashSet<String>,
}

impl WhitelistSnapshot {
    /// Build a snapshot, dropping anything that is not exactly 40 characters.
    pub fn new(entries: Vec<String>) -> Self {
        let entries: Vec<String> = entries
            .into_iter()
            .filter(|e| e.len() == DIGEST_HEX_LEN)
            .collect();
        let index = entries.iter().cloned().collect();
        Self { entries, index }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.index.contains(digest)
    }

    /// Empty snapshot allows everything; otherwise the digest must be listed.
    pub fn allows(&self, hostname: &str) -> bool {
        self.is_empty() || self.contains(&hostname_digest(hostname))
    }
}

/// Whitelist store shared by every listener and the refresher.
///
/// Uses ArcSwap so the per-connection check never blocks on a refresh.
#[derive(Debug)]
pub struct WhitelistStore {
    snapshot: ArcSwap<WhitelistSnapshot>,
}

impl WhitelistStore {
    /// Create a store with the empty (allow-all) snapshot.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(WhitelistSnapshot::default()),
        }
    }

    /// Create a store pre-seeded with digests.
    pub fn with_entries(entries: Vec<String>) -> Self {
        let store = Self::new();
        store.set(entries);
        store
    }

    /// Replace the whole whitelist in one pointer swap.
    pub fn set(&self, entries: Vec<String>) {
        let snapshot = Arc::new(WhitelistSnapshot::new(entries));
        debug!(entry_count = snapshot.len(), "Whitelist snapshot replaced");
        self.snapshot.store(snapshot);
    }

    /// Current snapshot. Stays valid even if a refresh lands meanwhile.
    pub fn get(&self) -> Arc<WhitelistSnapshot> {
        self.snapshot.load_full()
    }

    /// Whether a digest is in the current snapshot.
    pub fn contains(&self, digest: &str) -> bool {
        self.snapshot.load().contains(digest)
    }

    /// Whether `hostname` may be proxied.
    pub fn is_whitelisted(&self, hostname: &str) -> bool {
        self.snapshot.load().allows(hostname)
    }
}

impl Default for WhitelistStore {
    fn default() -> Self {
        Self::new()
    }
}
