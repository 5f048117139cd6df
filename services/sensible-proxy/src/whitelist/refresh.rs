//! Periodic whitelist refresh.
//!
//! The whitelist resource is plain text, one SHA-1 hex digest per line.
//! A failed fetch pushes an empty snapshot, so an unreachable resource
//! opens the proxy up instead of locking every client out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::store::{WhitelistStore, DIGEST_HEX_LEN};

/// Default refresh interval.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Anything that can produce the current list of whitelist digests.
#[async_trait]
pub trait WhitelistSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<String>>;
}

/// Keep only lines that are exactly one hex SHA-1 long.
pub fn parse_whitelist(body: &str) -> Vec<String> {
    body.split('\n')
        .filter(|line| line.len() == DIGEST_HEX_LEN)
        .map(str::to_string)
        .collect()
}

/// Whitelist fetched over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpWhitelistSource {
    client: reqwest::Client,
    url: String,
}

impl HttpWhitelistSource {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sensible-proxy/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build whitelist HTTP client")?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl WhitelistSource for HttpWhitelistSource {
    async fn fetch(&self) -> Result<Vec<String>> {
        let resp = self.client.get(&self.url).send().await?;

        if !resp.status().is_success() {
            return Err(anyhow::anyhow!(
                "whitelist fetch failed (status={})",
                resp.status()
            ));
        }

        let body = resp
            .text()
            .await
            .context("Failed to read whitelist body")?;
        Ok(parse_whitelist(&body))
    }
}

/// Pushes fresh whitelist snapshots into the store on a fixed interval.
pub struct WhitelistRefresher {
    source: Arc<dyn WhitelistSource>,
    store: Arc<WhitelistStore>,
    interval: Duration,
}

impl WhitelistRefresher {
    pub fn new(
        source: Arc<dyn WhitelistSource>,
        store: Arc<WhitelistStore>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            store,
            interval,
        }
    }

    /// Fetch once and replace the store's snapshot. Returns the entry count.
    pub async fn refresh_once(&self) -> usize {
        let entries = match self.source.fetch().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Whitelist fetch failed");
                Vec::new()
            }
        };

        let count = entries.len();
        if count > 0 {
            info!(entry_count = count, "Fetched white listed domains");
        } else {
            warn!("Could not find whitelist, allowing all domains");
        }

        self.store.set(entries);
        count
    }

    /// Refresh immediately, then on every tick. Never returns.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.refresh_once().await;
        }
    }
}
