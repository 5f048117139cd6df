//! Proxy configuration (env-driven).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// IP both listeners bind to.
    pub bind_ip: IpAddr,

    /// Plain HTTP listener port.
    pub http_port: u16,

    /// TLS passthrough listener port.
    pub https_port: u16,

    /// Access log file, opened in append mode.
    pub log_path: PathBuf,

    /// Whitelist resource. `None` allows every domain.
    pub whitelist_url: Option<String>,

    /// Interval between whitelist fetches.
    pub whitelist_refresh_interval: Duration,

    /// Emit DEBUG lines to the access log.
    pub debug_log: bool,

    /// Deadline for reading the HTTP head or ClientHello.
    pub sniff_timeout: Option<Duration>,

    /// Deadline for the upstream dial.
    pub connect_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let bind_ip = var("BIND_ADDR")
            .map(|v| v.parse())
            .transpose()
            .context("BIND_ADDR must be an IP address.")?
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        let http_port: u16 = var("HTTP_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("HTTP_PORT must be a port number.")?
            .unwrap_or(80);

        let https_port: u16 = var("HTTPS_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("HTTPS_PORT must be a port number.")?
            .unwrap_or(443);

        let log_path = var("LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/log/sensible-proxy.log"));

        let whitelist_url = var("WHITELIST_URL");

        let refresh_secs: u64 = var("WHITELIST_REFRESH_SECS")
            .map(|v| v.parse())
            .transpose()
            .context("WHITELIST_REFRESH_SECS must be an integer (seconds).")?
            .unwrap_or(60);
        let whitelist_refresh_interval = Duration::from_secs(refresh_secs.max(1));

        let debug_log = var("DEBUG_LOG")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let sniff_timeout = optional_millis(var("SNIFF_TIMEOUT_MS"), 30_000)
            .context("SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?;

        let connect_timeout = optional_millis(var("CONNECT_TIMEOUT_MS"), 10_000)
            .context("CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?;

        let log_level = var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_ip,
            http_port,
            https_port,
            log_path,
            whitelist_url,
            whitelist_refresh_interval,
            debug_log,
            sniff_timeout,
            connect_timeout,
            log_level,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.http_port)
    }

    pub fn https_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.https_port)
    }
}

/// Milliseconds with a default; `0` disables the deadline.
fn optional_millis(
    raw: Option<String>,
    default_ms: u64,
) -> Result<Option<Duration>, std::num::ParseIntError> {
    let ms = raw.map(|v| v.parse()).transpose()?.unwrap_or(default_ms);
    Ok((ms > 0).then(|| Duration::from_millis(ms)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.http_addr(), "0.0.0.0:80".parse().unwrap());
        assert_eq!(config.https_addr(), "0.0.0.0:443".parse().unwrap());
        assert_eq!(config.log_path, PathBuf::from("/var/log/sensible-proxy.log"));
        assert!(config.whitelist_url.is_none());
        assert_eq!(config.whitelist_refresh_interval, Duration::from_secs(60));
        assert!(!config.debug_log);
        assert_eq!(config.sniff_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(10)));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("HTTP_PORT", "8080"),
            ("HTTPS_PORT", "8443"),
            ("BIND_ADDR", "127.0.0.1"),
            ("LOG_PATH", "/tmp/proxy.log"),
            ("WHITELIST_URL", "https://example.com/whitelist.txt"),
            ("WHITELIST_REFRESH_SECS", "0"),
            ("DEBUG_LOG", "TRUE"),
            ("SNIFF_TIMEOUT_MS", "0"),
            ("CONNECT_TIMEOUT_MS", "2500"),
        ])
        .unwrap();

        assert_eq!(config.http_addr(), "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.https_addr(), "127.0.0.1:8443".parse().unwrap());
        assert_eq!(config.log_path, PathBuf::from("/tmp/proxy.log"));
        assert_eq!(
            config.whitelist_url.as_deref(),
            Some("https://example.com/whitelist.txt")
        );
        assert_eq!(config.whitelist_refresh_interval, Duration::from_secs(1));
        assert!(config.debug_log);
        assert_eq!(config.sniff_timeout, None);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let config = load(&[("HTTP_PORT", ""), ("WHITELIST_URL", "")]).unwrap();
        assert_eq!(config.http_port, 80);
        assert!(config.whitelist_url.is_none());
    }

    #[test]
    fn test_invalid_port() {
        let err = load(&[("HTTPS_PORT", "70000")]).unwrap_err();
        assert!(err.to_string().contains("HTTPS_PORT"));
    }
}
