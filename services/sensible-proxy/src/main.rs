//! sensible-proxy
//!
//! TCP proxy that lets apex domains be served through their `www.` host.
//!
//! This service:
//! - Listens for plain HTTP and for TLS on two ports
//! - Reads the Host header or the ClientHello SNI without terminating TLS
//! - Checks the hostname against an optional SHA-1 whitelist
//! - Splices the client to `www.<hostname>` on port 80 or 443
//!
//! Exits 0 on SIGINT/SIGTERM/SIGHUP/SIGQUIT and 1 if a listener fails.

use std::fs::OpenOptions;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sensible_proxy::{
    AccessLog, Config, HttpWhitelistSource, Listener, Protocol, ProxyHandler, TcpDialer,
    WhitelistRefresher, WhitelistStore,
};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Stopping server, it crashed");
            eprintln!("sensible-proxy: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sensible-proxy");
    info!(
        http_addr = %config.http_addr(),
        https_addr = %config.https_addr(),
        log_path = %config.log_path.display(),
        whitelist_url = config.whitelist_url.as_deref().unwrap_or("-"),
        debug_log = config.debug_log,
        "Configuration loaded"
    );

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.log_path)
        .with_context(|| format!("Failed to open log file {}", config.log_path.display()))?;
    let access_log = Arc::new(AccessLog::new(log_file, config.debug_log));

    let whitelist = Arc::new(WhitelistStore::new());
    let dialer = Arc::new(TcpDialer::new(config.connect_timeout));

    let mut listeners = JoinSet::new();
    for (protocol, addr) in [
        (Protocol::Http, config.http_addr()),
        (Protocol::Https, config.https_addr()),
    ] {
        let handler = Arc::new(
            ProxyHandler::new(
                Arc::clone(&whitelist),
                Arc::clone(&access_log),
                dialer.clone(),
            )
            .with_sniff_timeout(config.sniff_timeout),
        );

        let listener = Listener::bind(addr, protocol, handler)
            .await
            .with_context(|| format!("Couldn't start listening on {addr}"))?;
        listeners.spawn(listener.run());
    }

    match &config.whitelist_url {
        Some(url) => {
            let source = Arc::new(HttpWhitelistSource::new(url.clone())?);
            info!(url = %url, interval = ?config.whitelist_refresh_interval, "Fetching whitelist");
            let refresher = WhitelistRefresher::new(
                source,
                Arc::clone(&whitelist),
                config.whitelist_refresh_interval,
            );
            tokio::spawn(refresher.run());
        }
        None => info!("No WHITELIST_URL set, allowing all domains"),
    }

    tokio::select! {
        signal = shutdown_signal() => {
            signal.context("Failed to install signal handlers")?;
            info!("Stopping server");
            Ok(())
        }
        Some(result) = listeners.join_next() => {
            match result {
                Ok(Ok(())) => Err(anyhow::anyhow!("listener exited")),
                Ok(Err(e)) => Err(e).context("listener failed"),
                Err(e) => Err(e).context("listener task panicked"),
            }
        }
    }
}

/// Resolves on the first termination signal.
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut quit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
        _ = quit.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
