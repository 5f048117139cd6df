pub mod access_log;
pub mod config;
pub mod error;
pub mod proxy;
pub mod whitelist;

pub use access_log::{AccessLog, MemorySink};
pub use config::Config;
pub use error::ProxyError;
pub use proxy::{Dialer, Listener, Protocol, ProxyHandler, ProxyStats, TcpDialer};
pub use whitelist::{
    hostname_digest, HttpWhitelistSource, WhitelistRefresher, WhitelistSource, WhitelistStore,
};
