//! Domain whitelist: the shared store and the periodic refresher feeding it.

mod refresh;
mod store;

pub use refresh::{
    parse_whitelist, HttpWhitelistSource, WhitelistRefresher, WhitelistSource,
    DEFAULT_REFRESH_INTERVAL,
};
pub use store::{hostname_digest, WhitelistSnapshot, WhitelistStore, DIGEST_HEX_LEN};
