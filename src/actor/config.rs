use std::{net::SocketAddr, time::Duration};

use crate::common::{DEFAULT_MAX_REPLACEMENTS, DEFAULT_SPLIT_FACTOR, MAX_BUCKET_SIZE_K};
use crate::error::BuildError;
use crate::transport::DEFAULT_REQUEST_TIMEOUT;

/// Default number of concurrent requests of store and fetch fan outs.
pub const DEFAULT_SEARCH_CONCURRENCY: usize = 5;
/// Default number of concurrent requests of an iterative lookup.
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 10;
/// Default interval of republishing our own values.
pub const DEFAULT_ORIGINAL_REPUBLISH_INTERVAL: Duration = Duration::from_secs(8 * 60 * 60);
/// Default interval of republishing values we hold for others.
pub const DEFAULT_CACHE_REPUBLISH_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Default maximum of operations running at once, the rest wait in queue.
pub const DEFAULT_MAX_CONCURRENT_OPERATIONS: usize = 16;
/// Default depth of derived keys followed through diversifications.
pub const DEFAULT_MAX_DIVERSIFICATION_DEPTH: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// How many of the targeted replicas must confirm a put.
pub enum Quorum {
    /// At least one.
    Any,
    #[default]
    /// More than half.
    Majority,
    /// All of them.
    All,
}

impl Quorum {
    /// Number of confirmations required out of `targeted` replicas.
    pub fn required(&self, targeted: usize) -> usize {
        match self {
            Quorum::Any => targeted.min(1),
            Quorum::Majority => targeted / 2 + targeted.min(1),
            Quorum::All => targeted,
        }
    }
}

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Id of the logical network, nodes of different networks never talk.
    ///
    /// Defaults to `0`
    pub network: u8,
    /// Bootstrap nodes
    ///
    /// Defaults to none.
    pub bootstrap: Vec<SocketAddr>,
    /// Contacts per bucket, also the number of closest nodes of a lookup.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub k: usize,
    /// Buckets not covering our own Id only split every `split_factor` levels.
    ///
    /// Defaults to [DEFAULT_SPLIT_FACTOR]
    pub split_factor: usize,
    /// Defaults to [DEFAULT_SEARCH_CONCURRENCY]
    pub search_concurrency: usize,
    /// Defaults to [DEFAULT_LOOKUP_CONCURRENCY]
    pub lookup_concurrency: usize,
    /// Defaults to [DEFAULT_MAX_REPLACEMENTS]
    pub max_replacements: usize,
    /// Number of closest nodes without a value that a get caches it at.
    ///
    /// Defaults to `1`, `0` disables caching.
    pub cache_at_closest_n: usize,
    /// Defaults to [DEFAULT_ORIGINAL_REPUBLISH_INTERVAL]
    pub original_republish_interval: Duration,
    /// Defaults to [DEFAULT_CACHE_REPUBLISH_INTERVAL]
    pub cache_republish_interval: Duration,
    /// Hash user keys with SHA-1, otherwise keys must be 20 bytes Ids.
    ///
    /// Defaults to `true`
    pub encode_keys: bool,
    /// Look up a random Id at every table refresh.
    ///
    /// Defaults to `true`
    pub random_lookup: bool,
    /// Defaults to [Quorum::Majority]
    pub put_quorum: Quorum,
    /// Defaults to [DEFAULT_MAX_CONCURRENT_OPERATIONS]
    pub max_concurrent_operations: usize,
    /// Defaults to [DEFAULT_MAX_DIVERSIFICATION_DEPTH]
    pub max_diversification_depth: u8,
    /// Request timeout duration of the default transports.
    ///
    /// The longer this duration is, the longer queries take until they are deemeed "done".
    /// The shortet this duration is, the more responses from busy nodes we miss out on.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: 0,
            bootstrap: Vec::new(),
            k: MAX_BUCKET_SIZE_K,
            split_factor: DEFAULT_SPLIT_FACTOR,
            search_concurrency: DEFAULT_SEARCH_CONCURRENCY,
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
            cache_at_closest_n: 1,
            original_republish_interval: DEFAULT_ORIGINAL_REPUBLISH_INTERVAL,
            cache_republish_interval: DEFAULT_CACHE_REPUBLISH_INTERVAL,
            encode_keys: true,
            random_lookup: true,
            put_quorum: Quorum::default(),
            max_concurrent_operations: DEFAULT_MAX_CONCURRENT_OPERATIONS,
            max_diversification_depth: DEFAULT_MAX_DIVERSIFICATION_DEPTH,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl Config {
    pub(crate) fn validate(&self) -> Result<(), BuildError> {
        if self.k == 0 {
            return Err(BuildError::InvalidConfig("k must be positive"));
        }
        if self.split_factor == 0 {
            return Err(BuildError::InvalidConfig("split_factor must be positive"));
        }
        if self.search_concurrency == 0 || self.lookup_concurrency == 0 {
            return Err(BuildError::InvalidConfig("concurrency must be positive"));
        }
        if self.max_concurrent_operations == 0 {
            return Err(BuildError::InvalidConfig(
                "max_concurrent_operations must be positive",
            ));
        }
        if self.original_republish_interval.is_zero() || self.cache_republish_interval.is_zero()
        {
            return Err(BuildError::InvalidConfig("republish intervals must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum() {
        assert_eq!(Quorum::Majority.required(20), 11);
        assert_eq!(Quorum::Majority.required(3), 2);
        assert_eq!(Quorum::Majority.required(1), 1);
        assert_eq!(Quorum::Majority.required(0), 0);
        assert_eq!(Quorum::Any.required(7), 1);
        assert_eq!(Quorum::All.required(7), 7);
    }

    #[test]
    fn invalid_config() {
        let config = Config {
            k: 0,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(BuildError::InvalidConfig(_))));
        assert!(Config::default().validate().is_ok());
    }
}
