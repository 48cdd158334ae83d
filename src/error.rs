use thiserror::Error;

use crate::bus::BusError;
use crate::cache::CacheError;
use crate::changelog::ChangelogError;
use crate::config::ConfigError;

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (transient contention/outage).
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the subsystem errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Changelog(#[from] ChangelogError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            Error::Bus(e) => e.transience(),
            Error::Cache(e) => e.transience(),
            Error::Changelog(e) => e.transience(),
            Error::Config(e) => e.transience(),
        }
    }
}
