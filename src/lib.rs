#![forbid(unsafe_code)]
//! Message bus transport, sharded SLRU cache, and crash-recoverable changelog.
//!
//! Three independent subsystems share an ambient layer of config, telemetry,
//! metrics, and errors:
//!
//! - [`bus`]: length-prefixed multipart messaging over TCP or unix-domain
//!   sockets, with per-packet acknowledgement and stall detection.
//! - [`cache`]: a sharded segmented-LRU cache with a two-phase insert
//!   protocol that deduplicates concurrent loads of the same key.
//! - [`changelog`]: an append-only record log that survives torn writes by
//!   scanning and truncating back to the last intact record on open.

pub mod bus;
pub mod cache;
pub mod changelog;
pub mod config;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

pub use crate::config::Config;
