//! Append-only, indexed, crash-recoverable record log.
//!
//! A changelog is a pair of files: the data file (fixed header, metadata
//! blob, then page-aligned batches of checksummed records) and a companion
//! index mapping record numbers to byte ranges. The data file is the source
//! of truth; the index is advisory and is rebuilt by scanning whenever it
//! falls behind or disagrees.
//!
//! Opening performs the crash-recovery scan: records past the last indexed
//! position are re-parsed, and the file is physically truncated at the
//! first record that fails to parse. Truncating to an earlier record count
//! overwrites the orphaned bytes with a fill pattern so stale records can
//! never be mistaken for live ones.
//!
//! Any I/O failure during a mutating operation latches the changelog into
//! a permanently failing state; retry policy belongs to the caller.

use std::io;

use thiserror::Error;

use crate::error::Transience;

pub mod format;
mod index;
mod log;

pub use log::{ChangelogConfig, FileChangelog};

#[derive(Debug, Error)]
pub enum ChangelogError {
    #[error("changelog {op} failed")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("changelog path {path} is a symlink")]
    Symlink { path: String },
    #[error("changelog {path} is locked by another process")]
    Locked { path: String },
    /// A previous failure latched this changelog; every call now fails.
    #[error("changelog is in a failed state: {reason}")]
    Faulted { reason: String },
    #[error("changelog is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("bad changelog signature: {got:#018x}")]
    HeaderSignatureMismatch { got: u64 },
    #[error("changelog header crc mismatch")]
    HeaderCrcMismatch,
    #[error("changelog header truncated: needed {needed} bytes, file has {available}")]
    HeaderTruncated { needed: u64, available: u64 },
    /// The sentinel field holds a record count only in foreign formats.
    #[error("truncation sentinel is {got}: changelog was probably truncated by an incompatible writer")]
    HeaderSentinelInvalid { got: i32 },
    #[error("invalid changelog header: {reason}")]
    HeaderFieldInvalid { reason: String },
    #[error("record header truncated")]
    RecordHeaderTruncated,
    #[error("record index mismatch: expected {expected}, got {got}")]
    RecordIndexMismatch { expected: i32, got: i32 },
    #[error("record uuid does not match the changelog uuid")]
    RecordUuidMismatch,
    #[error("invalid record payload size {size}")]
    RecordPayloadSizeInvalid { size: i64 },
    #[error("invalid record padding size {size}")]
    RecordPaddingInvalid { size: i16 },
    #[error("record payload truncated")]
    RecordTruncated,
    #[error("record checksum mismatch: computed {computed:#018x}, stored {stored:#018x}")]
    RecordChecksumMismatch { computed: u64, stored: u64 },
    #[error("record padding truncated")]
    RecordPaddingTruncated,
    #[error("record too large: {got_bytes} bytes")]
    RecordTooLarge { got_bytes: u64 },
    #[error("cannot truncate to {requested} records, changelog has {count}")]
    TruncateBeyondEnd { requested: usize, count: usize },
}

impl ChangelogError {
    pub(crate) fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Self::Locked { .. } => Transience::Retryable,
            Self::Io { .. } => Transience::Unknown,
            _ => Transience::Permanent,
        }
    }
}
