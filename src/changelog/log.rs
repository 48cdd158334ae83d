//! The changelog proper: lifecycle state machine, append/read/truncate
//! paths, crash-recovery scan, and the advisory lock file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ChangelogError;
use super::format::{
    self, FILE_HEADER_LEN, FileHeader, IndexEntry, PAGE_ALIGNMENT, QWORD_ALIGNMENT,
    RECORD_HEADER_LEN, WIPE_PATTERN,
};
use super::index::ChangelogIndex;
use crate::metrics;

/// Largest chunk written at once when wiping truncated spans.
const WIPE_BUFFER_SIZE: usize = 16 << 20;

/// Payload cap keeping every record's on-disk span within a u32.
const MAX_RECORD_PAYLOAD: u64 =
    u32::MAX as u64 - RECORD_HEADER_LEN as u64 - QWORD_ALIGNMENT - PAGE_ALIGNMENT;

// ===== Configuration =====

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangelogConfig {
    /// Force appended data to durable storage on flush and close.
    #[serde(default = "default_enable_sync")]
    pub enable_sync: bool,
    #[serde(default = "default_enable_index_sync")]
    pub enable_index_sync: bool,
    /// Appended bytes between background index flushes.
    #[serde(default = "default_index_flush_size")]
    pub index_flush_size: u64,
    /// Grow the data file ahead of writes in chunks of this many bytes.
    #[serde(default)]
    pub preallocate_size: Option<u64>,
    #[serde(default = "default_lock_retry_count")]
    pub lock_retry_count: u32,
    #[serde(default = "default_lock_backoff_ms")]
    pub lock_backoff_ms: u64,
}

fn default_enable_sync() -> bool {
    true
}

fn default_enable_index_sync() -> bool {
    false
}

fn default_index_flush_size() -> u64 {
    1 << 20
}

fn default_lock_retry_count() -> u32 {
    100
}

fn default_lock_backoff_ms() -> u64 {
    100
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            enable_sync: default_enable_sync(),
            enable_index_sync: default_enable_index_sync(),
            index_flush_size: default_index_flush_size(),
            preallocate_size: None,
            lock_retry_count: default_lock_retry_count(),
            lock_backoff_ms: default_lock_backoff_ms(),
        }
    }
}

// ===== Lifecycle =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogState {
    Unopened,
    Open,
    Closed,
    Errored,
}

impl LogState {
    fn name(self) -> &'static str {
        match self {
            Self::Unopened => "unopened",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored => "errored",
        }
    }
}

/// An on-disk changelog instance.
///
/// `Unopened → Open → Closed`, with `Errored` absorbing any I/O failure
/// in a mutating operation. Not internally synchronized; one owner drives
/// all operations.
pub struct FileChangelog {
    path: PathBuf,
    config: ChangelogConfig,
    state: LogState,
    fault: Option<String>,
    uuid: Uuid,
    meta: Bytes,
    file: Option<File>,
    index: Option<ChangelogIndex>,
    lock: Option<ChangelogLock>,
    record_count: usize,
    /// Logical end of the record region.
    current_offset: u64,
    first_record_offset: u64,
    /// Physical file length, ahead of `current_offset` when preallocating
    /// or after a truncate.
    file_size: u64,
    unflushed_index_bytes: u64,
}

impl FileChangelog {
    pub fn new(path: impl Into<PathBuf>, config: ChangelogConfig) -> Self {
        Self {
            path: path.into(),
            config,
            state: LogState::Unopened,
            fault: None,
            uuid: Uuid::nil(),
            meta: Bytes::new(),
            file: None,
            index: None,
            lock: None,
            record_count: 0,
            current_offset: 0,
            first_record_offset: 0,
            file_size: 0,
            unflushed_index_bytes: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Metadata blob supplied at creation. Empty before open.
    pub fn meta(&self) -> &Bytes {
        &self.meta
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Creates a fresh changelog file with the given metadata blob.
    pub fn create(&mut self, meta: Bytes) -> Result<(), ChangelogError> {
        self.require_unopened()?;
        if meta.len() as u64 > u32::MAX as u64 - FILE_HEADER_LEN as u64 - PAGE_ALIGNMENT {
            return Err(ChangelogError::HeaderFieldInvalid {
                reason: format!("metadata blob of {} bytes does not fit the header", meta.len()),
            });
        }
        let lock = ChangelogLock::acquire(&self.path, &self.config)?;
        self.check_not_symlink()?;
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(source) => return Err(self.io_latch("create", source)),
        };
        let uuid = Uuid::new_v4();
        let header = FileHeader::for_meta(meta.len() as u32, uuid);
        let mut buf = BytesMut::with_capacity(header.first_record_offset as usize);
        buf.put_slice(&header.encode());
        buf.put_slice(&meta);
        buf.put_bytes(0, header.padding_size as usize);
        if let Err(source) = file.write_all(&buf) {
            return Err(self.io_latch("create", source));
        }
        if self.config.enable_sync
            && let Err(source) = file.sync_all()
        {
            return Err(self.io_latch("sync", source));
        }
        let index = match ChangelogIndex::create(
            index_path(&self.path),
            uuid,
            self.config.enable_index_sync,
        ) {
            Ok(index) => index,
            Err(source) => return Err(self.io_latch("create index", source)),
        };
        self.uuid = uuid;
        self.meta = meta;
        self.file = Some(file);
        self.index = Some(index);
        self.lock = Some(lock);
        self.record_count = 0;
        self.first_record_offset = header.first_record_offset as u64;
        self.current_offset = self.first_record_offset;
        self.file_size = self.first_record_offset;
        self.state = LogState::Open;
        info!(path = %self.path.display(), uuid = %uuid, "created changelog");
        Ok(())
    }

    /// Opens an existing changelog, running the crash-recovery scan: any
    /// records past the last indexed position are re-parsed, and the file
    /// is physically truncated at the first record that fails to parse.
    pub fn open(&mut self) -> Result<(), ChangelogError> {
        self.require_unopened()?;
        let lock = ChangelogLock::acquire(&self.path, &self.config)?;
        self.check_not_symlink()?;
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(file) => file,
            Err(source) => return Err(self.io_latch("open", source)),
        };
        let file_len = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(source) => return Err(self.io_latch("stat", source)),
        };
        if file_len < FILE_HEADER_LEN as u64 {
            let err = ChangelogError::HeaderTruncated {
                needed: FILE_HEADER_LEN as u64,
                available: file_len,
            };
            return Err(self.latch(err));
        }
        let mut header_buf = [0u8; FILE_HEADER_LEN];
        if let Err(source) = file.read_exact(&mut header_buf) {
            return Err(self.io_latch("read header", source));
        }
        let header = match FileHeader::decode(&header_buf) {
            Ok(header) => header,
            Err(err) => return Err(self.latch(err)),
        };
        let first_record_offset = header.first_record_offset as u64;
        if file_len < first_record_offset {
            let err = ChangelogError::HeaderTruncated {
                needed: first_record_offset,
                available: file_len,
            };
            return Err(self.latch(err));
        }
        let mut meta = vec![0u8; header.meta_size as usize];
        if let Err(source) = file.read_exact(&mut meta) {
            return Err(self.io_latch("read metadata", source));
        }
        let uuid = header.uuid;
        let mut index = match ChangelogIndex::open(
            index_path(&self.path),
            uuid,
            self.config.enable_index_sync,
        ) {
            Ok(index) => index,
            Err(source) => return Err(self.io_latch("open index", source)),
        };
        // The index must agree with the data file about where records
        // start and must not point past the end; otherwise fall back to
        // scanning from the closest trusted point.
        if let Some(entry) = index.entries().first()
            && entry.offset != first_record_offset as i64
        {
            warn!(
                path = %self.path.display(),
                index_offset = entry.offset,
                data_offset = first_record_offset,
                "changelog index disagrees with the data header, rebuilding"
            );
            if let Err(source) = index.rebuild_truncated(0) {
                return Err(self.io_latch("rebuild index", source));
            }
        }
        let backed = index
            .entries()
            .iter()
            .take_while(|entry| entry.end() as u64 <= file_len)
            .count();
        if backed < index.len() {
            warn!(
                path = %self.path.display(),
                kept = backed,
                dropped = index.len() - backed,
                "changelog index points past the data file, rebuilding"
            );
            if let Err(source) = index.rebuild_truncated(backed) {
                return Err(self.io_latch("rebuild index", source));
            }
        }
        let scan_start = index
            .last_indexed_end()
            .map_or(first_record_offset, |end| end as u64);
        let mut record_count = index.len();
        let mut tail = vec![0u8; (file_len - scan_start) as usize];
        if let Err(source) = file
            .seek(SeekFrom::Start(scan_start))
            .and_then(|_| file.read_exact(&mut tail))
        {
            return Err(self.io_latch("read tail", source));
        }
        let image = Bytes::from(tail);
        let mut pos = 0usize;
        while pos < image.len() {
            match format::parse_record(&image, pos, record_count as i32, &uuid) {
                Ok(parsed) => {
                    index.append(IndexEntry {
                        record_index: record_count as i32,
                        total_len: parsed.total_len as u32,
                        offset: (scan_start + pos as u64) as i64,
                    });
                    record_count += 1;
                    pos += parsed.total_len;
                }
                Err(err) => {
                    debug!(
                        offset = scan_start + pos as u64,
                        error = %err,
                        "changelog recovery scan stopped"
                    );
                    break;
                }
            }
        }
        let recovered_end = scan_start + pos as u64;
        if recovered_end < file_len {
            warn!(
                path = %self.path.display(),
                dropped_bytes = file_len - recovered_end,
                "truncating partially written changelog tail"
            );
            metrics::changelog_recovery_dropped(file_len - recovered_end);
            if let Err(source) = file.set_len(recovered_end) {
                return Err(self.io_latch("truncate tail", source));
            }
            if self.config.enable_sync
                && let Err(source) = file.sync_all()
            {
                return Err(self.io_latch("sync", source));
            }
        }
        if let Err(source) = index.flush() {
            return Err(self.io_latch("index flush", source));
        }
        self.uuid = uuid;
        self.meta = Bytes::from(meta);
        self.file = Some(file);
        self.index = Some(index);
        self.lock = Some(lock);
        self.record_count = record_count;
        self.first_record_offset = first_record_offset;
        self.current_offset = recovered_end;
        self.file_size = recovered_end;
        self.state = LogState::Open;
        info!(
            path = %self.path.display(),
            records = record_count,
            "opened changelog"
        );
        Ok(())
    }

    /// Appends a batch of records in one write.
    ///
    /// `first_record_index` must equal the current record count: appends
    /// are strictly contiguous, and a gap is a programming error rather
    /// than a recoverable condition.
    pub fn append(
        &mut self,
        first_record_index: usize,
        records: &[Bytes],
    ) -> Result<(), ChangelogError> {
        self.ensure_usable()?;
        if records.is_empty() {
            return Ok(());
        }
        assert_eq!(
            first_record_index, self.record_count,
            "changelog records must be appended contiguously"
        );
        for payload in records {
            if payload.len() as u64 > MAX_RECORD_PAYLOAD {
                return Err(ChangelogError::RecordTooLarge {
                    got_bytes: payload.len() as u64,
                });
            }
        }
        let mut buf = BytesMut::new();
        let mut entries = Vec::with_capacity(records.len());
        let mut offset = self.current_offset;
        for (i, payload) in records.iter().enumerate() {
            let record_index = (first_record_index + i) as i32;
            let qword_end = offset
                + RECORD_HEADER_LEN as u64
                + payload.len() as u64
                + format::padding_to(
                    (RECORD_HEADER_LEN + payload.len()) as u64,
                    QWORD_ALIGNMENT,
                );
            let page_padding = if i + 1 == records.len() {
                format::padding_to(qword_end, PAGE_ALIGNMENT) as usize
            } else {
                0
            };
            format::write_record(&mut buf, record_index, &self.uuid, payload, page_padding);
            let total_len = format::encoded_record_len(payload.len(), page_padding);
            entries.push(IndexEntry {
                record_index,
                total_len: total_len as u32,
                offset: offset as i64,
            });
            offset += total_len as u64;
        }
        let batch_len = buf.len() as u64;
        if let Some(chunk) = self.config.preallocate_size
            && offset > self.file_size
        {
            let new_size = offset.max(self.file_size + chunk);
            self.with_data("preallocate", |file| file.set_len(new_size))?;
            self.file_size = new_size;
        }
        let write_offset = self.current_offset;
        self.with_data("append", move |file| {
            let mut file = file;
            file.seek(SeekFrom::Start(write_offset))?;
            file.write_all(&buf)
        })?;
        if let Some(index) = self.index.as_mut() {
            for entry in entries {
                index.append(entry);
            }
        }
        self.record_count += records.len();
        self.current_offset = offset;
        self.file_size = self.file_size.max(offset);
        self.unflushed_index_bytes += batch_len;
        metrics::changelog_append(records.len() as u64, batch_len);
        debug!(
            records = records.len(),
            bytes = batch_len,
            total = self.record_count,
            "appended changelog records"
        );
        self.maybe_flush_index()
    }

    /// Reads up to `max_records` payloads starting at `first_record_index`,
    /// stopping once `max_bytes` of on-disk span is covered (always
    /// returning at least one record when any is in range).
    ///
    /// Validation failures here surface to the caller; unlike the open-time
    /// scan, an explicit read never repairs anything and never latches.
    pub fn read(
        &self,
        first_record_index: usize,
        max_records: usize,
        max_bytes: u64,
    ) -> Result<Vec<Bytes>, ChangelogError> {
        self.ensure_usable()?;
        let (Some(file), Some(index)) = (self.file.as_ref(), self.index.as_ref()) else {
            return Err(ChangelogError::InvalidState {
                expected: "open",
                actual: self.state.name(),
            });
        };
        if first_record_index >= self.record_count || max_records == 0 {
            return Ok(Vec::new());
        }
        let end_index = self.record_count.min(first_record_index + max_records);
        let entries = &index.entries()[first_record_index..end_index];
        let mut selected = 0usize;
        let mut span_bytes = 0u64;
        for entry in entries {
            if selected > 0 && span_bytes + entry.total_len as u64 > max_bytes {
                break;
            }
            span_bytes += entry.total_len as u64;
            selected += 1;
        }
        let mut raw = vec![0u8; span_bytes as usize];
        let mut file = file;
        file.seek(SeekFrom::Start(entries[0].offset as u64))
            .map_err(|source| ChangelogError::io("read seek", source))?;
        file.read_exact(&mut raw)
            .map_err(|source| ChangelogError::io("read", source))?;
        let image = Bytes::from(raw);
        let mut payloads = Vec::with_capacity(selected);
        let mut pos = 0usize;
        for i in 0..selected {
            let parsed = format::parse_record(
                &image,
                pos,
                (first_record_index + i) as i32,
                &self.uuid,
            )?;
            pos += parsed.total_len;
            payloads.push(parsed.payload);
        }
        Ok(payloads)
    }

    /// Drops every record from `record_count` on, overwriting the orphaned
    /// bytes with the wipe pattern so they can never parse again. The
    /// physical file length is left alone.
    pub fn truncate(&mut self, record_count: usize) -> Result<(), ChangelogError> {
        self.ensure_usable()?;
        if record_count > self.record_count {
            return Err(ChangelogError::TruncateBeyondEnd {
                requested: record_count,
                count: self.record_count,
            });
        }
        if record_count == self.record_count {
            return Ok(());
        }
        let new_end = if record_count == 0 {
            self.first_record_offset
        } else {
            match self.index.as_ref() {
                Some(index) => index.entries()[record_count - 1].end() as u64,
                None => {
                    return Err(ChangelogError::InvalidState {
                        expected: "open",
                        actual: self.state.name(),
                    });
                }
            }
        };
        if let Some(index) = self.index.as_mut()
            && let Err(source) = index.rebuild_truncated(record_count)
        {
            return Err(self.io_latch("rebuild index", source));
        }
        let wiped = self.current_offset - new_end;
        self.wipe_span(new_end, wiped)?;
        if self.config.enable_sync {
            self.with_data("sync", |file| file.sync_data())?;
        }
        self.record_count = record_count;
        self.current_offset = new_end;
        self.unflushed_index_bytes = 0;
        metrics::changelog_truncate_wiped(wiped);
        info!(
            path = %self.path.display(),
            records = record_count,
            wiped_bytes = wiped,
            "truncated changelog"
        );
        Ok(())
    }

    /// Forces appended data to durable storage (when syncing is enabled)
    /// and flushes the index if enough has accumulated.
    pub fn flush(&mut self) -> Result<(), ChangelogError> {
        self.ensure_usable()?;
        if self.config.enable_sync {
            self.with_data("sync", |file| file.sync_data())?;
        }
        self.maybe_flush_index()
    }

    /// Flushes everything, trims preallocated space, and releases the
    /// lock. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<(), ChangelogError> {
        match self.state {
            LogState::Closed => return Ok(()),
            LogState::Unopened => {
                self.state = LogState::Closed;
                return Ok(());
            }
            LogState::Errored => return self.ensure_usable(),
            LogState::Open => {}
        }
        self.flush_index()?;
        if self.config.enable_sync {
            self.with_data("sync", |file| file.sync_all())?;
        }
        if self.file_size > self.current_offset {
            let end = self.current_offset;
            self.with_data("trim preallocation", move |file| file.set_len(end))?;
            self.file_size = end;
        }
        self.file = None;
        self.index = None;
        self.lock = None;
        self.state = LogState::Closed;
        info!(path = %self.path.display(), "closed changelog");
        Ok(())
    }

    // ===== Internals =====

    fn ensure_usable(&self) -> Result<(), ChangelogError> {
        match self.state {
            LogState::Open => Ok(()),
            LogState::Errored => Err(ChangelogError::Faulted {
                reason: self
                    .fault
                    .clone()
                    .unwrap_or_else(|| "unknown failure".into()),
            }),
            other => Err(ChangelogError::InvalidState {
                expected: "open",
                actual: other.name(),
            }),
        }
    }

    fn require_unopened(&self) -> Result<(), ChangelogError> {
        match self.state {
            LogState::Unopened => Ok(()),
            LogState::Errored => Err(ChangelogError::Faulted {
                reason: self
                    .fault
                    .clone()
                    .unwrap_or_else(|| "unknown failure".into()),
            }),
            other => Err(ChangelogError::InvalidState {
                expected: "unopened",
                actual: other.name(),
            }),
        }
    }

    fn check_not_symlink(&self) -> Result<(), ChangelogError> {
        match fs::symlink_metadata(&self.path) {
            Ok(meta) if meta.file_type().is_symlink() => Err(ChangelogError::Symlink {
                path: self.path.display().to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Runs `f` against the data file, latching on failure.
    fn with_data<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&File) -> io::Result<T>,
    ) -> Result<T, ChangelogError> {
        let result = match self.file.as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "data file is not open",
            )),
        };
        result.map_err(|source| self.io_latch(op, source))
    }

    fn wipe_span(&mut self, start: u64, len: u64) -> Result<(), ChangelogError> {
        if len == 0 {
            return Ok(());
        }
        let chunk = vec![WIPE_PATTERN; len.min(WIPE_BUFFER_SIZE as u64) as usize];
        self.with_data("wipe", move |file| {
            let mut file = file;
            file.seek(SeekFrom::Start(start))?;
            let mut remaining = len;
            while remaining > 0 {
                let n = remaining.min(chunk.len() as u64) as usize;
                file.write_all(&chunk[..n])?;
                remaining -= n as u64;
            }
            Ok(())
        })
    }

    fn maybe_flush_index(&mut self) -> Result<(), ChangelogError> {
        if self.unflushed_index_bytes < self.config.index_flush_size {
            return Ok(());
        }
        self.flush_index()
    }

    fn flush_index(&mut self) -> Result<(), ChangelogError> {
        let result = match self.index.as_mut() {
            Some(index) => index.flush(),
            None => Ok(()),
        };
        match result {
            Ok(()) => {
                self.unflushed_index_bytes = 0;
                Ok(())
            }
            Err(source) => Err(self.io_latch("index flush", source)),
        }
    }

    fn latch(&mut self, err: ChangelogError) -> ChangelogError {
        error!(path = %self.path.display(), error = %err, "changelog failed");
        self.state = LogState::Errored;
        self.fault = Some(err.to_string());
        err
    }

    fn io_latch(&mut self, op: &'static str, source: io::Error) -> ChangelogError {
        self.latch(ChangelogError::Io { op, source })
    }
}

// ===== Lock file =====

/// Advisory sibling lock file holding the owner's pid. Removed on drop.
struct ChangelogLock {
    path: PathBuf,
}

impl ChangelogLock {
    fn acquire(data_path: &Path, config: &ChangelogConfig) -> Result<Self, ChangelogError> {
        let path = sibling_path(data_path, ".lock");
        let attempts = config.lock_retry_count.max(1);
        for attempt in 1..=attempts {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = file.write_all(process::id().to_string().as_bytes());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == attempts {
                        break;
                    }
                    debug!(path = %path.display(), attempt, "changelog lock busy, retrying");
                    thread::sleep(Duration::from_millis(config.lock_backoff_ms));
                }
                Err(source) => return Err(ChangelogError::Io { op: "lock", source }),
            }
        }
        Err(ChangelogError::Locked {
            path: path.display().to_string(),
        })
    }
}

impl Drop for ChangelogLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn index_path(path: &Path) -> PathBuf {
    sibling_path(path, ".index")
}
