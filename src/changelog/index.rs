//! Companion index file: record number to byte range.
//!
//! The index is advisory. Opening tolerates a missing, foreign, torn, or
//! internally inconsistent file by keeping the longest valid prefix and
//! healing the file to match; the data-file scan recovers the rest.
//! Entries are appended in memory and written out in batches.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use super::format::{INDEX_ENTRY_LEN, INDEX_HEADER_LEN, IndexEntry, IndexHeader};

pub(crate) struct ChangelogIndex {
    path: PathBuf,
    file: File,
    uuid: Uuid,
    entries: Vec<IndexEntry>,
    flushed_count: usize,
    enable_sync: bool,
}

impl ChangelogIndex {
    pub fn create(path: PathBuf, uuid: Uuid, enable_sync: bool) -> io::Result<Self> {
        let file = write_replacement(&path, uuid, &[])?;
        Ok(Self {
            path,
            file,
            uuid,
            entries: Vec::new(),
            flushed_count: 0,
            enable_sync,
        })
    }

    /// Opens an existing index, keeping the longest prefix of entries that
    /// is sequential and contiguous. Anything unusable is discarded and
    /// the file healed; a missing or foreign file becomes a fresh one.
    pub fn open(path: PathBuf, uuid: Uuid, enable_sync: bool) -> io::Result<Self> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Self::create(path, uuid, enable_sync);
            }
            Err(err) => return Err(err),
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < INDEX_HEADER_LEN {
            warn!(path = %path.display(), "changelog index header truncated, recreating");
            return Self::create(path, uuid, enable_sync);
        }
        let mut header_buf = [0u8; INDEX_HEADER_LEN];
        header_buf.copy_from_slice(&raw[..INDEX_HEADER_LEN]);
        match IndexHeader::decode(&header_buf) {
            Ok(header) if header.uuid == uuid => {}
            Ok(_) => {
                warn!(path = %path.display(), "changelog index belongs to another changelog, recreating");
                return Self::create(path, uuid, enable_sync);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "changelog index header invalid, recreating");
                return Self::create(path, uuid, enable_sync);
            }
        }
        let body = &raw[INDEX_HEADER_LEN..];
        let usable = body.len() - body.len() % INDEX_ENTRY_LEN;
        let mut entries = Vec::with_capacity(usable / INDEX_ENTRY_LEN);
        let mut next_offset: Option<i64> = None;
        for (i, chunk) in body[..usable].chunks_exact(INDEX_ENTRY_LEN).enumerate() {
            let entry = IndexEntry::decode(chunk);
            if entry.record_index != i as i32 || entry.total_len == 0 {
                break;
            }
            if let Some(expected) = next_offset
                && entry.offset != expected
            {
                break;
            }
            next_offset = Some(entry.end());
            entries.push(entry);
        }
        let keep_len = (INDEX_HEADER_LEN + entries.len() * INDEX_ENTRY_LEN) as u64;
        if keep_len < raw.len() as u64 {
            warn!(
                path = %path.display(),
                kept = entries.len(),
                dropped_bytes = raw.len() as u64 - keep_len,
                "dropping unusable changelog index tail"
            );
            file.set_len(keep_len)?;
        }
        let flushed_count = entries.len();
        Ok(Self {
            path,
            file,
            uuid,
            entries,
            flushed_count,
            enable_sync,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// End offset of the last indexed record, if any.
    pub fn last_indexed_end(&self) -> Option<i64> {
        self.entries.last().map(IndexEntry::end)
    }

    /// Records an entry in memory; [`flush`](Self::flush) writes it out.
    pub fn append(&mut self, entry: IndexEntry) {
        self.entries.push(entry);
    }

    /// Writes all unflushed entries after the flushed prefix.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.flushed_count == self.entries.len() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity((self.entries.len() - self.flushed_count) * INDEX_ENTRY_LEN);
        for entry in &self.entries[self.flushed_count..] {
            buf.extend_from_slice(&entry.encode());
        }
        let offset = (INDEX_HEADER_LEN + self.flushed_count * INDEX_ENTRY_LEN) as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        if self.enable_sync {
            self.file.sync_data()?;
        }
        self.flushed_count = self.entries.len();
        Ok(())
    }

    /// Rewrites the index to exactly the first `count` entries through an
    /// atomic replace, so a crash leaves either the old or the new index.
    pub fn rebuild_truncated(&mut self, count: usize) -> io::Result<()> {
        self.entries.truncate(count);
        self.file = write_replacement(&self.path, self.uuid, &self.entries)?;
        self.flushed_count = self.entries.len();
        Ok(())
    }
}

/// Writes a complete index file beside `path` and renames it into place,
/// returning the reopened handle.
fn write_replacement(path: &Path, uuid: Uuid, entries: &[IndexEntry]) -> io::Result<File> {
    let tmp = tmp_path(path);
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut buf = Vec::with_capacity(INDEX_HEADER_LEN + entries.len() * INDEX_ENTRY_LEN);
        buf.extend_from_slice(&IndexHeader { uuid }.encode());
        for entry in entries {
            buf.extend_from_slice(&entry.encode());
        }
        file.write_all(&buf)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)?;
    OpenOptions::new().read(true).write(true).open(path)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".tmp");
    PathBuf::from(raw)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(record_index: i32, total_len: u32, offset: i64) -> IndexEntry {
        IndexEntry {
            record_index,
            total_len,
            offset,
        }
    }

    #[test]
    fn entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.index");
        let uuid = Uuid::new_v4();
        let mut index = ChangelogIndex::create(path.clone(), uuid, false).unwrap();
        index.append(entry(0, 40, 4096));
        index.append(entry(1, 40, 4136));
        index.flush().unwrap();
        let reopened = ChangelogIndex::open(path, uuid, false).unwrap();
        assert_eq!(reopened.entries(), index.entries());
        assert_eq!(reopened.last_indexed_end(), Some(4176));
    }

    #[test]
    fn torn_tail_is_dropped_and_healed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.index");
        let uuid = Uuid::new_v4();
        let mut index = ChangelogIndex::create(path.clone(), uuid, false).unwrap();
        index.append(entry(0, 40, 4096));
        index.flush().unwrap();
        // Simulate a crash mid-write of the second entry.
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xab; 7]).unwrap();
        drop(file);
        let reopened = ChangelogIndex::open(path.clone(), uuid, false).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            (INDEX_HEADER_LEN + INDEX_ENTRY_LEN) as u64
        );
    }

    #[test]
    fn non_contiguous_entries_stop_the_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.index");
        let uuid = Uuid::new_v4();
        let mut index = ChangelogIndex::create(path.clone(), uuid, false).unwrap();
        index.append(entry(0, 40, 4096));
        // Gap: claims to start past the previous entry's end.
        index.append(entry(1, 40, 5000));
        index.flush().unwrap();
        let reopened = ChangelogIndex::open(path, uuid, false).unwrap();
        assert_eq!(reopened.len(), 1);
    }

    #[test]
    fn foreign_uuid_recreates_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.index");
        let mut index = ChangelogIndex::create(path.clone(), Uuid::new_v4(), false).unwrap();
        index.append(entry(0, 40, 4096));
        index.flush().unwrap();
        let reopened = ChangelogIndex::open(path, Uuid::new_v4(), false).unwrap();
        assert_eq!(reopened.len(), 0);
    }

    #[test]
    fn rebuild_truncated_rewrites_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.index");
        let uuid = Uuid::new_v4();
        let mut index = ChangelogIndex::create(path.clone(), uuid, false).unwrap();
        index.append(entry(0, 40, 4096));
        index.append(entry(1, 40, 4136));
        index.append(entry(2, 48, 4176));
        index.flush().unwrap();
        index.rebuild_truncated(1).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(
            fs::metadata(&path).unwrap().len(),
            (INDEX_HEADER_LEN + INDEX_ENTRY_LEN) as u64
        );
        let reopened = ChangelogIndex::open(path, uuid, false).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.last_indexed_end(), Some(4136));
    }
}
