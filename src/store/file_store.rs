//! Single-file key/value backend
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("ROLLUPDB")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - entry_count: 8 bytes (u64 LE)
//!   - index_offset: 8 bytes (u64 LE)
//!   - reserved: 32 bytes
//!
//! [BLOBS: variable]
//!   - compressed blobs, appended
//!
//! [INDEX: variable]
//!   - (key_len u16, key, offset u64, size u32, checksum 32 bytes), sorted by key
//! ```
//!
//! Blobs and indexes are only ever appended. `sync` writes a fresh index
//! after the last blob and then points the header at it, so a crash
//! before the header update leaves the previous index intact.
//!
//! Overwritten blobs and old indexes are garbage. Once garbage outweighs
//! the live data, `sync` compacts instead: live blobs are copied into a
//! new file that is renamed over the old one.

use super::{Backend, Blob};
use crate::model::Hash;
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const HEADER_SIZE: u64 = 64;

/// Garbage below this is never worth a compaction
const COMPACT_MIN_GARBAGE: u64 = 1 << 20;

#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
    checksum: Hash,
}

#[derive(Default)]
struct Index {
    entries: BTreeMap<String, IndexEntry>,
    dirty: bool,
    /// Sum of the sizes of indexed blobs
    live_bytes: u64,
}

impl Index {
    fn insert(&mut self, key: String, entry: IndexEntry) {
        self.live_bytes += entry.size as u64;
        if let Some(old) = self.entries.insert(key, entry) {
            self.live_bytes -= old.size as u64;
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.live_bytes -= old.size as u64;
                true
            }
            None => false,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (key, entry) in &self.entries {
            buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&entry.offset.to_le_bytes());
            buf.extend_from_slice(&entry.size.to_le_bytes());
            buf.extend_from_slice(entry.checksum.as_bytes());
        }
        buf
    }
}

fn header(entry_count: u64, index_offset: u64) -> [u8; HEADER_SIZE as usize] {
    let mut header = [0u8; HEADER_SIZE as usize];
    header[0..8].copy_from_slice(MAGIC);
    header[8..12].copy_from_slice(&VERSION.to_le_bytes());
    header[16..24].copy_from_slice(&entry_count.to_le_bytes());
    header[24..32].copy_from_slice(&index_offset.to_le_bytes());
    header
}

/// A key/value backend stored in a single file
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    index: RwLock<Index>,
    /// Next append position
    write_offset: RwLock<u64>,
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl FileBackend {
    /// Create a new database file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        file.write_all(&header(0, 0))?;
        file.sync_all()?;

        debug!(path = %path.display(), "created database file");
        Ok(FileBackend {
            path,
            file: RwLock::new(file),
            index: RwLock::new(Index::default()),
            write_offset: RwLock::new(HEADER_SIZE),
        })
    }

    /// Open an existing database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)
            .map_err(|_| Error::InvalidFile("File shorter than header".into()))?;

        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }

        let mut version = [0u8; 4];
        version.copy_from_slice(&header[8..12]);
        let version = u32::from_le_bytes(version);
        if version != VERSION {
            return Err(Error::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let entry_count = read_u64(&header, 16);
        let index_offset = read_u64(&header, 24);

        let mut index = Index::default();
        if index_offset > 0 {
            file.seek(SeekFrom::Start(index_offset))?;
            for _ in 0..entry_count {
                let mut len_buf = [0u8; 2];
                file.read_exact(&mut len_buf)?;
                let mut key_buf = vec![0u8; u16::from_le_bytes(len_buf) as usize];
                file.read_exact(&mut key_buf)?;
                let key = String::from_utf8(key_buf)
                    .map_err(|_| Error::Corruption("Non-UTF-8 key in index".into()))?;

                let mut entry_buf = [0u8; 44];
                file.read_exact(&mut entry_buf)?;
                let offset = read_u64(&entry_buf, 0);
                let mut size = [0u8; 4];
                size.copy_from_slice(&entry_buf[8..12]);
                let mut checksum = [0u8; 32];
                checksum.copy_from_slice(&entry_buf[12..44]);

                index.insert(
                    key,
                    IndexEntry {
                        offset,
                        size: u32::from_le_bytes(size),
                        checksum: Hash::from_bytes(checksum),
                    },
                );
            }
        }

        let write_offset = file.seek(SeekFrom::End(0))?;
        debug!(path = %path.display(), entries = index.entries.len(), "opened database file");

        Ok(FileBackend {
            path,
            file: RwLock::new(file),
            index: RwLock::new(index),
            write_offset: RwLock::new(write_offset),
        })
    }

    /// Open or create a database file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the file with only the live blobs and a fresh index. Makes
    /// every previous write durable, like [`sync`](Backend::sync).
    pub fn compact(&self) -> Result<()> {
        let mut index = self.index.write();
        let mut write_offset = self.write_offset.write();
        let mut file = self.file.write();
        self.compact_locked(&mut index, &mut write_offset, &mut file)
    }

    fn compact_locked(&self, index: &mut Index, write_offset: &mut u64, file: &mut File) -> Result<()> {
        let before = *write_offset;
        let mut compacted = Index::default();
        let mut offset = HEADER_SIZE;
        for (key, entry) in &index.entries {
            compacted.insert(
                key.clone(),
                IndexEntry {
                    offset,
                    ..entry.clone()
                },
            );
            offset += entry.size as u64;
        }
        let index_bytes = compacted.encode();

        // The old file stays untouched until the rename
        let tmp_path = self.path.with_extension("compacting");
        let tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut out = BufWriter::new(tmp);
        out.write_all(&header(compacted.entries.len() as u64, offset))?;
        let mut buf = Vec::new();
        for entry in index.entries.values() {
            buf.resize(entry.size as usize, 0);
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut buf)?;
            out.write_all(&buf)?;
        }
        out.write_all(&index_bytes)?;
        let new_file = out.into_inner().map_err(|e| e.into_error())?;
        new_file.sync_all()?;
        std::fs::rename(&tmp_path, &self.path)?;

        *file = new_file;
        *index = compacted;
        *write_offset = offset + index_bytes.len() as u64;
        info!(path = %self.path.display(), before, after = *write_offset, "compacted database file");
        Ok(())
    }
}

impl Backend for FileBackend {
    fn put(&self, key: &str, blob: &Blob) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(Error::InvalidFile(format!("Key too long: {} bytes", key.len())));
        }
        let compressed = blob.compress()?;
        let size = u32::try_from(compressed.len())
            .map_err(|_| Error::InvalidFile("Blob larger than 4 GiB".into()))?;

        // Lock order index, offset, file everywhere; compaction moves all three
        let mut index = self.index.write();
        let offset = {
            let mut write_offset = self.write_offset.write();
            let offset = *write_offset;

            let mut file = self.file.write();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&compressed)?;

            *write_offset = offset + size as u64;
            offset
        };

        index.insert(
            key.to_string(),
            IndexEntry {
                offset,
                size,
                checksum: blob.hash(),
            },
        );
        index.dirty = true;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Blob>> {
        let index = self.index.read();
        let Some(entry) = index.entries.get(key) else {
            return Ok(None);
        };

        let mut data = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.write();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut data)?;
        }
        let checksum = entry.checksum;
        drop(index);

        let blob = Blob::decompress(&data)?;
        if blob.hash() != checksum {
            return Err(Error::Corruption(format!("Checksum mismatch for {}", key)));
        }
        Ok(Some(blob))
    }

    fn exists(&self, key: &str) -> bool {
        self.index.read().entries.contains_key(key)
    }

    fn keys(&self) -> Vec<String> {
        self.index.read().entries.keys().cloned().collect()
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut index = self.index.write();
        let removed = index.remove(key);
        index.dirty |= removed;
        Ok(removed)
    }

    fn sync(&self) -> Result<()> {
        let mut index = self.index.write();
        if !index.dirty {
            return Ok(());
        }
        let mut write_offset = self.write_offset.write();
        let mut file = self.file.write();

        let garbage = (*write_offset - HEADER_SIZE).saturating_sub(index.live_bytes);
        if garbage > index.live_bytes.max(COMPACT_MIN_GARBAGE) {
            return self.compact_locked(&mut index, &mut write_offset, &mut file);
        }

        let index_offset = *write_offset;
        let buf = index.encode();
        file.seek(SeekFrom::Start(index_offset))?;
        file.write_all(&buf)?;
        file.sync_data()?;

        file.seek(SeekFrom::Start(16))?;
        file.write_all(&(index.entries.len() as u64).to_le_bytes())?;
        file.write_all(&index_offset.to_le_bytes())?;
        file.sync_all()?;

        *write_offset = index_offset + buf.len() as u64;
        index.dirty = false;
        Ok(())
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        if let Err(e) = self.sync() {
            warn!(path = %self.path.display(), error = %e, "sync on drop failed");
        }
    }
}
