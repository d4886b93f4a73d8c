//! Super block: the append-only needle data file.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  File Prefix (8 bytes)                      │
//! │  - Magic: "VBLK" (4 bytes)                  │
//! │  - Version: u8 (1 byte) = 1                 │
//! │  - Reserved: 3 zero bytes                   │
//! ├─────────────────────────────────────────────┤
//! │  Needle records (8-byte aligned, repeated)  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Appends go through an in-memory buffer and are serialized by the owning
//! volume; reads are positioned (`pread`) and run lock-free against the
//! shared file handle. Tombstoning rewrites the single flag byte of a
//! record in place, which never conflicts with appends (those touch
//! strictly higher offsets) and leaves the payload checksum intact.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::index::Indexer;
use crate::needle::{self, NeedleMeta};

/// Magic bytes prefixing a super-block file.
pub const SUPER_MAGIC: [u8; 4] = *b"VBLK";
/// Super-block format version.
pub const SUPER_VERSION: u8 = 1;
/// Length of the file prefix; the first needle record starts here, so
/// needle offset 0 never addresses a record.
pub const SUPER_HEADER_SIZE: u64 = 8;

/// Nominal capacity of the append buffer.
const WRITE_BUF_SIZE: usize = needle::NEEDLE_MAX_SIZE;

/// Append-only file of needle records with positioned random reads and
/// in-place flag writes for tombstoning.
pub struct SuperBlock {
    file: Arc<File>,
    path: PathBuf,
    /// Appended records not yet written to the file.
    buf: Vec<u8>,
    /// Byte offset where `buf` begins; everything below it is readable.
    flushed: u64,
}

impl SuperBlock {
    /// Opens (creating if absent) a super-block file.
    ///
    /// New files receive the 8-byte prefix; existing files must carry it.
    /// The append cursor starts at end-of-file rounded down to the 8-byte
    /// boundary; [`SuperBlock::recover`] pulls it back further when the
    /// tail is torn.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let flushed = if len < SUPER_HEADER_SIZE {
            let mut prefix = [0u8; SUPER_HEADER_SIZE as usize];
            prefix[..4].copy_from_slice(&SUPER_MAGIC);
            prefix[4] = SUPER_VERSION;
            file.write_all_at(&prefix, 0)?;
            file.set_len(SUPER_HEADER_SIZE)?;
            SUPER_HEADER_SIZE
        } else {
            let mut prefix = [0u8; SUPER_HEADER_SIZE as usize];
            file.read_exact_at(&mut prefix, 0)?;
            if prefix[..4] != SUPER_MAGIC {
                return Err(StoreError::BlockMagic([
                    prefix[0], prefix[1], prefix[2], prefix[3],
                ]));
            }
            if prefix[4] != SUPER_VERSION {
                return Err(StoreError::Version(prefix[4]));
            }
            len & !(needle::NEEDLE_ALIGNMENT as u64 - 1)
        };
        debug!("super block {} opened at offset {}", path.display(), flushed);
        Ok(Self {
            file: Arc::new(file),
            path,
            buf: Vec::with_capacity(WRITE_BUF_SIZE),
            flushed,
        })
    }

    /// Shared file handle for lock-free positioned reads and flag writes.
    pub fn shared_file(&self) -> Arc<File> {
        Arc::clone(&self.file)
    }

    /// Path of the data file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append cursor in bytes, including buffered records.
    pub fn end_offset(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    /// Byte offset below which records are in the file and readable.
    pub fn flushed_offset(&self) -> u64 {
        self.flushed
    }

    /// Buffered append of one needle record.
    ///
    /// Returns the needle offset and the full record length in bytes. Not
    /// safe for concurrent callers; the owning volume serializes appends.
    pub fn append(&mut self, key: u64, cookie: u64, data: &[u8]) -> Result<(u32, u32)> {
        let (padding, record_len) = needle::sizing(data.len())?;
        if !self.buf.is_empty() && self.buf.len() + record_len > WRITE_BUF_SIZE {
            self.flush()?;
        }
        let offset = needle::block_offset(self.end_offset());
        needle::encode(&mut self.buf, padding, key, cookie, data);
        Ok((offset, record_len as u32))
    }

    /// Appends one record and makes it immediately readable.
    pub fn add(&mut self, key: u64, cookie: u64, data: &[u8]) -> Result<(u32, u32)> {
        let appended = self.append(key, cookie, data)?;
        self.flush()?;
        Ok(appended)
    }

    /// Writes buffered records out to the file.
    pub fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all_at(&self.buf, self.flushed)?;
        self.flushed += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }

    /// Positioned read of `out.len()` bytes at `offset`.
    ///
    /// A single `pread`, atomic with respect to concurrent appends.
    pub fn read(file: &File, offset: u32, out: &mut [u8]) -> Result<()> {
        file.read_exact_at(out, needle::byte_offset(offset))?;
        Ok(())
    }

    /// Sets the on-disk deleted flag of the record at `offset`.
    ///
    /// Idempotent; the checksum covers only the payload, so a flagged
    /// record still parses.
    pub fn mark_deleted(file: &File, offset: u32) -> Result<()> {
        file.write_all_at(
            &[needle::FLAG_DELETED],
            needle::byte_offset(offset) + needle::FLAG_OFFSET,
        )?;
        Ok(())
    }

    /// Rebuilds cache entries by scanning records from byte offset `from`.
    ///
    /// Every valid record is inserted into `cache` (tombstoned when its
    /// flag says deleted) and, when `indexer` is given, appended to the
    /// index through its synchronous write path so the index catches up
    /// with needles persisted but not yet indexed before a crash. The scan
    /// stops at the first torn or corrupt record and truncates the file
    /// back to the last good boundary.
    pub fn recover(
        &mut self,
        cache: &mut HashMap<u64, NeedleMeta>,
        indexer: Option<&Indexer>,
        from: u64,
    ) -> Result<()> {
        let start = from.clamp(SUPER_HEADER_SIZE, self.flushed);
        let reached = scan(&self.file, start, self.flushed, |rec| {
            let meta = if rec.flag == needle::FLAG_DELETED {
                NeedleMeta::deleted(rec.size)
            } else {
                NeedleMeta::new(rec.offset, rec.size)
            };
            cache.insert(rec.key, meta);
            if let Some(indexer) = indexer {
                indexer.write(rec.key, rec.offset, rec.size)?;
            }
            Ok(())
        })?;
        if reached != self.flushed {
            warn!(
                "super block {}: truncating torn tail at {} (end was {})",
                self.path.display(),
                reached,
                self.flushed
            );
            self.file.set_len(reached)?;
            self.flushed = reached;
        }
        if let Some(indexer) = indexer {
            indexer.flush()?;
        }
        Ok(())
    }
}

impl Drop for SuperBlock {
    fn drop(&mut self) {
        // best effort for standalone use; volumes flush on close
        if let Err(e) = self.flush() {
            warn!(
                "super block {}: flush on drop failed: {}",
                self.path.display(),
                e
            );
        }
    }
}

/// One record yielded by [`scan`].
pub(crate) struct Record<'a> {
    /// Needle offset of the record.
    pub offset: u32,
    /// Needle key.
    pub key: u64,
    /// Anti-enumeration cookie.
    pub cookie: u64,
    /// Flag byte.
    pub flag: u8,
    /// Payload bytes.
    pub data: &'a [u8],
    /// Full record length in bytes.
    pub size: u32,
}

/// Walks valid records in the byte range `[from, to)`, invoking `f` for
/// each one; stops quietly at the first torn or corrupt record.
///
/// Returns the byte offset reached, always a record boundary. Errors from
/// `f` abort the walk and propagate.
pub(crate) fn scan(
    file: &File,
    from: u64,
    to: u64,
    mut f: impl FnMut(&Record<'_>) -> Result<()>,
) -> Result<u64> {
    let mut pos = from;
    let mut header_buf = [0u8; needle::HEADER_SIZE];
    let mut body = Vec::new();
    while pos + needle::HEADER_SIZE as u64 <= to {
        if file.read_exact_at(&mut header_buf, pos).is_err() {
            break;
        }
        let header = match needle::parse_header(&header_buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("scan stopped at {}: {}", pos, e);
                break;
            }
        };
        let record_len = needle::HEADER_SIZE + header.body_len;
        if pos + record_len as u64 > to {
            break;
        }
        body.resize(header.body_len, 0);
        if file
            .read_exact_at(&mut body, pos + needle::HEADER_SIZE as u64)
            .is_err()
        {
            break;
        }
        let data = match needle::parse_body(&body, &header) {
            Ok(data) => data,
            Err(e) => {
                debug!("scan stopped at {}: {}", pos, e);
                break;
            }
        };
        f(&Record {
            offset: needle::block_offset(pos),
            key: header.key,
            cookie: header.cookie,
            flag: header.flag,
            data,
            size: record_len as u32,
        })?;
        pos += record_len as u64;
    }
    Ok(pos)
}
