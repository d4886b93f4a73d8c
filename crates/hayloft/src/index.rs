//! Secondary index file and its asynchronous writer.
//!
//! The index exists to make recovery fast: instead of scanning gigabytes
//! of needle records, a volume replays the compact index and then scans
//! only the data-file tail the index had not yet reached.
//!
//! ## Record Format (16 bytes, big-endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Key: u64 (8 bytes)                         │
//! │  Offset: u32 (4 bytes, needle offset)       │
//! │  Size: u32 (4 bytes, full record length)    │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Interactive writers push triples into a bounded ring and fire a
//! coalesced wakeup; a single background thread drains the ring into a
//! buffered writer and flushes. Write latency therefore never waits on the
//! index disk. Crashes may lose a tail of the index; the super-block scan
//! fills the gap on the next open.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::needle::{self, NeedleMeta};

/// Size of one on-disk index record: key(8) + offset(4) + size(4).
pub const INDEX_RECORD_SIZE: usize = 16;
/// Default capacity of the in-memory index ring.
pub const DEFAULT_RING_SIZE: usize = 102_400;

/// Capacity of the index writer buffer.
const WRITE_BUF_SIZE: usize = needle::NEEDLE_MAX_SIZE;

/// One (key, offset, size) index triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord {
    /// Needle key.
    pub key: u64,
    /// Needle offset in the super block.
    pub offset: u32,
    /// Full record length in bytes.
    pub size: u32,
}

impl IndexRecord {
    fn encode(&self) -> [u8; INDEX_RECORD_SIZE] {
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        buf[..8].copy_from_slice(&self.key.to_be_bytes());
        buf[8..12].copy_from_slice(&self.offset.to_be_bytes());
        buf[12..].copy_from_slice(&self.size.to_be_bytes());
        buf
    }

    fn parse(buf: &[u8]) -> Self {
        Self {
            key: u64::from_be_bytes(buf[..8].try_into().unwrap()),
            offset: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            size: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    /// A triple is plausible when its offset lies past the super-block
    /// prefix and its size is a positive aligned record length.
    fn is_sane(&self) -> bool {
        self.offset != needle::TOMBSTONE_OFFSET
            && self.size >= 1
            && self.size as usize <= needle::MAX_RECORD_SIZE
            && self.size as usize % needle::NEEDLE_ALIGNMENT == 0
    }
}

/// Buffered positional writer over the index file.
struct IndexWriter {
    file: Arc<File>,
    buf: Vec<u8>,
    /// Byte offset where `buf` begins.
    pos: u64,
}

impl IndexWriter {
    fn write(&mut self, record: &IndexRecord) -> Result<()> {
        if self.buf.len() + INDEX_RECORD_SIZE > WRITE_BUF_SIZE {
            self.flush()?;
        }
        self.buf.extend_from_slice(&record.encode());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.file.write_all_at(&self.buf, self.pos)?;
        self.pos += self.buf.len() as u64;
        self.buf.clear();
        Ok(())
    }
}

/// Secondary index: an append-only file of fixed-size triples, fed by a
/// bounded ring and persisted by one background writer thread.
pub struct Indexer {
    path: PathBuf,
    file: Arc<File>,
    writer: Arc<Mutex<IndexWriter>>,
    ring: Arc<ArrayQueue<IndexRecord>>,
    signal: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Indexer {
    /// Opens (creating if absent) an index file and starts the background
    /// writer.
    pub fn open(path: impl AsRef<Path>, ring_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?,
        );
        let pos = file.metadata()?.len();
        let writer = Arc::new(Mutex::new(IndexWriter {
            file: Arc::clone(&file),
            buf: Vec::with_capacity(WRITE_BUF_SIZE),
            pos,
        }));
        let ring = Arc::new(ArrayQueue::new(ring_size));
        let (signal_tx, signal_rx) = bounded(1);
        let handle = thread::Builder::new().name("hayloft-index".into()).spawn({
            let ring = Arc::clone(&ring);
            let writer = Arc::clone(&writer);
            let file = Arc::clone(&file);
            move || write_loop(signal_rx, &ring, &writer, &file)
        })?;
        Ok(Self {
            path,
            file,
            writer,
            ring,
            signal: Some(signal_tx),
            handle: Some(handle),
        })
    }

    /// Queues a triple and wakes the writer; the interactive path.
    pub fn add(&self, key: u64, offset: u32, size: u32) -> Result<()> {
        self.append(key, offset, size)?;
        self.signal();
        Ok(())
    }

    /// Queues a triple without waking the writer.
    ///
    /// Batched callers append many triples and invoke [`Indexer::signal`]
    /// once after the batch.
    pub fn append(&self, key: u64, offset: u32, size: u32) -> Result<()> {
        self.ring
            .push(IndexRecord { key, offset, size })
            .map_err(|_| StoreError::RingFull)
    }

    /// Synchronous buffered write, bypassing the ring.
    ///
    /// Used during recovery only; callers must not interleave it with the
    /// ring producers on the same instance.
    pub fn write(&self, key: u64, offset: u32, size: u32) -> Result<()> {
        self.writer.lock().write(&IndexRecord { key, offset, size })
    }

    /// Drains the buffered writer to the file.
    pub fn flush(&self) -> Result<()> {
        self.writer.lock().flush()
    }

    /// Coalesced wakeup of the writer task; duplicate signals are dropped.
    pub fn signal(&self) {
        if let Some(signal) = &self.signal {
            let _ = signal.try_send(());
        }
    }

    /// Path of the index file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rebuilds the needle cache from the index file.
    ///
    /// Returns the needle offset just past the furthest indexed record;
    /// the super-block scan resumes there. On the first malformed triple
    /// the file and the writer are repositioned to the last good offset so
    /// subsequently appended triples stay parseable.
    pub fn recover(&self, cache: &mut HashMap<u64, NeedleMeta>) -> Result<u32> {
        let len = self.file.metadata()?.len();
        let mut pos: u64 = 0;
        let mut next: u32 = 0;
        let mut buf = [0u8; INDEX_RECORD_SIZE];
        while pos + INDEX_RECORD_SIZE as u64 <= len {
            self.file.read_exact_at(&mut buf, pos)?;
            let record = IndexRecord::parse(&buf);
            if !record.is_sane() {
                warn!(
                    "index {}: malformed record at {}, stopping recovery",
                    self.path.display(),
                    pos
                );
                break;
            }
            cache.insert(record.key, NeedleMeta::new(record.offset, record.size));
            next = next.max(record.offset + record.size / needle::NEEDLE_ALIGNMENT as u32);
            pos += INDEX_RECORD_SIZE as u64;
        }
        if pos != len {
            self.file.set_len(pos)?;
        }
        self.writer.lock().pos = pos;
        debug!(
            "index {} recovered, resume needle offset {}",
            self.path.display(),
            next
        );
        Ok(next)
    }

    /// Requests writer shutdown and joins it.
    ///
    /// The writer performs a final drain + flush + fsync before exiting.
    pub fn close(&mut self) {
        drop(self.signal.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("index {}: writer thread panicked", self.path.display());
            }
        }
    }
}

impl Drop for Indexer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Background writer loop: wait for a signal, drain the ring fully, flush.
///
/// Channel closure is the shutdown request; the loop then drains whatever
/// is left, flushes and fsyncs. I/O errors terminate the task without
/// touching the rest of the volume.
fn write_loop(
    signal: Receiver<()>,
    ring: &ArrayQueue<IndexRecord>,
    writer: &Mutex<IndexWriter>,
    file: &File,
) {
    debug!("index writer started");
    while signal.recv().is_ok() {
        if let Err(e) = drain(ring, writer) {
            warn!("index writer error: {}", e);
            break;
        }
    }
    if let Err(e) = drain(ring, writer) {
        warn!("index writer final drain error: {}", e);
    }
    if let Err(e) = file.sync_all() {
        warn!("index fsync error: {}", e);
    }
    debug!("index writer exited");
}

fn drain(ring: &ArrayQueue<IndexRecord>, writer: &Mutex<IndexWriter>) -> Result<()> {
    let mut writer = writer.lock();
    while let Some(record) = ring.pop() {
        writer.write(&record)?;
    }
    writer.flush()
}
