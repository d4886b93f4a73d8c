//! Volume: one super block, one index, the in-memory needle cache and the
//! background machinery coordinating them.
//!
//! ## Concurrency model
//!
//! A single mutex guards the needle cache, the super-block append path and
//! the compaction state. Reads only hold it for the cache lookup; the data
//! itself comes from a lock-free positioned read against the shared file
//! handle. Each volume runs exactly two background threads: the index
//! writer (owned by [`Indexer`]) and the delete task, which batches
//! deferred tombstone offsets and writes the on-disk flag bytes without
//! taking the volume lock. Both shut down through channel closure.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::block::{self, SuperBlock, SUPER_HEADER_SIZE};
use crate::error::{Result, StoreError};
use crate::index::{Indexer, DEFAULT_RING_SIZE};
use crate::needle::{self, NeedleMeta};

/// Default capacity of the deferred-delete queue.
pub const DEFAULT_DEL_QUEUE_SIZE: usize = 10_240;
/// Deferred deletes are flushed once this many offsets accumulate.
pub const DEFAULT_DEL_BATCH_SIZE: usize = 50;
/// A non-empty delete batch waits at most this long.
pub const DEFAULT_DEL_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for a volume's in-memory queues and delete batching.
///
/// On-disk format constants are fixed and not configurable.
#[derive(Debug, Clone)]
pub struct VolumeOptions {
    /// Capacity of the index ring.
    pub index_ring_size: usize,
    /// Capacity of the deferred-delete queue.
    pub del_queue_size: usize,
    /// Number of queued offsets that triggers a flag-write pass.
    pub del_batch_size: usize,
    /// Maximum time a non-empty delete batch may wait.
    pub del_flush_interval: Duration,
}

impl Default for VolumeOptions {
    fn default() -> Self {
        Self {
            index_ring_size: DEFAULT_RING_SIZE,
            del_queue_size: DEFAULT_DEL_QUEUE_SIZE,
            del_batch_size: DEFAULT_DEL_BATCH_SIZE,
            del_flush_interval: DEFAULT_DEL_FLUSH_INTERVAL,
        }
    }
}

/// State guarded by the volume lock.
struct VolumeInner {
    block: SuperBlock,
    needles: HashMap<u64, NeedleMeta>,
    compacting: bool,
    compact_offset: u64,
    compact_keys: Vec<u64>,
}

/// One deployed storage unit.
///
/// Composes the super block, the index, the needle cache and the delete
/// task; upper layers route requests to volumes and swap them during
/// compaction.
pub struct Volume {
    /// Volume identifier, assigned by the upper layer.
    pub id: u32,
    inner: Mutex<VolumeInner>,
    indexer: Indexer,
    /// Shared handle for lock-free reads and delete-flag writes.
    block_file: Arc<File>,
    block_path: PathBuf,
    del_tx: Option<Sender<u32>>,
    del_handle: Option<JoinHandle<()>>,
}

impl Volume {
    /// Opens a volume with default options.
    pub fn open(
        id: u32,
        block_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
    ) -> Result<Self> {
        Self::open_with(id, block_path, index_path, VolumeOptions::default())
    }

    /// Opens both files, recovers the needle cache and starts the delete
    /// task.
    ///
    /// Recovery replays the index first, then scans the super block from
    /// the index-derived resume offset so needles persisted but never
    /// indexed are picked up (and indexed on the way). Cache entries
    /// pointing past the recovered data end are dropped; they belong to an
    /// index that outlived a torn data tail.
    pub fn open_with(
        id: u32,
        block_path: impl AsRef<Path>,
        index_path: impl AsRef<Path>,
        options: VolumeOptions,
    ) -> Result<Self> {
        let mut block = SuperBlock::open(block_path)?;
        let indexer = Indexer::open(index_path, options.index_ring_size)?;

        let mut needles = HashMap::new();
        let resume = indexer.recover(&mut needles)?;
        block.recover(&mut needles, Some(&indexer), needle::byte_offset(resume))?;
        let end = block.flushed_offset();
        let before = needles.len();
        needles.retain(|_, meta| meta.is_deleted() || needle::byte_offset(meta.offset()) < end);
        if needles.len() != before {
            warn!(
                "volume {}: dropped {} cache entries past the data end",
                id,
                before - needles.len()
            );
        }
        info!("volume {} recovered {} needles", id, needles.len());

        let block_file = block.shared_file();
        let block_path = block.path().to_path_buf();
        let (del_tx, del_rx) = bounded(options.del_queue_size);
        let del_handle = thread::Builder::new()
            .name(format!("hayloft-del-{}", id))
            .spawn({
                let file = Arc::clone(&block_file);
                let batch_size = options.del_batch_size;
                let interval = options.del_flush_interval;
                move || del_loop(&file, &del_rx, batch_size, interval)
            })?;

        Ok(Self {
            id,
            inner: Mutex::new(VolumeInner {
                block,
                needles,
                compacting: false,
                compact_offset: 0,
                compact_keys: Vec::new(),
            }),
            indexer,
            block_file,
            block_path,
            del_tx: Some(del_tx),
            del_handle: Some(del_handle),
        })
    }

    /// Volume file paths: (super block, index).
    pub fn files(&self) -> (&Path, &Path) {
        (&self.block_path, self.indexer.path())
    }

    /// Reads the needle for `key`, returning its payload slice inside
    /// `scratch`.
    ///
    /// The cache lookup runs under the volume lock; the record itself is
    /// fetched with one lock-free positioned read. A record whose on-disk
    /// flag says deleted demotes the cache entry to a tombstone.
    pub fn get<'a>(&self, key: u64, cookie: u64, scratch: &'a mut Vec<u8>) -> Result<&'a [u8]> {
        let meta = {
            let inner = self.inner.lock();
            match inner.needles.get(&key) {
                Some(meta) => *meta,
                None => return Err(StoreError::NoNeedle),
            }
        };
        if meta.is_deleted() {
            return Err(StoreError::Deleted);
        }
        scratch.resize(meta.size() as usize, 0);
        SuperBlock::read(&self.block_file, meta.offset(), scratch)?;

        let header = needle::parse_header(&scratch[..needle::HEADER_SIZE])?;
        if needle::HEADER_SIZE + header.body_len != scratch.len() {
            // the record found here is not the one the cache promised
            return Err(StoreError::Size(header.size));
        }
        let data = needle::parse_body(&scratch[needle::HEADER_SIZE..], &header)?;
        if header.key != key {
            return Err(StoreError::Key {
                expected: key,
                actual: header.key,
            });
        }
        if header.cookie != cookie {
            return Err(StoreError::Cookie);
        }
        if header.flag == needle::FLAG_DELETED {
            self.inner
                .lock()
                .needles
                .insert(key, NeedleMeta::deleted(meta.size()));
            return Err(StoreError::Deleted);
        }
        Ok(data)
    }

    /// Appends a needle, updates the index and the cache.
    ///
    /// Re-adding an existing key appends a fresh record and retires the
    /// old one through the delete queue.
    pub fn add(&self, key: u64, cookie: u64, data: &[u8]) -> Result<()> {
        let old = {
            let mut inner = self.inner.lock();
            let old = inner.needles.get(&key).copied();
            let (offset, size) = inner.block.add(key, cookie, data)?;
            self.indexer.add(key, offset, size)?;
            inner.needles.insert(key, NeedleMeta::new(offset, size));
            old
        };
        self.retire(key, old)
    }

    /// Acquires the volume lock for a batch of [`VolumeWriter::write`]
    /// calls followed by one [`VolumeWriter::flush`].
    pub fn lock(&self) -> VolumeWriter<'_> {
        VolumeWriter {
            inner: self.inner.lock(),
            volume: self,
        }
    }

    /// Logically deletes `key`.
    ///
    /// The cache entry becomes a tombstone immediately; the on-disk flag
    /// write is deferred to the delete task. Returns [`StoreError::NoNeedle`]
    /// when the key is absent or already deleted.
    pub fn del(&self, key: u64) -> Result<()> {
        let offset = {
            let mut inner = self.inner.lock();
            match inner.needles.get(&key).copied() {
                Some(meta) if !meta.is_deleted() => {
                    inner.needles.insert(key, NeedleMeta::deleted(meta.size()));
                    if inner.compacting {
                        inner.compact_keys.push(key);
                    }
                    meta.offset()
                }
                _ => return Err(StoreError::NoNeedle),
            }
        };
        self.post_delete(offset)
    }

    /// Starts compacting live needles into `target`.
    ///
    /// The copy scan runs outside the volume lock, so reads, writes and
    /// deletes on the source proceed concurrently; finish with
    /// [`Volume::stop_compaction`] to copy the tail written meanwhile and
    /// re-apply raced deletes.
    pub fn start_compaction(&self, target: &Volume) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.compacting {
                return Err(StoreError::InCompaction);
            }
            inner.compacting = true;
        }
        debug!("volume {}: compaction started", self.id);
        self.compact_range(target)
    }

    /// Finishes a compaction started with [`Volume::start_compaction`]:
    /// copies the tail, replays deletes recorded during the copy and
    /// resets the compaction state. With `target = None` the compaction is
    /// abandoned and only the state is reset.
    pub fn stop_compaction(&self, target: Option<&Volume>) -> Result<()> {
        let mut inner = self.inner.lock();
        let result = match target {
            Some(target) => Self::finish_compaction(&mut inner, &self.block_file, target),
            None => Ok(()),
        };
        inner.compacting = false;
        inner.compact_offset = 0;
        inner.compact_keys.clear();
        debug!("volume {}: compaction stopped", self.id);
        result
    }

    /// Copies live records in `[compact_offset, flushed end)` into
    /// `target` and advances the cursor.
    ///
    /// A record is copied when its on-disk flag is OK and the cache still
    /// maps its key to its offset; superseded and deleted records are
    /// skipped. Copies go through the target's interactive add path, so
    /// its index writer drains concurrently with the copy. Locks are only
    /// ever taken one at a time here: the source lock for the per-record
    /// cache check, the target lock inside its add.
    fn compact_range(&self, target: &Volume) -> Result<()> {
        let (from, to) = {
            let mut inner = self.inner.lock();
            inner.block.flush()?;
            (
                inner.compact_offset.max(SUPER_HEADER_SIZE),
                inner.block.flushed_offset(),
            )
        };
        let reached = block::scan(&self.block_file, from, to, |rec| {
            if rec.flag == needle::FLAG_DELETED {
                return Ok(());
            }
            let current = self.inner.lock().needles.get(&rec.key).copied();
            if current.is_some_and(|meta| meta.offset() == rec.offset) {
                target.add(rec.key, rec.cookie, rec.data)?;
            }
            Ok(())
        })?;
        self.inner.lock().compact_offset = reached;
        Ok(())
    }

    /// Tail pass of [`Volume::stop_compaction`], run under the source
    /// lock: no new write or delete can slip in between the tail copy and
    /// the delete replay. Source → target is the only nested lock order in
    /// the crate.
    fn finish_compaction(
        inner: &mut VolumeInner,
        file: &File,
        target: &Volume,
    ) -> Result<()> {
        inner.block.flush()?;
        let from = inner.compact_offset.max(SUPER_HEADER_SIZE);
        let to = inner.block.flushed_offset();
        let needles = &inner.needles;
        let reached = block::scan(file, from, to, |rec| {
            if rec.flag == needle::FLAG_DELETED {
                return Ok(());
            }
            if needles
                .get(&rec.key)
                .is_some_and(|meta| meta.offset() == rec.offset)
            {
                target.add(rec.key, rec.cookie, rec.data)?;
            }
            Ok(())
        })?;
        inner.compact_offset = reached;
        for key in inner.compact_keys.drain(..) {
            match target.del(key) {
                // a record flag-marked before the scan reached it never
                // made it into the target; nothing left to tombstone
                Ok(()) | Err(StoreError::NoNeedle) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Flushes everything and stops both background tasks, the index
    /// writer first, then the delete task.
    pub fn close(&mut self) {
        {
            let mut inner = self.inner.lock();
            if let Err(e) = inner.block.flush() {
                warn!("volume {}: flush on close failed: {}", self.id, e);
            }
        }
        self.indexer.close();
        drop(self.del_tx.take());
        if let Some(handle) = self.del_handle.take() {
            if handle.join().is_err() {
                warn!("volume {}: delete task panicked", self.id);
            }
        }
        if let Err(e) = self.block_file.sync_all() {
            warn!("volume {}: fsync on close failed: {}", self.id, e);
        }
        debug!("volume {} closed", self.id);
    }

    /// Queues the retired offset of an overwritten key.
    fn retire(&self, key: u64, old: Option<NeedleMeta>) -> Result<()> {
        match old {
            Some(meta) if !meta.is_deleted() => {
                warn!(
                    "volume {}: key {} overwritten, retiring offset {}",
                    self.id,
                    key,
                    meta.offset()
                );
                self.post_delete(meta.offset())
            }
            _ => Ok(()),
        }
    }

    /// Non-blocking send to the delete queue.
    fn post_delete(&self, offset: u32) -> Result<()> {
        let Some(del_tx) = &self.del_tx else {
            return Ok(());
        };
        match del_tx.try_send(offset) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("volume {}: delete queue full", self.id);
                Err(StoreError::DeleteQueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.close();
    }
}

/// RAII write guard over a locked volume: the batched write path.
///
/// Holds the volume lock across many [`VolumeWriter::write`] calls;
/// records become readable after [`VolumeWriter::flush`], which also wakes
/// the index writer once for the whole batch.
pub struct VolumeWriter<'a> {
    inner: MutexGuard<'a, VolumeInner>,
    volume: &'a Volume,
}

impl VolumeWriter<'_> {
    /// Buffered append of one needle; see [`Volume::add`] for semantics.
    pub fn write(&mut self, key: u64, cookie: u64, data: &[u8]) -> Result<()> {
        let old = self.inner.needles.get(&key).copied();
        let (offset, size) = self.inner.block.append(key, cookie, data)?;
        self.volume.indexer.append(key, offset, size)?;
        self.inner.needles.insert(key, NeedleMeta::new(offset, size));
        self.volume.retire(key, old)
    }

    /// Flushes the super block and wakes the index writer.
    pub fn flush(&mut self) -> Result<()> {
        self.inner.block.flush()?;
        self.volume.indexer.signal();
        Ok(())
    }
}

/// Delete task: batches deferred offsets, sorts them for sequential disk
/// access and writes the deleted flag in place.
///
/// A batch is flushed when it reaches `batch_size` or when `interval`
/// elapses with offsets pending. Queue disconnection is the shutdown
/// request; the remaining offsets are flushed before exiting.
fn del_loop(file: &File, del_rx: &Receiver<u32>, batch_size: usize, interval: Duration) {
    debug!("delete task started");
    let mut batch: Vec<u32> = Vec::with_capacity(batch_size);
    let mut done = false;
    while !done {
        match del_rx.recv_timeout(interval) {
            Ok(offset) => {
                batch.push(offset);
                if batch.len() < batch_size {
                    continue;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => done = true,
        }
        if batch.is_empty() {
            continue;
        }
        batch.sort_unstable();
        for &offset in &batch {
            if offset == needle::TOMBSTONE_OFFSET {
                continue;
            }
            if let Err(e) = SuperBlock::mark_deleted(file, offset) {
                warn!("delete flag write at {} failed: {}", offset, e);
                break;
            }
        }
        batch.clear();
    }
    debug!("delete task exited");
}
