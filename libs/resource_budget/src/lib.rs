//! Process-wide pool of worker slots handed out to transfers, plus the
//! shared chunk-buffer pool used while streaming ciphertext/plaintext.
//!
//! Mirrors the teacher's `page_cache` in spirit (one process-wide shared
//! resource, created once at startup, explicitly sized) but is far
//! simpler: slots are fungible counters, not buffers with identity, so one
//! coarse lock over a counter is enough — there is no need for the
//! per-slot locking `page_cache.rs` uses to protect buffer contents.
#![deny(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Files at or below this size get a single worker: the per-part
/// overhead of spinning up more workers isn't worth it.
pub const SMALL_FILE_THRESHOLD: u64 = 8 * 1024 * 1024;
/// Files at or below this size are capped at 4 workers.
pub const MEDIUM_FILE_THRESHOLD: u64 = 256 * 1024 * 1024;
/// Default ceiling on workers handed to a single large-file transfer,
/// independent of how large the shared pool is.
pub const DEFAULT_MAX_WORKERS_PER_TRANSFER: usize = 16;

/// Size of one buffer in the shared chunk-buffer pool.
pub const CHUNK_BUFFER_SIZE: usize = 16 * 1024 * 1024;

struct Inner {
    // Signed so a forced "floor of one worker" grant against an exhausted
    // pool (see `allocate`) is recorded as debt rather than silently
    // un-tracked; the matching `release` then repays that debt instead of
    // inflating the pool past its original size.
    free_slots: Mutex<isize>,
    max_per_transfer: usize,
    // Advisory: most-recently-reported throughput samples feed nothing
    // load-bearing today, but give a future allocator policy something to
    // look at without changing the handle API.
    last_reported_bps: AtomicUsize,
}

/// One process-wide instance, created at engine start and explicitly torn
/// down (i.e. just dropped) at shutdown — no singleton lock-in, so tests
/// can build fresh copies.
#[derive(Clone)]
pub struct ResourceBudget {
    inner: Arc<Inner>,
}

impl ResourceBudget {
    /// `total_slots` is the size of the shared pool; `max_per_transfer`
    /// bounds how many of those slots any single transfer may hold at
    /// once, regardless of how empty the pool otherwise is.
    pub fn new(total_slots: usize, max_per_transfer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                free_slots: Mutex::new(total_slots as isize),
                max_per_transfer,
                last_reported_bps: AtomicUsize::new(0),
            }),
        }
    }

    /// Sizes the pool from the logical CPU count, the way the teacher's
    /// startup code derives pool sizes from `num_cpus`.
    pub fn new_default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self::new(cpus * 4, DEFAULT_MAX_WORKERS_PER_TRANSFER)
    }

    fn size_based_target(&self, file_size: u64, fan_out: usize) -> usize {
        let target = if file_size <= SMALL_FILE_THRESHOLD {
            1
        } else if file_size <= MEDIUM_FILE_THRESHOLD {
            4
        } else {
            self.inner.max_per_transfer
        };
        target.min(fan_out.max(1)).max(1)
    }

    /// Never blocks; may return a handle with fewer workers than the
    /// size-based policy would like if the pool is nearly exhausted, down
    /// to a minimum of one (a transfer always makes progress, just more
    /// slowly).
    pub fn allocate(&self, file_size: u64, fan_out: usize) -> ResourceBudgetHandle {
        let target = self.size_based_target(file_size, fan_out);
        let granted = {
            let mut free = self.inner.free_slots.lock();
            let available = (*free).max(0) as usize;
            // Even a fully exhausted pool still grants one slot: a transfer
            // must always be able to make forward progress. When the pool
            // has nothing free this goes into debt rather than skipping the
            // subtraction, so the matching `release` repays it instead of
            // inflating the pool past its original size.
            let granted = target.min(available).max(1);
            *free -= granted as isize;
            granted
        };
        debug!(target, granted, file_size, fan_out, "allocated worker budget");
        ResourceBudgetHandle {
            inner: self.inner.clone(),
            workers: AtomicUsize::new(granted),
            released: AtomicBool::new(false),
        }
    }
}

/// A transfer's claim on the shared worker pool. Must be released on every
/// exit path; `Drop` does so defensively if the caller forgot.
pub struct ResourceBudgetHandle {
    inner: Arc<Inner>,
    workers: AtomicUsize,
    released: AtomicBool,
}

impl ResourceBudgetHandle {
    pub fn workers(&self) -> usize {
        self.workers.load(Ordering::Relaxed)
    }

    /// Opportunistic expansion: grabs up to `k` more slots if the pool has
    /// them free right now. Returns how many were actually acquired (may
    /// be zero).
    pub fn try_acquire_more(&self, k: usize) -> usize {
        if k == 0 || self.released.load(Ordering::Relaxed) {
            return 0;
        }
        let acquired = {
            let mut free = self.inner.free_slots.lock();
            let available = (*free).max(0) as usize;
            let acquired = k.min(available);
            *free -= acquired as isize;
            acquired
        };
        if acquired > 0 {
            self.workers.fetch_add(acquired, Ordering::Relaxed);
        }
        acquired
    }

    /// Advisory hint for future allocation decisions; does not affect this
    /// handle's own grant.
    pub fn record_throughput(&self, bytes_per_second: usize) {
        self.inner
            .last_reported_bps
            .store(bytes_per_second, Ordering::Relaxed);
    }

    /// Returns all held slots to the pool. Idempotent: a second call is a
    /// no-op.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let held = self.workers.swap(0, Ordering::Relaxed);
        if held > 0 {
            *self.inner.free_slots.lock() += held as isize;
        }
    }
}

impl Drop for ResourceBudgetHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Relaxed) {
            warn!("ResourceBudgetHandle dropped without explicit release; releasing now");
            self.release();
        }
    }
}

/// Process-wide pool of fixed-size buffers shared by the encryption
/// producer and the download worker pool. Implemented as a plain
/// mutex-guarded free list: the spec allows "any lock-free pooling
/// strategy", but the teacher's own shared caches (`page_cache.rs`) favor
/// a simple lock over a hand-rolled lock-free structure, and a mutex over
/// a `Vec<Vec<u8>>` is correct and just as fast at this contention level.
#[derive(Clone)]
pub struct BufferPool {
    free: Arc<Mutex<Vec<Vec<u8>>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            buffer_size,
        }
    }

    pub fn new_default() -> Self {
        Self::new(CHUNK_BUFFER_SIZE)
    }

    /// Takes a buffer from the pool, allocating a fresh one if empty.
    pub fn acquire(&self) -> Vec<u8> {
        let mut free = self.free.lock();
        free.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Returns a buffer for reuse. Callers must call this even on error
    /// paths (e.g. in a `Drop` guard or after `?`); buffers of the wrong
    /// size are silently dropped rather than stored, since the pool is
    /// only useful when every buffer it holds is reusable at the expected
    /// size.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.buffer_size {
            return;
        }
        buf.clear();
        self.free.lock().push(buf);
    }
}
