//! Process-wide pool of zero-filled device buffers
//!
//! Zero-initialized intermediates are expensive to produce every
//! launch. When a kernel guarantees it leaves such a buffer zero again
//! (`resets_to_zero`), or the process opted in, the launch engine
//! borrows from this pool and returns the buffer before handing control
//! back to the caller. The pool is shared by all executors and guarded
//! by a mutex; executors only ever borrow.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::driver::{DeviceBuffer, DeviceContext};
use crate::error::Result;

/// Standard size classes (powers of four from 4 KiB to 256 MiB)
const CLASSES: [usize; 9] = [
    4096,
    16_384,
    65_536,
    262_144,
    1_048_576,
    4_194_304,
    16_777_216,
    67_108_864,
    268_435_456,
];

/// Default cap on pooled free bytes per process
const DEFAULT_MAX_POOLED_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// Smallest size class that fits `size`; oversize requests are pooled
/// at their exact size
#[must_use]
pub fn class_for(size: usize) -> usize {
    CLASSES.iter().copied().find(|&class| class >= size).unwrap_or(size)
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZeroedPoolStats {
    /// Borrows served from the free lists
    pub hits: usize,
    /// Borrows that allocated fresh memory
    pub misses: usize,
    /// Buffers currently lent out
    pub outstanding: usize,
    /// Bytes sitting in the free lists
    pub free_bytes: usize,
}

#[derive(Default)]
struct PoolInner {
    /// Free zeroed buffers keyed by (device, class bytes)
    free: BTreeMap<(usize, usize), Vec<DeviceBuffer>>,
    /// Buffers currently lent out
    lent: Vec<(usize, usize, Arc<DeviceBuffer>)>,
    stats: ZeroedPoolStats,
    max_pooled_bytes: usize,
}

impl PoolInner {
    fn free_bytes(&self) -> usize {
        self.free.iter().map(|((_, class), bufs)| class * bufs.len()).sum()
    }
}

fn pool() -> &'static Mutex<PoolInner> {
    static POOL: OnceLock<Mutex<PoolInner>> = OnceLock::new();
    POOL.get_or_init(|| {
        Mutex::new(PoolInner {
            max_pooled_bytes: DEFAULT_MAX_POOLED_BYTES,
            ..PoolInner::default()
        })
    })
}

/// Borrow a zero-filled buffer of at least `bytes` bytes.
///
/// The caller must drop every clone of the returned handle before the
/// next [`release_borrowed`] so the buffer can rejoin the free lists.
pub fn borrow_zeroed(ctx: &DeviceContext, bytes: usize) -> Result<Arc<DeviceBuffer>> {
    let class = class_for(bytes);
    let device = ctx.device_index();
    let mut inner = pool().lock().expect("zeroed pool poisoned");
    let reused = inner.free.get_mut(&(device, class)).and_then(Vec::pop);
    let buffer = match reused {
        Some(buffer) => {
            inner.stats.hits += 1;
            buffer
        }
        None => {
            inner.stats.misses += 1;
            DeviceBuffer::alloc_zeroed(ctx, class)?
        }
    };
    let handle = Arc::new(buffer);
    inner.lent.push((device, class, Arc::clone(&handle)));
    inner.stats.outstanding = inner.lent.len();
    Ok(handle)
}

/// Return every buffer whose borrowers are done back to the free lists.
///
/// Buffers still referenced elsewhere stay lent; buffers over the pool
/// cap are dropped instead of pooled.
pub fn release_borrowed() {
    let mut inner = pool().lock().expect("zeroed pool poisoned");
    let lent = std::mem::take(&mut inner.lent);
    for (device, class, handle) in lent {
        match Arc::try_unwrap(handle) {
            Ok(buffer) => {
                if inner.free_bytes() + class <= inner.max_pooled_bytes {
                    inner.free.entry((device, class)).or_default().push(buffer);
                } else {
                    drop(buffer);
                }
            }
            Err(handle) => inner.lent.push((device, class, handle)),
        }
    }
    inner.stats.outstanding = inner.lent.len();
    inner.stats.free_bytes = inner.free_bytes();
}

/// Current pool counters
#[must_use]
pub fn stats() -> ZeroedPoolStats {
    let mut inner = pool().lock().expect("zeroed pool poisoned");
    inner.stats.free_bytes = inner.free_bytes();
    inner.stats.outstanding = inner.lent.len();
    inner.stats
}

/// Drop all pooled free buffers (outstanding loans are unaffected)
pub fn clear() {
    let mut inner = pool().lock().expect("zeroed pool poisoned");
    inner.free.clear();
    inner.stats.free_bytes = 0;
}
