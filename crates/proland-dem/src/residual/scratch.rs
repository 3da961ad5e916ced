//! Reusable decode buffers shared by the threads reading one residual file.

use parking_lot::Mutex;

use super::format::MAX_TILE_SIZE;

/// Bytes reserved for each buffer: the largest tile at four bytes per sample.
pub const SCRATCH_BYTES: usize = (MAX_TILE_SIZE * MAX_TILE_SIZE * 4) as usize;

/// Compressed payload and decoded samples of one read.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    pub compressed: Vec<u8>,
    pub samples: Vec<i16>,
}

impl ScratchBuffers {
    fn with_capacity(bytes: usize) -> Self {
        Self {
            compressed: Vec::with_capacity(bytes),
            samples: Vec::with_capacity(bytes / 2),
        }
    }
}

/// Pool of [`ScratchBuffers`], one per concurrent reader.
///
/// Buffers are created on first use and returned to the pool when the
/// [`ScratchGuard`] drops, so a pool never holds more buffers than the
/// highest number of simultaneous reads it has seen.
#[derive(Debug)]
pub struct ScratchPool {
    bytes: usize,
    free: Mutex<Vec<ScratchBuffers>>,
}

impl ScratchPool {
    /// Create a new pool whose buffers reserve `bytes` each.
    pub const fn new(bytes: usize) -> Self {
        Self {
            bytes,
            free: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire(&self) -> ScratchGuard<'_> {
        let buffers = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| ScratchBuffers::with_capacity(self.bytes));
        ScratchGuard {
            pool: self,
            buffers,
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(SCRATCH_BYTES)
    }
}

/// Buffers checked out of a [`ScratchPool`].
pub struct ScratchGuard<'a> {
    pool: &'a ScratchPool,
    buffers: ScratchBuffers,
}

impl std::ops::Deref for ScratchGuard<'_> {
    type Target = ScratchBuffers;

    fn deref(&self) -> &ScratchBuffers {
        &self.buffers
    }
}

impl std::ops::DerefMut for ScratchGuard<'_> {
    fn deref_mut(&mut self) -> &mut ScratchBuffers {
        &mut self.buffers
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.pool.free.lock().push(buffers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_reused() {
        let pool = ScratchPool::new(64);
        {
            let mut a = pool.acquire();
            a.compressed.extend_from_slice(&[1, 2, 3]);
            let _b = pool.acquire();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
        let again = pool.acquire();
        assert!(again.compressed.capacity() >= 64);
        assert_eq!(pool.idle(), 1);
    }
}
