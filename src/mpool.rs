//! Fixed-capacity recycler for per-request state.
//!
//! A pool hands out boxed chunks that were freed earlier and never grows:
//! the capacity is a deployment decision sized against the device queue
//! depth. Exhaustion is surfaced by the caller as `ENOMEM` in the FUSE
//! reply.
//!
//! The intended use is one pool per polling thread: the poller allocates and
//! the completion path (often a different thread, e.g. the RPC service
//! thread or the ring reaper) frees. The backing ring is lock-free, so that
//! split is safe; handing chunks between unrelated pools is not supported.

use crossbeam_queue::ArrayQueue;

/// Pool construction error.
#[derive(Debug, thiserror::Error)]
pub enum MpoolError {
    #[error("pool capacity must be >= 4 and a power of 2, got {0}")]
    BadCapacity(usize),
}

pub struct Mpool<T> {
    ring: ArrayQueue<Box<T>>,
}

impl<T: Default> Mpool<T> {
    /// Create a pool holding `chunks` recycled objects.
    pub fn new(chunks: usize) -> Result<Mpool<T>, MpoolError> {
        if chunks < 4 || !chunks.is_power_of_two() {
            return Err(MpoolError::BadCapacity(chunks));
        }
        let ring = ArrayQueue::new(chunks);
        for _ in 0..chunks {
            let _ = ring.push(Box::new(T::default()));
        }
        Ok(Mpool { ring })
    }

    /// Take a chunk, or `None` when the pool is empty.
    pub fn alloc(&self) -> Option<Box<T>> {
        self.ring.pop()
    }

    /// Return a chunk. The chunk is reset to its default state so a later
    /// `alloc` never observes stale request state.
    pub fn free(&self, mut chunk: Box<T>) {
        *chunk = T::default();
        let _ = self.ring.push(chunk);
    }

    /// Number of chunks currently available.
    pub fn available(&self) -> usize {
        self.ring.len()
    }
}

impl<T> std::fmt::Debug for Mpool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mpool")
            .field("capacity", &self.ring.capacity())
            .field("available", &self.ring.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_bad_capacities() {
        assert!(Mpool::<u64>::new(0).is_err());
        assert!(Mpool::<u64>::new(2).is_err());
        assert!(Mpool::<u64>::new(48).is_err());
        assert!(Mpool::<u64>::new(4).is_ok());
        assert!(Mpool::<u64>::new(256).is_ok());
    }

    #[test]
    fn alloc_free_keeps_occupancy() {
        let pool: Mpool<u64> = Mpool::new(8).unwrap();
        assert_eq!(pool.available(), 8);
        let c = pool.alloc().unwrap();
        assert_eq!(pool.available(), 7);
        pool.free(c);
        assert_eq!(pool.available(), 8);
    }

    #[test]
    fn exhaustion_returns_none_without_blocking() {
        let pool: Mpool<u64> = Mpool::new(4).unwrap();
        let chunks: Vec<_> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert!(pool.alloc().is_none());
        for c in chunks {
            pool.free(c);
        }
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn freed_chunks_are_reset() {
        let pool: Mpool<u64> = Mpool::new(4).unwrap();
        let mut c = pool.alloc().unwrap();
        *c = 99;
        pool.free(c);
        // Drain until we see the recycled chunk; all must read as default.
        for _ in 0..4 {
            assert_eq!(*pool.alloc().unwrap(), 0);
        }
    }
}
