//! io_uring submission fanout and the completion reaper.
//!
//! One ring per polling thread so submissions never contend; a single
//! reaper thread drains every completion queue and hands each CQE's
//! user_data/result pair back to the backend. Rings sit behind short-held
//! mutexes, which keeps the split (submit from poller, reap from the reaper
//! thread) safe without touching the ring internals.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use io_uring::{squeue, IoUring};
use log::error;
use parking_lot::Mutex;

pub(crate) struct RingSet {
    rings: Vec<Mutex<IoUring>>,
    stop: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl RingSet {
    pub(crate) fn new(nthreads: u16, entries: u32) -> io::Result<Arc<RingSet>> {
        let mut rings = Vec::with_capacity(nthreads as usize);
        for _ in 0..nthreads {
            rings.push(Mutex::new(IoUring::new(entries)?));
        }
        Ok(Arc::new(RingSet {
            rings,
            stop: AtomicBool::new(false),
            reaper: Mutex::new(None),
        }))
    }

    /// Queue one SQE on the calling thread's ring and submit it. Returns a
    /// positive errno on failure; a full submission queue surfaces as
    /// `ENOMEM` like an exhausted request pool.
    ///
    /// Safety contract: the entry's buffers (paths, iovec arrays, statx
    /// destination) must stay valid until the reaper observes the matching
    /// completion.
    pub(crate) fn submit(&self, thread_id: u16, entry: squeue::Entry) -> Result<(), i32> {
        let mut ring = self.rings[thread_id as usize].lock();
        // Safety: per the contract above the referenced buffers outlive the
        // operation; they live in the RCB addressed by user_data.
        if unsafe { ring.submission().push(&entry) }.is_err() {
            error!("not enough uring sqe elements available");
            return Err(libc::ENOMEM);
        }
        ring.submit()
            .map(|_| ())
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    /// Start the completion reaper. `complete` receives each CQE's
    /// user_data and result.
    pub(crate) fn start_reaper<F>(self: &Arc<RingSet>, complete: F)
    where
        F: Fn(u64, i32) + Send + 'static,
    {
        let rings = self.clone();
        let handle = std::thread::Builder::new()
            .name("dpfs-uring-reaper".into())
            .spawn(move || {
                let mut batch: Vec<(u64, i32)> = Vec::with_capacity(64);
                while !rings.stop.load(Ordering::Acquire) {
                    for ring in &rings.rings {
                        let mut guard = ring.lock();
                        for cqe in guard.completion() {
                            batch.push((cqe.user_data(), cqe.result()));
                        }
                        drop(guard);
                        for (user_data, result) in batch.drain(..) {
                            complete(user_data, result);
                        }
                    }
                    // Nothing to busy-wait on: completions come from disk
                    std::thread::sleep(Duration::from_micros(5));
                }
            })
            .expect("failed to spawn the uring reaper");
        *self.reaper.lock() = Some(handle);
    }

    pub(crate) fn stop_reaper(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RingSet {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.reaper.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for RingSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingSet")
            .field("rings", &self.rings.len())
            .field("stopped", &self.stop.load(Ordering::Relaxed))
            .finish()
    }
}
