//! FUSE session state.
//!
//! One session exists per backend instance and tracks the INIT/DESTROY
//! lifecycle: `Uninit -> Initialized -> Destroyed`. Every operation other
//! than INIT, FORGET and DESTROY fails with `EBUSY` until the backend's INIT
//! hook has marked the session ready, and again after DESTROY.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::hal;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::CapFlags;

/// Negotiated connection parameters, fixed after the INIT exchange.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub proto_major: u32,
    pub proto_minor: u32,
    /// What the client kernel offered, intersected with what we understand.
    pub capable: CapFlags,
    /// What we enable in the INIT reply. Must stay a subset of `capable`.
    pub want: CapFlags,
    pub max_readahead: u32,
    pub max_background: u32,
    pub congestion_threshold: u32,
    pub max_write: u32,
    /// Timestamp granularity in nanoseconds.
    pub time_gran: u32,
}

impl Default for ConnInfo {
    fn default() -> Self {
        ConnInfo {
            proto_major: 0,
            proto_minor: 0,
            capable: CapFlags::empty(),
            want: CapFlags::empty(),
            max_readahead: u32::MAX,
            max_background: hal::MAX_BACKGROUND,
            congestion_threshold: 0,
            max_write: u32::MAX,
            time_gran: 1,
        }
    }
}

pub struct Session {
    pub(crate) conn: Mutex<ConnInfo>,
    // Mirror of conn.proto_minor so reply sizing never takes the lock.
    proto_minor: AtomicU32,
    bufsize: AtomicUsize,
    got_init: AtomicBool,
    got_destroy: AtomicBool,
    init_done: AtomicBool,
    error: AtomicU32,
}

impl Session {
    pub fn new() -> Session {
        Session {
            conn: Mutex::new(ConnInfo::default()),
            proto_minor: AtomicU32::new(0),
            bufsize: AtomicUsize::new(
                abi::FUSE_MAX_MAX_PAGES * page_size::get() + abi::FUSE_BUFFER_HEADER_SIZE,
            ),
            got_init: AtomicBool::new(false),
            got_destroy: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
            error: AtomicU32::new(0),
        }
    }

    pub fn proto_minor(&self) -> u32 {
        self.proto_minor.load(Ordering::Relaxed)
    }

    pub(crate) fn set_proto_minor(&self, minor: u32) {
        self.proto_minor.store(minor, Ordering::Relaxed);
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bufsize(&self, bufsize: usize) {
        self.bufsize.store(bufsize, Ordering::Relaxed);
    }

    pub fn got_init(&self) -> bool {
        self.got_init.load(Ordering::Acquire)
    }

    pub(crate) fn set_got_init(&self) {
        self.got_init.store(true, Ordering::Release);
    }

    pub fn got_destroy(&self) -> bool {
        self.got_destroy.load(Ordering::Acquire)
    }

    pub(crate) fn set_got_destroy(&self) {
        self.got_destroy.store(true, Ordering::Release);
    }

    /// Mark the session ready for regular operations. Called by the
    /// backend's INIT hook once its own bring-up allows request traffic.
    pub fn set_init_done(&self) {
        self.init_done.store(true, Ordering::Release);
    }

    /// Whether regular operations are currently admitted.
    pub fn ready(&self) -> bool {
        self.init_done.load(Ordering::Acquire) && !self.got_destroy()
    }

    pub(crate) fn set_error(&self, errno: i32) {
        self.error.store(errno as u32, Ordering::Relaxed);
    }

    /// Last fatal session error (0 when none), recorded when an INIT
    /// exchange went wrong.
    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Relaxed) as i32
    }

    /// Snapshot of the negotiated connection parameters.
    pub fn conn_info(&self) -> ConnInfo {
        *self.conn.lock()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("proto_minor", &self.proto_minor())
            .field("got_init", &self.got_init())
            .field("got_destroy", &self.got_destroy())
            .field("ready", &self.ready())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle_gating() {
        let se = Session::new();
        assert!(!se.ready());
        se.set_got_init();
        // got_init alone does not admit traffic; the backend hook decides
        assert!(!se.ready());
        se.set_init_done();
        assert!(se.ready());
        se.set_got_destroy();
        assert!(!se.ready());
    }

    #[test]
    fn default_bufsize_is_max_pages() {
        let se = Session::new();
        assert_eq!(
            se.bufsize(),
            abi::FUSE_MAX_MAX_PAGES * page_size::get() + abi::FUSE_BUFFER_HEADER_SIZE
        );
    }
}
