//! FUSE request dispatch.
//!
//! One entry point: the dispatcher implements [`RequestHandler`], decodes
//! the input header, validates the per-opcode scatter-gather layout and
//! routes to a [`FuseOps`] backend. Handlers reply synchronously by framing
//! into the output segments and returning `Done`, or suspend by keeping the
//! request and returning `Pending`.
//!
//! ENOSYS replies are produced only after the request parsed cleanly; FUSE
//! clients cache ENOSYS and never re-issue the operation, so a transient
//! parse problem must not be reported as unimplemented.

use std::ffi::OsString;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::hal::{FuseRequest, HandlerOutcome, RequestHandler};
use crate::ll::argument::ArgumentIterator;
use crate::ll::fuse_abi::{self as abi, consts, CapFlags};
use crate::ll::reply::{self, EntryParam};
use crate::session::{ConnInfo, Session};

impl FuseRequest {
    /// Copy of the input header. Valid after the dispatcher accepted the
    /// request.
    pub fn in_header(&self) -> abi::fuse_in_header {
        ArgumentIterator::new(&self.bufs.in_iov[0])
            .fetch()
            .unwrap_or_default()
    }

    /// The WRITE payload segments (everything after header and argument).
    pub fn write_payload(&self) -> &[Vec<u8>] {
        &self.bufs.in_iov[2..]
    }

    /// The READ/READDIR data segments (everything after the reply header).
    pub fn data_segs_mut(&mut self) -> &mut [Vec<u8>] {
        &mut self.bufs.out_iov[1..]
    }

    fn out_split(&mut self) -> (&mut [u8], &mut [u8]) {
        let (hdr, rest) = self.bufs.out_iov.split_at_mut(1);
        (&mut hdr[0], &mut rest[0])
    }

    /// Record `errno` in the reply header (no-op for reply-less requests).
    pub fn set_error(&mut self, errno: i32) {
        if let Some(seg) = self.bufs.out_iov.first_mut() {
            reply::set_out_error(seg, errno);
        }
    }

    /// Account `n` bytes of payload already scattered into the data
    /// segments.
    pub fn add_data_len(&mut self, n: usize) {
        reply::add_out_len(&mut self.bufs.out_iov[0], n);
    }

    pub fn frame_attr(&mut self, proto_minor: u32, attr: &abi::fuse_attr, timeout: std::time::Duration) {
        let (hdr, arg) = self.out_split();
        reply::reply_attr(proto_minor, hdr, arg, attr, timeout);
    }

    pub fn frame_entry(&mut self, proto_minor: u32, e: &EntryParam) {
        let (hdr, arg) = self.out_split();
        reply::reply_entry(proto_minor, hdr, arg, e);
    }

    pub fn frame_open(&mut self, fh: u64, open_flags: u32) {
        let (hdr, arg) = self.out_split();
        reply::reply_open(hdr, arg, fh, open_flags);
    }

    pub fn frame_create(&mut self, proto_minor: u32, e: &EntryParam, fh: u64, open_flags: u32) {
        let (hdr, arg) = self.out_split();
        reply::reply_create(proto_minor, hdr, arg, e, fh, open_flags);
    }

    pub fn frame_statfs(&mut self, proto_minor: u32, st: &abi::fuse_kstatfs) {
        let (hdr, arg) = self.out_split();
        reply::reply_statfs(proto_minor, hdr, arg, st);
    }

    pub fn frame_write(&mut self, written: u32) {
        let (hdr, arg) = self.out_split();
        reply::reply_write(hdr, arg, written);
    }

    // Consuming variants for the synchronous reply path.

    pub fn reply_ok(self) -> HandlerOutcome {
        HandlerOutcome::Done(self)
    }

    pub fn reply_err(mut self, errno: i32) -> HandlerOutcome {
        self.set_error(errno);
        HandlerOutcome::Done(self)
    }

    pub fn reply_attr(
        mut self,
        se: &Session,
        attr: &abi::fuse_attr,
        timeout: std::time::Duration,
    ) -> HandlerOutcome {
        self.frame_attr(se.proto_minor(), attr, timeout);
        HandlerOutcome::Done(self)
    }

    pub fn reply_entry(mut self, se: &Session, e: &EntryParam) -> HandlerOutcome {
        self.frame_entry(se.proto_minor(), e);
        HandlerOutcome::Done(self)
    }

    pub fn reply_open(mut self, fh: u64, open_flags: u32) -> HandlerOutcome {
        self.frame_open(fh, open_flags);
        HandlerOutcome::Done(self)
    }

    pub fn reply_create(
        mut self,
        se: &Session,
        e: &EntryParam,
        fh: u64,
        open_flags: u32,
    ) -> HandlerOutcome {
        self.frame_create(se.proto_minor(), e, fh, open_flags);
        HandlerOutcome::Done(self)
    }

    pub fn reply_statfs(mut self, se: &Session, st: &abi::fuse_kstatfs) -> HandlerOutcome {
        self.frame_statfs(se.proto_minor(), st);
        HandlerOutcome::Done(self)
    }

    pub fn reply_write(mut self, written: u32) -> HandlerOutcome {
        self.frame_write(written);
        HandlerOutcome::Done(self)
    }
}

/// The per-operation backend contract.
///
/// Handlers either complete the request in place (all the `reply_*` sugar
/// returns `Done`) or move it into their own per-request state and return
/// [`HandlerOutcome::Pending`], completing later through
/// [`crate::hal::async_complete`]. Unimplemented operations fall back to
/// `-ENOSYS`.
#[allow(unused_variables)]
pub trait FuseOps: Send + Sync + 'static {
    /// Adjust the negotiated connection (e.g. request writeback caching)
    /// and perform backend bring-up checks. Returning an errno fails the
    /// INIT. The implementation must call [`Session::set_init_done`] once it
    /// is willing to accept traffic.
    fn init(
        &self,
        se: &Session,
        conn: &mut ConnInfo,
        hdr: &abi::fuse_in_header,
        arg: &abi::fuse_init_in,
    ) -> Result<(), i32> {
        se.set_init_done();
        Ok(())
    }

    fn destroy(&self, se: &Session, hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        req.reply_ok()
    }

    fn lookup(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn forget(&self, se: &Session, hdr: &abi::fuse_in_header, arg: abi::fuse_forget_in) {}

    fn batch_forget(&self, se: &Session, hdr: &abi::fuse_in_header, nodes: Vec<abi::fuse_forget_one>) {
        for node in nodes {
            let mut one = *hdr;
            one.nodeid = node.nodeid;
            self.forget(se, &one, abi::fuse_forget_in { nlookup: node.nlookup });
        }
    }

    fn getattr(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_getattr_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn setattr(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_setattr_in,
        fh: Option<u64>,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn mknod(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_mknod_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn mkdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_mkdir_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn symlink(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        target: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn unlink(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn rmdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn rename(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        newdir: u64,
        newname: OsString,
        flags: u32,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn open(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn read(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn write(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_write_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn statfs(&self, se: &Session, hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn release(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn fsync(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_fsync_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn flush(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_flush_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn opendir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn readdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        plus: bool,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn releasedir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn fsyncdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_fsync_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn create(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_create_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    /// Advisory file-level lock (`flock(2)` semantics). `op` is a
    /// `LOCK_SH`/`LOCK_EX`/`LOCK_UN` combination.
    fn flock(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        fh: u64,
        owner: u64,
        op: i32,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn fallocate(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_fallocate_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_err(libc::ENOSYS)
    }

    fn register_device(&self, device_id: u16) {}
    fn unregister_device(&self, device_id: u16) {}
}

enum Count {
    Exact(usize),
    AtLeast(usize),
}

impl Count {
    fn admits(&self, n: usize) -> bool {
        match *self {
            Count::Exact(want) => n == want,
            Count::AtLeast(min) => n >= min,
        }
    }
}

pub struct FuseDispatcher<B> {
    se: Arc<Session>,
    backend: Arc<B>,
}

impl<B: FuseOps> FuseDispatcher<B> {
    pub fn new(backend: Arc<B>) -> FuseDispatcher<B> {
        FuseDispatcher {
            se: Arc::new(Session::new()),
            backend,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.se
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    fn check_counts(&self, op: abi::fuse_opcode, req: &FuseRequest, inc: Count, outc: Count) -> bool {
        let ok = inc.admits(req.bufs.in_iov.len()) && outc.admits(req.bufs.out_iov.len());
        if !ok {
            error!(
                "{op:?}: invalid number of iovecs (in {}, out {})",
                req.bufs.in_iov.len(),
                req.bufs.out_iov.len()
            );
        }
        ok
    }

    fn handle_init(&self, hdr: &abi::fuse_in_header, mut req: FuseRequest) -> HandlerOutcome {
        let se = &self.se;
        if se.got_init() && !se.got_destroy() {
            return req.reply_err(libc::EISCONN);
        }

        let Some(arg) = ArgumentIterator::new(&req.bufs.in_iov[1]).fetch::<abi::fuse_init_in>()
        else {
            return req.reply_err(libc::EINVAL);
        };

        let mut out = abi::fuse_init_out {
            major: abi::FUSE_KERNEL_VERSION,
            minor: abi::FUSE_KERNEL_MINOR_VERSION,
            ..Default::default()
        };

        if arg.major < 7 {
            warn!("unsupported protocol version: {}.{}", arg.major, arg.minor);
            return req.reply_err(libc::EPROTO);
        }
        if arg.major > 7 {
            // Wait for a second INIT request with a 7.X version
            let n = size_of::<abi::fuse_init_out>();
            let (hdr_seg, arg_seg) = req.out_split();
            use zerocopy::IntoBytes;
            if arg_seg.len() < n {
                reply::set_out_error(hdr_seg, libc::EINVAL);
                return HandlerOutcome::Done(req);
            }
            arg_seg[..n].copy_from_slice(out.as_bytes());
            reply::add_out_len(hdr_seg, n);
            return HandlerOutcome::Done(req);
        }

        let mut conn = se.conn_info();
        conn.proto_major = arg.major;
        conn.proto_minor = arg.minor;
        conn.capable = CapFlags::empty();
        conn.want = CapFlags::empty();
        conn.max_background = crate::hal::MAX_BACKGROUND;
        se.set_proto_minor(arg.minor);

        let mut bufsize = se.bufsize();
        if arg.minor >= 6 {
            // Settle for the smallest max_readahead size of the two parties
            if arg.max_readahead < conn.max_readahead {
                conn.max_readahead = arg.max_readahead;
            }
            conn.capable = CapFlags::from_bits_truncate(arg.flags) & CapFlags::KNOWN;
            if arg.flags & CapFlags::MAX_PAGES.bits() == 0 {
                let max_bufsize = abi::FUSE_DEFAULT_MAX_PAGES_PER_REQ * page_size::get()
                    + abi::FUSE_BUFFER_HEADER_SIZE;
                bufsize = bufsize.min(max_bufsize);
            }
        } else {
            conn.max_readahead = 0;
        }
        if conn.proto_minor >= 18 {
            conn.capable |= CapFlags::HAS_IOCTL_DIR;
        }

        // Default capability selection for modern filesystems. AUTO_INVAL_DATA
        // stays off: it turns every read into getattr+read and the attr
        // timeouts already bound staleness.
        let defaults = CapFlags::ASYNC_READ
            | CapFlags::PARALLEL_DIROPS
            | CapFlags::HANDLE_KILLPRIV
            | CapFlags::ASYNC_DIO
            | CapFlags::HAS_IOCTL_DIR
            | CapFlags::ATOMIC_O_TRUNC
            | CapFlags::FLOCK_LOCKS
            | CapFlags::DO_READDIRPLUS
            | CapFlags::READDIRPLUS_AUTO;
        conn.want = conn.capable & defaults;
        // Splicing is not a thing over virtio, POSIX locks are not supported
        conn.want -= CapFlags::SPLICE_READ | CapFlags::SPLICE_WRITE | CapFlags::POSIX_LOCKS;
        conn.time_gran = 1;

        if bufsize < consts::FUSE_MIN_READ_BUFFER {
            warn!("buffer size too small: {bufsize}");
            bufsize = consts::FUSE_MIN_READ_BUFFER;
        }
        se.set_bufsize(bufsize);
        let max_write_cap = (bufsize - abi::FUSE_BUFFER_HEADER_SIZE) as u32;
        if conn.max_write > max_write_cap {
            conn.max_write = max_write_cap;
        }

        se.set_got_init();
        if let Err(errno) = self.backend.init(se, &mut conn, hdr, &arg) {
            se.set_error(libc::EPROTO);
            se.set_got_destroy();
            return req.reply_err(errno);
        }

        if !conn.capable.contains(conn.want) {
            error!(
                "filesystem requested capabilities {:?} that are not supported by the kernel, aborting",
                conn.want - conn.capable
            );
            se.set_error(libc::EPROTO);
            se.set_got_destroy();
            return req.reply_err(libc::EPROTO);
        }

        if arg.flags & CapFlags::MAX_PAGES.bits() != 0 {
            out.flags |= CapFlags::MAX_PAGES.bits();
            out.max_pages = ((conn.max_write as usize - 1) / page_size::get() + 1) as u16;
        }
        // Always enable big writes; superseded by max_write but old kernels
        // look for the flag
        out.flags |= CapFlags::BIG_WRITES.bits() | conn.want.bits();

        out.max_readahead = conn.max_readahead;
        out.max_write = conn.max_write;
        if conn.proto_minor >= 13 {
            conn.max_background = conn.max_background.min((1 << 16) - 1);
            if conn.congestion_threshold > conn.max_background {
                conn.congestion_threshold = conn.max_background;
            }
            if conn.congestion_threshold == 0 {
                conn.congestion_threshold = conn.max_background * 3 / 4;
            }
            out.max_background = conn.max_background as u16;
            out.congestion_threshold = conn.congestion_threshold as u16;
        }
        if conn.proto_minor >= 23 {
            out.time_gran = conn.time_gran;
        }

        *se.conn.lock() = conn;

        let outargsize = if arg.minor < 5 {
            abi::FUSE_COMPAT_INIT_OUT_SIZE
        } else if arg.minor < 23 {
            abi::FUSE_COMPAT_22_INIT_OUT_SIZE
        } else {
            size_of::<abi::fuse_init_out>()
        };
        debug!(
            "INIT 7.{}: flags 0x{:x} max_write {} max_background {}",
            arg.minor, out.flags, out.max_write, out.max_background
        );
        let (hdr_seg, arg_seg) = req.out_split();
        use zerocopy::IntoBytes;
        if arg_seg.len() < outargsize {
            reply::set_out_error(hdr_seg, libc::EINVAL);
            return HandlerOutcome::Done(req);
        }
        arg_seg[..outargsize].copy_from_slice(&out.as_bytes()[..outargsize]);
        reply::add_out_len(hdr_seg, outargsize);
        HandlerOutcome::Done(req)
    }
}

impl<B: FuseOps> RequestHandler for FuseDispatcher<B> {
    fn handle(&self, mut req: FuseRequest, _device_id: u16) -> HandlerOutcome {
        use crate::ll::fuse_abi::fuse_opcode::*;
        use Count::{AtLeast, Exact};

        if req.bufs.in_iov.is_empty()
            || req.bufs.in_iov[0].len() < size_of::<abi::fuse_in_header>()
        {
            error!("request without a parseable input header");
            return HandlerOutcome::Failed(req);
        }
        let hdr = req.in_header();

        if hdr.opcode < 1 || hdr.opcode > abi::FUSE_MAX_OPCODE {
            error!("invalid FUSE opcode {}", hdr.opcode);
            return HandlerOutcome::Failed(req);
        }
        let opcode = abi::fuse_opcode::try_from(hdr.opcode).ok();

        // FORGET-class requests carry no reply descriptor; everything else
        // must give us room for at least the output header.
        if req.bufs.out_iov.is_empty() {
            if !matches!(opcode, Some(FUSE_FORGET) | Some(FUSE_BATCH_FORGET)) {
                error!("request for opcode {} without output iovecs", hdr.opcode);
                return HandlerOutcome::Failed(req);
            }
        } else {
            if req.bufs.out_iov[0].len() < size_of::<abi::fuse_out_header>() {
                error!("first output iovec cannot hold a reply header");
                return HandlerOutcome::Failed(req);
            }
            reply::init_out_header(&mut req.bufs.out_iov[0], hdr.unique);
        }

        let se = &*self.se;
        let backend = &*self.backend;

        // Session gate: everything but INIT, FORGET and DESTROY requires a
        // completed handshake.
        let gated = !matches!(
            opcode,
            Some(FUSE_INIT) | Some(FUSE_FORGET) | Some(FUSE_BATCH_FORGET) | Some(FUSE_DESTROY)
        );
        if gated && !se.ready() {
            return req.reply_err(libc::EBUSY);
        }

        let Some(opcode) = opcode else {
            // In-range opcode we have no handler for (LINK-less table slots)
            debug!("FUSE op({}) called, but not implemented", hdr.opcode);
            return req.reply_err(libc::ENOSYS);
        };

        macro_rules! counts {
            ($inc:expr, $outc:expr) => {
                if !self.check_counts(opcode, &req, $inc, $outc) {
                    return HandlerOutcome::Failed(req);
                }
            };
        }
        macro_rules! arg {
            ($it:expr, $ty:ty) => {
                match $it.fetch::<$ty>() {
                    Some(v) => v,
                    None => return req.reply_err(libc::EINVAL),
                }
            };
        }
        macro_rules! name {
            ($it:expr) => {
                match $it.fetch_string() {
                    Some(v) => v,
                    None => return req.reply_err(libc::EINVAL),
                }
            };
        }

        match opcode {
            FUSE_INIT => {
                counts!(Exact(2), Exact(2));
                self.handle_init(&hdr, req)
            }
            FUSE_DESTROY => {
                counts!(Exact(1), Exact(1));
                se.set_got_destroy();
                backend.destroy(se, &hdr, req)
            }
            FUSE_LOOKUP => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let name = name!(it);
                backend.lookup(se, &hdr, name, req)
            }
            FUSE_FORGET => {
                counts!(Exact(1), Exact(0));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[0]);
                let _ = arg!(it, abi::fuse_in_header);
                let forget = arg!(it, abi::fuse_forget_in);
                backend.forget(se, &hdr, forget);
                HandlerOutcome::Done(req)
            }
            FUSE_BATCH_FORGET => {
                counts!(Exact(1), Exact(0));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[0]);
                let _ = arg!(it, abi::fuse_in_header);
                let batch = arg!(it, abi::fuse_batch_forget_in);
                let avail = it.len() / size_of::<abi::fuse_forget_one>();
                let count = (batch.count as usize).min(avail);
                match it.fetch_vec::<abi::fuse_forget_one>(count) {
                    Some(nodes) => backend.batch_forget(se, &hdr, nodes),
                    None => return req.reply_err(libc::EINVAL),
                }
                HandlerOutcome::Done(req)
            }
            FUSE_GETATTR => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_getattr_in);
                backend.getattr(se, &hdr, arg, req)
            }
            FUSE_SETATTR => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let mut arg = arg!(it, abi::fuse_setattr_in);
                let fh = (arg.valid & consts::FATTR_FH != 0).then_some(arg.fh);
                arg.valid &= consts::FATTR_MODE
                    | consts::FATTR_UID
                    | consts::FATTR_GID
                    | consts::FATTR_SIZE
                    | consts::FATTR_ATIME
                    | consts::FATTR_MTIME
                    | consts::FATTR_ATIME_NOW
                    | consts::FATTR_MTIME_NOW
                    | consts::FATTR_CTIME;
                backend.setattr(se, &hdr, arg, fh, req)
            }
            FUSE_READLINK => {
                // Not wired to the backends yet; the symlink itself can
                // still be created and read back through the host cache.
                counts!(AtLeast(1), AtLeast(1));
                req.reply_err(libc::ENOSYS)
            }
            FUSE_MKNOD => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = if se.proto_minor() < 12 {
                    let mode = arg!(it, u32);
                    let rdev = arg!(it, u32);
                    abi::fuse_mknod_in {
                        mode,
                        rdev,
                        umask: 0,
                        padding: 0,
                    }
                } else {
                    arg!(it, abi::fuse_mknod_in)
                };
                let name = name!(it);
                backend.mknod(se, &hdr, arg, name, req)
            }
            FUSE_MKDIR => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_mkdir_in);
                let name = name!(it);
                backend.mkdir(se, &hdr, arg, name, req)
            }
            FUSE_SYMLINK => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let name = name!(it);
                let target = name!(it);
                backend.symlink(se, &hdr, name, target, req)
            }
            FUSE_UNLINK => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let name = name!(it);
                backend.unlink(se, &hdr, name, req)
            }
            FUSE_RMDIR => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let name = name!(it);
                backend.rmdir(se, &hdr, name, req)
            }
            FUSE_RENAME => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_rename_in);
                let name = name!(it);
                let newname = name!(it);
                backend.rename(se, &hdr, name, arg.newdir, newname, 0, req)
            }
            FUSE_RENAME2 => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_rename2_in);
                let name = name!(it);
                let newname = name!(it);
                backend.rename(se, &hdr, name, arg.newdir, newname, arg.flags, req)
            }
            FUSE_OPEN => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_open_in);
                backend.open(se, &hdr, arg, req)
            }
            FUSE_READ => {
                counts!(Exact(2), AtLeast(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_read_in);
                let data_len: usize = req.bufs.out_iov[1..].iter().map(Vec::len).sum();
                if data_len != arg.size as usize {
                    error!("READ: data iovecs hold {data_len} bytes but size is {}", arg.size);
                    return HandlerOutcome::Failed(req);
                }
                backend.read(se, &hdr, arg, req)
            }
            FUSE_WRITE => {
                counts!(AtLeast(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_write_in);
                let data_len: usize = req.bufs.in_iov[2..].iter().map(Vec::len).sum();
                if data_len != arg.size as usize {
                    error!("WRITE: payload iovecs hold {data_len} bytes but size is {}", arg.size);
                    return HandlerOutcome::Failed(req);
                }
                backend.write(se, &hdr, arg, req)
            }
            FUSE_STATFS => {
                counts!(Exact(1), Exact(2));
                backend.statfs(se, &hdr, req)
            }
            FUSE_RELEASE => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_release_in);
                backend.release(se, &hdr, arg, req)
            }
            FUSE_FSYNC => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_fsync_in);
                backend.fsync(se, &hdr, arg, req)
            }
            FUSE_FLUSH => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_flush_in);
                backend.flush(se, &hdr, arg, req)
            }
            FUSE_OPENDIR => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_open_in);
                backend.opendir(se, &hdr, arg, req)
            }
            FUSE_READDIR | FUSE_READDIRPLUS => {
                counts!(AtLeast(2), AtLeast(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_read_in);
                backend.readdir(se, &hdr, arg, opcode == FUSE_READDIRPLUS, req)
            }
            FUSE_RELEASEDIR => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_release_in);
                backend.releasedir(se, &hdr, arg, req)
            }
            FUSE_FSYNCDIR => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_fsync_in);
                backend.fsyncdir(se, &hdr, arg, req)
            }
            FUSE_CREATE => {
                counts!(Exact(2), Exact(2));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = if se.proto_minor() >= 12 {
                    arg!(it, abi::fuse_create_in)
                } else {
                    let open: abi::fuse_open_in = arg!(it, abi::fuse_open_in);
                    abi::fuse_create_in {
                        flags: open.flags,
                        mode: 0,
                        umask: 0,
                        padding: 0,
                    }
                };
                let name = name!(it);
                backend.create(se, &hdr, arg, name, req)
            }
            FUSE_SETLK | FUSE_SETLKW => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_lk_in);
                if arg.lk_flags & consts::FUSE_LK_FLOCK == 0 {
                    // only FLOCK-style locks are supported
                    return req.reply_err(libc::ENOSYS);
                }
                // Both variants take the blocking path; LOCK_NB for the
                // non-waiting one is still unwired.
                let op = match arg.lk.typ as i32 {
                    libc::F_RDLCK => libc::LOCK_SH,
                    libc::F_WRLCK => libc::LOCK_EX,
                    libc::F_UNLCK => libc::LOCK_UN,
                    _ => return req.reply_err(libc::EINVAL),
                };
                backend.flock(se, &hdr, arg.fh, arg.owner, op, req)
            }
            FUSE_FALLOCATE => {
                counts!(Exact(2), Exact(1));
                let mut it = ArgumentIterator::new(&req.bufs.in_iov[1]);
                let arg = arg!(it, abi::fuse_fallocate_in);
                backend.fallocate(se, &hdr, arg, req)
            }
            FUSE_LINK
            | FUSE_GETLK
            | FUSE_ACCESS
            | FUSE_INTERRUPT
            | FUSE_BMAP
            | FUSE_IOCTL
            | FUSE_POLL
            | FUSE_NOTIFY_REPLY
            | FUSE_LSEEK
            | FUSE_COPY_FILE_RANGE
            | FUSE_SETXATTR
            | FUSE_GETXATTR
            | FUSE_LISTXATTR
            | FUSE_REMOVEXATTR
            | FUSE_SETUPMAPPING
            | FUSE_REMOVEMAPPING => {
                debug!("FUSE op({}) called, but not implemented", hdr.opcode);
                req.reply_err(libc::ENOSYS)
            }
        }
    }

    fn register_device(&self, device_id: u16) {
        self.backend.register_device(device_id);
    }

    fn unregister_device(&self, device_id: u16) {
        self.backend.unregister_device(device_id);
    }
}

impl<B> std::fmt::Debug for FuseDispatcher<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseDispatcher").field("se", &self.se).finish()
    }
}
