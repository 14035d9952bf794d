//! Local-mirror backend.
//!
//! Replays FUSE operations against a source directory. Metadata walks
//! (lookup, readdir, mknod) run synchronously with `*at` syscalls anchored
//! on long-lived `O_PATH` descriptors; the data plane (open, create, read,
//! write, fsync, close, rename, unlink, fallocate, statx) goes through
//! per-thread io_uring submission queues with a shared completion reaper
//! (see [`rings`]).
//!
//! Much of the mirroring logic follows the shape of libfuse's
//! `passthrough_hp` example: inodes are keyed by source `st_ino`, hold an
//! `O_PATH` anchor fd, and survive unlink as "recycled" records (fd == -1,
//! bumped generation) until the host forgets them.

mod rings;

use std::collections::HashMap;
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use io_uring::{opcode, types};
use log::{debug, error, warn};
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use parking_lot::Mutex;

use crate::dispatch::FuseOps;
use crate::hal::{self, CompletionStatus, FuseRequest, HandlerOutcome};
use crate::hal::config::MirrorConfig;
use crate::inode::{InodeTable, TableEntry};
use crate::ll::fuse_abi::{self as abi, consts, FUSE_ROOT_ID};
use crate::ll::iov::IovCursor;
use crate::ll::reply::{attr_from_stat, kstatfs_from_statvfs, EntryParam};
use crate::mpool::Mpool;
use crate::session::{ConnInfo, Session};

const URING_ENTRIES: u32 = 512;
const RCB_POOL_CHUNKS: usize = 256;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn cstring(name: &OsStr) -> Result<CString, i32> {
    CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)
}

/// One mirrored file or directory, keyed by its source inode number.
#[derive(Debug)]
pub struct PtInode {
    fileid: u64,
    src_dev: u64,
    /// fd is a long-lived `O_PATH|O_NOFOLLOW` anchor; -1 marks a recycled
    /// record kept alive until the host forgets it.
    state: Mutex<PtState>,
    generation: AtomicU64,
    nopen: AtomicU64,
}

#[derive(Debug)]
struct PtState {
    fd: libc::c_int,
    nlookup: u64,
}

impl PtInode {
    fn new(fileid: u64, src_dev: u64) -> PtInode {
        PtInode {
            fileid,
            src_dev,
            state: Mutex::new(PtState { fd: -1, nlookup: 0 }),
            generation: AtomicU64::new(0),
            nopen: AtomicU64::new(0),
        }
    }

    fn fd(&self) -> Option<libc::c_int> {
        let state = self.state.lock();
        (state.fd >= 0).then_some(state.fd)
    }
}

impl TableEntry for PtInode {
    fn fileid(&self) -> u64 {
        self.fileid
    }
}

impl Drop for PtInode {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.fd >= 0 {
            unsafe { libc::close(state.fd) };
        }
    }
}

/// An open directory stream (`DIR *`) plus its read cursor.
struct DirStream {
    dp: NonNull<libc::DIR>,
}

// DIR streams are only touched under the owning DirHandle's lock.
unsafe impl Send for DirStream {}

struct RawDirent {
    ino: u64,
    off: i64,
    typ: u32,
    name: OsString,
}

impl DirStream {
    /// Takes ownership of `fd` (the stream closes it).
    fn from_fd(fd: libc::c_int) -> Result<DirStream, i32> {
        match NonNull::new(unsafe { libc::fdopendir(fd) }) {
            Some(dp) => Ok(DirStream { dp }),
            None => {
                let err = last_errno();
                unsafe { libc::close(fd) };
                Err(err)
            }
        }
    }

    fn read(&mut self) -> Result<Option<RawDirent>, i32> {
        nix::errno::Errno::clear();
        let entry = unsafe { libc::readdir(self.dp.as_ptr()) };
        if entry.is_null() {
            let err = last_errno();
            return if err == 0 { Ok(None) } else { Err(err) };
        }
        let entry = unsafe { &*entry };
        let name_bytes = unsafe { std::ffi::CStr::from_ptr(entry.d_name.as_ptr()) }.to_bytes();
        Ok(Some(RawDirent {
            ino: entry.d_ino,
            off: entry.d_off,
            typ: entry.d_type as u32,
            name: OsString::from_vec(name_bytes.to_vec()),
        }))
    }

    fn seek(&mut self, off: i64) {
        unsafe { libc::seekdir(self.dp.as_ptr(), off) };
    }

    fn dirfd(&self) -> libc::c_int {
        unsafe { libc::dirfd(self.dp.as_ptr()) }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dp.as_ptr()) };
    }
}

struct DirHandle {
    stream: Mutex<DirCursor>,
}

struct DirCursor {
    stream: DirStream,
    offset: i64,
}

struct StatxBuf(libc::statx);

impl Default for StatxBuf {
    fn default() -> Self {
        // statx is plain data filled in by the kernel
        StatxBuf(unsafe { std::mem::zeroed() })
    }
}

type PtDoneFn = fn(&Arc<PtShared>, &mut PtRcb, &mut FuseRequest, i32);

/// Per-inflight-request state; the SQE's user_data points at the box, the
/// buffers referenced from the SQE (paths, iovec array, statx destination)
/// live inside it.
#[derive(Default)]
struct PtRcb {
    thread_id: u16,
    proto_minor: u32,
    cb: Option<PtDoneFn>,
    req: Option<FuseRequest>,
    inode: Option<Arc<PtInode>>,
    inode2: Option<Arc<PtInode>>,
    name: Option<CString>,
    name2: Option<CString>,
    open_flags: u32,
    create_name: Option<OsString>,
    iovecs: Vec<libc::iovec>,
    statx: StatxBuf,
}

// The iovec array carries raw pointers into the request buffers owned by
// the same RCB; the RCB moves as one unit between the poller and the
// reaper.
unsafe impl Send for PtRcb {}

struct PtShared {
    timeout: Duration,
    src_dev: u64,
    root: Arc<PtInode>,
    inodes: InodeTable<PtInode>,
    rings: Arc<rings::RingSet>,
    pools: Vec<Mpool<PtRcb>>,
    dirs: Mutex<HashMap<u64, Arc<DirHandle>>>,
    next_dir_fh: AtomicU64,
}

pub struct PassthroughFs {
    inner: Arc<PtShared>,
}

impl PassthroughFs {
    pub fn new(cfg: &MirrorConfig, nthreads: u16) -> io::Result<PassthroughFs> {
        let source = &cfg.dir;
        let meta = std::fs::symlink_metadata(source)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("source {} is not a directory", source.display()),
            ));
        }
        let src_dev = std::os::unix::fs::MetadataExt::dev(&meta);

        let c_source = CString::new(source.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let root_fd = unsafe { libc::open(c_source.as_ptr(), libc::O_PATH) };
        if root_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Use modes exactly as specified
        unsafe { libc::umask(0) };
        // One anchor fd per dentry the host knows about is far more than
        // most processes need
        maximize_fd_limit();

        let root = Arc::new(PtInode {
            fileid: FUSE_ROOT_ID,
            src_dev,
            state: Mutex::new(PtState {
                fd: root_fd,
                nlookup: 9999,
            }),
            generation: AtomicU64::new(0),
            nopen: AtomicU64::new(0),
        });

        let rings = rings::RingSet::new(nthreads, URING_ENTRIES)?;
        let pools = (0..nthreads)
            .map(|_| Mpool::new(RCB_POOL_CHUNKS).expect("pool capacity is a power of two"))
            .collect();

        let inner = Arc::new(PtShared {
            timeout: cfg.timeout(),
            src_dev,
            root,
            inodes: InodeTable::new(),
            rings,
            pools,
            dirs: Mutex::new(HashMap::new()),
            next_dir_fh: AtomicU64::new(1),
        });

        let reap_shared = inner.clone();
        inner
            .rings
            .start_reaper(move |user_data, result| reap(&reap_shared, user_data, result));

        Ok(PassthroughFs { inner })
    }

    pub fn source_dev(&self) -> u64 {
        self.inner.src_dev
    }

    pub fn inode_count(&self) -> usize {
        self.inner.inodes.len()
    }

    fn alloc_rcb(&self, se: &Session) -> Result<Box<PtRcb>, i32> {
        let tid = hal::thread_id();
        let mut rcb = self.inner.pools[tid as usize]
            .alloc()
            .ok_or(libc::ENOMEM)?;
        rcb.thread_id = tid;
        rcb.proto_minor = se.proto_minor();
        Ok(rcb)
    }

    fn submit(
        &self,
        mut rcb: Box<PtRcb>,
        req: FuseRequest,
        entry: io_uring::squeue::Entry,
        done: PtDoneFn,
    ) -> HandlerOutcome {
        rcb.cb = Some(done);
        rcb.req = Some(req);
        let tid = rcb.thread_id;
        let ptr = Box::into_raw(rcb);
        match self.inner.rings.submit(tid, entry.user_data(ptr as u64)) {
            Ok(()) => HandlerOutcome::Pending,
            Err(errno) => {
                // Safety: the entry never reached the kernel, the pointer is
                // exclusively ours again.
                let mut rcb = unsafe { Box::from_raw(ptr) };
                let req = rcb.req.take().expect("request moved into rcb above");
                self.inner.pools[tid as usize].free(rcb);
                req.reply_err(errno)
            }
        }
    }
}

impl Drop for PassthroughFs {
    fn drop(&mut self) {
        self.inner.rings.stop_reaper();
    }
}

impl std::fmt::Debug for PassthroughFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughFs")
            .field("src_dev", &self.inner.src_dev)
            .field("inodes", &self.inner.inodes.len())
            .finish()
    }
}

fn maximize_fd_limit() {
    match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok((_soft, hard)) => {
            if let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, hard, hard) {
                warn!("setrlimit(RLIMIT_NOFILE) failed: {e}");
            }
        }
        Err(e) => warn!("getrlimit(RLIMIT_NOFILE) failed: {e}"),
    }
}

fn ino_to_inode(shared: &PtShared, nodeid: u64) -> Option<Arc<PtInode>> {
    if nodeid == FUSE_ROOT_ID {
        return Some(shared.root.clone());
    }
    let inode = shared.inodes.get(nodeid)?;
    if inode.fd().is_none() {
        warn!("unknown inode {nodeid}");
        return None;
    }
    Some(inode)
}

fn ino_to_fd(shared: &PtShared, nodeid: u64) -> Option<libc::c_int> {
    ino_to_inode(shared, nodeid).and_then(|i| i.fd())
}

fn fstatat_empty(fd: libc::c_int) -> Result<libc::stat, i32> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let res = unsafe {
        libc::fstatat(
            fd,
            c"".as_ptr(),
            &mut st,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if res == -1 {
        return Err(last_errno());
    }
    Ok(st)
}

/// Resolve `name` under `parent` and account a lookup on the resulting
/// inode, creating or reviving the table record as needed.
fn do_lookup(shared: &PtShared, parent: u64, name: &OsStr) -> Result<EntryParam, i32> {
    let parent_inode = ino_to_inode(shared, parent).ok_or(libc::EINVAL)?;
    let parent_fd = parent_inode.fd().ok_or(libc::EINVAL)?;
    let c_name = cstring(name)?;

    let newfd = unsafe {
        libc::openat(
            parent_fd,
            c_name.as_ptr(),
            libc::O_PATH | libc::O_NOFOLLOW,
        )
    };
    if newfd == -1 {
        return Err(last_errno());
    }

    let st = match fstatat_empty(newfd) {
        Ok(st) => st,
        Err(err) => {
            unsafe { libc::close(newfd) };
            return Err(err);
        }
    };

    if st.st_dev != shared.src_dev {
        warn!("mountpoints in the source directory tree are hidden");
        unsafe { libc::close(newfd) };
        return Err(libc::ENOTSUP);
    }
    if st.st_ino == FUSE_ROOT_ID {
        error!("source directory tree must not include inode {FUSE_ROOT_ID}");
        unsafe { libc::close(newfd) };
        return Err(libc::EIO);
    }

    let inode = shared
        .inodes
        .get_or_insert_with(st.st_ino, || PtInode::new(st.st_ino, st.st_dev));
    let generation = {
        let mut state = inode.state.lock();
        if state.fd >= 0 {
            // known inode, the freshly opened anchor is redundant
            debug_assert_eq!(inode.src_dev, st.st_dev);
            unsafe { libc::close(newfd) };
        } else {
            // fresh or recycled record; a recycled one keeps its nlookup
            state.fd = newfd;
        }
        state.nlookup += 1;
        inode.generation.load(Ordering::Relaxed)
    };

    Ok(EntryParam {
        ino: st.st_ino,
        generation,
        attr: attr_from_stat(&st),
        attr_timeout: shared.timeout,
        entry_timeout: shared.timeout,
    })
}

fn forget_one(shared: &PtShared, nodeid: u64, n: u64) {
    if nodeid == FUSE_ROOT_ID {
        return;
    }
    let Some(inode) = shared.inodes.get(nodeid) else {
        return;
    };
    let gone = {
        let mut state = inode.state.lock();
        if n > state.nlookup {
            error!("negative lookup count for inode {}", inode.fileid);
            state.nlookup = 0;
        } else {
            state.nlookup -= n;
        }
        if state.nlookup == 0 {
            if state.fd >= 0 {
                unsafe { libc::close(state.fd) };
                state.fd = -1;
            }
            true
        } else {
            false
        }
    };
    if gone {
        shared.inodes.erase(nodeid);
    }
}

fn make_node(
    shared: &PtShared,
    parent: u64,
    name: &OsStr,
    mode: u32,
    rdev: u32,
    link: Option<&OsStr>,
) -> Result<EntryParam, i32> {
    let parent_inode = ino_to_inode(shared, parent).ok_or(libc::EINVAL)?;
    let parent_fd = parent_inode.fd().ok_or(libc::EINVAL)?;
    let c_name = cstring(name)?;

    let res = if mode & libc::S_IFMT == libc::S_IFDIR {
        unsafe { libc::mkdirat(parent_fd, c_name.as_ptr(), mode & !libc::S_IFMT) }
    } else if mode & libc::S_IFMT == libc::S_IFLNK {
        let link = cstring(link.ok_or(libc::EINVAL)?)?;
        unsafe { libc::symlinkat(link.as_ptr(), parent_fd, c_name.as_ptr()) }
    } else {
        unsafe { libc::mknodat(parent_fd, c_name.as_ptr(), mode, rdev as libc::dev_t) }
    };
    if res == -1 {
        return Err(last_errno());
    }

    do_lookup(shared, parent, name)
}

fn log_fd_exhaustion(errno: i32) {
    if errno == libc::ENFILE || errno == libc::EMFILE {
        error!("reached maximum number of file descriptors");
    }
}

/// Completion-reaper entry: rebox the RCB, run the per-op completion and
/// finish the request towards the host.
fn reap(shared: &Arc<PtShared>, user_data: u64, result: i32) {
    // Safety: user_data is the pointer produced by submit(); the kernel is
    // done with the buffers it references.
    let mut rcb = unsafe { Box::from_raw(user_data as *mut PtRcb) };
    let cb = rcb.cb.take().expect("rcb without completion callback");
    let mut req = rcb.req.take().expect("rcb without request");
    cb(shared, &mut rcb, &mut req, result);
    shared.pools[rcb.thread_id as usize].free(rcb);
    hal::async_complete(req, CompletionStatus::Success);
}

fn done_generic(_shared: &Arc<PtShared>, _rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        req.set_error(-res);
    }
}

fn done_getattr(shared: &Arc<PtShared>, rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        req.set_error(-res);
        return;
    }
    let attr = attr_from_statx(&rcb.statx.0);
    req.frame_attr(rcb.proto_minor, &attr, shared.timeout);
}

fn done_open(_shared: &Arc<PtShared>, rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        log_fd_exhaustion(-res);
        req.set_error(-res);
        return;
    }
    let inode = rcb.inode.take().expect("open rcb without inode");
    inode.nopen.fetch_add(1, Ordering::AcqRel);
    req.frame_open(res as u64, rcb.open_flags);
}

fn done_create(shared: &Arc<PtShared>, rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        log_fd_exhaustion(-res);
        req.set_error(-res);
        return;
    }
    let name = rcb.create_name.take().expect("create rcb without name");
    let parent = req.in_header().nodeid;
    match do_lookup(shared, parent, &name) {
        Ok(e) => {
            if let Some(inode) = shared.inodes.get(e.ino) {
                inode.nopen.fetch_add(1, Ordering::AcqRel);
            }
            req.frame_create(rcb.proto_minor, &e, res as u64, 0);
        }
        Err(err) => {
            log_fd_exhaustion(err);
            req.set_error(err);
        }
    }
}

fn done_read(_shared: &Arc<PtShared>, _rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        req.set_error(-res);
        return;
    }
    req.add_data_len(res as usize);
}

fn done_write(_shared: &Arc<PtShared>, _rcb: &mut PtRcb, req: &mut FuseRequest, res: i32) {
    if res < 0 {
        req.set_error(-res);
        return;
    }
    req.frame_write(res as u32);
}

fn attr_from_statx(sx: &libc::statx) -> abi::fuse_attr {
    abi::fuse_attr {
        ino: sx.stx_ino,
        size: sx.stx_size,
        blocks: sx.stx_blocks,
        atime: sx.stx_atime.tv_sec,
        mtime: sx.stx_mtime.tv_sec,
        ctime: sx.stx_ctime.tv_sec,
        atimensec: sx.stx_atime.tv_nsec,
        mtimensec: sx.stx_mtime.tv_nsec,
        ctimensec: sx.stx_ctime.tv_nsec,
        mode: sx.stx_mode as u32,
        nlink: sx.stx_nlink,
        uid: sx.stx_uid,
        gid: sx.stx_gid,
        rdev: libc::makedev(sx.stx_rdev_major, sx.stx_rdev_minor) as u32,
        blksize: sx.stx_blksize,
        padding: 0,
    }
}

impl PassthroughFs {
    fn do_fsync(
        &self,
        se: &Session,
        fd: libc::c_int,
        fsync_flags: u32,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let mut flags = types::FsyncFlags::empty();
        if fsync_flags & consts::FUSE_FSYNC_FDATASYNC != 0 {
            flags = types::FsyncFlags::DATASYNC;
        }
        let entry = opcode::Fsync::new(types::Fd(fd)).flags(flags).build();
        self.submit(rcb, req, entry, done_generic)
    }
}

impl FuseOps for PassthroughFs {
    fn init(
        &self,
        se: &Session,
        conn: &mut ConnInfo,
        hdr: &abi::fuse_in_header,
        _arg: &abi::fuse_init_in,
    ) -> Result<(), i32> {
        use crate::ll::fuse_abi::CapFlags;

        if conn.capable.contains(CapFlags::EXPORT_SUPPORT) {
            conn.want |= CapFlags::EXPORT_SUPPORT;
        }
        if !self.inner.timeout.is_zero() && conn.capable.contains(CapFlags::WRITEBACK_CACHE) {
            conn.want |= CapFlags::WRITEBACK_CACHE;
        }
        if conn.capable.contains(CapFlags::FLOCK_LOCKS) {
            conn.want |= CapFlags::FLOCK_LOCKS;
        }

        if hdr.uid != 0 && hdr.gid != 0 {
            if let Err(e) = nix::unistd::seteuid(nix::unistd::Uid::from_raw(hdr.uid)) {
                warn!("could not set euid to {}: {e}", hdr.uid);
                return Err(e as i32);
            }
            if let Err(e) = nix::unistd::setegid(nix::unistd::Gid::from_raw(hdr.gid)) {
                warn!("could not set egid to {}: {e}", hdr.gid);
                return Err(e as i32);
            }
        } else {
            debug!(
                "init carried no credentials; operations run as uid {} gid {}",
                nix::unistd::getuid(),
                nix::unistd::getgid()
            );
        }

        se.set_init_done();
        Ok(())
    }

    fn destroy(&self, _se: &Session, _hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        self.inner.inodes.clear_with(|i| {
            error!(
                "inode {} was not released by the host before the file system was destroyed",
                i.fileid
            );
        });
        req.reply_ok()
    }

    fn lookup(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        match do_lookup(&self.inner, hdr.nodeid, &name) {
            Ok(e) => req.reply_entry(se, &e),
            Err(libc::ENOENT) => {
                // negative entry: the host may cache the absence
                let e = EntryParam {
                    attr_timeout: self.inner.timeout,
                    entry_timeout: self.inner.timeout,
                    ..Default::default()
                };
                req.reply_entry(se, &e)
            }
            Err(err) => {
                log_fd_exhaustion(err);
                req.reply_err(err)
            }
        }
    }

    fn forget(&self, _se: &Session, hdr: &abi::fuse_in_header, arg: abi::fuse_forget_in) {
        forget_one(&self.inner, hdr.nodeid, arg.nlookup);
    }

    fn batch_forget(&self, _se: &Session, _hdr: &abi::fuse_in_header, nodes: Vec<abi::fuse_forget_one>) {
        for node in nodes {
            forget_one(&self.inner, node.nodeid, node.nlookup);
        }
    }

    fn getattr(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_getattr_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let fd = if arg.getattr_flags & consts::FUSE_GETATTR_FH != 0 {
            arg.fh as libc::c_int
        } else {
            match ino_to_fd(&self.inner, hdr.nodeid) {
                Some(fd) => fd,
                None => return req.reply_err(libc::EINVAL),
            }
        };
        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        rcb.name = Some(CString::default());
        let entry = opcode::Statx::new(
            types::Fd(fd),
            rcb.name.as_ref().unwrap().as_ptr(),
            &mut rcb.statx.0 as *mut libc::statx as *mut _,
        )
        .flags(libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW | libc::AT_NO_AUTOMOUNT)
        .mask(libc::STATX_BASIC_STATS)
        .build();
        self.submit(rcb, req, entry, done_getattr)
    }

    fn setattr(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_setattr_in,
        fh: Option<u64>,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(inode) = ino_to_inode(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let Some(ifd) = inode.fd() else {
            return req.reply_err(libc::EINVAL);
        };

        let procname = |fd: libc::c_int| CString::new(format!("/proc/self/fd/{fd}")).unwrap();

        if arg.valid & consts::FATTR_MODE != 0 {
            let res = match fh {
                Some(fh) => unsafe { libc::fchmod(fh as libc::c_int, arg.mode) },
                None => unsafe { libc::chmod(procname(ifd).as_ptr(), arg.mode) },
            };
            if res == -1 {
                return req.reply_err(last_errno());
            }
        }
        if arg.valid & (consts::FATTR_UID | consts::FATTR_GID) != 0 {
            let uid = if arg.valid & consts::FATTR_UID != 0 {
                arg.uid
            } else {
                u32::MAX
            };
            let gid = if arg.valid & consts::FATTR_GID != 0 {
                arg.gid
            } else {
                u32::MAX
            };
            let res = unsafe {
                libc::fchownat(
                    ifd,
                    c"".as_ptr(),
                    uid,
                    gid,
                    libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
                )
            };
            if res == -1 {
                return req.reply_err(last_errno());
            }
        }
        if arg.valid & consts::FATTR_SIZE != 0 {
            let res = match fh {
                Some(fh) => unsafe { libc::ftruncate(fh as libc::c_int, arg.size as libc::off_t) },
                None => unsafe {
                    libc::truncate(procname(ifd).as_ptr(), arg.size as libc::off_t)
                },
            };
            if res == -1 {
                return req.reply_err(last_errno());
            }
        }
        if arg.valid & (consts::FATTR_ATIME | consts::FATTR_MTIME) != 0 {
            let mut tv = [
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: libc::UTIME_OMIT,
                },
            ];
            if arg.valid & consts::FATTR_ATIME_NOW != 0 {
                tv[0].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & consts::FATTR_ATIME != 0 {
                tv[0].tv_sec = arg.atime;
                tv[0].tv_nsec = arg.atimensec as libc::c_long;
            }
            if arg.valid & consts::FATTR_MTIME_NOW != 0 {
                tv[1].tv_nsec = libc::UTIME_NOW;
            } else if arg.valid & consts::FATTR_MTIME != 0 {
                tv[1].tv_sec = arg.mtime;
                tv[1].tv_nsec = arg.mtimensec as libc::c_long;
            }
            let res = match fh {
                Some(fh) => unsafe { libc::futimens(fh as libc::c_int, tv.as_ptr()) },
                None => unsafe {
                    libc::utimensat(libc::AT_FDCWD, procname(ifd).as_ptr(), tv.as_ptr(), 0)
                },
            };
            if res == -1 {
                return req.reply_err(last_errno());
            }
        }

        match fstatat_empty(ifd) {
            Ok(st) => req.reply_attr(se, &attr_from_stat(&st), self.inner.timeout),
            Err(err) => req.reply_err(err),
        }
    }

    fn mknod(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_mknod_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        match make_node(&self.inner, hdr.nodeid, &name, arg.mode, arg.rdev, None) {
            Ok(e) => req.reply_entry(se, &e),
            Err(err) => req.reply_err(err),
        }
    }

    fn mkdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_mkdir_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        match make_node(
            &self.inner,
            hdr.nodeid,
            &name,
            libc::S_IFDIR | arg.mode,
            0,
            None,
        ) {
            Ok(e) => req.reply_entry(se, &e),
            Err(err) => req.reply_err(err),
        }
    }

    fn symlink(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        target: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        match make_node(&self.inner, hdr.nodeid, &name, libc::S_IFLNK, 0, Some(&target)) {
            Ok(e) => req.reply_entry(se, &e),
            Err(err) => req.reply_err(err),
        }
    }

    fn unlink(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(parent) = ino_to_inode(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let Some(parent_fd) = parent.fd() else {
            return req.reply_err(libc::EINVAL);
        };

        // Release the anchor fd before the last unlink (like nfsd's
        // CLOSE_BEFORE_UNLINK) so server-side fileid reuse is observable as
        // a generation bump. Skipped under writeback caching, where the
        // kernel may still read through the inode.
        if self.inner.timeout.is_zero() {
            match do_lookup(&self.inner, hdr.nodeid, &name) {
                Ok(e) => {
                    if e.attr.nlink == 1 {
                        if let Some(inode) = self.inner.inodes.get(e.ino) {
                            let mut state = inode.state.lock();
                            if state.fd >= 0 && inode.nopen.load(Ordering::Acquire) == 0 {
                                unsafe { libc::close(state.fd) };
                                state.fd = -1;
                                inode.generation.fetch_add(1, Ordering::AcqRel);
                            }
                        }
                    }
                    // drop the reference the lookup above added
                    forget_one(&self.inner, e.ino, 1);
                }
                Err(err) => return req.reply_err(err),
            }
        }

        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let c_name = match cstring(&name) {
            Ok(c) => c,
            Err(e) => {
                self.inner.pools[rcb.thread_id as usize].free(rcb);
                return req.reply_err(e);
            }
        };
        rcb.name = Some(c_name);
        rcb.inode = Some(parent);
        let entry = opcode::UnlinkAt::new(types::Fd(parent_fd), rcb.name.as_ref().unwrap().as_ptr())
            .build();
        self.submit(rcb, req, entry, done_generic)
    }

    fn rmdir(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(parent_fd) = ino_to_fd(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let c_name = match cstring(&name) {
            Ok(c) => c,
            Err(e) => return req.reply_err(e),
        };
        let res = unsafe { libc::unlinkat(parent_fd, c_name.as_ptr(), libc::AT_REMOVEDIR) };
        if res == -1 {
            return req.reply_err(last_errno());
        }
        req.reply_ok()
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
        if flags != 0 {
            // RENAME_EXCHANGE / NOREPLACE are not wired through
            return req.reply_err(libc::EINVAL);
        }
        let (Some(old_parent), Some(new_parent)) = (
            ino_to_inode(&self.inner, hdr.nodeid),
            ino_to_inode(&self.inner, newdir),
        ) else {
            return req.reply_err(libc::EINVAL);
        };
        let (Some(old_fd), Some(new_fd)) = (old_parent.fd(), new_parent.fd()) else {
            return req.reply_err(libc::EINVAL);
        };

        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let (c_old, c_new) = match (cstring(&name), cstring(&newname)) {
            (Ok(a), Ok(b)) => (a, b),
            _ => {
                self.inner.pools[rcb.thread_id as usize].free(rcb);
                return req.reply_err(libc::EINVAL);
            }
        };
        rcb.name = Some(c_old);
        rcb.name2 = Some(c_new);
        rcb.inode = Some(old_parent);
        rcb.inode2 = Some(new_parent);
        let entry = opcode::RenameAt::new(
            types::Fd(old_fd),
            rcb.name.as_ref().unwrap().as_ptr(),
            types::Fd(new_fd),
            rcb.name2.as_ref().unwrap().as_ptr(),
        )
        .build();
        self.submit(rcb, req, entry, done_generic)
    }

    fn open(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(inode) = ino_to_inode(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let Some(fd) = inode.fd() else {
            return req.reply_err(libc::EINVAL);
        };

        let mut flags = arg.flags as i32;
        let writeback = !self.inner.timeout.is_zero();
        // With writeback caching the kernel may read behind a write-only
        // open, and it owns append positioning.
        if writeback && flags & libc::O_ACCMODE == libc::O_WRONLY {
            flags = (flags & !libc::O_ACCMODE) | libc::O_RDWR;
        }
        if writeback {
            flags &= !libc::O_APPEND;
        }

        let mut open_flags = 0;
        if writeback {
            open_flags |= consts::FOPEN_KEEP_CACHE;
        }
        if !writeback && flags & libc::O_ACCMODE == libc::O_RDONLY {
            open_flags |= consts::FOPEN_NOFLUSH;
        }

        // The anchor fd was opened O_PATH, so reopen through procfs
        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        rcb.name = Some(CString::new(format!("/proc/self/fd/{fd}")).unwrap());
        rcb.inode = Some(inode);
        rcb.open_flags = open_flags;
        let entry = opcode::OpenAt::new(
            types::Fd(libc::AT_FDCWD),
            rcb.name.as_ref().unwrap().as_ptr(),
        )
        .flags(flags & !libc::O_NOFOLLOW)
        .build();
        self.submit(rcb, req, entry, done_open)
    }

    fn create(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_create_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(parent) = ino_to_inode(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let Some(parent_fd) = parent.fd() else {
            return req.reply_err(libc::EINVAL);
        };

        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let c_name = match cstring(&name) {
            Ok(c) => c,
            Err(e) => {
                self.inner.pools[rcb.thread_id as usize].free(rcb);
                return req.reply_err(e);
            }
        };
        rcb.name = Some(c_name);
        rcb.create_name = Some(name);
        rcb.inode = Some(parent);
        let entry = opcode::OpenAt::new(
            types::Fd(parent_fd),
            rcb.name.as_ref().unwrap().as_ptr(),
        )
        .flags((arg.flags as i32 | libc::O_CREAT) & !libc::O_NOFOLLOW)
        .mode(arg.mode)
        .build();
        self.submit(rcb, req, entry, done_create)
    }

    fn read(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        mut req: FuseRequest,
    ) -> HandlerOutcome {
        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        rcb.iovecs = req
            .data_segs_mut()
            .iter_mut()
            .map(|seg| libc::iovec {
                iov_base: seg.as_mut_ptr().cast(),
                iov_len: seg.len(),
            })
            .collect();
        let entry = opcode::Readv::new(
            types::Fd(arg.fh as libc::c_int),
            rcb.iovecs.as_ptr(),
            rcb.iovecs.len() as u32,
        )
        .offset(arg.offset)
        .build();
        self.submit(rcb, req, entry, done_read)
    }

    fn write(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_write_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let mut rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        rcb.iovecs = req
            .write_payload()
            .iter()
            .map(|seg| libc::iovec {
                iov_base: seg.as_ptr() as *mut _,
                iov_len: seg.len(),
            })
            .collect();
        let entry = opcode::Writev::new(
            types::Fd(arg.fh as libc::c_int),
            rcb.iovecs.as_ptr(),
            rcb.iovecs.len() as u32,
        )
        .offset(arg.offset)
        .build();
        self.submit(rcb, req, entry, done_write)
    }

    fn statfs(&self, se: &Session, hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        let Some(fd) = ino_to_fd(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstatvfs(fd, &mut st) } == -1 {
            return req.reply_err(last_errno());
        }
        req.reply_statfs(se, &kstatfs_from_statvfs(&st))
    }

    fn release(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if let Some(inode) = ino_to_inode(&self.inner, hdr.nodeid) {
            inode
                .nopen
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    Some(n.saturating_sub(1))
                })
                .ok();
        }
        let rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let entry = opcode::Close::new(types::Fd(arg.fh as libc::c_int)).build();
        self.submit(rcb, req, entry, done_generic)
    }

    fn fsync(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_fsync_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        self.do_fsync(se, arg.fh as libc::c_int, arg.fsync_flags, req)
    }

    fn flush(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_flush_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        // close() flushes data; there is no flush syscall to mirror
        self.do_fsync(se, arg.fh as libc::c_int, consts::FUSE_FSYNC_FDATASYNC, req)
    }

    fn opendir(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        _arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(fd) = ino_to_fd(&self.inner, hdr.nodeid) else {
            return req.reply_err(libc::EINVAL);
        };
        let dir_fd = unsafe { libc::openat(fd, c".".as_ptr(), libc::O_RDONLY) };
        if dir_fd == -1 {
            let err = last_errno();
            log_fd_exhaustion(err);
            return req.reply_err(err);
        }
        let stream = match DirStream::from_fd(dir_fd) {
            Ok(s) => s,
            Err(err) => return req.reply_err(err),
        };
        let fh = self.inner.next_dir_fh.fetch_add(1, Ordering::Relaxed);
        self.inner.dirs.lock().insert(
            fh,
            Arc::new(DirHandle {
                stream: Mutex::new(DirCursor { stream, offset: 0 }),
            }),
        );
        let mut open_flags = 0;
        if !self.inner.timeout.is_zero() {
            open_flags |= consts::FOPEN_KEEP_CACHE | consts::FOPEN_CACHE_DIR;
        }
        req.reply_open(fh, open_flags)
    }

    fn releasedir(
        &self,
        _se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        self.inner.dirs.lock().remove(&arg.fh);
        req.reply_ok()
    }

    fn readdir(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        plus: bool,
        mut req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(dir) = self.inner.dirs.lock().get(&arg.fh).cloned() else {
            return req.reply_err(libc::EBADF);
        };
        let mut cursor = dir.stream.lock();
        if arg.offset as i64 != cursor.offset {
            cursor.stream.seek(arg.offset as i64);
            cursor.offset = arg.offset as i64;
        }

        let mut written = 0usize;
        let mut err = 0;
        {
            let mut out = IovCursor::new(req.data_segs_mut());
            loop {
                let entry = match cursor.stream.read() {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        err = e;
                        break;
                    }
                };
                cursor.offset = entry.off;
                if entry.name == "." || entry.name == ".." {
                    continue;
                }

                let n = if plus {
                    let e = match do_lookup(&self.inner, hdr.nodeid, &entry.name) {
                        Ok(e) => e,
                        Err(e) => {
                            err = e;
                            break;
                        }
                    };
                    let n = out.add_direntry_plus(&entry.name, &e, entry.off as u64);
                    if n == 0 {
                        // entry does not fit; undo the lookup it took
                        forget_one(&self.inner, e.ino, 1);
                    }
                    n
                } else {
                    out.add_direntry(
                        &entry.name,
                        entry.ino,
                        entry.off as u64,
                        entry.typ << 12,
                    )
                };
                if n == 0 {
                    break;
                }
                written += n;
            }
        }
        drop(cursor);

        // An error is only reportable if nothing was emitted yet; with
        // entries in the buffer the lookup counts for them are already
        // taken, so return what we have.
        if err != 0 && written == 0 {
            log_fd_exhaustion(err);
            return req.reply_err(err);
        }
        req.add_data_len(written);
        HandlerOutcome::Done(req)
    }

    fn fsyncdir(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_fsync_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(dir) = self.inner.dirs.lock().get(&arg.fh).cloned() else {
            return req.reply_err(libc::EBADF);
        };
        let fd = dir.stream.lock().stream.dirfd();
        self.do_fsync(se, fd, arg.fsync_flags, req)
    }

    fn flock(
        &self,
        _se: &Session,
        _hdr: &abi::fuse_in_header,
        fh: u64,
        _owner: u64,
        op: i32,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let res = unsafe { libc::flock(fh as libc::c_int, op) };
        if res == -1 {
            return req.reply_err(last_errno());
        }
        req.reply_ok()
    }

    fn fallocate(
        &self,
        se: &Session,
        _hdr: &abi::fuse_in_header,
        arg: abi::fuse_fallocate_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let rcb = match self.alloc_rcb(se) {
            Ok(rcb) => rcb,
            Err(e) => return req.reply_err(e),
        };
        let entry = opcode::Fallocate::new(types::Fd(arg.fh as libc::c_int), arg.length)
            .offset(arg.offset)
            .mode(arg.mode as i32)
            .build();
        self.submit(rcb, req, entry, done_generic)
    }
}
