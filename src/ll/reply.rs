//! Reply framing.
//!
//! Helpers that frame FUSE replies directly into the output segments the
//! host posted. Every helper accounts the bytes it wrote into
//! `fuse_out_header.len`, emitting the compat-sized form when the negotiated
//! protocol minor predates the full structure:
//! attr/entry before 7.9, statfs before 7.4, init before 7.5/7.23.

use std::time::Duration;

use zerocopy::{FromBytes, IntoBytes};

use super::fuse_abi as abi;

/// Directory entry parameters a backend supplies for LOOKUP-shaped replies.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryParam {
    /// Unique inode number. Zero means negative entry: the kernel may cache
    /// the absence of the name for `entry_timeout`.
    pub ino: u64,
    /// Generation of this `ino`. `ino`/`generation` pairs must be unique
    /// over the filesystem's lifetime, so reused fileids get a bumped
    /// generation.
    pub generation: u64,
    pub attr: abi::fuse_attr,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
}

pub(crate) fn fill_entry(e: &EntryParam) -> abi::fuse_entry_out {
    abi::fuse_entry_out {
        nodeid: e.ino,
        generation: e.generation,
        entry_valid: e.entry_timeout.as_secs(),
        attr_valid: e.attr_timeout.as_secs(),
        entry_valid_nsec: e.entry_timeout.subsec_nanos(),
        attr_valid_nsec: e.attr_timeout.subsec_nanos(),
        attr: e.attr,
    }
}

/// Read back the output header of a framed reply.
pub fn load_out_header(seg: &[u8]) -> abi::fuse_out_header {
    abi::fuse_out_header::read_from_prefix(seg)
        .map(|(h, _)| h)
        .unwrap_or_default()
}

pub(crate) fn store_out_header(seg: &mut [u8], hdr: &abi::fuse_out_header) {
    let _ = hdr.write_to_prefix(seg);
}

/// Initialize the output header for a fresh request: echo `unique`, header
/// length only, no error.
pub fn init_out_header(seg: &mut [u8], unique: u64) {
    store_out_header(
        seg,
        &abi::fuse_out_header {
            len: size_of::<abi::fuse_out_header>() as u32,
            error: 0,
            unique,
        },
    );
}

/// Account `n` payload bytes in the output header.
pub fn add_out_len(seg: &mut [u8], n: usize) {
    let mut hdr = load_out_header(seg);
    hdr.len += n as u32;
    store_out_header(seg, &hdr);
}

/// Record a (positive) POSIX errno in the output header.
pub fn set_out_error(seg: &mut [u8], errno: i32) {
    let mut hdr = load_out_header(seg);
    hdr.error = -errno;
    store_out_header(seg, &hdr);
}

fn put_sized(out_hdr: &mut [u8], out_arg: &mut [u8], bytes: &[u8], size: usize) {
    if out_arg.len() < size {
        set_out_error(out_hdr, libc::EINVAL);
        return;
    }
    out_arg[..size].copy_from_slice(&bytes[..size]);
    add_out_len(out_hdr, size);
}

pub fn reply_attr(
    proto_minor: u32,
    out_hdr: &mut [u8],
    out_arg: &mut [u8],
    attr: &abi::fuse_attr,
    attr_timeout: Duration,
) {
    let size = if proto_minor < 9 {
        abi::FUSE_COMPAT_ATTR_OUT_SIZE
    } else {
        size_of::<abi::fuse_attr_out>()
    };
    let out = abi::fuse_attr_out {
        attr_valid: attr_timeout.as_secs(),
        attr_valid_nsec: attr_timeout.subsec_nanos(),
        dummy: 0,
        attr: *attr,
    };
    put_sized(out_hdr, out_arg, out.as_bytes(), size);
}

pub fn reply_entry(proto_minor: u32, out_hdr: &mut [u8], out_arg: &mut [u8], e: &EntryParam) {
    // before ABI 7.4, ino == 0 was invalid and only ENOENT meant a negative
    // entry
    if e.ino == 0 && proto_minor < 4 {
        set_out_error(out_hdr, libc::ENOENT);
        return;
    }
    let size = if proto_minor < 9 {
        abi::FUSE_COMPAT_ENTRY_OUT_SIZE
    } else {
        size_of::<abi::fuse_entry_out>()
    };
    let out = fill_entry(e);
    put_sized(out_hdr, out_arg, out.as_bytes(), size);
}

pub fn reply_open(out_hdr: &mut [u8], out_arg: &mut [u8], fh: u64, open_flags: u32) {
    let out = abi::fuse_open_out {
        fh,
        open_flags,
        padding: 0,
    };
    put_sized(out_hdr, out_arg, out.as_bytes(), size_of::<abi::fuse_open_out>());
}

/// CREATE reply: entry-out (compat sized) immediately followed by open-out.
pub fn reply_create(
    proto_minor: u32,
    out_hdr: &mut [u8],
    out_arg: &mut [u8],
    e: &EntryParam,
    fh: u64,
    open_flags: u32,
) {
    let entrysize = if proto_minor < 9 {
        abi::FUSE_COMPAT_ENTRY_OUT_SIZE
    } else {
        size_of::<abi::fuse_entry_out>()
    };
    let opensize = size_of::<abi::fuse_open_out>();
    if out_arg.len() < entrysize + opensize {
        set_out_error(out_hdr, libc::EINVAL);
        return;
    }
    let entry = fill_entry(e);
    out_arg[..entrysize].copy_from_slice(&entry.as_bytes()[..entrysize]);
    let open = abi::fuse_open_out {
        fh,
        open_flags,
        padding: 0,
    };
    out_arg[entrysize..entrysize + opensize].copy_from_slice(open.as_bytes());
    add_out_len(out_hdr, entrysize + opensize);
}

pub fn reply_statfs(
    proto_minor: u32,
    out_hdr: &mut [u8],
    out_arg: &mut [u8],
    st: &abi::fuse_kstatfs,
) {
    let size = if proto_minor < 4 {
        abi::FUSE_COMPAT_STATFS_SIZE
    } else {
        size_of::<abi::fuse_statfs_out>()
    };
    let out = abi::fuse_statfs_out { st: *st };
    put_sized(out_hdr, out_arg, out.as_bytes(), size);
}

pub fn reply_write(out_hdr: &mut [u8], out_arg: &mut [u8], written: u32) {
    let out = abi::fuse_write_out {
        size: written,
        padding: 0,
    };
    put_sized(out_hdr, out_arg, out.as_bytes(), size_of::<abi::fuse_write_out>());
}

/// Convert a `stat` result into the wire attr form.
pub fn attr_from_stat(s: &libc::stat) -> abi::fuse_attr {
    abi::fuse_attr {
        ino: s.st_ino,
        size: s.st_size as u64,
        blocks: s.st_blocks as u64,
        atime: s.st_atime,
        mtime: s.st_mtime,
        ctime: s.st_ctime,
        atimensec: s.st_atime_nsec as u32,
        mtimensec: s.st_mtime_nsec as u32,
        ctimensec: s.st_ctime_nsec as u32,
        mode: s.st_mode,
        nlink: s.st_nlink as u32,
        uid: s.st_uid,
        gid: s.st_gid,
        rdev: s.st_rdev as u32,
        blksize: s.st_blksize as u32,
        padding: 0,
    }
}

/// Convert a `statvfs` result into the wire statfs form.
pub fn kstatfs_from_statvfs(st: &libc::statvfs) -> abi::fuse_kstatfs {
    abi::fuse_kstatfs {
        blocks: st.f_blocks,
        bfree: st.f_bfree,
        bavail: st.f_bavail,
        files: st.f_files,
        ffree: st.f_ffree,
        bsize: st.f_bsize as u32,
        namelen: st.f_namemax as u32,
        frsize: st.f_frsize as u32,
        padding: 0,
        spare: [0; 6],
    }
}
