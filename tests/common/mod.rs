//! Shared harness for the engine integration tests: request builders that
//! lay out scatter-gather buffers the way the virtio-fs transport would,
//! and helpers to drive them through a software queue device.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use zerocopy::IntoBytes;

use dpfs::hal::queue::{CompletedRequest, QueueDevice};
use dpfs::hal::{Device, SgBuf};
use dpfs::ll::fuse_abi::{self as abi, fuse_opcode};
use dpfs::ll::reply::load_out_header;

pub struct ReqBuilder {
    hdr: abi::fuse_in_header,
    hdr_tail: Vec<u8>,
    in_segs: Vec<Vec<u8>>,
    out_lens: Vec<usize>,
}

impl ReqBuilder {
    pub fn new(opcode: fuse_opcode, nodeid: u64) -> ReqBuilder {
        ReqBuilder {
            hdr: abi::fuse_in_header {
                len: 0,
                opcode: opcode as u32,
                unique: 7,
                nodeid,
                uid: 0,
                gid: 0,
                pid: 1,
                padding: 0,
            },
            hdr_tail: Vec::new(),
            in_segs: Vec::new(),
            out_lens: Vec::new(),
        }
    }

    pub fn opcode_raw(mut self, opcode: u32) -> Self {
        self.hdr.opcode = opcode;
        self
    }

    pub fn unique(mut self, unique: u64) -> Self {
        self.hdr.unique = unique;
        self
    }

    pub fn creds(mut self, uid: u32, gid: u32) -> Self {
        self.hdr.uid = uid;
        self.hdr.gid = gid;
        self
    }

    /// Bytes appended to the header segment (FORGET-style requests).
    pub fn hdr_tail(mut self, bytes: &[u8]) -> Self {
        self.hdr_tail.extend_from_slice(bytes);
        self
    }

    /// One additional input segment.
    pub fn in_seg(mut self, bytes: Vec<u8>) -> Self {
        self.in_segs.push(bytes);
        self
    }

    /// Argument segment: a wire struct, optionally followed by
    /// NUL-terminated names.
    pub fn arg<T: IntoBytes + zerocopy::Immutable>(self, arg: &T, names: &[&[u8]]) -> Self {
        let mut seg = arg.as_bytes().to_vec();
        for name in names {
            seg.extend_from_slice(name);
            seg.push(0);
        }
        self.in_seg(seg)
    }

    pub fn out(mut self, len: usize) -> Self {
        self.out_lens.push(len);
        self
    }

    pub fn build(self) -> SgBuf {
        let mut hdr_seg = self.hdr.as_bytes().to_vec();
        hdr_seg.extend_from_slice(&self.hdr_tail);
        let mut in_iov = vec![hdr_seg];
        in_iov.extend(self.in_segs);
        let total: usize = in_iov.iter().map(Vec::len).sum();
        in_iov[0][..4].copy_from_slice(&(total as u32).to_ne_bytes());
        SgBuf {
            in_iov,
            out_iov: self.out_lens.into_iter().map(|l| vec![0u8; l]).collect(),
        }
    }
}

/// Push one request through the device and wait for its completion.
pub fn roundtrip(dev: &Arc<QueueDevice>, bufs: SgBuf) -> CompletedRequest {
    let rx = dev.submit(bufs);
    dev.poll_io();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("request was not completed")
}

pub fn out_header(done: &CompletedRequest) -> abi::fuse_out_header {
    load_out_header(&done.bufs.out_iov[0])
}

pub fn out_error(done: &CompletedRequest) -> i32 {
    out_header(done).error
}

/// Standard INIT exchange: 7.31 with a typical modern flag set.
pub fn do_init(dev: &Arc<QueueDevice>) -> CompletedRequest {
    let init = abi::fuse_init_in {
        major: 7,
        minor: 31,
        max_readahead: 128 * 1024,
        flags: abi::CapFlags::all().bits(),
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_INIT, 0)
        .arg(&init, &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_init_out>())
        .build();
    roundtrip(dev, bufs)
}

pub fn lookup_req(nodeid: u64, name: &str) -> SgBuf {
    let mut seg = name.as_bytes().to_vec();
    seg.push(0);
    ReqBuilder::new(fuse_opcode::FUSE_LOOKUP, nodeid)
        .in_seg(seg)
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_entry_out>())
        .build()
}

pub fn getattr_req(nodeid: u64) -> SgBuf {
    ReqBuilder::new(fuse_opcode::FUSE_GETATTR, nodeid)
        .arg(&abi::fuse_getattr_in::default(), &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_attr_out>())
        .build()
}

pub fn forget_req(nodeid: u64, nlookup: u64) -> SgBuf {
    ReqBuilder::new(fuse_opcode::FUSE_FORGET, nodeid)
        .hdr_tail(abi::fuse_forget_in { nlookup }.as_bytes())
        .build()
}

/// Parse an entry-out reply (7.31 layout).
pub fn entry_out(done: &CompletedRequest) -> abi::fuse_entry_out {
    use zerocopy::FromBytes;
    abi::fuse_entry_out::read_from_prefix(&done.bufs.out_iov[1])
        .map(|(e, _)| e)
        .expect("reply too short for an entry-out")
}

pub fn attr_out(done: &CompletedRequest) -> abi::fuse_attr_out {
    use zerocopy::FromBytes;
    abi::fuse_attr_out::read_from_prefix(&done.bufs.out_iov[1])
        .map(|(a, _)| a)
        .expect("reply too short for an attr-out")
}

pub fn open_out(done: &CompletedRequest) -> abi::fuse_open_out {
    use zerocopy::FromBytes;
    abi::fuse_open_out::read_from_prefix(&done.bufs.out_iov[1])
        .map(|(o, _)| o)
        .expect("reply too short for an open-out")
}

/// Decode the dirent stream of a READDIR reply.
pub fn parse_dirents(data: &[u8]) -> Vec<(u64, String)> {
    use zerocopy::FromBytes;
    let mut out = Vec::new();
    let mut rest = data;
    while rest.len() >= abi::FUSE_NAME_OFFSET {
        let (dirent, tail) = abi::fuse_dirent::read_from_prefix(rest).unwrap();
        let namelen = dirent.namelen as usize;
        let name = String::from_utf8_lossy(&tail[..namelen]).into_owned();
        out.push((dirent.ino, name));
        let entlen = abi::fuse_dirent_align(abi::FUSE_NAME_OFFSET + namelen);
        if entlen > rest.len() {
            break;
        }
        rest = &rest[entlen..];
    }
    out
}

/// A queue device wired to a dispatcher over the given backend.
pub fn device_for<B: dpfs::FuseOps>(backend: Arc<B>) -> Arc<QueueDevice> {
    dpfs::hal::register_poller_thread(0);
    let handler = Arc::new(dpfs::FuseDispatcher::new(backend));
    QueueDevice::new(0, handler)
}

/// Keep the Device trait import used by every test file.
pub fn poll(dev: &Arc<QueueDevice>) -> usize {
    dev.poll_io()
}
