//! Dispatch-layer behavior driven end-to-end through a software queue
//! device: the INIT handshake, session gating, per-opcode scatter-gather
//! validation and error taxonomy.

mod common;

use std::sync::Arc;

use common::*;
use dpfs::hal::CompletionStatus;
use dpfs::ll::fuse_abi::{self as abi, fuse_opcode, CapFlags};
use dpfs::null::NullFs;
use zerocopy::{FromBytes, IntoBytes};

fn init_out(done: &dpfs::hal::queue::CompletedRequest) -> abi::fuse_init_out {
    abi::fuse_init_out::read_from_prefix(&done.bufs.out_iov[1])
        .map(|(o, _)| o)
        .unwrap()
}

#[test]
fn init_handshake() {
    let dev = device_for(Arc::new(NullFs));
    let done = do_init(&dev);

    let hdr = out_header(&done);
    assert_eq!(hdr.error, 0);
    assert_eq!(hdr.unique, 7);
    assert_eq!(
        hdr.len as usize,
        size_of::<abi::fuse_out_header>() + size_of::<abi::fuse_init_out>()
    );

    let out = init_out(&done);
    assert_eq!(out.major, 7);
    assert_eq!(out.minor, 31);
    let flags = CapFlags::from_bits_truncate(out.flags);
    assert!(flags.contains(CapFlags::BIG_WRITES));
    assert!(flags.contains(CapFlags::ASYNC_READ));
    assert!(flags.contains(CapFlags::DO_READDIRPLUS));
    // splicing never comes back enabled over virtio
    assert!(!flags.contains(CapFlags::SPLICE_READ));
    assert!(!flags.contains(CapFlags::SPLICE_WRITE));
    assert_eq!(out.max_background, 4096);
    assert_eq!(out.congestion_threshold, 4096 * 3 / 4);
    assert_eq!(out.time_gran, 1);
    assert!(out.max_write > 0);
}

#[test]
fn init_compat_sizes() {
    // a 7.21 client gets the 24-byte init-out
    let dev = device_for(Arc::new(NullFs));
    let init = abi::fuse_init_in {
        major: 7,
        minor: 21,
        max_readahead: 4096,
        flags: CapFlags::ASYNC_READ.bits(),
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_INIT, 0)
        .arg(&init, &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_init_out>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), 0);
    assert_eq!(
        out_header(&done).len as usize,
        size_of::<abi::fuse_out_header>() + abi::FUSE_COMPAT_22_INIT_OUT_SIZE
    );
}

#[test]
fn pre_7_major_is_eproto() {
    let dev = device_for(Arc::new(NullFs));
    let init = abi::fuse_init_in {
        major: 6,
        minor: 8,
        ..Default::default()
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_INIT, 0)
        .arg(&init, &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_init_out>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), -libc::EPROTO);
}

#[test]
fn ops_before_init_fail_ebusy() {
    let dev = device_for(Arc::new(NullFs));
    let done = roundtrip(&dev, getattr_req(1));
    assert_eq!(out_error(&done), -libc::EBUSY);
    // FORGET has no reply but must be accepted (and not crash) pre-INIT
    let done = roundtrip(&dev, forget_req(5, 1));
    assert_eq!(done.status, CompletionStatus::Success);
    assert!(done.bufs.out_iov.is_empty());
}

#[test]
fn duplicate_init_is_eisconn() {
    let dev = device_for(Arc::new(NullFs));
    assert_eq!(out_error(&do_init(&dev)), 0);
    let done = do_init(&dev);
    assert_eq!(out_error(&done), -libc::EISCONN);
}

#[test]
fn requests_after_destroy_fail_ebusy() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let destroy = ReqBuilder::new(fuse_opcode::FUSE_DESTROY, 0)
        .out(size_of::<abi::fuse_out_header>())
        .build();
    assert_eq!(out_error(&roundtrip(&dev, destroy)), 0);
    let done = roundtrip(&dev, getattr_req(1));
    assert_eq!(out_error(&done), -libc::EBUSY);
}

#[test]
fn unimplemented_opcode_is_enosys() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    // LINK is in range but unhandled
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_LINK, 1)
        .in_seg(vec![0u8; 16])
        .out(size_of::<abi::fuse_out_header>())
        .out(128)
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(done.status, CompletionStatus::Success);
    assert_eq!(out_error(&done), -libc::ENOSYS);
}

#[test]
fn out_of_range_opcode_is_an_error_completion() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_GETATTR, 1)
        .opcode_raw(abi::FUSE_MAX_OPCODE + 3)
        .arg(&abi::fuse_getattr_in::default(), &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(128)
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(done.status, CompletionStatus::Error);
}

#[test]
fn iovec_count_mismatch_is_an_error_completion() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    // LOOKUP wants exactly 2 output iovecs
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_LOOKUP, 1)
        .in_seg(b"x\0".to_vec())
        .out(size_of::<abi::fuse_out_header>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(done.status, CompletionStatus::Error);
}

#[test]
fn read_size_mismatch_is_an_error_completion() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let read = abi::fuse_read_in {
        fh: 1,
        offset: 0,
        size: 8192,
        ..Default::default()
    };
    // data segments only hold 4096 of the 8192 requested
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_READ, 2)
        .arg(&read, &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(4096)
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(done.status, CompletionStatus::Error);
}

#[test]
fn write_size_mismatch_is_an_error_completion() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let write = abi::fuse_write_in {
        fh: 1,
        offset: 0,
        size: 100,
        ..Default::default()
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_WRITE, 2)
        .arg(&write, &[])
        .in_seg(vec![0u8; 64])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_write_out>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(done.status, CompletionStatus::Error);
}

#[test]
fn posix_byte_range_locks_are_enosys() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let lk = abi::fuse_lk_in {
        fh: 3,
        owner: 9,
        lk: abi::fuse_file_lock {
            start: 0,
            end: 100,
            typ: libc::F_WRLCK as u32,
            pid: 1,
        },
        lk_flags: 0, // not FLOCK
        padding: 0,
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_SETLK, 3)
        .arg(&lk, &[])
        .out(size_of::<abi::fuse_out_header>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), -libc::ENOSYS);
}

#[test]
fn readlink_is_a_stub() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_READLINK, 4)
        .out(size_of::<abi::fuse_out_header>())
        .out(256)
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), -libc::ENOSYS);
}

#[test]
fn reply_headers_echo_unique() {
    let dev = device_for(Arc::new(NullFs));
    do_init(&dev);
    let bufs = lookup_req(1, "nope");
    let mut hdr = abi::fuse_in_header::read_from_prefix(&bufs.in_iov[0])
        .map(|(h, _)| h)
        .unwrap();
    hdr.unique = 0xdead_beef;
    let mut bufs = bufs;
    bufs.in_iov[0][..size_of::<abi::fuse_in_header>()].copy_from_slice(hdr.as_bytes());
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_header(&done).unique, 0xdead_beef);
    // NullFs has no lookup
    assert_eq!(out_error(&done), -libc::ENOSYS);
}
