//! End-to-end scenarios against the in-memory key-value backend: the full
//! create/write/read/readdir/forget lifecycle over the dispatch layer.

mod common;

use common::*;
use dpfs::kv::KvFs;
use dpfs::ll::fuse_abi::{self as abi, fuse_opcode};
use zerocopy::IntoBytes;

fn create_req(name: &str) -> dpfs::hal::SgBuf {
    let create = abi::fuse_create_in {
        flags: (libc::O_CREAT | libc::O_WRONLY) as u32,
        mode: 0o644,
        umask: 0,
        padding: 0,
    };
    ReqBuilder::new(fuse_opcode::FUSE_CREATE, 1)
        .arg(&create, &[name.as_bytes()])
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_entry_out>() + size_of::<abi::fuse_open_out>())
        .build()
}

fn write_req(nodeid: u64, offset: u64, data: &[u8]) -> dpfs::hal::SgBuf {
    let write = abi::fuse_write_in {
        fh: 0,
        offset,
        size: data.len() as u32,
        ..Default::default()
    };
    ReqBuilder::new(fuse_opcode::FUSE_WRITE, nodeid)
        .arg(&write, &[])
        .in_seg(data.to_vec())
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_write_out>())
        .build()
}

fn read_req(nodeid: u64, offset: u64, seg_lens: &[usize]) -> dpfs::hal::SgBuf {
    let size: usize = seg_lens.iter().sum();
    let read = abi::fuse_read_in {
        fh: 0,
        offset,
        size: size as u32,
        ..Default::default()
    };
    let mut b = ReqBuilder::new(fuse_opcode::FUSE_READ, nodeid)
        .arg(&read, &[])
        .out(size_of::<abi::fuse_out_header>());
    for len in seg_lens {
        b = b.out(*len);
    }
    b.build()
}

#[test]
fn create_write_read_roundtrip() {
    let dev = device_for(KvFs::new());
    do_init(&dev);

    let done = roundtrip(&dev, create_req("foo"));
    assert_eq!(out_error(&done), 0);
    let entry = entry_out(&done);
    assert!(entry.nodeid > 1);
    let nodeid = entry.nodeid;

    let payload = b"hello kv world";
    let done = roundtrip(&dev, write_req(nodeid, 0, payload));
    assert_eq!(out_error(&done), 0);
    let hdr = out_header(&done);
    assert_eq!(
        hdr.len as usize,
        size_of::<abi::fuse_out_header>() + size_of::<abi::fuse_write_out>()
    );

    // scatter read across two output segments
    let done = roundtrip(&dev, read_req(nodeid, 0, &[6, payload.len() - 6]));
    assert_eq!(out_error(&done), 0);
    assert_eq!(
        out_header(&done).len as usize,
        size_of::<abi::fuse_out_header>() + payload.len()
    );
    assert_eq!(&done.bufs.out_iov[1], &payload[..6]);
    assert_eq!(&done.bufs.out_iov[2], &payload[6..]);
}

#[test]
fn lookup_tracks_nlookup_and_forget_reclaims() {
    let dev = device_for(KvFs::new());
    do_init(&dev);

    let done = roundtrip(&dev, create_req("key"));
    let nodeid = entry_out(&done).nodeid;

    // a second lookup reference
    let done = roundtrip(&dev, lookup_req(1, "key"));
    assert_eq!(out_error(&done), 0);
    assert_eq!(entry_out(&done).nodeid, nodeid);

    let done = roundtrip(&dev, getattr_req(nodeid));
    assert_eq!(out_error(&done), 0);

    // forget one of the two references: still reachable
    roundtrip(&dev, forget_req(nodeid, 1));
    assert_eq!(out_error(&roundtrip(&dev, getattr_req(nodeid))), 0);

    // forget the last reference: the inode is gone
    roundtrip(&dev, forget_req(nodeid, 1));
    assert_eq!(
        out_error(&roundtrip(&dev, getattr_req(nodeid))),
        -libc::ENOENT
    );
}

#[test]
fn lookup_of_missing_key_is_enoent() {
    let dev = device_for(KvFs::new());
    do_init(&dev);
    let done = roundtrip(&dev, lookup_req(1, "missing"));
    assert_eq!(out_error(&done), -libc::ENOENT);
}

#[test]
fn readdir_lists_keys_in_stable_order() {
    let dev = device_for(KvFs::new());
    do_init(&dev);

    for name in ["zeta", "alpha", "mid"] {
        assert_eq!(out_error(&roundtrip(&dev, create_req(name))), 0);
    }

    let read = abi::fuse_read_in {
        fh: 0,
        offset: 0,
        size: 4096,
        ..Default::default()
    };
    let bufs = ReqBuilder::new(fuse_opcode::FUSE_READDIR, 1)
        .arg(&read, &[])
        .out(size_of::<abi::fuse_out_header>())
        .out(4096)
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), 0);
    let hdr = out_header(&done);
    let data_len = hdr.len as usize - size_of::<abi::fuse_out_header>();
    let names: Vec<String> = parse_dirents(&done.bufs.out_iov[1][..data_len])
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    assert_eq!(names, ["alpha", "mid", "zeta"]);
}

#[test]
fn unlink_then_lookup_is_enoent() {
    let dev = device_for(KvFs::new());
    do_init(&dev);
    roundtrip(&dev, create_req("gone"));

    let bufs = ReqBuilder::new(fuse_opcode::FUSE_UNLINK, 1)
        .in_seg(b"gone\0".to_vec())
        .out(size_of::<abi::fuse_out_header>())
        .build();
    assert_eq!(out_error(&roundtrip(&dev, bufs)), 0);
    assert_eq!(out_error(&roundtrip(&dev, lookup_req(1, "gone"))), -libc::ENOENT);
}

#[test]
fn statfs_reports_file_count() {
    let dev = device_for(KvFs::new());
    do_init(&dev);
    roundtrip(&dev, create_req("a"));
    roundtrip(&dev, create_req("b"));

    let bufs = ReqBuilder::new(fuse_opcode::FUSE_STATFS, 1)
        .out(size_of::<abi::fuse_out_header>())
        .out(size_of::<abi::fuse_statfs_out>())
        .build();
    let done = roundtrip(&dev, bufs);
    assert_eq!(out_error(&done), 0);
    use zerocopy::FromBytes;
    let (st, _) = abi::fuse_statfs_out::read_from_prefix(&done.bufs.out_iov[1]).unwrap();
    assert_eq!(st.st.files, 2);
    assert_eq!(st.st.namelen, 255);
}

#[test]
fn write_extends_value() {
    let dev = device_for(KvFs::new());
    do_init(&dev);
    let nodeid = entry_out(&roundtrip(&dev, create_req("sparse"))).nodeid;

    assert_eq!(out_error(&roundtrip(&dev, write_req(nodeid, 4, b"tail"))), 0);
    let done = roundtrip(&dev, getattr_req(nodeid));
    assert_eq!(attr_out(&done).attr.size, 8);

    let done = roundtrip(&dev, read_req(nodeid, 0, &[8]));
    assert_eq!(&done.bufs.out_iov[1], b"\0\0\0\0tail");
}

#[test]
fn write_out_is_bit_exact() {
    let dev = device_for(KvFs::new());
    do_init(&dev);
    let nodeid = entry_out(&roundtrip(&dev, create_req("x"))).nodeid;
    let done = roundtrip(&dev, write_req(nodeid, 0, &[7u8; 32]));
    let expected = abi::fuse_write_out {
        size: 32,
        padding: 0,
    };
    assert_eq!(
        &done.bufs.out_iov[1][..size_of::<abi::fuse_write_out>()],
        expected.as_bytes()
    );
}
