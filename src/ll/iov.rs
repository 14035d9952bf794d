//! Scatter-gather output helpers.
//!
//! A [`IovCursor`] walks a run of reply segments and copies bytes across
//! segment boundaries. It backs the READDIR/READDIRPLUS paths, where
//! directory entries are emitted into whatever descriptor layout the host
//! posted.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use smallvec::SmallVec;
use zerocopy::IntoBytes;

use super::fuse_abi as abi;
use super::reply::{fill_entry, EntryParam};

// Scratch for one padded entry; spills to the heap only for very long names.
type EntryBuf = SmallVec<[u8; 512]>;

/// Cursor over a contiguous run of output segments.
#[derive(Debug)]
pub struct IovCursor<'a> {
    segs: &'a mut [Vec<u8>],
    seg_idx: usize,
    byte_idx: usize,
    total_size: usize,
    bytes_unused: usize,
}

impl<'a> IovCursor<'a> {
    pub fn new(segs: &'a mut [Vec<u8>]) -> IovCursor<'a> {
        let total_size = segs.iter().map(Vec::len).sum();
        IovCursor {
            segs,
            seg_idx: 0,
            byte_idx: 0,
            total_size,
            bytes_unused: total_size,
        }
    }

    /// Bytes written into the cursor so far.
    pub fn bytes_written(&self) -> usize {
        self.total_size - self.bytes_unused
    }

    pub fn bytes_unused(&self) -> usize {
        self.bytes_unused
    }

    /// Copy `buf` into the cursor, advancing across segment boundaries.
    /// Copies nothing and returns 0 if `buf` does not fit in the remaining
    /// space.
    pub fn write_buf(&mut self, buf: &[u8]) -> usize {
        if self.bytes_unused < buf.len() {
            return 0;
        }
        // The space check above guarantees the copy loop terminates inside
        // the segment run.
        let mut rem = buf;
        while !rem.is_empty() {
            let seg = &mut self.segs[self.seg_idx];
            let to_cpy = rem.len().min(seg.len() - self.byte_idx);
            seg[self.byte_idx..self.byte_idx + to_cpy].copy_from_slice(&rem[..to_cpy]);
            if self.byte_idx + to_cpy == seg.len() {
                self.seg_idx += 1;
                self.byte_idx = 0;
            } else {
                self.byte_idx += to_cpy;
            }
            rem = &rem[to_cpy..];
        }
        self.bytes_unused -= buf.len();
        buf.len()
    }

    /// Append one directory entry. Returns the padded entry size, or 0
    /// without side effects when the entry does not fit.
    pub fn add_direntry(&mut self, name: &OsStr, ino: u64, off: u64, mode: u32) -> usize {
        let namelen = name.as_bytes().len();
        let entlen = abi::FUSE_NAME_OFFSET + namelen;
        let entlen_padded = abi::fuse_dirent_align(entlen);
        if self.bytes_unused < entlen_padded {
            return 0;
        }

        let dirent = abi::fuse_dirent {
            ino,
            off,
            namelen: namelen as u32,
            typ: (mode & libc::S_IFMT) >> 12,
        };
        let mut buf = EntryBuf::new();
        buf.extend_from_slice(dirent.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.resize(entlen_padded, 0);
        self.write_buf(&buf)
    }

    /// Append one READDIRPLUS entry: a `fuse_entry_out` followed by the
    /// dirent. Returns 0 without side effects when it does not fit.
    pub fn add_direntry_plus(&mut self, name: &OsStr, e: &EntryParam, off: u64) -> usize {
        let namelen = name.as_bytes().len();
        let entlen = abi::FUSE_NAME_OFFSET_DIRENTPLUS + namelen;
        let entlen_padded = abi::fuse_dirent_align(entlen);
        if self.bytes_unused < entlen_padded {
            return 0;
        }

        let dp = abi::fuse_direntplus {
            entry_out: fill_entry(e),
            dirent: abi::fuse_dirent {
                ino: e.attr.ino,
                off,
                namelen: namelen as u32,
                typ: (e.attr.mode & libc::S_IFMT) >> 12,
            },
        };
        let mut buf = EntryBuf::new();
        buf.extend_from_slice(dp.as_bytes());
        buf.extend_from_slice(name.as_bytes());
        buf.resize(entlen_padded, 0);
        self.write_buf(&buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use zerocopy::FromBytes;

    fn segs(lens: &[usize]) -> Vec<Vec<u8>> {
        lens.iter().map(|&l| vec![0u8; l]).collect()
    }

    #[test]
    fn write_spans_segments() {
        let mut bufs = segs(&[4, 4, 4]);
        let mut cur = IovCursor::new(&mut bufs);
        assert_eq!(cur.write_buf(&[1; 6]), 6);
        assert_eq!(cur.write_buf(&[2; 6]), 6);
        assert_eq!(cur.bytes_unused(), 0);
        assert_eq!(bufs[0], [1, 1, 1, 1]);
        assert_eq!(bufs[1], [1, 1, 2, 2]);
        assert_eq!(bufs[2], [2, 2, 2, 2]);
    }

    #[test]
    fn write_too_large_is_a_noop() {
        let mut bufs = segs(&[4]);
        let mut cur = IovCursor::new(&mut bufs);
        assert_eq!(cur.write_buf(&[7; 5]), 0);
        assert_eq!(cur.bytes_unused(), 4);
        assert_eq!(bufs[0], [0; 4]);
    }

    #[test]
    fn direntry_roundtrip() {
        let mut bufs = segs(&[256]);
        let mut cur = IovCursor::new(&mut bufs);
        let written = cur.add_direntry(OsStr::new("hello"), 42, 7, libc::S_IFREG | 0o644);
        assert_eq!(written, abi::fuse_dirent_align(abi::FUSE_NAME_OFFSET + 5));

        let (dirent, rest) = abi::fuse_dirent::read_from_prefix(&bufs[0]).unwrap();
        assert_eq!(dirent.ino, 42);
        assert_eq!(dirent.off, 7);
        assert_eq!(dirent.namelen, 5);
        assert_eq!(dirent.typ, libc::S_IFREG >> 12);
        assert_eq!(&rest[..5], b"hello");
        // zero padding up to the aligned length
        assert!(rest[5..written - abi::FUSE_NAME_OFFSET].iter().all(|&b| b == 0));
    }

    #[test]
    fn direntry_returns_zero_when_full() {
        let mut bufs = segs(&[abi::FUSE_NAME_OFFSET + 2]);
        let mut cur = IovCursor::new(&mut bufs);
        assert_eq!(cur.add_direntry(OsStr::new("longername"), 1, 1, libc::S_IFDIR), 0);
        assert_eq!(cur.bytes_written(), 0);
    }

    #[test]
    fn direntry_plus_layout() {
        let mut bufs = segs(&[512]);
        let mut cur = IovCursor::new(&mut bufs);
        let mut e = EntryParam::default();
        e.ino = 9;
        e.attr.ino = 9;
        e.attr.mode = libc::S_IFDIR | 0o755;
        let written = cur.add_direntry_plus(OsStr::new("d"), &e, 3);
        assert_eq!(
            written,
            abi::fuse_dirent_align(abi::FUSE_NAME_OFFSET_DIRENTPLUS + 1)
        );
        let (dp, rest) = abi::fuse_direntplus::read_from_prefix(&bufs[0]).unwrap();
        assert_eq!(dp.entry_out.nodeid, 9);
        assert_eq!(dp.dirent.ino, 9);
        assert_eq!(dp.dirent.typ, libc::S_IFDIR >> 12);
        assert_eq!(&rest[..1], b"d");
    }
}
