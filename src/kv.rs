//! In-memory key-value backend.
//!
//! A flat namespace: every key is one regular file directly under the root
//! directory, with its value as the file content. This is the illustrative
//! backend against an in-memory store; it completes everything
//! synchronously and keeps the full inode-lifetime bookkeeping so the
//! dispatch layer can be exercised end-to-end without hardware, a remote
//! server or io_uring.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;

use crate::dispatch::FuseOps;
use crate::hal::{FuseRequest, HandlerOutcome};
use crate::inode::{InodeTable, TableEntry};
use crate::ll::fuse_abi::{self as abi, FUSE_ROOT_ID};
use crate::ll::iov::IovCursor;
use crate::ll::reply::EntryParam;
use crate::session::{ConnInfo, Session};

const KV_BLKSIZE: u32 = 4096;

#[derive(Debug)]
struct KvInode {
    fileid: u64,
    name: OsString,
    nlookup: AtomicU64,
}

impl TableEntry for KvInode {
    fn fileid(&self) -> u64 {
        self.fileid
    }
}

#[derive(Debug, Default)]
struct KvStore {
    /// key -> fileid, ordered so readdir offsets are stable
    names: BTreeMap<OsString, u64>,
    /// fileid -> value
    values: std::collections::HashMap<u64, Vec<u8>>,
}

#[derive(Debug)]
pub struct KvFs {
    store: Mutex<KvStore>,
    inodes: InodeTable<KvInode>,
    next_fileid: AtomicU64,
}

impl KvFs {
    pub fn new() -> Arc<KvFs> {
        Arc::new(KvFs {
            store: Mutex::new(KvStore::default()),
            inodes: InodeTable::new(),
            // fileid 1 is the root
            next_fileid: AtomicU64::new(FUSE_ROOT_ID + 1),
        })
    }

    fn root_attr(&self, hdr: &abi::fuse_in_header) -> abi::fuse_attr {
        abi::fuse_attr {
            ino: FUSE_ROOT_ID,
            mode: libc::S_IFDIR | 0o755,
            nlink: 2,
            uid: hdr.uid,
            gid: hdr.gid,
            blksize: KV_BLKSIZE,
            ..Default::default()
        }
    }

    fn value_attr(&self, fileid: u64, len: usize, hdr: &abi::fuse_in_header) -> abi::fuse_attr {
        abi::fuse_attr {
            ino: fileid,
            size: len as u64,
            blocks: (len as u64).div_ceil(512),
            mode: libc::S_IFREG | 0o644,
            nlink: 1,
            uid: hdr.uid,
            gid: hdr.gid,
            blksize: KV_BLKSIZE,
            ..Default::default()
        }
    }

    /// Reference the inode of an existing key, creating the table record on
    /// first sight.
    fn lookup_key(&self, name: &OsStr, hdr: &abi::fuse_in_header) -> Option<EntryParam> {
        let store = self.store.lock();
        let fileid = *store.names.get(name)?;
        let len = store.values.get(&fileid).map_or(0, Vec::len);
        let inode = self.inodes.get_or_insert_with(fileid, || KvInode {
            fileid,
            name: name.to_owned(),
            nlookup: AtomicU64::new(0),
        });
        inode.nlookup.fetch_add(1, Ordering::AcqRel);
        Some(EntryParam {
            ino: fileid,
            generation: 0,
            attr: self.value_attr(fileid, len, hdr),
            attr_timeout: Duration::ZERO,
            entry_timeout: Duration::ZERO,
        })
    }
}

impl FuseOps for KvFs {
    fn init(
        &self,
        se: &Session,
        _conn: &mut ConnInfo,
        _hdr: &abi::fuse_in_header,
        _arg: &abi::fuse_init_in,
    ) -> Result<(), i32> {
        se.set_init_done();
        Ok(())
    }

    fn destroy(&self, _se: &Session, _hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        self.inodes.clear_with(|i| {
            debug!("destroy: host never forgot key {:?}", i.name);
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
        if hdr.nodeid != FUSE_ROOT_ID {
            return req.reply_err(libc::ENOTDIR);
        }
        match self.lookup_key(&name, hdr) {
            Some(e) => req.reply_entry(se, &e),
            None => req.reply_err(libc::ENOENT),
        }
    }

    fn forget(&self, _se: &Session, hdr: &abi::fuse_in_header, arg: abi::fuse_forget_in) {
        if hdr.nodeid == FUSE_ROOT_ID {
            return;
        }
        if let Some(inode) = self.inodes.get(hdr.nodeid) {
            let prev = inode.nlookup.fetch_sub(arg.nlookup, Ordering::AcqRel);
            if prev <= arg.nlookup {
                self.inodes.erase(hdr.nodeid);
            }
        }
    }

    fn getattr(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        _arg: abi::fuse_getattr_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if hdr.nodeid == FUSE_ROOT_ID {
            return req.reply_attr(se, &self.root_attr(hdr), Duration::ZERO);
        }
        let Some(inode) = self.inodes.get(hdr.nodeid) else {
            return req.reply_err(libc::ENOENT);
        };
        let len = self
            .store
            .lock()
            .values
            .get(&inode.fileid)
            .map_or(0, Vec::len);
        req.reply_attr(se, &self.value_attr(inode.fileid, len, hdr), Duration::ZERO)
    }

    fn open(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        _arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if self.inodes.get(hdr.nodeid).is_none() {
            return req.reply_err(libc::ENOENT);
        }
        req.reply_open(0, 0)
    }

    fn create(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        _arg: abi::fuse_create_in,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if hdr.nodeid != FUSE_ROOT_ID {
            return req.reply_err(libc::ENOTDIR);
        }
        {
            let mut store = self.store.lock();
            if !store.names.contains_key(&name) {
                let fileid = self.next_fileid.fetch_add(1, Ordering::Relaxed);
                store.names.insert(name.clone(), fileid);
                store.values.insert(fileid, Vec::new());
            }
        }
        // lookup_key increments the lookup count the kernel now holds
        let e = match self.lookup_key(&name, hdr) {
            Some(e) => e,
            None => return req.reply_err(libc::EIO),
        };
        req.reply_create(se, &e, 0, 0)
    }

    fn read(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        mut req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(inode) = self.inodes.get(hdr.nodeid) else {
            return req.reply_err(libc::ENOENT);
        };
        let store = self.store.lock();
        let Some(value) = store.values.get(&inode.fileid) else {
            return req.reply_err(libc::ENOENT);
        };
        let start = (arg.offset as usize).min(value.len());
        let end = (start + arg.size as usize).min(value.len());
        let mut cursor = IovCursor::new(req.data_segs_mut());
        let written = cursor.write_buf(&value[start..end]);
        drop(store);
        req.add_data_len(written);
        HandlerOutcome::Done(req)
    }

    fn write(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_write_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        let Some(inode) = self.inodes.get(hdr.nodeid) else {
            return req.reply_err(libc::ENOENT);
        };
        let mut store = self.store.lock();
        let Some(value) = store.values.get_mut(&inode.fileid) else {
            return req.reply_err(libc::ENOENT);
        };
        let mut off = arg.offset as usize;
        if value.len() < off + arg.size as usize {
            value.resize(off + arg.size as usize, 0);
        }
        for seg in req.write_payload() {
            value[off..off + seg.len()].copy_from_slice(seg);
            off += seg.len();
        }
        drop(store);
        req.reply_write(arg.size)
    }

    fn release(
        &self,
        _se: &Session,
        _hdr: &abi::fuse_in_header,
        _arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_ok()
    }

    fn unlink(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        name: OsString,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if hdr.nodeid != FUSE_ROOT_ID {
            return req.reply_err(libc::ENOTDIR);
        }
        let mut store = self.store.lock();
        match store.names.remove(&name) {
            Some(fileid) => {
                store.values.remove(&fileid);
                req.reply_ok()
            }
            None => req.reply_err(libc::ENOENT),
        }
    }

    fn opendir(
        &self,
        _se: &Session,
        hdr: &abi::fuse_in_header,
        _arg: abi::fuse_open_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        if hdr.nodeid != FUSE_ROOT_ID {
            return req.reply_err(libc::ENOTDIR);
        }
        req.reply_open(0, 0)
    }

    fn releasedir(
        &self,
        _se: &Session,
        _hdr: &abi::fuse_in_header,
        _arg: abi::fuse_release_in,
        req: FuseRequest,
    ) -> HandlerOutcome {
        req.reply_ok()
    }

    fn readdir(
        &self,
        se: &Session,
        hdr: &abi::fuse_in_header,
        arg: abi::fuse_read_in,
        plus: bool,
        mut req: FuseRequest,
    ) -> HandlerOutcome {
        if hdr.nodeid != FUSE_ROOT_ID {
            return req.reply_err(libc::ENOTDIR);
        }
        let entries: Vec<(OsString, u64)> = {
            let store = self.store.lock();
            store
                .names
                .iter()
                .map(|(name, &fileid)| (name.clone(), fileid))
                .collect()
        };

        let mut written = 0;
        {
            let mut cursor = IovCursor::new(req.data_segs_mut());
            for (idx, (name, fileid)) in entries.iter().enumerate().skip(arg.offset as usize) {
                let off = idx as u64 + 1;
                let n = if plus {
                    let Some(e) = self.lookup_key(name, hdr) else {
                        continue;
                    };
                    let n = cursor.add_direntry_plus(name, &e, off);
                    if n == 0 {
                        // roll back the lookup count taken for an entry that
                        // did not fit
                        let mut fhdr = *hdr;
                        fhdr.nodeid = *fileid;
                        self.forget(se, &fhdr, abi::fuse_forget_in { nlookup: 1 });
                    }
                    n
                } else {
                    cursor.add_direntry(name, *fileid, off, libc::S_IFREG | 0o644)
                };
                if n == 0 {
                    break;
                }
                written += n;
            }
        }
        req.add_data_len(written);
        HandlerOutcome::Done(req)
    }

    fn statfs(&self, se: &Session, _hdr: &abi::fuse_in_header, req: FuseRequest) -> HandlerOutcome {
        let store = self.store.lock();
        let used: u64 = store.values.values().map(|v| v.len() as u64).sum();
        let st = abi::fuse_kstatfs {
            blocks: u32::MAX as u64,
            bfree: u32::MAX as u64 - used.div_ceil(KV_BLKSIZE as u64),
            bavail: u32::MAX as u64 - used.div_ceil(KV_BLKSIZE as u64),
            files: store.names.len() as u64,
            ffree: u32::MAX as u64,
            bsize: KV_BLKSIZE,
            namelen: 255,
            frsize: KV_BLKSIZE,
            ..Default::default()
        };
        drop(store);
        req.reply_statfs(se, &st)
    }
}
