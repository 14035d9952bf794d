//! Inode table.
//!
//! A bucketed map from 64-bit fileid to a backend-defined inode record. The
//! table-level mutex serializes structural changes; attribute mutation goes
//! through whatever lock the record itself carries. Buckets are selected by
//! `fileid % size` with a fixed size (8192 by default).
//!
//! Fileid 1 is reserved for the filesystem root. Records are handed out as
//! `Arc` clones; a record dropped from the table stays alive for whoever
//! still holds a handle, which is exactly the lifetime a suspended request
//! needs.

use std::sync::Arc;

use parking_lot::Mutex;

pub const INODE_TABLE_SIZE: usize = 8192;

/// A record stored in an [`InodeTable`].
pub trait TableEntry {
    fn fileid(&self) -> u64;
}

pub struct InodeTable<I> {
    buckets: Mutex<Vec<Vec<Arc<I>>>>,
    size: usize,
}

impl<I: TableEntry> InodeTable<I> {
    pub fn new() -> InodeTable<I> {
        Self::with_size(INODE_TABLE_SIZE)
    }

    pub fn with_size(size: usize) -> InodeTable<I> {
        assert!(size > 0);
        InodeTable {
            buckets: Mutex::new(vec![Vec::new(); size]),
            size,
        }
    }

    fn hash(&self, fileid: u64) -> usize {
        (fileid % self.size as u64) as usize
    }

    pub fn get(&self, fileid: u64) -> Option<Arc<I>> {
        let buckets = self.buckets.lock();
        buckets[self.hash(fileid)]
            .iter()
            .find(|i| i.fileid() == fileid)
            .cloned()
    }

    pub fn insert(&self, inode: Arc<I>) {
        let hash = self.hash(inode.fileid());
        self.buckets.lock()[hash].push(inode);
    }

    /// Look up `fileid`, inserting a fresh record built by `make` when the
    /// table has none. The build happens under the table lock so two racing
    /// lookups of an unseen fileid agree on one record.
    pub fn get_or_insert_with<F: FnOnce() -> I>(&self, fileid: u64, make: F) -> Arc<I> {
        let hash = self.hash(fileid);
        let mut buckets = self.buckets.lock();
        if let Some(i) = buckets[hash].iter().find(|i| i.fileid() == fileid) {
            return i.clone();
        }
        let inode = Arc::new(make());
        buckets[hash].push(inode.clone());
        inode
    }

    /// Unlink `fileid` from the table, returning the record.
    pub fn remove(&self, fileid: u64) -> Option<Arc<I>> {
        let hash = self.hash(fileid);
        let mut buckets = self.buckets.lock();
        let pos = buckets[hash].iter().position(|i| i.fileid() == fileid)?;
        Some(buckets[hash].swap_remove(pos))
    }

    /// Drop `fileid` from the table. Returns whether a record was present.
    pub fn erase(&self, fileid: u64) -> bool {
        self.remove(fileid).is_some()
    }

    /// Drain every record, invoking `f` on each. Used at DESTROY to report
    /// inodes the host never released.
    pub fn clear_with<F: FnMut(&I)>(&self, mut f: F) {
        let mut buckets = self.buckets.lock();
        for bucket in buckets.iter_mut() {
            for inode in bucket.drain(..) {
                f(&inode);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.lock().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<I: TableEntry> Default for InodeTable<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: TableEntry> std::fmt::Debug for InodeTable<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("size", &self.size)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct TestInode {
        fileid: u64,
        nlookup: AtomicU64,
    }

    impl TableEntry for TestInode {
        fn fileid(&self) -> u64 {
            self.fileid
        }
    }

    fn inode(fileid: u64) -> TestInode {
        TestInode {
            fileid,
            nlookup: AtomicU64::new(0),
        }
    }

    #[test]
    fn get_or_insert_returns_one_record() {
        let t: InodeTable<TestInode> = InodeTable::with_size(16);
        let a = t.get_or_insert_with(7, || inode(7));
        let b = t.get_or_insert_with(7, || inode(7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn colliding_fileids_live_in_one_bucket() {
        // size 16: 3, 19 and 35 all hash to bucket 3
        let t: InodeTable<TestInode> = InodeTable::with_size(16);
        for id in [3, 19, 35] {
            t.get_or_insert_with(id, || inode(id));
        }
        assert_eq!(t.len(), 3);
        for id in [3, 19, 35] {
            assert_eq!(t.get(id).unwrap().fileid(), id);
        }
        assert!(t.erase(19));
        assert!(t.get(19).is_none());
        assert_eq!(t.get(35).unwrap().fileid(), 35);
    }

    #[test]
    fn removed_records_stay_alive_for_holders() {
        let t: InodeTable<TestInode> = InodeTable::with_size(16);
        let held = t.get_or_insert_with(9, || inode(9));
        held.nlookup.store(1, Ordering::Relaxed);
        assert!(t.erase(9));
        assert!(t.get(9).is_none());
        assert_eq!(held.nlookup.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn erase_missing_is_false() {
        let t: InodeTable<TestInode> = InodeTable::with_size(16);
        assert!(!t.erase(1234));
    }

    #[test]
    fn clear_reports_leftovers() {
        let t: InodeTable<TestInode> = InodeTable::with_size(16);
        t.get_or_insert_with(1, || inode(1));
        t.get_or_insert_with(2, || inode(2));
        let mut seen = 0;
        t.clear_with(|_| seen += 1);
        assert_eq!(seen, 2);
        assert!(t.is_empty());
    }
}
