//! Inode table: protocol identifiers, backing-object dedup, lookup counts.
//!
//! Identifiers handed to the kernel are allocated tokens, never addresses.
//! One mutex guards both maps and all `nlookup` arithmetic, so a forget
//! that evicts a record can never interleave with a lookup resurrecting it.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fuser::FUSE_ROOT_ID;
use tracing::debug;

/// Backing-object identity: `(st_dev, st_ino)`. Hard links share a key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct InodeKey {
    pub dev: u64,
    pub ino: u64,
}

impl InodeKey {
    pub fn from_stat(st: &libc::stat) -> Self {
        InodeKey {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        }
    }
}

/// One known backing object.
///
/// The descriptor was opened `O_PATH | O_NOFOLLOW` and pins the object
/// across renames in the backing tree; it closes when the record drops.
pub struct InodeRecord {
    fd: OwnedFd,
    key: InodeKey,
    is_symlink: bool,
    // Mutated only while the table lock is held.
    nlookup: AtomicU64,
}

impl InodeRecord {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn is_symlink(&self) -> bool {
        self.is_symlink
    }

    pub fn key(&self) -> InodeKey {
        self.key
    }

    /// Outstanding lookups the kernel has not yet forgotten.
    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::Relaxed)
    }
}

struct TableInner {
    by_id: HashMap<u64, Arc<InodeRecord>>,
    by_key: HashMap<InodeKey, u64>,
    next_id: u64,
}

/// The process-wide inode collection.
pub struct InodeTable {
    inner: Mutex<TableInner>,
}

impl InodeTable {
    /// Build a table holding only the root sentinel. The root starts with
    /// `nlookup = 2` per protocol rules and is never evicted by forgets.
    pub fn new(root_fd: OwnedFd, root_stat: &libc::stat) -> Self {
        let key = InodeKey::from_stat(root_stat);
        let root = Arc::new(InodeRecord {
            fd: root_fd,
            key,
            is_symlink: false,
            nlookup: AtomicU64::new(2),
        });

        let mut by_id = HashMap::new();
        by_id.insert(FUSE_ROOT_ID, root);
        let mut by_key = HashMap::new();
        by_key.insert(key, FUSE_ROOT_ID);

        InodeTable {
            inner: Mutex::new(TableInner {
                by_id,
                by_key,
                next_id: FUSE_ROOT_ID + 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolve a protocol identifier to its live record.
    pub fn get(&self, ino: u64) -> Option<Arc<InodeRecord>> {
        self.lock().by_id.get(&ino).cloned()
    }

    /// Install `fd` for the object described by `st`, or fold into the
    /// existing record for the same `(dev, ino)`. Bumps the lookup count
    /// either way and returns the protocol identifier. A redundant
    /// descriptor is closed on the spot.
    pub fn register(&self, fd: OwnedFd, st: &libc::stat) -> u64 {
        let key = InodeKey::from_stat(st);
        let mut inner = self.lock();

        if let Some(&id) = inner.by_key.get(&key) {
            if let Some(record) = inner.by_id.get(&id) {
                record.nlookup.fetch_add(1, Ordering::Relaxed);
                return id;
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let record = Arc::new(InodeRecord {
            fd,
            key,
            is_symlink: (st.st_mode & libc::S_IFMT) == libc::S_IFLNK,
            nlookup: AtomicU64::new(1),
        });
        debug!(id, dev = key.dev, ino = key.ino, fd = record.fd(), "new inode record");
        inner.by_id.insert(id, record);
        inner.by_key.insert(key, id);
        id
    }

    /// Drop `n` lookups from `ino`. At zero the record leaves the table and
    /// its descriptor closes with the last reference. A count smaller than
    /// `n` is a protocol violation: fatal in debug builds, clamped
    /// otherwise. The root sentinel survives regardless.
    pub fn forget(&self, ino: u64, n: u64) {
        let mut inner = self.lock();

        let (remaining, key) = match inner.by_id.get(&ino) {
            Some(record) => {
                let current = record.nlookup.load(Ordering::Relaxed);
                debug_assert!(
                    current >= n,
                    "forget underflow on inode {ino}: {current} < {n}"
                );
                let remaining = current.saturating_sub(n);
                record.nlookup.store(remaining, Ordering::Relaxed);
                (remaining, record.key)
            }
            None => return,
        };

        if remaining == 0 && ino != FUSE_ROOT_ID {
            debug!(ino, "freeing inode record");
            inner.by_id.remove(&ino);
            inner.by_key.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_id.is_empty()
    }

    /// Drop every record, the root included. Shutdown only.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.by_key.clear();
        inner.by_id.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::os::fd::AsRawFd;
    use std::thread;

    use crate::sys;

    use super::*;

    fn table_for(dir: &std::path::Path) -> InodeTable {
        let root_fd = sys::open(dir, libc::O_PATH).expect("open root");
        let st = sys::stat_fd(root_fd.as_raw_fd()).expect("stat root");
        InodeTable::new(root_fd, &st)
    }

    fn open_path(table: &InodeTable, name: &str) -> (OwnedFd, libc::stat) {
        let root = table.get(FUSE_ROOT_ID).expect("root");
        let fd = sys::openat(
            root.fd(),
            OsStr::new(name),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat");
        let st = sys::stat_fd(fd.as_raw_fd()).expect("stat");
        (fd, st)
    }

    #[test]
    fn register_deduplicates_by_backing_identity() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = table_for(dir.path());

        let (fd1, st1) = open_path(&table, "a");
        let (fd2, st2) = open_path(&table, "a");
        let first = table.register(fd1, &st1);
        let second = table.register(fd2, &st2);

        assert_eq!(first, second);
        assert_eq!(table.get(first).expect("record").nlookup(), 2);
        assert_eq!(table.len(), 2); // root + one record
    }

    #[test]
    fn hard_links_share_one_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        std::fs::hard_link(dir.path().join("a"), dir.path().join("b")).expect("link");
        let table = table_for(dir.path());

        let (fd1, st1) = open_path(&table, "a");
        let (fd2, st2) = open_path(&table, "b");

        assert_eq!(table.register(fd1, &st1), table.register(fd2, &st2));
    }

    #[test]
    fn forget_to_zero_evicts_the_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = table_for(dir.path());

        let (fd, st) = open_path(&table, "a");
        let id = table.register(fd, &st);
        let (fd2, st2) = open_path(&table, "a");
        assert_eq!(table.register(fd2, &st2), id);

        table.forget(id, 1);
        assert!(table.get(id).is_some());

        table.forget(id, 1);
        assert!(table.get(id).is_none());
        assert_eq!(table.len(), 1); // root only
    }

    #[test]
    fn eviction_frees_the_identifier_for_reuse_of_the_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = table_for(dir.path());

        let (fd, st) = open_path(&table, "a");
        let id = table.register(fd, &st);
        table.forget(id, 1);

        // A fresh lookup gets a fresh token for the same backing object.
        let (fd, st) = open_path(&table, "a");
        let id2 = table.register(fd, &st);
        assert_ne!(id, id2);
        assert_eq!(table.get(id2).expect("record").nlookup(), 1);
    }

    #[test]
    fn root_survives_forget_to_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table_for(dir.path());

        table.forget(FUSE_ROOT_ID, 2);
        let root = table.get(FUSE_ROOT_ID).expect("root still present");
        assert_eq!(root.nlookup(), 0);
    }

    #[test]
    fn forget_of_unknown_identifier_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let table = table_for(dir.path());
        table.forget(999, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn symlink_flag_is_cached_from_the_stat_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink("a", dir.path().join("l")).expect("symlink");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = table_for(dir.path());

        let (fd, st) = open_path(&table, "l");
        let id = table.register(fd, &st);
        assert!(table.get(id).expect("record").is_symlink());

        let (fd, st) = open_path(&table, "a");
        let id = table.register(fd, &st);
        assert!(!table.get(id).expect("record").is_symlink());
    }

    #[test]
    fn concurrent_registers_of_one_object_agree_on_the_identifier() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = std::sync::Arc::new(table_for(dir.path()));

        let mut handles = vec![];
        for _ in 0..8 {
            let table = std::sync::Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let (fd, st) = open_path(&table, "a");
                table.register(fd, &st)
            }));
        }

        let ids: Vec<u64> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(table.get(ids[0]).expect("record").nlookup(), 8);

        table.forget(ids[0], 8);
        assert!(table.get(ids[0]).is_none());
    }

    #[test]
    fn clear_empties_the_table_for_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");
        let table = table_for(dir.path());

        let (fd, st) = open_path(&table, "a");
        table.register(fd, &st);
        assert_eq!(table.len(), 2);

        table.clear();
        assert!(table.is_empty());
    }
}
