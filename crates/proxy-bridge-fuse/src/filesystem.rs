//! The passthrough filesystem: one handler per FUSE operation, each
//! translated into system calls against the backing tree.
//!
//! Every handler adopts the caller's filesystem credentials for its
//! duration, resolves protocol inode identifiers through the inode table,
//! and replies exactly once.

use std::ffi::{c_int, OsStr};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
    TimeOrNow,
};
use tracing::{debug, info, warn};

use crate::attr;
use crate::creds::FsCredGuard;
use crate::dirstream::{DirEntry, DirHandle, DirStream};
use crate::error::BridgeError;
use crate::fdpath;
use crate::inode::InodeTable;
use crate::sys;

/// Entry and attribute cache lifetime handed to the kernel on lookups.
const TTL: Duration = Duration::from_secs(1);

/// getattr replies are not cached; the backing tree may change underneath.
const ATTR_TTL: Duration = Duration::ZERO;

type OpResult<T> = Result<T, BridgeError>;

/// A looked-up child for the readdirplus path.
struct PlusEntry {
    ino: u64,
    attr: FileAttr,
}

/// Re-exports a backing directory tree, impersonating each caller.
///
/// The backing root is pinned with a path-only descriptor at construction;
/// every further object the kernel learns about gets its own record in the
/// [`InodeTable`]. Open files and directory iterators live in handle tables
/// keyed by allocated ids.
pub struct PassthroughFs {
    inodes: InodeTable,
    files: DashMap<u64, Arc<OwnedFd>>,
    dirs: DashMap<u64, Arc<Mutex<DirHandle>>>,
    next_fh: AtomicU64,
}

impl PassthroughFs {
    /// Open `backing` as the bridge root. Fails when the directory cannot
    /// be pinned, which is fatal at startup.
    pub fn new(backing: &Path) -> io::Result<Self> {
        let root_fd = sys::open(backing, libc::O_PATH)?;
        let root_stat = sys::stat_fd(root_fd.as_raw_fd())?;
        Ok(PassthroughFs {
            inodes: InodeTable::new(root_fd, &root_stat),
            files: DashMap::new(),
            dirs: DashMap::new(),
            next_fh: AtomicU64::new(1),
        })
    }

    fn inode(&self, ino: u64) -> OpResult<Arc<crate::inode::InodeRecord>> {
        self.inodes.get(ino).ok_or(BridgeError::StaleInode)
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    fn insert_file(&self, fd: OwnedFd) -> u64 {
        let fh = self.alloc_fh();
        self.files.insert(fh, Arc::new(fd));
        fh
    }

    fn file_handle(&self, fh: u64) -> Option<Arc<OwnedFd>> {
        self.files.get(&fh).map(|entry| Arc::clone(entry.value()))
    }

    fn dir_handle(&self, fh: u64) -> Option<Arc<Mutex<DirHandle>>> {
        self.dirs.get(&fh).map(|entry| Arc::clone(entry.value()))
    }

    // ========================================================================
    // Lookup engine
    // ========================================================================

    /// Resolve `name` under `parent` without following a trailing symlink,
    /// install or reuse the inode record, and return its identifier with
    /// fresh attributes. `attr.ino` carries the token, not the backing
    /// inode number.
    fn do_lookup(&self, parent: u64, name: &OsStr) -> OpResult<(u64, FileAttr)> {
        let dir = self.inode(parent)?;
        let fd = sys::openat(dir.fd(), name, libc::O_PATH | libc::O_NOFOLLOW, 0)?;
        let st = sys::stat_fd(fd.as_raw_fd())?;
        let ino = self.inodes.register(fd, &st);
        Ok((ino, attr::file_attr_from_stat(&st, ino)))
    }

    fn do_getattr(&self, ino: u64) -> OpResult<FileAttr> {
        let record = self.inode(ino)?;
        let st = sys::stat_fd(record.fd())?;
        Ok(attr::file_attr_from_stat(&st, ino))
    }

    // ========================================================================
    // Directory iteration
    // ========================================================================

    /// Shared accumulation loop for readdir and readdirplus. `emit` returns
    /// true when the reply buffer is full; the entry that did not fit stays
    /// pending for the next call, and a plus lookup already performed for
    /// it is undone so the lookup counts stay truthful.
    ///
    /// Returns the number of entries emitted. An error surfaces only when
    /// nothing was accumulated; a partially filled buffer is a success.
    fn fill_dir(
        &self,
        dir_ino: u64,
        handle: &mut DirHandle,
        offset: i64,
        plus: bool,
        emit: &mut dyn FnMut(&DirEntry, i64, Option<&PlusEntry>) -> bool,
    ) -> OpResult<usize> {
        handle.seek_to(offset);
        let mut emitted = 0usize;

        loop {
            if handle.pending.is_none() {
                handle.pending = match handle.stream.next_entry() {
                    Ok(next) => next,
                    Err(err) if emitted == 0 => return Err(err.into()),
                    Err(_) => break,
                };
            }
            let entry = match handle.pending.take() {
                Some(entry) => entry,
                None => break,
            };
            let next_offset = handle.stream.tell();

            if entry.is_dot() {
                handle.offset = next_offset;
                continue;
            }

            if plus {
                let (child, child_attr) = match self.do_lookup(dir_ino, &entry.name) {
                    Ok(found) => found,
                    Err(err) => {
                        handle.pending = Some(entry);
                        if emitted == 0 {
                            return Err(err);
                        }
                        break;
                    }
                };
                let plus_entry = PlusEntry { ino: child, attr: child_attr };
                if emit(&entry, next_offset, Some(&plus_entry)) {
                    // The kernel will not acknowledge this entry.
                    self.inodes.forget(child, 1);
                    handle.pending = Some(entry);
                    break;
                }
            } else if emit(&entry, next_offset, None) {
                handle.pending = Some(entry);
                break;
            }

            emitted += 1;
            handle.offset = next_offset;
        }

        Ok(emitted)
    }

    fn do_opendir(&self, ino: u64) -> OpResult<u64> {
        let record = self.inode(ino)?;
        let fd = sys::openat(record.fd(), OsStr::new("."), libc::O_RDONLY, 0)?;
        let stream = DirStream::from_fd(fd)?;
        let fh = self.alloc_fh();
        self.dirs.insert(fh, Arc::new(Mutex::new(DirHandle::new(stream))));
        Ok(fh)
    }

    // ========================================================================
    // File creation and opening
    // ========================================================================

    fn do_create(&self, parent: u64, name: &OsStr, mode: u32, flags: i32) -> OpResult<(u64, FileAttr, u64)> {
        let dir = self.inode(parent)?;
        // Creation cannot follow anything, so O_NOFOLLOW has no business here.
        let flags = (flags | libc::O_CREAT) & !libc::O_NOFOLLOW;
        let fd = sys::openat(dir.fd(), name, flags, mode & 0o7777)?;
        // Enforce the exact mode past whatever the umask left behind.
        sys::fchmod(fd.as_raw_fd(), mode & 0o7777)?;
        let (ino, entry_attr) = self.do_lookup(parent, name)?;
        let fh = self.insert_file(fd);
        Ok((ino, entry_attr, fh))
    }

    fn do_open(&self, ino: u64, flags: i32) -> OpResult<u64> {
        let record = self.inode(ino)?;
        // The lookup already resolved the name without following; reopening
        // through procfs must not refuse the (magic) symlink either.
        let path = fdpath::proc_path(record.fd());
        let fd = sys::open(&path, flags & !libc::O_NOFOLLOW)?;
        Ok(self.insert_file(fd))
    }

    // ========================================================================
    // Name-space mutation
    // ========================================================================

    fn do_mkdir(&self, uid: u32, gid: u32, parent: u64, name: &OsStr, mode: u32) -> OpResult<(u64, FileAttr)> {
        let dir = self.inode(parent)?;
        sys::mkdirat(dir.fd(), name, mode)?;
        let (ino, _) = self.do_lookup(parent, name)?;

        let fixup = || -> OpResult<FileAttr> {
            let record = self.inode(ino)?;
            let path = fdpath::real_path(record.fd())?;
            sys::chown(&path, uid, gid)?;
            sys::chmod(&path, mode & 0o7777)?;
            let st = sys::stat_fd(record.fd())?;
            Ok(attr::file_attr_from_stat(&st, ino))
        };
        match fixup() {
            Ok(entry_attr) => Ok((ino, entry_attr)),
            Err(err) => {
                // The kernel never learns about the entry; take the lookup back.
                self.inodes.forget(ino, 1);
                Err(err)
            }
        }
    }

    /// Shared tail of mknod and symlink: create the object, hand ownership
    /// and the exact mode to the caller for non-symlink types, then look the
    /// entry up for the reply.
    fn do_mknod_symlink(
        &self,
        uid: u32,
        gid: u32,
        parent: u64,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        target: Option<&OsStr>,
    ) -> OpResult<(u64, FileAttr)> {
        let dir = self.inode(parent)?;
        let dirfd = dir.fd();

        match mode & libc::S_IFMT {
            libc::S_IFLNK => {
                let target = target.ok_or(BridgeError::InvalidArgument)?;
                sys::symlinkat(target, dirfd, name)?;
            }
            libc::S_IFREG => {
                let fd = sys::openat(
                    dirfd,
                    name,
                    libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY,
                    mode & 0o7777,
                )?;
                sys::fchown(fd.as_raw_fd(), uid, gid)?;
                sys::fchmod(fd.as_raw_fd(), mode & 0o7777)?;
            }
            _ => {
                sys::mknodat(dirfd, name, mode, u64::from(rdev))?;
                sys::fchownat(dirfd, name, uid, gid, libc::AT_SYMLINK_NOFOLLOW)?;
                sys::fchmodat(dirfd, name, mode & 0o7777)?;
            }
        }

        self.do_lookup(parent, name)
    }

    fn do_link(&self, ino: u64, newparent: u64, newname: &OsStr) -> OpResult<(u64, FileAttr)> {
        let record = self.inode(ino)?;
        let dir = self.inode(newparent)?;

        if record.is_symlink() {
            // Linking the symlink object itself needs CAP_DAC_READ_SEARCH;
            // the usual refusals mean "can't hard-link a symlink".
            sys::linkat_empty(record.fd(), dir.fd(), newname).map_err(|err| {
                match err.raw_os_error() {
                    Some(libc::ENOENT) | Some(libc::EINVAL) => BridgeError::NotPermitted,
                    _ => BridgeError::from(err),
                }
            })?;
        } else {
            sys::linkat_follow(&fdpath::proc_path(record.fd()), dir.fd(), newname)?;
        }

        self.do_lookup(newparent, newname)
    }

    fn do_rename(
        &self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> OpResult<()> {
        if flags != 0 {
            return Err(BridgeError::InvalidArgument);
        }
        let old_dir = self.inode(parent)?;
        let new_dir = self.inode(newparent)?;
        sys::renameat(old_dir.fd(), name, new_dir.fd(), newname)?;
        Ok(())
    }

    fn do_unlink(&self, parent: u64, name: &OsStr, flags: libc::c_int) -> OpResult<()> {
        let dir = self.inode(parent)?;
        sys::unlinkat(dir.fd(), name, flags)?;
        Ok(())
    }

    // ========================================================================
    // Attributes
    // ========================================================================

    fn do_setattr(
        &self,
        ino: u64,
        mode: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> OpResult<FileAttr> {
        let record = self.inode(ino)?;
        let file = fh.and_then(|fh| self.file_handle(fh));
        let file_fd = file.as_ref().map(|fd| fd.as_raw_fd());

        if let Some(mode) = mode {
            match file_fd {
                Some(fd) => sys::fchmod(fd, mode)?,
                None => sys::chmod(&fdpath::proc_path(record.fd()), mode)?,
            }
        }

        if let Some(size) = size {
            match file_fd {
                Some(fd) => sys::ftruncate(fd, size as i64)?,
                None => sys::truncate(&fdpath::proc_path(record.fd()), size as i64)?,
            }
        }

        if atime.is_some() || mtime.is_some() {
            let times = [timespec_from(atime), timespec_from(mtime)];
            match file_fd {
                Some(fd) => sys::futimens(fd, &times)?,
                None if record.is_symlink() => {
                    // The kernel refuses the empty-path/no-follow combination
                    // for symlinks with EINVAL; to the client that is EPERM.
                    sys::utimensat_fd_nofollow(record.fd(), &times).map_err(|err| {
                        if err.raw_os_error() == Some(libc::EINVAL) {
                            BridgeError::NotPermitted
                        } else {
                            BridgeError::from(err)
                        }
                    })?;
                }
                None => sys::utimensat_path(&fdpath::proc_path(record.fd()), &times)?,
            }
        }

        self.do_getattr(ino)
    }

    fn do_readlink(&self, ino: u64) -> OpResult<Vec<u8>> {
        let record = self.inode(ino)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize + 1];
        let n = sys::readlink_fd(record.fd(), &mut buf)?;
        if n == buf.len() {
            return Err(BridgeError::NameTooLong);
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn do_removexattr(&self, ino: u64, name: &OsStr) -> OpResult<()> {
        let record = self.inode(ino)?;
        if record.is_symlink() {
            return Err(BridgeError::NotPermitted);
        }
        sys::removexattr(&fdpath::proc_path(record.fd()), name)?;
        Ok(())
    }
}

/// One slot of the utimensat pair: omitted, "now", or an absolute time.
fn timespec_from(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT },
        Some(TimeOrNow::Now) => libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_NOW },
        Some(TimeOrNow::SpecificTime(t)) => match t.duration_since(SystemTime::UNIX_EPOCH) {
            Ok(d) => libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(d.subsec_nanos()),
            },
            // Pre-epoch times round down to the whole second.
            Err(e) => libc::timespec {
                tv_sec: -(e.duration().as_secs() as libc::time_t),
                tv_nsec: 0,
            },
        },
    }
}

/// Read up to `size` bytes at `offset`, tolerating short reads and EINTR.
fn read_at(fd: RawFd, size: usize, offset: i64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0usize;
    while filled < size {
        match sys::pread(fd, &mut buf[filled..], offset + filled as i64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) if filled > 0 => break,
            Err(err) => return Err(err),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Write all of `data` at `offset`; a failure after a partial transfer
/// reports the bytes that made it.
fn write_at(fd: RawFd, data: &[u8], offset: i64) -> io::Result<usize> {
    let mut written = 0usize;
    while written < data.len() {
        match sys::pwrite(fd, &data[written..], offset + written as i64) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) if written > 0 => break,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

impl Filesystem for PassthroughFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        info!("passthrough bridge initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        info!(
            inodes = self.inodes.len(),
            open_files = self.files.len(),
            open_dirs = self.dirs.len(),
            "passthrough bridge shutting down"
        );
        self.dirs.clear();
        self.files.clear();
        self.inodes.clear();
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, "lookup");

        match self.do_lookup(parent, name) {
            Ok((ino, entry_attr)) => {
                debug!(parent, ?name, ino, "lookup resolved");
                reply.entry(&TTL, &entry_attr, 0);
            }
            Err(err) => {
                debug!(parent, ?name, error = %err, "lookup failed");
                reply.error(err.errno());
            }
        }
    }

    fn forget(&mut self, req: &Request<'_>, ino: u64, nlookup: u64) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, "getattr");

        match self.do_getattr(ino) {
            Ok(file_attr) => reply.attr(&ATTR_TTL, &file_attr),
            Err(err) => {
                debug!(ino, error = %err, "getattr failed");
                reply.error(err.errno());
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, ?mode, ?size, "setattr");

        match self.do_setattr(ino, mode, size, atime, mtime, fh) {
            Ok(file_attr) => reply.attr(&ATTR_TTL, &file_attr),
            Err(err) => {
                debug!(ino, error = %err, "setattr failed");
                reply.error(err.errno());
            }
        }
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, "readlink");

        match self.do_readlink(ino) {
            Ok(target) => reply.data(&target),
            Err(err) => {
                debug!(ino, error = %err, "readlink failed");
                reply.error(err.errno());
            }
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, mode, rdev, "mknod");

        match self.do_mknod_symlink(req.uid(), req.gid(), parent, name, mode, rdev, None) {
            Ok((_, entry_attr)) => reply.entry(&TTL, &entry_attr, 0),
            Err(err) => {
                debug!(parent, ?name, error = %err, "mknod failed");
                reply.error(err.errno());
            }
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, mode, "mkdir");

        match self.do_mkdir(req.uid(), req.gid(), parent, name, mode) {
            Ok((_, entry_attr)) => reply.entry(&TTL, &entry_attr, 0),
            Err(err) => {
                warn!(parent, ?name, error = %err, "mkdir failed");
                reply.error(err.errno());
            }
        }
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, "unlink");

        match self.do_unlink(parent, name, 0) {
            Ok(()) => reply.ok(),
            Err(err) => {
                debug!(parent, ?name, error = %err, "unlink failed");
                reply.error(err.errno());
            }
        }
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, "rmdir");

        match self.do_unlink(parent, name, libc::AT_REMOVEDIR) {
            Ok(()) => reply.ok(),
            Err(err) => {
                debug!(parent, ?name, error = %err, "rmdir failed");
                reply.error(err.errno());
            }
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?link_name, ?target, "symlink");

        let result = self.do_mknod_symlink(
            req.uid(),
            req.gid(),
            parent,
            link_name,
            libc::S_IFLNK,
            0,
            Some(target.as_os_str()),
        );
        match result {
            Ok((_, entry_attr)) => reply.entry(&TTL, &entry_attr, 0),
            Err(err) => {
                debug!(parent, ?link_name, error = %err, "symlink failed");
                reply.error(err.errno());
            }
        }
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, newparent, ?newname, flags, "rename");

        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(err) => {
                debug!(parent, ?name, error = %err, "rename failed");
                reply.error(err.errno());
            }
        }
    }

    fn link(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, newparent, ?newname, "link");

        match self.do_link(ino, newparent, newname) {
            Ok((_, entry_attr)) => reply.entry(&TTL, &entry_attr, 0),
            Err(err) => {
                debug!(ino, ?newname, error = %err, "link failed");
                reply.error(err.errno());
            }
        }
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, flags, "open");

        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => {
                debug!(ino, error = %err, "open failed");
                reply.error(err.errno());
            }
        }
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, offset, size, "read");

        let Some(file) = self.file_handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match read_at(file.as_raw_fd(), size as usize, offset) {
            Ok(data) => reply.data(&data),
            Err(err) => {
                debug!(ino, fh, error = %err, "read failed");
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, offset, size = data.len(), "write");

        let Some(file) = self.file_handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match write_at(file.as_raw_fd(), data, offset) {
            Ok(written) => reply.written(written as u32),
            Err(err) => {
                debug!(ino, fh, error = %err, "write failed");
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, "release");
        self.files.remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, req: &Request<'_>, ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, datasync, "fsync");

        let Some(file) = self.file_handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let result = if datasync {
            sys::fdatasync(file.as_raw_fd())
        } else {
            sys::fsync(file.as_raw_fd())
        };
        match result {
            Ok(()) => reply.ok(),
            Err(err) => {
                debug!(ino, fh, error = %err, "fsync failed");
                reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            }
        }
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, "opendir");

        match self.do_opendir(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => {
                debug!(ino, error = %err, "opendir failed");
                reply.error(err.errno());
            }
        }
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, offset, "readdir");

        let Some(handle) = self.dir_handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = self.fill_dir(ino, &mut handle, offset, false, &mut |entry, next_offset, _| {
            reply.add(
                entry.ino,
                next_offset,
                attr::file_type_from_dtype(entry.d_type),
                &entry.name,
            )
        });
        match result {
            Ok(_) => reply.ok(),
            Err(err) => {
                debug!(ino, fh, error = %err, "readdir failed");
                reply.error(err.errno());
            }
        }
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, offset, "readdirplus");

        let Some(handle) = self.dir_handle(fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut handle = handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let result = self.fill_dir(ino, &mut handle, offset, true, &mut |entry, next_offset, plus| {
            let Some(plus) = plus else { return false };
            reply.add(plus.ino, next_offset, &entry.name, &TTL, &plus.attr, 0)
        });
        match result {
            Ok(_) => reply.ok(),
            Err(err) => {
                debug!(ino, fh, error = %err, "readdirplus failed");
                reply.error(err.errno());
            }
        }
    }

    fn releasedir(&mut self, req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, fh, "releasedir");
        self.dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, "statfs");

        let result = self
            .inode(ino)
            .and_then(|record| sys::fstatvfs(record.fd()).map_err(BridgeError::from));
        match result {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(err) => {
                debug!(ino, error = %err, "statfs failed");
                reply.error(err.errno());
            }
        }
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, ?name, "removexattr");

        match self.do_removexattr(ino, name) {
            Ok(()) => reply.ok(),
            Err(err) => {
                debug!(ino, ?name, error = %err, "removexattr failed");
                reply.error(err.errno());
            }
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), parent, ?name, mode, flags, "create");

        match self.do_create(parent, name, mode, flags) {
            Ok((_, entry_attr, fh)) => reply.created(&TTL, &entry_attr, 0, fh, 0),
            Err(err) => {
                debug!(parent, ?name, error = %err, "create failed");
                reply.error(err.errno());
            }
        }
    }

    fn fallocate(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        let _creds = FsCredGuard::adopt(req.uid(), req.gid());
        debug!(uid = req.uid(), gid = req.gid(), pid = req.pid(), ino, "fallocate declined");
        reply.error(BridgeError::NotSupported.errno());
    }
}
