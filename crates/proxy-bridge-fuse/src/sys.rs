//! Thin safe wrappers over the backing-tree syscalls.
//!
//! Every wrapper converts the C return convention into `io::Result` at the
//! call site, so no errno state survives past the function boundary. Names
//! are borrowed fd-relative whenever the kernel offers an `*at` form.

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

fn cstr(name: &OsStr) -> io::Result<CString> {
    // Interior NULs cannot name anything in the backing tree.
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn cvt_fd(ret: libc::c_int) -> io::Result<OwnedFd> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(ret) })
    }
}

/// An empty C string, for the `AT_EMPTY_PATH` family.
const EMPTY: &[u8] = b"\0";

pub fn open(path: &Path, flags: libc::c_int) -> io::Result<OwnedFd> {
    let path = cstr(path.as_os_str())?;
    cvt_fd(unsafe { libc::open(path.as_ptr(), flags) })
}

pub fn openat(dirfd: RawFd, name: &OsStr, flags: libc::c_int, mode: u32) -> io::Result<OwnedFd> {
    let name = cstr(name)?;
    cvt_fd(unsafe { libc::openat(dirfd, name.as_ptr(), flags, mode as libc::c_uint) })
}

/// Stat the object behind `fd` itself, never a name: empty path, no follow.
pub fn stat_fd(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    cvt(unsafe {
        libc::fstatat(
            fd,
            EMPTY.as_ptr().cast(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(unsafe { st.assume_init() })
}

/// Read the symlink behind `fd` into `buf`; returns the byte count.
pub fn readlink_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let res = unsafe { libc::readlinkat(fd, EMPTY.as_ptr().cast(), buf.as_mut_ptr().cast(), buf.len()) };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn mkdirat(dirfd: RawFd, name: &OsStr, mode: u32) -> io::Result<()> {
    let name = cstr(name)?;
    cvt(unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode as libc::mode_t) })
}

pub fn mknodat(dirfd: RawFd, name: &OsStr, mode: u32, rdev: u64) -> io::Result<()> {
    let name = cstr(name)?;
    cvt(unsafe { libc::mknodat(dirfd, name.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
}

pub fn symlinkat(target: &OsStr, dirfd: RawFd, name: &OsStr) -> io::Result<()> {
    let target = cstr(target)?;
    let name = cstr(name)?;
    cvt(unsafe { libc::symlinkat(target.as_ptr(), dirfd, name.as_ptr()) })
}

/// Hard-link the object behind `fd` by descriptor identity (empty path).
/// Needs `CAP_DAC_READ_SEARCH`; the caller maps the usual refusals.
pub fn linkat_empty(fd: RawFd, newdirfd: RawFd, newname: &OsStr) -> io::Result<()> {
    let newname = cstr(newname)?;
    cvt(unsafe { libc::linkat(fd, EMPTY.as_ptr().cast(), newdirfd, newname.as_ptr(), libc::AT_EMPTY_PATH) })
}

/// Hard-link through a path, following the terminal symlink (used with the
/// procfs magic path, which is itself a symlink to the real object).
pub fn linkat_follow(oldpath: &Path, newdirfd: RawFd, newname: &OsStr) -> io::Result<()> {
    let oldpath = cstr(oldpath.as_os_str())?;
    let newname = cstr(newname)?;
    cvt(unsafe {
        libc::linkat(
            libc::AT_FDCWD,
            oldpath.as_ptr(),
            newdirfd,
            newname.as_ptr(),
            libc::AT_SYMLINK_FOLLOW,
        )
    })
}

pub fn renameat(olddirfd: RawFd, oldname: &OsStr, newdirfd: RawFd, newname: &OsStr) -> io::Result<()> {
    let oldname = cstr(oldname)?;
    let newname = cstr(newname)?;
    cvt(unsafe { libc::renameat(olddirfd, oldname.as_ptr(), newdirfd, newname.as_ptr()) })
}

pub fn unlinkat(dirfd: RawFd, name: &OsStr, flags: libc::c_int) -> io::Result<()> {
    let name = cstr(name)?;
    cvt(unsafe { libc::unlinkat(dirfd, name.as_ptr(), flags) })
}

pub fn fchmod(fd: RawFd, mode: u32) -> io::Result<()> {
    cvt(unsafe { libc::fchmod(fd, mode as libc::mode_t) })
}

pub fn fchown(fd: RawFd, uid: u32, gid: u32) -> io::Result<()> {
    cvt(unsafe { libc::fchown(fd, uid, gid) })
}

pub fn fchmodat(dirfd: RawFd, name: &OsStr, mode: u32) -> io::Result<()> {
    let name = cstr(name)?;
    cvt(unsafe { libc::fchmodat(dirfd, name.as_ptr(), mode as libc::mode_t, 0) })
}

pub fn fchownat(dirfd: RawFd, name: &OsStr, uid: u32, gid: u32, flags: libc::c_int) -> io::Result<()> {
    let name = cstr(name)?;
    cvt(unsafe { libc::fchownat(dirfd, name.as_ptr(), uid, gid, flags) })
}

pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    let path = cstr(path.as_os_str())?;
    cvt(unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) })
}

pub fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    let path = cstr(path.as_os_str())?;
    cvt(unsafe { libc::chown(path.as_ptr(), uid, gid) })
}

pub fn truncate(path: &Path, size: i64) -> io::Result<()> {
    let path = cstr(path.as_os_str())?;
    cvt(unsafe { libc::truncate(path.as_ptr(), size as libc::off_t) })
}

pub fn ftruncate(fd: RawFd, size: i64) -> io::Result<()> {
    cvt(unsafe { libc::ftruncate(fd, size as libc::off_t) })
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    cvt(unsafe { libc::futimens(fd, times.as_ptr()) })
}

/// Set times on the object behind `fd` itself: empty path, no follow.
/// The kernel refuses this combination for symlinks with `EINVAL`.
pub fn utimensat_fd_nofollow(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    cvt(unsafe {
        libc::utimensat(
            fd,
            EMPTY.as_ptr().cast(),
            times.as_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn utimensat_path(path: &Path, times: &[libc::timespec; 2]) -> io::Result<()> {
    let path = cstr(path.as_os_str())?;
    cvt(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) })
}

pub fn fsync(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::fsync(fd) })
}

pub fn fdatasync(fd: RawFd) -> io::Result<()> {
    cvt(unsafe { libc::fdatasync(fd) })
}

pub fn fstatvfs(fd: RawFd) -> io::Result<libc::statvfs> {
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    cvt(unsafe { libc::fstatvfs(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn removexattr(path: &Path, name: &OsStr) -> io::Result<()> {
    let path = cstr(path.as_os_str())?;
    let name = cstr(name)?;
    cvt(unsafe { libc::removexattr(path.as_ptr(), name.as_ptr()) })
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> io::Result<usize> {
    let res = unsafe {
        libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset as libc::off_t)
    };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> io::Result<usize> {
    let res = unsafe {
        libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset as libc::off_t)
    };
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn openat_and_stat_fd_resolve_without_following() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("plain"), b"12345").expect("write");
        std::os::unix::fs::symlink("plain", dir.path().join("alias")).expect("symlink");

        let dirfd = open(dir.path(), libc::O_PATH).expect("open root");

        let plain = openat(
            dirfd.as_raw_fd(),
            OsStr::new("plain"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat plain");
        let st = stat_fd(plain.as_raw_fd()).expect("stat plain");
        assert_eq!(st.st_size, 5);
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFREG);

        // O_NOFOLLOW must hand back the link object, not its target.
        let alias = openat(
            dirfd.as_raw_fd(),
            OsStr::new("alias"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat alias");
        let st = stat_fd(alias.as_raw_fd()).expect("stat alias");
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFLNK);
    }

    #[test]
    fn readlink_fd_reads_the_link_object() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink("target-name", dir.path().join("link")).expect("symlink");

        let dirfd = open(dir.path(), libc::O_PATH).expect("open root");
        let link = openat(
            dirfd.as_raw_fd(),
            OsStr::new("link"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat link");

        let mut buf = [0u8; 64];
        let n = readlink_fd(link.as_raw_fd(), &mut buf).expect("readlink");
        assert_eq!(&buf[..n], b"target-name");
    }

    #[test]
    fn interior_nul_names_are_rejected_with_einval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirfd = open(dir.path(), libc::O_PATH).expect("open root");

        let bogus = OsStr::from_bytes(b"a\0b");
        let err = openat(dirfd.as_raw_fd(), bogus, libc::O_PATH, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
    }

    #[test]
    fn pread_pwrite_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dirfd = open(dir.path(), libc::O_PATH).expect("open root");
        let file = openat(
            dirfd.as_raw_fd(),
            OsStr::new("data"),
            libc::O_CREAT | libc::O_RDWR,
            0o644,
        )
        .expect("create");

        assert_eq!(pwrite(file.as_raw_fd(), b"abcdef", 2).expect("pwrite"), 6);
        let mut buf = [0u8; 4];
        assert_eq!(pread(file.as_raw_fd(), &mut buf, 4).expect("pread"), 4);
        assert_eq!(&buf, b"cdef");
    }

    #[test]
    fn utimensat_fd_nofollow_on_a_symlink_never_reports_a_surprise() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::os::unix::fs::symlink("x", dir.path().join("link")).expect("symlink");

        let dirfd = open(dir.path(), libc::O_PATH).expect("open root");
        let link = openat(
            dirfd.as_raw_fd(),
            OsStr::new("link"),
            libc::O_PATH | libc::O_NOFOLLOW,
            0,
        )
        .expect("openat link");

        let omit = libc::timespec { tv_sec: 0, tv_nsec: libc::UTIME_OMIT };
        // Kernels without AT_EMPTY_PATH support here report EINVAL; newer
        // ones may accept the call. Nothing else is acceptable.
        match utimensat_fd_nofollow(link.as_raw_fd(), &[omit, omit]) {
            Ok(()) => {}
            Err(err) => assert_eq!(err.raw_os_error(), Some(libc::EINVAL)),
        }
    }
}
