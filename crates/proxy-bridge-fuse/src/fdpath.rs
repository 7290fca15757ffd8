//! Descriptor-to-path indirection via procfs.
//!
//! A "path only" descriptor pins a backing object without read or write
//! access. Formatting `/proc/self/fd/N` turns that descriptor back into
//! something path-taking syscalls accept; reading the link recovers the
//! object's current canonical name.

use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

/// The process-local magic path for `fd`. Path-taking syscalls resolve it
/// to whatever object the descriptor is currently bound to.
pub fn proc_path(fd: RawFd) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{fd}"))
}

/// The backing object's current canonical name, recovered by reading the
/// procfs symlink. Needed where a real path must be handed to a syscall
/// (e.g. `chown` after `mkdir`).
pub fn real_path(fd: RawFd) -> io::Result<PathBuf> {
    std::fs::read_link(proc_path(fd))
}
