//! Directory streams for the opendir/readdir/releasedir protocol.
//!
//! Wraps the C library's `DIR` stream so entries, offsets and rewind all
//! behave exactly as the backing filesystem reports them.

use std::ffi::{CStr, OsString};
use std::io;
use std::os::fd::{IntoRawFd, OwnedFd};
use std::os::unix::ffi::OsStringExt;
use std::ptr::NonNull;

/// One directory entry, copied out of the stream's internal buffer.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub ino: u64,
    pub d_type: u8,
    pub name: OsString,
}

impl DirEntry {
    /// `.` and `..` are never forwarded to the kernel; a lookup on them
    /// would inflate the lookup counts forget later checks.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }
}

/// An owned `DIR` stream. Takes over the descriptor it is built from and
/// closes it with the stream.
pub struct DirStream {
    dirp: NonNull<libc::DIR>,
}

// The stream is confined to one open-directory session; the raw pointer is
// never shared across threads concurrently.
unsafe impl Send for DirStream {}

impl DirStream {
    pub fn from_fd(fd: OwnedFd) -> io::Result<Self> {
        let raw = fd.into_raw_fd();
        let dirp = unsafe { libc::fdopendir(raw) };
        match NonNull::new(dirp) {
            Some(dirp) => Ok(DirStream { dirp }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(raw) };
                Err(err)
            }
        }
    }

    /// The next entry, or `None` at end of stream.
    pub fn next_entry(&mut self) -> io::Result<Option<DirEntry>> {
        // readdir reports errors only through errno; clear it so an
        // unchanged value means end-of-stream.
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(self.dirp.as_ptr()) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => Ok(None),
                Some(_) => Err(err),
            };
        }

        let entry = unsafe { &*entry };
        let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
        Ok(Some(DirEntry {
            ino: entry.d_ino as u64,
            d_type: entry.d_type,
            name: OsString::from_vec(name.to_bytes().to_vec()),
        }))
    }

    /// The stream position after the most recently read entry.
    pub fn tell(&mut self) -> i64 {
        unsafe { libc::telldir(self.dirp.as_ptr()) as i64 }
    }

    pub fn seek(&mut self, offset: i64) {
        unsafe { libc::seekdir(self.dirp.as_ptr(), offset as libc::c_long) }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        // closedir also closes the underlying descriptor.
        unsafe { libc::closedir(self.dirp.as_ptr()) };
    }
}

/// Iteration state for one open-directory session: the stream, the entry
/// fetched but not yet emitted, and the offset last handed to the kernel.
pub struct DirHandle {
    pub stream: DirStream,
    pub pending: Option<DirEntry>,
    pub offset: i64,
}

impl DirHandle {
    pub fn new(stream: DirStream) -> Self {
        DirHandle {
            stream,
            pending: None,
            offset: 0,
        }
    }

    /// Align the stream with the offset the kernel asked for. A mismatch
    /// means the client rewound or skipped; any pending entry is stale.
    pub fn seek_to(&mut self, offset: i64) {
        if offset != self.offset {
            self.stream.seek(offset);
            self.pending = None;
            self.offset = offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::ffi::OsStr;

    use crate::sys;

    use super::*;

    fn open_stream(dir: &std::path::Path) -> DirStream {
        let fd = sys::open(dir, libc::O_RDONLY).expect("open dir");
        DirStream::from_fd(fd).expect("fdopendir")
    }

    fn names(stream: &mut DirStream) -> Vec<String> {
        let mut out = vec![];
        while let Some(entry) = stream.next_entry().expect("next_entry") {
            out.push(entry.name.to_string_lossy().into_owned());
        }
        out
    }

    #[test]
    fn stream_yields_every_entry_including_dots() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let mut stream = open_stream(dir.path());
        let got: HashSet<String> = names(&mut stream).into_iter().collect();
        let want: HashSet<String> =
            [".", "..", "a", "b", "c"].iter().map(|s| s.to_string()).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn tell_and_seek_resume_at_the_same_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a", "b", "c", "d"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let mut stream = open_stream(dir.path());
        let first = stream.next_entry().expect("read").expect("entry");
        let resume = stream.tell();
        let rest: Vec<String> = names(&mut stream);

        stream.seek(resume);
        let replay: Vec<String> = names(&mut stream);
        assert_eq!(rest, replay);
        assert!(!replay.iter().any(|n| *n == first.name.to_string_lossy()));
    }

    #[test]
    fn rewind_to_zero_replays_the_whole_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("only"), b"x").expect("write");

        let mut stream = open_stream(dir.path());
        let all = names(&mut stream);
        stream.seek(0);
        assert_eq!(names(&mut stream), all);
    }

    #[test]
    fn dot_entries_are_recognized() {
        let entry = |name: &str| DirEntry {
            ino: 1,
            d_type: libc::DT_DIR,
            name: OsStr::new(name).to_os_string(),
        };
        assert!(entry(".").is_dot());
        assert!(entry("..").is_dot());
        assert!(!entry(".hidden").is_dot());
    }

    #[test]
    fn seek_to_discards_pending_state_only_on_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a"), b"x").expect("write");

        let mut handle = DirHandle::new(open_stream(dir.path()));
        let entry = handle.stream.next_entry().expect("read").expect("entry");
        handle.pending = Some(entry);

        handle.seek_to(handle.offset);
        assert!(handle.pending.is_some());

        let ahead = handle.stream.tell();
        handle.seek_to(ahead + 1);
        assert!(handle.pending.is_none());
    }

    #[test]
    fn independent_streams_do_not_interfere() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["a", "b"] {
            std::fs::write(dir.path().join(name), b"x").expect("write");
        }

        let mut one = open_stream(dir.path());
        let mut two = open_stream(dir.path());
        let _ = one.next_entry().expect("read");

        let got: HashSet<String> = names(&mut two).into_iter().collect();
        assert!(got.contains("a") && got.contains("b"));
    }
}
