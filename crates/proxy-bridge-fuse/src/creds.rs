//! Per-request adoption of the caller's filesystem credentials.
//!
//! Each handler switches the worker thread's fsuid/fsgid to the request's
//! uid/gid so permission checks in the backing tree see the real client.

/// Scoped fsuid/fsgid switch. Restores the previous identity on drop,
/// whether the handler succeeded or not.
///
/// `setfsuid`/`setfsgid` are thread-local and always report the previous
/// value; when the process lacks the privilege to switch, the calls are
/// silent no-ops, which keeps the bridge usable (if less faithful) when
/// run unprivileged.
#[derive(Debug)]
pub struct FsCredGuard {
    prev_uid: libc::uid_t,
    prev_gid: libc::gid_t,
}

impl FsCredGuard {
    pub fn adopt(uid: u32, gid: u32) -> Self {
        let prev_uid = unsafe { libc::setfsuid(uid) } as libc::uid_t;
        let prev_gid = unsafe { libc::setfsgid(gid) } as libc::gid_t;
        FsCredGuard { prev_uid, prev_gid }
    }
}

impl Drop for FsCredGuard {
    fn drop(&mut self) {
        unsafe {
            libc::setfsuid(self.prev_uid);
            libc::setfsgid(self.prev_gid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adopting_own_identity_round_trips() {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };

        {
            let _guard = FsCredGuard::adopt(uid, gid);
            // The switch to our own identity is always permitted.
            assert_eq!(unsafe { libc::setfsuid(uid) } as libc::uid_t, uid);
        }

        // After the guard drops the fsuid is back to the effective uid.
        assert_eq!(unsafe { libc::setfsuid(uid) } as libc::uid_t, uid);
    }

    #[test]
    fn nested_guards_unwind_in_order() {
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };

        let outer = FsCredGuard::adopt(uid, gid);
        {
            let _inner = FsCredGuard::adopt(uid, gid);
        }
        drop(outer);

        assert_eq!(unsafe { libc::setfsuid(uid) } as libc::uid_t, uid);
    }
}
