//! Error types for the passthrough bridge.
//!
//! Defines `BridgeError` and its conversion to libc errno values.

use std::io;

use thiserror::Error;

/// Errors a request handler can surface to the kernel.
///
/// Most backing-tree failures travel through `Os` untouched; the named
/// variants cover the cases where the bridge substitutes its own verdict
/// for what the backing tree reported.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The operation is declined by the bridge.
    #[error("operation not supported")]
    NotSupported,

    /// Symlink-hostile operations: hard-linking a symlink, touching its
    /// times where the OS refuses, removing its xattrs.
    #[error("operation not permitted")]
    NotPermitted,

    #[error("invalid argument")]
    InvalidArgument,

    /// A readlink result filled the whole path buffer.
    #[error("name too long")]
    NameTooLong,

    /// The kernel referenced an inode identifier the table no longer holds.
    #[error("stale inode identifier")]
    StaleInode,

    /// Any other system-call failure, forwarded verbatim.
    #[error("{0}")]
    Os(#[from] io::Error),
}

impl BridgeError {
    /// The errno to hand back on the reply channel.
    pub fn errno(&self) -> libc::c_int {
        match self {
            BridgeError::NotSupported => libc::ENOSYS,
            BridgeError::NotPermitted => libc::EPERM,
            BridgeError::InvalidArgument => libc::EINVAL,
            BridgeError::NameTooLong => libc::ENAMETOOLONG,
            BridgeError::StaleInode => libc::ENOENT,
            BridgeError::Os(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_variants_map_to_expected_errnos() {
        assert_eq!(BridgeError::NotSupported.errno(), libc::ENOSYS);
        assert_eq!(BridgeError::NotPermitted.errno(), libc::EPERM);
        assert_eq!(BridgeError::InvalidArgument.errno(), libc::EINVAL);
        assert_eq!(BridgeError::NameTooLong.errno(), libc::ENAMETOOLONG);
        assert_eq!(BridgeError::StaleInode.errno(), libc::ENOENT);
    }

    #[test]
    fn os_errors_pass_through_their_errno() {
        let err = BridgeError::from(io::Error::from_raw_os_error(libc::ENOTEMPTY));
        assert_eq!(err.errno(), libc::ENOTEMPTY);
    }

    #[test]
    fn os_errors_without_errno_degrade_to_eio() {
        let err = BridgeError::from(io::Error::new(io::ErrorKind::Other, "synthetic"));
        assert_eq!(err.errno(), libc::EIO);
    }
}
