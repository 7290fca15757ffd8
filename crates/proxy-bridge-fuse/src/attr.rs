//! Conversions from kernel stat structures to fuser attribute types.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};

/// The file type encoded in a stat mode.
pub fn file_type_from_mode(mode: u32) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// The file type from a dirent `d_type` byte. `DT_UNKNOWN` degrades to a
/// regular file; in the non-plus listing the kernel treats this as a hint.
pub fn file_type_from_dtype(d_type: u8) -> FileType {
    match d_type {
        libc::DT_DIR => FileType::Directory,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_SOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(secs.unsigned_abs())
    }
}

/// Build the reply attributes for a stat result. `ino` is the protocol
/// identifier, not the backing inode number: fuser propagates `attr.ino`
/// as the FUSE nodeid, so the token goes here.
pub fn file_attr_from_stat(st: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: timestamp(st.st_atime, st.st_atime_nsec),
        mtime: timestamp(st.st_mtime, st.st_mtime_nsec),
        ctime: timestamp(st.st_ctime, st.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use crate::sys;

    use super::*;

    #[test]
    fn regular_file_attrs_carry_size_mode_and_token() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").expect("write");

        let fd = sys::open(&path, libc::O_PATH).expect("open");
        let st = sys::stat_fd(fd.as_raw_fd()).expect("stat");
        let attr = file_attr_from_stat(&st, 42);

        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn symlink_mode_maps_to_symlink_kind() {
        assert_eq!(file_type_from_mode(libc::S_IFLNK | 0o777), FileType::Symlink);
        assert_eq!(file_type_from_mode(libc::S_IFDIR | 0o755), FileType::Directory);
    }

    #[test]
    fn dtype_mapping_covers_the_common_kinds() {
        assert_eq!(file_type_from_dtype(libc::DT_DIR), FileType::Directory);
        assert_eq!(file_type_from_dtype(libc::DT_LNK), FileType::Symlink);
        assert_eq!(file_type_from_dtype(libc::DT_REG), FileType::RegularFile);
        assert_eq!(file_type_from_dtype(libc::DT_UNKNOWN), FileType::RegularFile);
    }

    #[test]
    fn pre_epoch_timestamps_do_not_panic() {
        let t = timestamp(-10, 0);
        assert!(t < UNIX_EPOCH);
    }
}
