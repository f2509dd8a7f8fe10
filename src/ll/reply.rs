//! Reply serialization for the daemon side.
//!
//! A [`Response`] owns the payload of one reply; [`Response::into_frame`]
//! prepends the out-header with the negated error convention and yields the
//! bytes the endpoint expects in a single `write`.

use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use smallvec::SmallVec;
use zerocopy::Immutable;
use zerocopy::IntoBytes;

use super::Errno;
use super::FileHandle;
use super::Generation;
use super::Lock;
use super::Unique;
use super::fuse_abi as abi;
use super::fuse_abi::FopenFlags;
use crate::FileAttr;
use crate::FileType;
use crate::XTimes;
use crate::time::time_from_system_time;

const INLINE_DATA_THRESHOLD: usize = size_of::<u64>() * 4;

pub(crate) type ResponseBuf = SmallVec<[u8; INLINE_DATA_THRESHOLD]>;

/// One reply payload, not yet framed.
#[derive(Debug)]
pub enum Response {
    Error(Option<Errno>),
    Data(ResponseBuf),
}

impl Response {
    /// Serializes header plus payload. The header length includes itself.
    pub fn into_frame(self, unique: Unique) -> Vec<u8> {
        let (error, data) = match &self {
            Response::Error(errno) => (errno.map_or(0, Errno::to_wire), &[][..]),
            Response::Data(data) => (0, data.as_slice()),
        };
        let header = abi::fuse_out_header {
            len: (size_of::<abi::fuse_out_header>() + data.len()) as u32,
            error,
            unique: unique.0,
        };
        let mut frame = Vec::with_capacity(header.len as usize);
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(data);
        frame
    }

    // Constructors

    pub fn new_empty() -> Self {
        Self::Error(None)
    }

    pub fn new_error(error: Errno) -> Self {
        Self::Error(Some(error))
    }

    pub fn new_data<T: AsRef<[u8]>>(data: T) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_ref()))
    }

    pub fn new_entry(
        nodeid: u64,
        generation: Generation,
        attr: &FileAttr,
        attr_ttl: Duration,
        entry_ttl: Duration,
    ) -> Self {
        let d = abi::fuse_entry_out {
            nodeid,
            generation: generation.0,
            entry_valid: entry_ttl.as_secs(),
            attr_valid: attr_ttl.as_secs(),
            entry_valid_nsec: entry_ttl.subsec_nanos(),
            attr_valid_nsec: attr_ttl.subsec_nanos(),
            attr: fuse_attr_from_attr(attr),
        };
        Self::from_struct(&d)
    }

    pub fn new_attr(ttl: Duration, attr: &FileAttr) -> Self {
        let r = abi::fuse_attr_out {
            attr_valid: ttl.as_secs(),
            attr_valid_nsec: ttl.subsec_nanos(),
            dummy: 0,
            attr: fuse_attr_from_attr(attr),
        };
        Self::from_struct(&r)
    }

    pub fn new_xtimes(xtimes: &XTimes) -> Self {
        let (bkuptime_secs, bkuptime_nanos) = time_from_system_time(&xtimes.bkuptime);
        let (crtime_secs, crtime_nanos) = time_from_system_time(&xtimes.crtime);
        let r = abi::fuse_getxtimes_out {
            bkuptime: bkuptime_secs,
            crtime: crtime_secs,
            bkuptimensec: bkuptime_nanos,
            crtimensec: crtime_nanos,
        };
        Self::from_struct(&r)
    }

    pub fn new_open(fh: FileHandle, flags: FopenFlags) -> Self {
        let r = abi::fuse_open_out {
            fh: fh.0,
            open_flags: flags.bits(),
            padding: 0,
        };
        Self::from_struct(&r)
    }

    pub fn new_lock(lock: &Lock) -> Self {
        let r = abi::fuse_lk_out {
            lk: abi::fuse_file_lock {
                start: lock.range.0,
                end: lock.range.1,
                typ: lock.typ,
                pid: lock.pid,
            },
        };
        Self::from_struct(&r)
    }

    pub fn new_bmap(block: u64) -> Self {
        let r = abi::fuse_bmap_out { block };
        Self::from_struct(&r)
    }

    pub fn new_write(written: u32) -> Self {
        let r = abi::fuse_write_out {
            size: written,
            padding: 0,
        };
        Self::from_struct(&r)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_statfs(
        blocks: u64,
        bfree: u64,
        bavail: u64,
        files: u64,
        ffree: u64,
        bsize: u32,
        namelen: u32,
        frsize: u32,
    ) -> Self {
        let r = abi::fuse_statfs_out {
            st: abi::fuse_kstatfs {
                blocks,
                bfree,
                bavail,
                files,
                ffree,
                bsize,
                namelen,
                frsize,
                padding: 0,
                spare: [0; 6],
            },
        };
        Self::from_struct(&r)
    }

    pub fn new_create(
        nodeid: u64,
        generation: Generation,
        attr: &FileAttr,
        ttl: Duration,
        fh: FileHandle,
        flags: FopenFlags,
    ) -> Self {
        let entry = abi::fuse_entry_out {
            nodeid,
            generation: generation.0,
            entry_valid: ttl.as_secs(),
            attr_valid: ttl.as_secs(),
            entry_valid_nsec: ttl.subsec_nanos(),
            attr_valid_nsec: ttl.subsec_nanos(),
            attr: fuse_attr_from_attr(attr),
        };
        let open = abi::fuse_open_out {
            fh: fh.0,
            open_flags: flags.bits(),
            padding: 0,
        };
        let mut buf = ResponseBuf::from_slice(entry.as_bytes());
        buf.extend_from_slice(open.as_bytes());
        Self::Data(buf)
    }

    pub fn new_init(init: &abi::fuse_init_out) -> Self {
        Self::from_struct(init)
    }

    pub fn new_xattr_size(size: u32) -> Self {
        let r = abi::fuse_getxattr_out { size, padding: 0 };
        Self::from_struct(&r)
    }

    pub fn new_directory(list: DirEntList) -> Self {
        debug_assert!(list.buf.len() <= list.max_size);
        Self::Data(list.buf)
    }

    fn from_struct<T: IntoBytes + Immutable>(data: &T) -> Self {
        Self::Data(ResponseBuf::from_slice(data.as_bytes()))
    }
}

/// Returns the mode for a given file kind and permission bits.
#[allow(trivial_numeric_casts)]
#[allow(clippy::unnecessary_cast)]
pub(crate) fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (match kind {
        FileType::NamedPipe => libc::S_IFIFO,
        FileType::CharDevice => libc::S_IFCHR,
        FileType::BlockDevice => libc::S_IFBLK,
        FileType::Directory => libc::S_IFDIR,
        FileType::RegularFile => libc::S_IFREG,
        FileType::Symlink => libc::S_IFLNK,
        FileType::Socket => libc::S_IFSOCK,
    }) as u32
        | u32::from(perm)
}

pub(crate) fn fuse_attr_from_attr(attr: &FileAttr) -> abi::fuse_attr {
    let (atime_secs, atime_nanos) = time_from_system_time(&attr.atime);
    let (mtime_secs, mtime_nanos) = time_from_system_time(&attr.mtime);
    let (ctime_secs, ctime_nanos) = time_from_system_time(&attr.ctime);
    let (crtime_secs, crtime_nanos) = time_from_system_time(&attr.crtime);
    abi::fuse_attr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.blocks,
        atime: atime_secs,
        mtime: mtime_secs,
        ctime: ctime_secs,
        crtime: crtime_secs,
        atimensec: atime_nanos,
        mtimensec: mtime_nanos,
        ctimensec: ctime_nanos,
        crtimensec: crtime_nanos,
        mode: mode_from_kind_and_perm(attr.kind, attr.perm),
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: attr.rdev,
        flags: attr.flags,
        blksize: attr.blksize,
        padding: 0,
    }
}

/// Packs directory entries into the READDIR stream format: a
/// [`abi::fuse_dirent`] header followed by the name, NUL-padded to the
/// dirent alignment.
#[derive(Debug)]
pub struct DirEntList {
    buf: ResponseBuf,
    max_size: usize,
}

impl DirEntList {
    pub fn new(max_size: usize) -> DirEntList {
        DirEntList {
            buf: ResponseBuf::new(),
            max_size,
        }
    }

    /// Appends one record. Returns `true` when the buffer is full and the
    /// record was not added; the caller resumes from `off` next time.
    pub fn push(&mut self, ino: u64, off: u64, kind: FileType, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let header_len = size_of::<abi::fuse_dirent>();
        let padded = (header_len + name.len()).next_multiple_of(abi::DIRENT_ALIGN);
        if self.buf.len() + padded > self.max_size {
            return true;
        }
        let dirent = abi::fuse_dirent {
            ino,
            off,
            namelen: name.len() as u32,
            typ: mode_from_kind_and_perm(kind, 0) >> 12,
        };
        self.buf.extend_from_slice(dirent.as_bytes());
        self.buf.extend_from_slice(name);
        let pad = padded - header_len - name.len();
        self.buf.extend_from_slice(&[0u8; abi::DIRENT_ALIGN][..pad]);
        false
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}
