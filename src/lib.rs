//! In-process FUSE transport.
//!
//! Both halves of a filesystem-in-userspace transport in one crate: the
//! driver half — request dispatch, per-mount sessions, the VFS adapter
//! ([`Volume`]) and a character-device style endpoint ([`Device`]) — and
//! the daemon half — a session loop ([`Server`]) that feeds a path-based
//! filesystem trait ([`PathFilesystem`]) through an inode/path table.
//!
//! A host VFS (or a test) calls into a [`Volume`]; the volume turns each
//! call into a framed request, queues it on the mount's session and blocks
//! the caller. The server pulls frames from its [`SlotHandle`], computes a
//! reply and writes it back; the endpoint matches the reply by its unique
//! id and wakes the blocked caller.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

use std::time::SystemTime;

pub use crate::access_flags::AccessFlags;
pub use crate::adapter::CallContext;
pub use crate::adapter::Entry;
pub use crate::adapter::SetAttrRequest;
pub use crate::adapter::Statfs;
pub use crate::adapter::Volume;
pub use crate::bsd_file_flags::BsdFileFlags;
pub use crate::device::AlterVnode;
pub use crate::device::AlterVnodeCmd;
pub use crate::device::DEFAULT_SLOT_COUNT;
pub use crate::device::Device;
pub use crate::device::Ioctl;
pub use crate::device::IoctlReply;
pub use crate::device::PollEvents;
pub use crate::device::SlotHandle;
pub use crate::device::UbcFlags;
pub use crate::dispatch::CancelToken;
pub use crate::ll::Errno;
pub use crate::ll::FileHandle;
pub use crate::ll::Generation;
pub use crate::ll::Lock;
pub use crate::ll::NodeId;
pub use crate::ll::Unique;
pub use crate::ll::Version;
pub use crate::ll::fuse_abi::InitFlags;
pub use crate::mount_options::MountOption;
pub use crate::open_flags::OpenAccMode;
pub use crate::open_flags::OpenFlags;
pub use crate::server::ConnectionInfo;
pub use crate::server::PathFilesystem;
pub use crate::server::Server;
pub use crate::server::ServerOptions;
pub use crate::session::BUFFER_SIZE;
pub use crate::session::MAX_WRITE_SIZE;

mod access_flags;
mod adapter;
mod bsd_file_flags;
mod device;
mod dispatch;
pub mod ll;
mod mount_options;
mod nodes;
mod open_flags;
mod server;
mod session;
mod ticket;
mod time;

/// File types
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    /// Named pipe (`S_IFIFO`)
    NamedPipe,
    /// Character device (`S_IFCHR`)
    CharDevice,
    /// Block device (`S_IFBLK`)
    BlockDevice,
    /// Directory (`S_IFDIR`)
    Directory,
    /// Regular file (`S_IFREG`)
    RegularFile,
    /// Symbolic link (`S_IFLNK`)
    Symlink,
    /// Unix domain socket (`S_IFSOCK`)
    Socket,
}

impl FileType {
    /// Recovers the file type from a wire mode word.
    #[allow(clippy::unnecessary_cast)]
    pub fn from_mode(mode: u32) -> Option<FileType> {
        match mode & libc::S_IFMT as u32 {
            x if x == libc::S_IFIFO as u32 => Some(FileType::NamedPipe),
            x if x == libc::S_IFCHR as u32 => Some(FileType::CharDevice),
            x if x == libc::S_IFBLK as u32 => Some(FileType::BlockDevice),
            x if x == libc::S_IFDIR as u32 => Some(FileType::Directory),
            x if x == libc::S_IFREG as u32 => Some(FileType::RegularFile),
            x if x == libc::S_IFLNK as u32 => Some(FileType::Symlink),
            x if x == libc::S_IFSOCK as u32 => Some(FileType::Socket),
            _ => None,
        }
    }
}

/// File attributes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileAttr {
    /// Node number
    pub ino: NodeId,
    /// Size in bytes
    pub size: u64,
    /// Allocated size in 512-byte blocks. May be smaller than the actual
    /// file size if the file is sparse or compressed.
    pub blocks: u64,
    /// Time of last access
    pub atime: SystemTime,
    /// Time of last modification
    pub mtime: SystemTime,
    /// Time of last change
    pub ctime: SystemTime,
    /// Time of creation
    pub crtime: SystemTime,
    /// Kind of file (directory, file, pipe, etc)
    pub kind: FileType,
    /// Permissions
    pub perm: u16,
    /// Number of hard links
    pub nlink: u32,
    /// User id
    pub uid: u32,
    /// Group id
    pub gid: u32,
    /// Rdev
    pub rdev: u32,
    /// Block size to be reported by `stat()`. If unsure, set to 4096.
    pub blksize: u32,
    /// File flags, see chflags(2)
    pub flags: u32,
}

/// Backup and creation times, exposed when the session negotiated XTIMES.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct XTimes {
    /// Time of last backup
    pub bkuptime: SystemTime,
    /// Time of creation
    pub crtime: SystemTime,
}

/// One decoded directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// Node number the entry points at
    pub ino: u64,
    /// Offset to resume the listing after this entry
    pub offset: u64,
    /// Entry type
    pub kind: FileType,
    /// Entry name
    pub name: std::ffi::OsString,
}

/// A time value in a SETATTR request: either a concrete time, or "now",
/// which the daemon resolves against its own clock.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TimeOrNow {
    /// A specific point in time
    SpecificTime(SystemTime),
    /// The daemon's current time
    Now,
}

/// Credentials of the thread entering the adapter; stamped into every
/// request header.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Caller {
    /// Effective user id
    pub uid: u32,
    /// Effective group id
    pub gid: u32,
    /// Process id
    pub pid: u32,
}

impl Caller {
    /// Builds explicit credentials.
    pub fn new(uid: u32, gid: u32, pid: u32) -> Caller {
        Caller { uid, gid, pid }
    }

    /// The credentials of the current process.
    pub fn current() -> Caller {
        // SAFETY: getuid/getgid/getpid cannot fail.
        unsafe {
            Caller {
                uid: libc::getuid(),
                gid: libc::getgid(),
                pid: libc::getpid() as u32,
            }
        }
    }
}
