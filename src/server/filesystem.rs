//! The path-based filesystem trait the daemon loop drives.
//!
//! The session loop resolves node ids to pathnames through its node table
//! and hands the paths here. Reasonable default implementations are provided
//! to get a mountable filesystem that does nothing.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use log::warn;

use crate::AccessFlags;
use crate::DirEntry;
use crate::FileAttr;
use crate::SetAttrRequest;
use crate::Statfs;
use crate::XTimes;
use crate::ll::Errno;
use crate::ll::FileHandle;
use crate::ll::Lock;
use crate::ll::Version;
use crate::ll::fuse_abi::InitFlags;
use crate::open_flags::OpenFlags;

/// What the driver told the daemon during INIT.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    /// Protocol revision spoken by the driver.
    pub proto: Version,
    /// Capabilities both sides agreed on.
    pub capabilities: InitFlags,
    /// Readahead window the driver announced.
    pub max_readahead: u32,
}

/// A userspace filesystem addressed by pathnames.
///
/// Paths are absolute within the volume (the root is `/`). File handles are
/// whatever [`open`](PathFilesystem::open) returned; stateless filesystems
/// may ignore them.
#[allow(unused_variables)]
pub trait PathFilesystem: Send + Sync + 'static {
    /// Initialize filesystem. Called before any other method.
    fn init(&self, conn: &ConnectionInfo) -> Result<(), Errno> {
        Ok(())
    }

    /// Clean up filesystem. Called once the session is over.
    fn destroy(&self) {}

    /// Get file attributes.
    fn getattr(&self, path: &Path) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] getattr(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    /// Set file attributes. `fh` is set when the caller holds the file open.
    fn setattr(
        &self,
        path: &Path,
        changes: &SetAttrRequest,
        fh: Option<FileHandle>,
    ) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] setattr(path: {path:?}, changes: {changes:?})");
        Err(Errno::ENOSYS)
    }

    /// Read symbolic link.
    fn readlink(&self, path: &Path) -> Result<PathBuf, Errno> {
        warn!("[Not Implemented] readlink(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    /// Create file node (regular file, device, fifo or socket).
    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] mknod(path: {path:?}, mode: {mode:#05o}, rdev: {rdev})");
        Err(Errno::ENOSYS)
    }

    /// Create a directory.
    fn mkdir(&self, path: &Path, mode: u32) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] mkdir(path: {path:?}, mode: {mode:#05o})");
        Err(Errno::ENOSYS)
    }

    /// Remove a file.
    fn unlink(&self, path: &Path) -> Result<(), Errno> {
        warn!("[Not Implemented] unlink(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    /// Remove a directory.
    fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        warn!("[Not Implemented] rmdir(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    /// Create a symbolic link.
    fn symlink(&self, path: &Path, target: &Path) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] symlink(path: {path:?}, target: {target:?})");
        Err(Errno::EPERM)
    }

    /// Rename a file.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), Errno> {
        warn!("[Not Implemented] rename(from: {from:?}, to: {to:?})");
        Err(Errno::ENOSYS)
    }

    /// Create a hard link.
    fn link(&self, path: &Path, newpath: &Path) -> Result<FileAttr, Errno> {
        warn!("[Not Implemented] link(path: {path:?}, newpath: {newpath:?})");
        Err(Errno::EPERM)
    }

    /// Atomically swap the contents of two paths.
    fn exchange(&self, path1: &Path, path2: &Path, options: u64) -> Result<(), Errno> {
        warn!("[Not Implemented] exchange(path1: {path1:?}, path2: {path2:?})");
        Err(Errno::ENOSYS)
    }

    /// Open a file. The returned handle is passed to all subsequent file
    /// operations on this open.
    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, Errno> {
        Ok(FileHandle(0))
    }

    /// Read data.
    fn read(&self, path: &Path, fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        warn!("[Not Implemented] read(path: {path:?}, fh: {fh}, offset: {offset}, size: {size})");
        Err(Errno::ENOSYS)
    }

    /// Write data.
    fn write(&self, path: &Path, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        warn!(
            "[Not Implemented] write(path: {path:?}, fh: {fh}, offset: {offset}, data.len(): {})",
            data.len()
        );
        Err(Errno::ENOSYS)
    }

    /// Flush method, called on each close of the opened file.
    fn flush(&self, path: &Path, fh: FileHandle) -> Result<(), Errno> {
        warn!("[Not Implemented] flush(path: {path:?}, fh: {fh})");
        Err(Errno::ENOSYS)
    }

    /// Release an open file; called once per open when the last reference
    /// to the handle goes away.
    fn release(&self, path: &Path, fh: FileHandle, flags: OpenFlags) -> Result<(), Errno> {
        Ok(())
    }

    /// Synchronize file contents.
    fn fsync(&self, path: &Path, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        warn!("[Not Implemented] fsync(path: {path:?}, fh: {fh}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    /// Open a directory.
    fn opendir(&self, path: &Path) -> Result<FileHandle, Errno> {
        Ok(FileHandle(0))
    }

    /// Read a directory: the complete listing; the session loop handles
    /// resume offsets and packing.
    fn readdir(&self, path: &Path, fh: FileHandle) -> Result<Vec<DirEntry>, Errno> {
        warn!("[Not Implemented] readdir(path: {path:?}, fh: {fh})");
        Err(Errno::ENOSYS)
    }

    /// Release an open directory.
    fn releasedir(&self, path: &Path, fh: FileHandle) -> Result<(), Errno> {
        Ok(())
    }

    /// Synchronize directory contents.
    fn fsyncdir(&self, path: &Path, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        warn!("[Not Implemented] fsyncdir(path: {path:?}, fh: {fh}, datasync: {datasync})");
        Err(Errno::ENOSYS)
    }

    /// Get file system statistics.
    fn statfs(&self, path: &Path) -> Result<Statfs, Errno> {
        Ok(Statfs {
            bsize: 512,
            namelen: 255,
            ..Statfs::default()
        })
    }

    /// Set an extended attribute.
    fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        position: u32,
    ) -> Result<(), Errno> {
        warn!("[Not Implemented] setxattr(path: {path:?}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Get an extended attribute.
    fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        warn!("[Not Implemented] getxattr(path: {path:?}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// List extended attribute names.
    fn listxattr(&self, path: &Path) -> Result<Vec<OsString>, Errno> {
        warn!("[Not Implemented] listxattr(path: {path:?})");
        Err(Errno::ENOSYS)
    }

    /// Remove an extended attribute.
    fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), Errno> {
        warn!("[Not Implemented] removexattr(path: {path:?}, name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Check file access permissions.
    fn access(&self, path: &Path, mask: AccessFlags) -> Result<(), Errno> {
        warn!("[Not Implemented] access(path: {path:?}, mask: {mask})");
        Err(Errno::ENOSYS)
    }

    /// Create and open a file in one step.
    fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(FileAttr, FileHandle), Errno> {
        warn!("[Not Implemented] create(path: {path:?}, mode: {mode:#05o}, flags: {flags:#x})");
        Err(Errno::ENOSYS)
    }

    /// Test for a byte-range lock. `Ok(None)` means no conflicting lock.
    fn getlk(
        &self,
        path: &Path,
        fh: FileHandle,
        owner: u64,
        lock: &Lock,
    ) -> Result<Option<Lock>, Errno> {
        warn!("[Not Implemented] getlk(path: {path:?}, fh: {fh}, owner: {owner})");
        Err(Errno::ENOSYS)
    }

    /// Acquire, modify or release a byte-range lock.
    fn setlk(
        &self,
        path: &Path,
        fh: FileHandle,
        owner: u64,
        lock: &Lock,
        sleep: bool,
    ) -> Result<(), Errno> {
        warn!("[Not Implemented] setlk(path: {path:?}, fh: {fh}, owner: {owner})");
        Err(Errno::ENOSYS)
    }

    /// Map a block index within the file to a device block.
    fn bmap(&self, path: &Path, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        warn!("[Not Implemented] bmap(path: {path:?}, blocksize: {blocksize}, idx: {idx})");
        Err(Errno::ENOSYS)
    }

    /// Rename the volume; sent only when VOL_RENAME was negotiated.
    fn setvolname(&self, name: &OsStr) -> Result<(), Errno> {
        warn!("[Not Implemented] setvolname(name: {name:?})");
        Err(Errno::ENOSYS)
    }

    /// Query backup and creation times; sent only when XTIMES was
    /// negotiated.
    fn getxtimes(&self, path: &Path) -> Result<XTimes, Errno> {
        warn!("[Not Implemented] getxtimes(path: {path:?})");
        Err(Errno::ENOSYS)
    }
}

/// Shared filesystems work too; every method already takes `&self`.
impl<FS: PathFilesystem> PathFilesystem for std::sync::Arc<FS> {
    fn init(&self, conn: &ConnectionInfo) -> Result<(), Errno> {
        (**self).init(conn)
    }

    fn destroy(&self) {
        (**self).destroy()
    }

    fn getattr(&self, path: &Path) -> Result<FileAttr, Errno> {
        (**self).getattr(path)
    }

    fn setattr(
        &self,
        path: &Path,
        changes: &SetAttrRequest,
        fh: Option<FileHandle>,
    ) -> Result<FileAttr, Errno> {
        (**self).setattr(path, changes, fh)
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, Errno> {
        (**self).readlink(path)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<FileAttr, Errno> {
        (**self).mknod(path, mode, rdev)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<FileAttr, Errno> {
        (**self).mkdir(path, mode)
    }

    fn unlink(&self, path: &Path) -> Result<(), Errno> {
        (**self).unlink(path)
    }

    fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        (**self).rmdir(path)
    }

    fn symlink(&self, path: &Path, target: &Path) -> Result<FileAttr, Errno> {
        (**self).symlink(path, target)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Errno> {
        (**self).rename(from, to)
    }

    fn link(&self, path: &Path, newpath: &Path) -> Result<FileAttr, Errno> {
        (**self).link(path, newpath)
    }

    fn exchange(&self, path1: &Path, path2: &Path, options: u64) -> Result<(), Errno> {
        (**self).exchange(path1, path2, options)
    }

    fn open(&self, path: &Path, flags: OpenFlags) -> Result<FileHandle, Errno> {
        (**self).open(path, flags)
    }

    fn read(&self, path: &Path, fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        (**self).read(path, fh, offset, size)
    }

    fn write(&self, path: &Path, fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        (**self).write(path, fh, offset, data)
    }

    fn flush(&self, path: &Path, fh: FileHandle) -> Result<(), Errno> {
        (**self).flush(path, fh)
    }

    fn release(&self, path: &Path, fh: FileHandle, flags: OpenFlags) -> Result<(), Errno> {
        (**self).release(path, fh, flags)
    }

    fn fsync(&self, path: &Path, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        (**self).fsync(path, fh, datasync)
    }

    fn opendir(&self, path: &Path) -> Result<FileHandle, Errno> {
        (**self).opendir(path)
    }

    fn readdir(&self, path: &Path, fh: FileHandle) -> Result<Vec<DirEntry>, Errno> {
        (**self).readdir(path, fh)
    }

    fn releasedir(&self, path: &Path, fh: FileHandle) -> Result<(), Errno> {
        (**self).releasedir(path, fh)
    }

    fn fsyncdir(&self, path: &Path, fh: FileHandle, datasync: bool) -> Result<(), Errno> {
        (**self).fsyncdir(path, fh, datasync)
    }

    fn statfs(&self, path: &Path) -> Result<Statfs, Errno> {
        (**self).statfs(path)
    }

    fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        position: u32,
    ) -> Result<(), Errno> {
        (**self).setxattr(path, name, value, position)
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        (**self).getxattr(path, name)
    }

    fn listxattr(&self, path: &Path) -> Result<Vec<OsString>, Errno> {
        (**self).listxattr(path)
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), Errno> {
        (**self).removexattr(path, name)
    }

    fn access(&self, path: &Path, mask: AccessFlags) -> Result<(), Errno> {
        (**self).access(path, mask)
    }

    fn create(
        &self,
        path: &Path,
        mode: u32,
        flags: OpenFlags,
    ) -> Result<(FileAttr, FileHandle), Errno> {
        (**self).create(path, mode, flags)
    }

    fn getlk(
        &self,
        path: &Path,
        fh: FileHandle,
        owner: u64,
        lock: &Lock,
    ) -> Result<Option<Lock>, Errno> {
        (**self).getlk(path, fh, owner, lock)
    }

    fn setlk(
        &self,
        path: &Path,
        fh: FileHandle,
        owner: u64,
        lock: &Lock,
        sleep: bool,
    ) -> Result<(), Errno> {
        (**self).setlk(path, fh, owner, lock, sleep)
    }

    fn bmap(&self, path: &Path, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        (**self).bmap(path, blocksize, idx)
    }

    fn setvolname(&self, name: &OsStr) -> Result<(), Errno> {
        (**self).setvolname(name)
    }

    fn getxtimes(&self, path: &Path) -> Result<XTimes, Errno> {
        (**self).getxtimes(path)
    }
}
