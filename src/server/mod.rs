//! The daemon's session loop.
//!
//! Reads request frames from the endpoint, resolves node ids to pathnames
//! through the node table, dispatches to the filesystem implementation and
//! writes replies back. The loop ends when the session dies (unmount or
//! device close); an unknown opcode from the peer terminates it too.

mod filesystem;

pub use filesystem::ConnectionInfo;
pub use filesystem::PathFilesystem;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use log::error;
use log::warn;
use zerocopy::IntoBytes;

use crate::SetAttrRequest;
use crate::TimeOrNow;
use crate::bsd_file_flags::BsdFileFlags;
use crate::device::SlotHandle;
use crate::ll::Errno;
use crate::ll::FileHandle;
use crate::ll::Generation;
use crate::ll::Lock;
use crate::ll::Unique;
use crate::ll::Version;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::FopenFlags;
use crate::ll::fuse_abi::InitFlags;
use crate::ll::fuse_abi::consts;
use crate::ll::reply::DirEntList;
use crate::ll::reply::Response;
use crate::ll::request::AnyRequest;
use crate::ll::request::Operation;
use crate::nodes::LockRecord;
use crate::nodes::NodeTable;
use crate::open_flags::OpenFlags;
use crate::session::BUFFER_SIZE;
use crate::session::MAX_WRITE_SIZE;
use crate::time::system_time_from_time;

/// Knobs of one daemon instance.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Capabilities this daemon accepts out of what the driver offers.
    pub flags: InitFlags,
    /// Largest write this daemon wants per request.
    pub max_write: u32,
    /// Validity the daemon grants to attributes and entries it returns.
    pub ttl: Duration,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            flags: InitFlags::empty(),
            max_write: MAX_WRITE_SIZE as u32,
            ttl: Duration::from_secs(1),
        }
    }
}

/// Drives one slot's request loop against a [`PathFilesystem`].
pub struct Server<FS> {
    fs: FS,
    handle: SlotHandle,
    options: ServerOptions,
    nodes: NodeTable,
    proto: Option<Version>,
    initialized: bool,
}

impl<FS> std::fmt::Debug for Server<FS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("slot", &self.handle.index())
            .field("initialized", &self.initialized)
            .finish_non_exhaustive()
    }
}

impl<FS: PathFilesystem> Server<FS> {
    /// Builds a daemon over an opened slot with default options.
    pub fn new(fs: FS, handle: SlotHandle) -> Server<FS> {
        Server::with_options(fs, handle, ServerOptions::default())
    }

    /// Protocol revision the driver announced, once INIT has run.
    pub fn protocol(&self) -> Option<Version> {
        self.proto
    }

    /// Builds a daemon with explicit options.
    pub fn with_options(fs: FS, handle: SlotHandle, options: ServerOptions) -> Server<FS> {
        Server {
            fs,
            handle,
            options,
            nodes: NodeTable::new(false),
            proto: None,
            initialized: false,
        }
    }

    /// Runs the loop until the session ends. Returns `Ok` on a clean end
    /// (unmount or device close), an error on a protocol violation.
    pub fn run(&mut self) -> io::Result<()> {
        // One receive buffer, reused between requests, held u64-aligned so
        // header parsing never sees a misaligned frame.
        let mut buffer: Vec<u64> = vec![0; BUFFER_SIZE.div_ceil(8)];
        loop {
            let len = match self.handle.read(buffer.as_mut_slice().as_mut_bytes()) {
                Ok(len) => len,
                Err(errno) if errno == Errno::ENODEV => {
                    debug!("session over, leaving the request loop");
                    self.fs.destroy();
                    return Ok(());
                }
                Err(errno) if errno == Errno::EAGAIN || errno == Errno::EINTR => continue,
                Err(errno) => return Err(errno.into()),
            };
            let bytes = &buffer.as_slice().as_bytes()[..len];
            let request = match AnyRequest::try_from(bytes) {
                Ok(request) => request,
                Err(err) => {
                    // Unknown opcodes and malformed frames end the session;
                    // they are never surfaced as recoverable errors.
                    error!("{err}");
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err.to_string()));
                }
            };
            debug!("{request}");
            let unique = request.unique();
            match self.handle_request(&request) {
                Ok(Some(response)) => self.send(unique, response)?,
                Ok(None) => {}
                Err(errno) => self.send(unique, Response::new_error(errno))?,
            }
        }
    }

    fn send(&self, unique: Unique, response: Response) -> io::Result<()> {
        let frame = response.into_frame(unique);
        self.handle.write(&frame).map_err(io::Error::from)?;
        Ok(())
    }

    fn path_of(&self, nodeid: u64) -> Result<PathBuf, Errno> {
        self.nodes.get_path(nodeid)
    }

    fn child_path(&self, parent: u64, name: &std::ffi::OsStr) -> Result<PathBuf, Errno> {
        Ok(self.path_of(parent)?.join(name))
    }

    fn make_entry(
        &mut self,
        parent: u64,
        name: &std::ffi::OsStr,
        attr: &crate::FileAttr,
    ) -> Result<Response, Errno> {
        let node = self.nodes.lookup(parent, name)?;
        let (id, generation) = (node.id, node.generation);
        if let Some(node) = self.nodes.get_mut(id) {
            if node.cached_mtime.is_some_and(|seen| seen != attr.mtime)
                || (node.cached_mtime.is_some() && node.cached_size != attr.size)
            {
                debug!("node {id:#x} changed since its last entry reply");
            }
            node.cached_size = attr.size;
            node.cached_mtime = Some(attr.mtime);
        }
        Ok(Response::new_entry(
            id,
            Generation(generation),
            attr,
            self.options.ttl,
            self.options.ttl,
        ))
    }

    fn do_init(&mut self, arg: &abi::fuse_init_in) -> Result<Response, Errno> {
        let offered = Version {
            major: arg.major,
            minor: arg.minor,
        };
        if arg.major != abi::KERNEL_VERSION {
            error!("unsupported transport revision {offered}");
            return Err(Errno::EPROTONOSUPPORT);
        }
        let accepted = InitFlags::from_bits_truncate(arg.flags) & self.options.flags;
        if accepted.contains(InitFlags::CASE_INSENSITIVE) {
            self.nodes = NodeTable::new(true);
        }
        let conn = ConnectionInfo {
            proto: offered,
            capabilities: accepted,
            max_readahead: arg.max_readahead,
        };
        self.fs.init(&conn)?;
        self.proto = Some(offered);
        self.initialized = true;
        debug!("handshake: accepted flags {accepted:?}");
        Ok(Response::new_init(&abi::fuse_init_out {
            major: abi::KERNEL_VERSION,
            minor: abi::KERNEL_MINOR_VERSION,
            max_readahead: arg.max_readahead,
            flags: accepted.bits(),
            unused: 0,
            max_write: self.options.max_write,
        }))
    }

    fn setattr_from_plain(arg: &abi::fuse_setattr_in) -> (SetAttrRequest, Option<FileHandle>) {
        let mut changes = SetAttrRequest::default();
        if arg.valid & consts::FATTR_MODE != 0 {
            changes.mode = Some(arg.mode);
        }
        if arg.valid & consts::FATTR_UID != 0 {
            changes.uid = Some(arg.uid);
        }
        if arg.valid & consts::FATTR_GID != 0 {
            changes.gid = Some(arg.gid);
        }
        if arg.valid & consts::FATTR_SIZE != 0 {
            changes.size = Some(arg.size);
        }
        if arg.valid & consts::FATTR_ATIME != 0 {
            changes.atime = Some(if arg.valid & consts::FATTR_ATIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(arg.atime, arg.atimensec))
            });
        }
        if arg.valid & consts::FATTR_MTIME != 0 {
            changes.mtime = Some(if arg.valid & consts::FATTR_MTIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(arg.mtime, arg.mtimensec))
            });
        }
        let fh = (arg.valid & consts::FATTR_FH != 0).then(|| FileHandle(arg.fh));
        (changes, fh)
    }

    fn setattr_from_extended(arg: &abi::fuse_setattr_x_in) -> SetAttrRequest {
        let mut changes = SetAttrRequest::default();
        if arg.valid & consts::FATTR_MODE != 0 {
            changes.mode = Some(arg.mode);
        }
        if arg.valid & consts::FATTR_UID != 0 {
            changes.uid = Some(arg.uid);
        }
        if arg.valid & consts::FATTR_GID != 0 {
            changes.gid = Some(arg.gid);
        }
        if arg.valid & consts::FATTR_SIZE != 0 {
            changes.size = Some(arg.size);
        }
        if arg.valid & consts::FATTR_ATIME != 0 {
            changes.atime = Some(if arg.valid & consts::FATTR_ATIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(arg.atime, arg.atimensec))
            });
        }
        if arg.valid & consts::FATTR_MTIME != 0 {
            changes.mtime = Some(if arg.valid & consts::FATTR_MTIME_NOW != 0 {
                TimeOrNow::Now
            } else {
                TimeOrNow::SpecificTime(system_time_from_time(arg.mtime, arg.mtimensec))
            });
        }
        if arg.valid & consts::FATTR_CRTIME != 0 {
            changes.crtime = Some(system_time_from_time(arg.crtime, arg.crtimensec));
        }
        if arg.valid & consts::FATTR_CHGTIME != 0 {
            changes.chgtime = Some(system_time_from_time(arg.chgtime, arg.chgtimensec));
        }
        if arg.valid & consts::FATTR_BKUPTIME != 0 {
            changes.bkuptime = Some(system_time_from_time(arg.bkuptime, arg.bkuptimensec));
        }
        if arg.valid & consts::FATTR_FLAGS != 0 {
            changes.flags = Some(BsdFileFlags::from_bits_truncate(arg.flags));
        }
        changes
    }

    /// Local byte-range locks, used when the filesystem has no lock
    /// support of its own. Contended sleeping locks fail with EAGAIN
    /// rather than block the request loop.
    fn local_getlk(&self, nodeid: u64, owner: u64, wanted: &LockRecord) -> Lock {
        let conflict = self
            .nodes
            .get(nodeid)
            .and_then(|node| node.locks.iter().find(|held| held.conflicts(wanted)).copied());
        match conflict {
            Some(held) => Lock {
                range: (held.start, held.end),
                typ: held.typ,
                pid: held.pid,
            },
            None => Lock {
                range: (0, 0),
                typ: libc::F_UNLCK,
                pid: owner as u32,
            },
        }
    }

    fn local_setlk(&mut self, nodeid: u64, wanted: LockRecord) -> Result<(), Errno> {
        let Some(node) = self.nodes.get_mut(nodeid) else {
            return Err(Errno::ENOENT);
        };
        if wanted.typ == libc::F_UNLCK {
            node.locks
                .retain(|held| held.owner != wanted.owner || held.end < wanted.start || held.start > wanted.end);
            return Ok(());
        }
        if node.locks.iter().any(|held| held.conflicts(&wanted)) {
            return Err(Errno::EAGAIN);
        }
        node.locks
            .retain(|held| held.owner != wanted.owner || held.end < wanted.start || held.start > wanted.end);
        node.locks.push(wanted);
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn handle_request(&mut self, request: &AnyRequest<'_>) -> Result<Option<Response>, Errno> {
        let nodeid = request.nodeid().0;
        if let Operation::Init { arg } = request.operation() {
            return self.do_init(arg).map(Some);
        }
        if !self.initialized {
            warn!("ignoring operation before handshake: {request}");
            return Err(Errno::EIO);
        }
        let response = match request.operation() {
            Operation::Init { .. } => unreachable!("handled above"),
            Operation::Lookup { name } => {
                let path = self.child_path(nodeid, name)?;
                let attr = self.fs.getattr(&path)?;
                self.make_entry(nodeid, name, &attr)?
            }
            Operation::Forget { arg } => {
                self.nodes.forget(nodeid, arg.nlookup);
                return Ok(None);
            }
            Operation::GetAttr => {
                let path = self.path_of(nodeid)?;
                let attr = self.fs.getattr(&path)?;
                Response::new_attr(self.options.ttl, &attr)
            }
            Operation::SetAttr { arg } => {
                let path = self.path_of(nodeid)?;
                let (changes, fh) = Self::setattr_from_plain(arg);
                let attr = self.fs.setattr(&path, &changes, fh)?;
                if let Some(node) = self.nodes.get_mut(nodeid) {
                    node.cached_size = attr.size;
                    node.cached_mtime = Some(attr.mtime);
                }
                Response::new_attr(self.options.ttl, &attr)
            }
            Operation::SetAttrX { arg } => {
                let path = self.path_of(nodeid)?;
                let changes = Self::setattr_from_extended(arg);
                let attr = self.fs.setattr(&path, &changes, None)?;
                Response::new_attr(self.options.ttl, &attr)
            }
            Operation::ReadLink => {
                use std::os::unix::ffi::OsStrExt;
                let path = self.path_of(nodeid)?;
                let target = self.fs.readlink(&path)?;
                Response::new_data(target.as_os_str().as_bytes())
            }
            Operation::SymLink { name, link } => {
                let path = self.child_path(nodeid, name)?;
                let attr = self.fs.symlink(&path, std::path::Path::new(link))?;
                self.make_entry(nodeid, name, &attr)?
            }
            Operation::MkNod { arg, name } => {
                let path = self.child_path(nodeid, name)?;
                let attr = self.fs.mknod(&path, arg.mode, arg.rdev)?;
                self.make_entry(nodeid, name, &attr)?
            }
            Operation::MkDir { arg, name } => {
                let path = self.child_path(nodeid, name)?;
                let attr = self.fs.mkdir(&path, arg.mode)?;
                self.make_entry(nodeid, name, &attr)?
            }
            Operation::Unlink { name } => {
                let path = self.child_path(nodeid, name)?;
                self.fs.unlink(&path)?;
                let _ = self.nodes.remove(nodeid, name);
                Response::new_empty()
            }
            Operation::RmDir { name } => {
                let path = self.child_path(nodeid, name)?;
                self.fs.rmdir(&path)?;
                let _ = self.nodes.remove(nodeid, name);
                Response::new_empty()
            }
            Operation::Rename { arg, name, newname } => {
                let from = self.child_path(nodeid, name)?;
                let to = self.child_path(arg.newdir, newname)?;
                self.fs.rename(&from, &to)?;
                let hide = self
                    .nodes
                    .find(arg.newdir, newname)
                    .and_then(|id| self.nodes.get(id))
                    .is_some_and(|node| node.open_count > 0);
                self.nodes.rename(nodeid, name, arg.newdir, newname, hide)?;
                Response::new_empty()
            }
            Operation::Link { arg, name } => {
                let oldpath = self.path_of(arg.oldnodeid)?;
                let newpath = self.child_path(nodeid, name)?;
                let attr = self.fs.link(&oldpath, &newpath)?;
                self.make_entry(nodeid, name, &attr)?
            }
            Operation::Exchange {
                arg,
                oldname,
                newname,
            } => {
                let path1 = self.child_path(arg.olddir, oldname)?;
                let path2 = self.child_path(arg.newdir, newname)?;
                self.fs.exchange(&path1, &path2, arg.options)?;
                self.nodes
                    .exchange(arg.olddir, oldname, arg.newdir, newname)?;
                Response::new_empty()
            }
            Operation::Open { arg } => {
                let path = self.path_of(nodeid)?;
                let fh = self.fs.open(&path, OpenFlags(arg.flags as i32))?;
                self.nodes.open_inc(nodeid);
                Response::new_open(fh, FopenFlags::empty())
            }
            Operation::Read { arg } => {
                let path = self.path_of(nodeid)?;
                let data = self
                    .fs
                    .read(&path, FileHandle(arg.fh), arg.offset, arg.size)?;
                if data.len() > arg.size as usize {
                    return Err(Errno::EIO);
                }
                Response::new_data(data)
            }
            Operation::Write { arg, data } => {
                let path = self.path_of(nodeid)?;
                let written = self.fs.write(&path, FileHandle(arg.fh), arg.offset, data)?;
                Response::new_write(written)
            }
            Operation::StatFs => {
                let path = self.path_of(nodeid)?;
                let st = self.fs.statfs(&path)?;
                Response::new_statfs(
                    st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                    st.frsize,
                )
            }
            Operation::Release { arg } => {
                let path = self.path_of(nodeid)?;
                let result = self
                    .fs
                    .release(&path, FileHandle(arg.fh), OpenFlags(arg.flags as i32));
                self.nodes.open_dec(nodeid);
                result?;
                Response::new_empty()
            }
            Operation::FSync { arg } => {
                let path = self.path_of(nodeid)?;
                self.fs
                    .fsync(&path, FileHandle(arg.fh), arg.fsync_flags & 1 != 0)?;
                Response::new_empty()
            }
            Operation::Flush { arg } => {
                let path = self.path_of(nodeid)?;
                let result = self.fs.flush(&path, FileHandle(arg.fh));
                // The closing owner's local locks go away regardless.
                if let Some(node) = self.nodes.get_mut(nodeid) {
                    node.locks.retain(|held| held.owner != arg.lock_owner);
                }
                result?;
                Response::new_empty()
            }
            Operation::SetXAttr { arg, name, value } => {
                let path = self.path_of(nodeid)?;
                self.fs.setxattr(&path, name, value, arg.position)?;
                Response::new_empty()
            }
            Operation::GetXAttr { arg, name } => {
                let path = self.path_of(nodeid)?;
                let value = self.fs.getxattr(&path, name)?;
                if arg.size == 0 {
                    Response::new_xattr_size(value.len() as u32)
                } else if value.len() > arg.size as usize {
                    return Err(Errno::ERANGE);
                } else {
                    Response::new_data(value)
                }
            }
            Operation::ListXAttr { arg } => {
                use std::os::unix::ffi::OsStrExt;
                let path = self.path_of(nodeid)?;
                let names = self.fs.listxattr(&path)?;
                let mut packed = Vec::new();
                for name in names {
                    packed.extend_from_slice(name.as_bytes());
                    packed.push(0);
                }
                if arg.size == 0 {
                    Response::new_xattr_size(packed.len() as u32)
                } else if packed.len() > arg.size as usize {
                    return Err(Errno::ERANGE);
                } else {
                    Response::new_data(packed)
                }
            }
            Operation::RemoveXAttr { name } => {
                let path = self.path_of(nodeid)?;
                self.fs.removexattr(&path, name)?;
                Response::new_empty()
            }
            Operation::OpenDir { arg } => {
                let path = self.path_of(nodeid)?;
                let fh = self.fs.opendir(&path)?;
                let _ = arg;
                self.nodes.open_inc(nodeid);
                Response::new_open(fh, FopenFlags::empty())
            }
            Operation::ReadDir { arg } => {
                let path = self.path_of(nodeid)?;
                let entries = self.fs.readdir(&path, FileHandle(arg.fh))?;
                let mut list = DirEntList::new(arg.size as usize);
                for (index, entry) in entries.iter().enumerate() {
                    let offset = index as u64 + 1;
                    if offset <= arg.offset {
                        continue;
                    }
                    if list.push(entry.ino, offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                Response::new_directory(list)
            }
            Operation::ReleaseDir { arg } => {
                let path = self.path_of(nodeid)?;
                let result = self.fs.releasedir(&path, FileHandle(arg.fh));
                self.nodes.open_dec(nodeid);
                result?;
                Response::new_empty()
            }
            Operation::FSyncDir { arg } => {
                let path = self.path_of(nodeid)?;
                self.fs
                    .fsyncdir(&path, FileHandle(arg.fh), arg.fsync_flags & 1 != 0)?;
                Response::new_empty()
            }
            Operation::Access { arg } => {
                let path = self.path_of(nodeid)?;
                let mask = crate::AccessFlags::from_bits_truncate(arg.mask as i32);
                self.fs.access(&path, mask)?;
                Response::new_empty()
            }
            Operation::Create { arg, name } => {
                let path = self.child_path(nodeid, name)?;
                let (attr, fh) = self
                    .fs
                    .create(&path, arg.mode, OpenFlags(arg.flags as i32))?;
                let node = self.nodes.lookup(nodeid, name)?;
                let (id, generation) = (node.id, node.generation);
                self.nodes.open_inc(id);
                Response::new_create(
                    id,
                    Generation(generation),
                    &attr,
                    self.options.ttl,
                    fh,
                    FopenFlags::empty(),
                )
            }
            Operation::GetLk { arg } => {
                let path = self.path_of(nodeid)?;
                let wanted = LockRecord {
                    owner: arg.owner,
                    start: arg.lk.start,
                    end: arg.lk.end,
                    typ: arg.lk.typ,
                    pid: arg.lk.pid,
                };
                let lock = Lock {
                    range: (arg.lk.start, arg.lk.end),
                    typ: arg.lk.typ,
                    pid: arg.lk.pid,
                };
                match self.fs.getlk(&path, FileHandle(arg.fh), arg.owner, &lock) {
                    Ok(Some(held)) => Response::new_lock(&held),
                    Ok(None) => Response::new_lock(&Lock {
                        range: (0, 0),
                        typ: libc::F_UNLCK,
                        pid: 0,
                    }),
                    Err(errno) if errno == Errno::ENOSYS => {
                        Response::new_lock(&self.local_getlk(nodeid, arg.owner, &wanted))
                    }
                    Err(errno) => return Err(errno),
                }
            }
            Operation::SetLk { arg } | Operation::SetLkW { arg } => {
                let sleep = matches!(request.operation(), Operation::SetLkW { .. });
                let path = self.path_of(nodeid)?;
                let lock = Lock {
                    range: (arg.lk.start, arg.lk.end),
                    typ: arg.lk.typ,
                    pid: arg.lk.pid,
                };
                match self
                    .fs
                    .setlk(&path, FileHandle(arg.fh), arg.owner, &lock, sleep)
                {
                    Ok(()) => Response::new_empty(),
                    Err(errno) if errno == Errno::ENOSYS => {
                        self.local_setlk(
                            nodeid,
                            LockRecord {
                                owner: arg.owner,
                                start: arg.lk.start,
                                end: arg.lk.end,
                                typ: arg.lk.typ,
                                pid: arg.lk.pid,
                            },
                        )?;
                        Response::new_empty()
                    }
                    Err(errno) => return Err(errno),
                }
            }
            Operation::Interrupt { arg } => {
                // Serial loop: by the time an INTERRUPT is read, its target
                // has been answered. EAGAIN tells the driver to re-send if
                // it still cares; it stops once the target completes.
                debug!("interrupt for {} answered with EAGAIN", arg.unique);
                return Err(Errno::EAGAIN);
            }
            Operation::BMap { arg } => {
                let path = self.path_of(nodeid)?;
                let block = self.fs.bmap(&path, arg.blocksize, arg.block)?;
                Response::new_bmap(block)
            }
            Operation::SetVolName { name } => {
                self.fs.setvolname(name)?;
                Response::new_empty()
            }
            Operation::GetXTimes => {
                let path = self.path_of(nodeid)?;
                let xtimes = self.fs.getxtimes(&path)?;
                Response::new_xtimes(&xtimes)
            }
        };
        Ok(Some(response))
    }
}
