//! The VFS adapter.
//!
//! [`Volume`] is what a host VFS calls into: it translates per-operation
//! calls (lookup, read, write, readdir, …) into dispatches on the mount's
//! session, and keeps the driver-side caches coherent: attribute caches
//! with deadlines, a name cache, the per-(inode, access-mode) handle table,
//! the page store, and the hidden-deletion bookkeeping that preserves
//! open-unlink semantics on backing filesystems that cannot keep a file
//! with no link.

mod dirent;
mod ubc;
mod vnode;

use std::collections::HashMap;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use log::debug;
use log::warn;
use parking_lot::Condvar;
use parking_lot::Mutex;
use parking_lot::RwLock;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

use crate::AccessFlags;
use crate::BsdFileFlags;
use crate::Caller;
use crate::DirEntry;
use crate::FileAttr;
use crate::FileType;
use crate::TimeOrNow;
use crate::XTimes;
use crate::device::AlterVnode;
use crate::device::AlterVnodeCmd;
use crate::device::Device;
use crate::device::UbcFlags;
use crate::dispatch::CancelToken;
use crate::dispatch::DispatchOptions;
use crate::dispatch::dispatch;
use crate::dispatch::send_oneway;
use crate::ll::Errno;
use crate::ll::FileHandle;
use crate::ll::Generation;
use crate::ll::Lock;
use crate::ll::NodeId;
use crate::ll::Version;
use crate::ll::fuse_abi as abi;
use crate::ll::fuse_abi::FopenFlags;
use crate::ll::fuse_abi::InitFlags;
use crate::ll::fuse_abi::Opcode;
use crate::ll::fuse_abi::consts;
use crate::mount_options::MountConfig;
use crate::mount_options::MountOption;
use crate::open_flags::OpenAccMode;
use crate::session::MAX_WRITE_SIZE;
use crate::session::MountHooks;
use crate::session::Negotiated;
use crate::session::Session;
use crate::ticket::SharedSlice;
use crate::ticket::TicketReply;
use crate::time::system_time_from_time;
use crate::time::time_from_system_time;

use self::vnode::HiddenRecord;
use self::vnode::Vnode;

/// TTL for cached negative lookups; the daemon has no say in it.
const NEGATIVE_TTL: Duration = Duration::from_secs(1);
/// Buffer size requested per READDIR round trip.
const READDIR_CHUNK: u32 = 8192;
/// Readahead window requested during INIT.
const MAX_READAHEAD: u32 = 128 * 1024;

/// The result of a LOOKUP/CREATE style operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Node the name resolved to
    pub ino: NodeId,
    /// Incarnation of the node id
    pub generation: Generation,
    /// Its attributes at resolution time
    pub attr: FileAttr,
}

/// Filesystem-wide statistics as returned by STATFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub struct Statfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// What a SETATTR call wants changed. Unset fields are left alone.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub crtime: Option<SystemTime>,
    pub chgtime: Option<SystemTime>,
    pub bkuptime: Option<SystemTime>,
    pub flags: Option<BsdFileFlags>,
}

impl SetAttrRequest {
    fn wants_extended(&self) -> bool {
        self.crtime.is_some()
            || self.chgtime.is_some()
            || self.bkuptime.is_some()
            || self.flags.is_some()
    }
}

/// Identity and cancellation context of one VFS call.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Credentials stamped into the request header.
    pub caller: Caller,
    /// Absolute deadline; expiry behaves like an interrupt.
    pub deadline: Option<Instant>,
    /// Cooperative cancellation for the blocked call.
    pub cancel: Option<CancelToken>,
}

impl CallContext {
    /// A context with the given credentials and no deadline.
    pub fn new(caller: Caller) -> CallContext {
        CallContext {
            caller,
            deadline: None,
            cancel: None,
        }
    }

    /// Sets an absolute deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> CallContext {
        self.deadline = Some(deadline);
        self
    }

    /// Attaches a cancel token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> CallContext {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum NameEntry {
    Positive { ino: u64, until: Instant },
    Negative { until: Instant },
}

/// Serializes racy windows: a CREATE in flight under a name, or a first
/// OPEN in flight on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Window {
    Name(u64, OsString),
    Open(u64, i32),
    Dir(u64),
}

struct VolumeShared {
    session: Arc<Session>,
    device: Arc<Device>,
    slot: usize,
    config: MountConfig,
    owner: Caller,
    vnodes: RwLock<HashMap<u64, Arc<Vnode>>>,
    /// Authoritative (parent, name) → ino mirror, independent of cache TTLs.
    links: Mutex<HashMap<(u64, OsString), u64>>,
    name_cache: Mutex<HashMap<(u64, OsString), NameEntry>>,
    windows: Mutex<HashSet<Window>>,
    window_cv: Condvar,
    hidden_seq: AtomicU64,
    unmounted: AtomicBool,
}

impl std::fmt::Debug for VolumeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeShared")
            .field("slot", &self.slot)
            .field("vnodes", &self.vnodes.read().len())
            .finish_non_exhaustive()
    }
}

/// One mounted filesystem, as seen by the host VFS.
#[derive(Debug)]
pub struct Volume {
    shared: Arc<VolumeShared>,
}

fn decode_attr(wire: &abi::fuse_attr) -> Result<FileAttr, Errno> {
    let kind = FileType::from_mode(wire.mode).ok_or(Errno::EIO)?;
    Ok(FileAttr {
        ino: NodeId(wire.ino),
        size: wire.size,
        blocks: wire.blocks,
        atime: system_time_from_time(wire.atime, wire.atimensec),
        mtime: system_time_from_time(wire.mtime, wire.mtimensec),
        ctime: system_time_from_time(wire.ctime, wire.ctimensec),
        crtime: system_time_from_time(wire.crtime, wire.crtimensec),
        kind,
        perm: (wire.mode & 0o7777) as u16,
        nlink: wire.nlink,
        uid: wire.uid,
        gid: wire.gid,
        rdev: wire.rdev,
        blksize: wire.blksize,
        flags: wire.flags,
    })
}

fn read_reply<T: FromBytes>(reply: &TicketReply) -> Result<T, Errno> {
    T::read_from_prefix(&reply.data)
        .map(|(value, _)| value)
        .map_err(|_| Errno::EIO)
}

fn name_bytes(name: &OsStr) -> Result<Vec<u8>, Errno> {
    use std::os::unix::ffi::OsStrExt;
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > abi::NAME_MAX {
        return Err(Errno::ENAMETOOLONG);
    }
    if bytes.contains(&0) || bytes.contains(&b'/') {
        return Err(Errno::EINVAL);
    }
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.extend_from_slice(bytes);
    out.push(0);
    Ok(out)
}

impl Volume {
    /// Mounts a filesystem: binds a fresh session to an opened slot and
    /// performs the INIT handshake. A server must already be reading the
    /// slot, or the handshake never completes.
    pub fn mount(
        device: &Arc<Device>,
        slot: usize,
        options: &[MountOption],
        owner: Caller,
    ) -> Result<Volume, Errno> {
        let config = MountConfig::parse(options)?;
        let (server_pid, nonce) = device.slot_server(slot)?;
        let session = Session::new(server_pid, nonce, config.blocksize, config.daemon_timeout);
        device.attach_session(slot, session.clone())?;
        session.set_mounted(true);

        match Self::handshake(&session, &owner) {
            Ok(()) => {}
            Err(errno) => {
                session.set_mounted(false);
                session.mark_dead("handshake failed");
                device.reap_session(slot);
                return Err(errno);
            }
        }

        let shared = Arc::new(VolumeShared {
            session: session.clone(),
            device: device.clone(),
            slot,
            config,
            owner,
            vnodes: RwLock::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            name_cache: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashSet::new()),
            window_cv: Condvar::new(),
            hidden_seq: AtomicU64::new(nonce),
            unmounted: AtomicBool::new(false),
        });
        let dyn_shared: Arc<dyn MountHooks> = shared.clone();
        let hooks: std::sync::Weak<dyn MountHooks> = Arc::downgrade(&dyn_shared);
        session.set_hooks(hooks);
        shared.vnodes.write().insert(
            abi::ROOT_ID,
            Arc::new(Vnode::new(
                NodeId::ROOT,
                Generation(0),
                NodeId::ROOT,
                OsString::from("/"),
            )),
        );
        if let Some(volname) = shared.config.volname.clone() {
            let ctx = CallContext::new(owner);
            if let Err(errno) = shared.setvolname(&ctx, OsStr::new(&volname)) {
                debug!("volname not applied: {errno}");
            }
        }
        Ok(Volume { shared })
    }

    fn handshake(session: &Arc<Session>, owner: &Caller) -> Result<(), Errno> {
        session.mark_init_sent();
        let requested = InitFlags::ASYNC_READ
            | InitFlags::BIG_WRITES
            | InitFlags::CASE_INSENSITIVE
            | InitFlags::VOL_RENAME
            | InitFlags::XTIMES;
        let payload = abi::fuse_init_in {
            major: abi::KERNEL_VERSION,
            minor: abi::KERNEL_MINOR_VERSION,
            max_readahead: MAX_READAHEAD,
            flags: requested.bits(),
        };
        let reply = dispatch(
            session,
            owner,
            Opcode::Init,
            NodeId::ROOT,
            payload.as_bytes(),
            None,
            DispatchOptions::default(),
        )?;
        let init: abi::fuse_init_out = read_reply(&reply)?;
        if init.major != abi::KERNEL_VERSION || init.minor < abi::MIN_DAEMON_MINOR_VERSION {
            warn!(
                "daemon speaks {}.{}, need {}.{}+",
                init.major,
                init.minor,
                abi::KERNEL_VERSION,
                abi::MIN_DAEMON_MINOR_VERSION
            );
            return Err(Errno::EPROTONOSUPPORT);
        }
        let negotiated = Negotiated {
            proto: Version {
                major: init.major,
                minor: init.minor,
            },
            flags: InitFlags::from_bits_truncate(init.flags) & requested,
            max_write: init.max_write.min(MAX_WRITE_SIZE as u32).max(4096),
        };
        debug!(
            "handshake complete: {}, flags {:?}, max_write {}",
            negotiated.proto, negotiated.flags, negotiated.max_write
        );
        session.complete_init(negotiated);
        Ok(())
    }

    /// Capability flags the daemon accepted during INIT.
    pub fn negotiated_flags(&self) -> InitFlags {
        self.shared.session.negotiated().flags
    }

    /// Detaches the mount. Every waiter completes with "connection lost";
    /// the session object survives until the server also closes its slot.
    pub fn unmount(&self) {
        self.shared.unmount();
    }

    // Forwarders; the logic lives on the shared state so the endpoint's
    // ioctl hooks can reach it too.

    /// Resolves `name` under `parent`.
    pub fn lookup(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<Entry, Errno> {
        self.shared.lookup(ctx, parent, name)
    }

    /// Drops the driver's references to a node (vnode reclaim).
    pub fn reclaim(&self, ino: NodeId) {
        self.shared.reclaim(ino);
    }

    /// File attributes, from cache when fresh.
    pub fn getattr(&self, ctx: &CallContext, ino: NodeId) -> Result<FileAttr, Errno> {
        self.shared.getattr(ctx, ino)
    }

    /// Changes attributes; size changes flush and drop cached pages.
    pub fn setattr(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        changes: &SetAttrRequest,
    ) -> Result<FileAttr, Errno> {
        self.shared.setattr(ctx, ino, changes)
    }

    /// Reads a symbolic link's target.
    pub fn readlink(&self, ctx: &CallContext, ino: NodeId) -> Result<PathBuf, Errno> {
        self.shared.readlink(ctx, ino)
    }

    /// Creates a device node, fifo, socket or regular file.
    pub fn mknod(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<Entry, Errno> {
        self.shared.mknod(ctx, parent, name, mode, rdev)
    }

    /// Creates a directory.
    pub fn mkdir(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
    ) -> Result<Entry, Errno> {
        self.shared.mkdir(ctx, parent, name, mode)
    }

    /// Creates a symbolic link.
    pub fn symlink(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<Entry, Errno> {
        self.shared.symlink(ctx, parent, name, target)
    }

    /// Creates a hard link.
    pub fn link(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        newparent: NodeId,
        newname: &OsStr,
    ) -> Result<Entry, Errno> {
        self.shared.link(ctx, ino, newparent, newname)
    }

    /// Removes a name. An open file is hidden-renamed instead, and really
    /// unlinked after its last close.
    pub fn unlink(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.shared.unlink(ctx, parent, name)
    }

    /// Removes a directory.
    pub fn rmdir(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.shared.rmdir(ctx, parent, name)
    }

    /// Renames a name; an open target is hidden first.
    pub fn rename(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
    ) -> Result<(), Errno> {
        self.shared.rename(ctx, parent, name, newparent, newname)
    }

    /// Atomically swaps the contents of two existing paths.
    pub fn exchange(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        options: u64,
    ) -> Result<(), Errno> {
        self.shared
            .exchange(ctx, parent, name, newparent, newname, options)
    }

    /// Opens a file for the given access mode, reusing the per-mode handle.
    pub fn open(&self, ctx: &CallContext, ino: NodeId, acc: OpenAccMode) -> Result<(), Errno> {
        self.shared.open(ctx, ino, acc)
    }

    /// Closes one reference; the last close releases the daemon handle and
    /// completes any deferred hidden unlink.
    pub fn release(&self, ctx: &CallContext, ino: NodeId, acc: OpenAccMode) -> Result<(), Errno> {
        self.shared.release(ctx, ino, acc)
    }

    /// Reads file data, from the page store when possible.
    pub fn read(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, Errno> {
        self.shared.read(ctx, ino, offset, size)
    }

    /// Writes file data, chunked by the negotiated write size.
    pub fn write(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Errno> {
        self.shared.write(ctx, ino, offset, data)
    }

    /// Flushes on close(2); pushes dirty pages first.
    pub fn flush(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.shared.flush(ctx, ino)
    }

    /// Synchronizes file contents.
    pub fn fsync(&self, ctx: &CallContext, ino: NodeId, datasync: bool) -> Result<(), Errno> {
        self.shared.fsync(ctx, ino, datasync)
    }

    /// Opens the directory stream.
    pub fn opendir(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.shared.opendir(ctx, ino)
    }

    /// Reads the whole directory, decoding the packed entry stream.
    pub fn readdir(&self, ctx: &CallContext, ino: NodeId) -> Result<Vec<DirEntry>, Errno> {
        self.shared.readdir(ctx, ino)
    }

    /// Closes the directory stream.
    pub fn releasedir(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.shared.releasedir(ctx, ino)
    }

    /// Synchronizes directory contents.
    pub fn fsyncdir(&self, ctx: &CallContext, ino: NodeId, datasync: bool) -> Result<(), Errno> {
        self.shared.fsyncdir(ctx, ino, datasync)
    }

    /// Filesystem statistics.
    pub fn statfs(&self, ctx: &CallContext) -> Result<Statfs, Errno> {
        self.shared.statfs(ctx)
    }

    /// Permission check, honoring the permission mount options.
    pub fn access(&self, ctx: &CallContext, ino: NodeId, mask: AccessFlags) -> Result<(), Errno> {
        self.shared.access(ctx, ino, mask)
    }

    /// Creates and opens a file in one round trip.
    pub fn create(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        acc: OpenAccMode,
    ) -> Result<Entry, Errno> {
        self.shared.create(ctx, parent, name, mode, acc)
    }

    /// Sets an extended attribute.
    pub fn setxattr(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        name: &OsStr,
        value: &[u8],
        position: u32,
    ) -> Result<(), Errno> {
        self.shared.setxattr(ctx, ino, name, value, position)
    }

    /// Reads an extended attribute.
    pub fn getxattr(&self, ctx: &CallContext, ino: NodeId, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.shared.getxattr(ctx, ino, name)
    }

    /// Lists extended attribute names.
    pub fn listxattr(&self, ctx: &CallContext, ino: NodeId) -> Result<Vec<OsString>, Errno> {
        self.shared.listxattr(ctx, ino)
    }

    /// Removes an extended attribute.
    pub fn removexattr(&self, ctx: &CallContext, ino: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.shared.removexattr(ctx, ino, name)
    }

    /// Tests for a byte-range lock.
    pub fn getlk(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        owner: u64,
        lock: Lock,
    ) -> Result<Lock, Errno> {
        self.shared.getlk(ctx, ino, owner, lock)
    }

    /// Acquires or releases a byte-range lock.
    pub fn setlk(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        owner: u64,
        lock: Lock,
        sleep: bool,
    ) -> Result<(), Errno> {
        self.shared.setlk(ctx, ino, owner, lock, sleep)
    }

    /// Maps a file block to a device block.
    pub fn bmap(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        blocksize: u32,
        block: u64,
    ) -> Result<u64, Errno> {
        self.shared.bmap(ctx, ino, blocksize, block)
    }

    /// Backup and creation times; zeroed when the daemon lacks them.
    pub fn getxtimes(&self, ctx: &CallContext, ino: NodeId) -> Result<XTimes, Errno> {
        self.shared.getxtimes(ctx, ino)
    }

    /// Renames the volume, when the daemon negotiated it.
    pub fn setvolname(&self, ctx: &CallContext, name: &OsStr) -> Result<(), Errno> {
        self.shared.setvolname(ctx, name)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.shared.unmount();
    }
}

impl VolumeShared {
    // --- plumbing ---

    fn call(
        &self,
        ctx: &CallContext,
        opcode: Opcode,
        nodeid: NodeId,
        payload: &[u8],
    ) -> Result<TicketReply, Errno> {
        self.call_data(ctx, opcode, nodeid, payload, None)
    }

    fn call_data(
        &self,
        ctx: &CallContext,
        opcode: Opcode,
        nodeid: NodeId,
        payload: &[u8],
        data: Option<SharedSlice>,
    ) -> Result<TicketReply, Errno> {
        dispatch(
            &self.session,
            &ctx.caller,
            opcode,
            nodeid,
            payload,
            data,
            DispatchOptions {
                deadline: ctx.deadline,
                cancel: ctx.cancel.as_ref(),
            },
        )
    }

    /// The mount-owner check that precedes every operation.
    fn gate(&self, ctx: &CallContext) -> Result<(), Errno> {
        let uid = ctx.caller.uid;
        if uid == self.owner.uid || self.config.allow_other {
            return Ok(());
        }
        if self.config.allow_root && uid == 0 {
            return Ok(());
        }
        Err(Errno::EACCES)
    }

    fn attr_ttl(&self, secs: u64, nsecs: u32) -> Option<Duration> {
        if self.config.no_attrcache {
            None
        } else {
            Some(Duration::new(secs, nsecs))
        }
    }

    /// Without the sparse option every regular file is assumed densely
    /// allocated; the daemon's block count is recomputed from the size.
    fn adjust_attr(&self, attr: &mut FileAttr) {
        if !self.config.sparse && attr.kind == FileType::RegularFile {
            attr.blocks = attr.size.div_ceil(512);
        }
    }

    fn vnode(&self, ino: NodeId) -> Arc<Vnode> {
        if let Some(vnode) = self.vnodes.read().get(&ino.0) {
            return vnode.clone();
        }
        let mut vnodes = self.vnodes.write();
        vnodes
            .entry(ino.0)
            .or_insert_with(|| {
                Arc::new(Vnode::new(
                    ino,
                    Generation(0),
                    NodeId(abi::UNKNOWN_NODE_ID),
                    OsString::new(),
                ))
            })
            .clone()
    }

    fn known_vnode(&self, ino: u64) -> Option<Arc<Vnode>> {
        self.vnodes.read().get(&ino).cloned()
    }

    // --- windows (CREATE→OPEN and first-open serialization) ---

    fn enter_window(&self, window: Window) {
        let mut windows = self.windows.lock();
        while windows.contains(&window) {
            self.window_cv.wait(&mut windows);
        }
        windows.insert(window);
    }

    fn leave_window(&self, window: &Window) {
        let mut windows = self.windows.lock();
        windows.remove(window);
        drop(windows);
        self.window_cv.notify_all();
    }

    fn wait_window(&self, window: &Window) {
        let mut windows = self.windows.lock();
        while windows.contains(window) {
            self.window_cv.wait(&mut windows);
        }
    }

    // --- name cache ---

    fn cache_positive(&self, parent: NodeId, name: &OsStr, ino: u64, ttl: Duration) {
        self.links
            .lock()
            .insert((parent.0, name.to_owned()), ino);
        if !self.config.no_vncache {
            self.name_cache.lock().insert(
                (parent.0, name.to_owned()),
                NameEntry::Positive {
                    ino,
                    until: Instant::now() + ttl,
                },
            );
        }
    }

    fn cache_negative(&self, parent: NodeId, name: &OsStr) {
        if self.config.negative_vncache {
            self.name_cache.lock().insert(
                (parent.0, name.to_owned()),
                NameEntry::Negative {
                    until: Instant::now() + NEGATIVE_TTL,
                },
            );
        }
    }

    fn uncache_name(&self, parent: NodeId, name: &OsStr) {
        let key = (parent.0, name.to_owned());
        self.links.lock().remove(&key);
        self.name_cache.lock().remove(&key);
    }

    fn cached_name(&self, parent: NodeId, name: &OsStr) -> Option<NameEntry> {
        if self.config.no_vncache {
            return None;
        }
        let key = (parent.0, name.to_owned());
        let mut cache = self.name_cache.lock();
        let expired = matches!(
            cache.get(&key),
            Some(NameEntry::Positive { until, .. } | NameEntry::Negative { until })
                if *until <= Instant::now()
        );
        if expired {
            cache.remove(&key);
            return None;
        }
        cache.get(&key).copied()
    }

    fn known_ino(&self, parent: NodeId, name: &OsStr) -> Option<u64> {
        self.links.lock().get(&(parent.0, name.to_owned())).copied()
    }

    /// The disappearing-inode path: drop every local trace of a node the
    /// daemon no longer recognises and schedule it for recycling.
    fn soft_revoke(&self, ino: u64) {
        debug!("soft revoke of node {ino:#x}");
        self.links.lock().retain(|_, v| *v != ino);
        self.name_cache.lock().retain(|_, entry| {
            !matches!(entry, NameEntry::Positive { ino: cached, .. } if *cached == ino)
        });
        self.reclaim(NodeId(ino));
    }

    fn reclaim(&self, ino: NodeId) {
        if ino == NodeId::ROOT {
            return;
        }
        let Some(vnode) = self.vnodes.write().remove(&ino.0) else {
            return;
        };
        {
            let meta = vnode.meta.lock();
            debug!("reclaiming node {ino} ({}, {:?})", meta.parent, meta.name);
        }
        let nlookup = vnode.nlookup_take();
        if nlookup > 0 && !self.session.is_dead() {
            let payload = abi::fuse_forget_in { nlookup };
            let ctx = CallContext::new(self.owner);
            if let Err(errno) =
                send_oneway(&self.session, &ctx.caller, Opcode::Forget, ino, payload.as_bytes())
            {
                debug!("forget for {ino} not sent: {errno}");
            }
        }
    }

    fn unmount(&self) {
        if self.unmounted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.set_mounted(false);
        self.session.mark_dead("unmounted");
        self.device.reap_session(self.slot);
    }

    // --- operations ---

    fn lookup(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<Entry, Errno> {
        self.gate(ctx)?;
        self.wait_window(&Window::Name(parent.0, name.to_owned()));
        match self.cached_name(parent, name) {
            Some(NameEntry::Negative { .. }) => return Err(Errno::ENOENT),
            Some(NameEntry::Positive { ino, .. }) => {
                if let Some(vnode) = self.known_vnode(ino) {
                    if let Some(attr) = vnode.attr() {
                        vnode.nlookup_inc();
                        return Ok(Entry {
                            ino: NodeId(ino),
                            generation: vnode.generation,
                            attr,
                        });
                    }
                }
            }
            None => {}
        }
        let payload = name_bytes(name)?;
        match self.call(ctx, Opcode::Lookup, parent, &payload) {
            Ok(reply) => {
                let entry: abi::fuse_entry_out = read_reply(&reply)?;
                if entry.nodeid == 0 {
                    self.cache_negative(parent, name);
                    return Err(Errno::ENOENT);
                }
                self.finish_entry(parent, name, &entry)
            }
            Err(errno) if errno == Errno::ENOENT => {
                if let Some(stale) = self.known_ino(parent, name) {
                    self.soft_revoke(stale);
                }
                self.uncache_name(parent, name);
                self.cache_negative(parent, name);
                Err(Errno::ENOENT)
            }
            Err(errno) => Err(errno),
        }
    }

    /// Registers the node named by an entry reply and builds the caller's
    /// view of it.
    fn finish_entry(
        &self,
        parent: NodeId,
        name: &OsStr,
        entry: &abi::fuse_entry_out,
    ) -> Result<Entry, Errno> {
        let mut attr = decode_attr(&entry.attr)?;
        self.adjust_attr(&mut attr);
        let ino = NodeId(entry.nodeid);
        let vnode = {
            let mut vnodes = self.vnodes.write();
            vnodes
                .entry(entry.nodeid)
                .or_insert_with(|| {
                    Arc::new(Vnode::new(
                        ino,
                        Generation(entry.generation),
                        parent,
                        name.to_owned(),
                    ))
                })
                .clone()
        };
        vnode.nlookup_inc();
        {
            let mut meta = vnode.meta.lock();
            meta.parent = parent;
            meta.name = name.to_owned();
        }
        vnode.store_attr(
            &attr,
            self.attr_ttl(entry.attr_valid, entry.attr_valid_nsec),
        );
        self.cache_positive(
            parent,
            name,
            entry.nodeid,
            Duration::new(entry.entry_valid, entry.entry_valid_nsec),
        );
        Ok(Entry {
            ino,
            generation: vnode.generation,
            attr,
        })
    }

    fn getattr(&self, ctx: &CallContext, ino: NodeId) -> Result<FileAttr, Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        if let Some(attr) = vnode.attr() {
            return Ok(attr);
        }
        let reply = self.call(ctx, Opcode::GetAttr, ino, &[])?;
        let out: abi::fuse_attr_out = read_reply(&reply)?;
        let mut attr = decode_attr(&out.attr)?;
        self.adjust_attr(&mut attr);
        vnode.store_attr(&attr, self.attr_ttl(out.attr_valid, out.attr_valid_nsec));
        Ok(attr)
    }

    fn setattr(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        changes: &SetAttrRequest,
    ) -> Result<FileAttr, Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let resizing = changes.size.is_some();
        if resizing {
            self.push_dirty(ctx, &vnode)?;
        }

        let reply = if changes.wants_extended() && self.config.xtimes {
            match self.setattr_extended(ctx, ino, changes) {
                Err(errno) if errno == Errno::ENOSYS => {
                    self.setattr_plain(ctx, ino, &vnode, changes)
                }
                other => other,
            }
        } else {
            self.setattr_plain(ctx, ino, &vnode, changes)
        }?;

        let out: abi::fuse_attr_out = read_reply(&reply)?;
        let mut attr = decode_attr(&out.attr)?;
        self.adjust_attr(&mut attr);
        vnode.store_attr(&attr, self.attr_ttl(out.attr_valid, out.attr_valid_nsec));
        if resizing {
            // Cached pages must never shadow the daemon's view of a
            // resized file.
            vnode.pages.invalidate();
        }
        Ok(attr)
    }

    fn setattr_plain(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        vnode: &Vnode,
        changes: &SetAttrRequest,
    ) -> Result<TicketReply, Errno> {
        let mut arg = abi::fuse_setattr_in {
            valid: 0,
            padding: 0,
            fh: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            atimensec: 0,
            mtimensec: 0,
            mode: 0,
            unused: 0,
            uid: 0,
            gid: 0,
        };
        if let Some(mode) = changes.mode {
            arg.valid |= consts::FATTR_MODE;
            arg.mode = mode;
        }
        if let Some(uid) = changes.uid {
            arg.valid |= consts::FATTR_UID;
            arg.uid = uid;
        }
        if let Some(gid) = changes.gid {
            arg.valid |= consts::FATTR_GID;
            arg.gid = gid;
        }
        if let Some(size) = changes.size {
            arg.valid |= consts::FATTR_SIZE;
            arg.size = size;
            if let Some(fh) = vnode.write_handle() {
                arg.valid |= consts::FATTR_FH;
                arg.fh = fh.0;
            }
        }
        match changes.atime {
            Some(TimeOrNow::SpecificTime(t)) => {
                arg.valid |= consts::FATTR_ATIME;
                (arg.atime, arg.atimensec) = time_from_system_time(&t);
            }
            Some(TimeOrNow::Now) => arg.valid |= consts::FATTR_ATIME | consts::FATTR_ATIME_NOW,
            None => {}
        }
        match changes.mtime {
            Some(TimeOrNow::SpecificTime(t)) => {
                arg.valid |= consts::FATTR_MTIME;
                (arg.mtime, arg.mtimensec) = time_from_system_time(&t);
            }
            Some(TimeOrNow::Now) => arg.valid |= consts::FATTR_MTIME | consts::FATTR_MTIME_NOW,
            None => {}
        }
        self.call(ctx, Opcode::SetAttr, ino, arg.as_bytes())
    }

    fn setattr_extended(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        changes: &SetAttrRequest,
    ) -> Result<TicketReply, Errno> {
        let mut arg = abi::fuse_setattr_x_in {
            valid: 0,
            mode: 0,
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            bkuptime: 0,
            chgtime: 0,
            crtime: 0,
            atimensec: 0,
            mtimensec: 0,
            bkuptimensec: 0,
            chgtimensec: 0,
            crtimensec: 0,
            flags: 0,
        };
        if let Some(mode) = changes.mode {
            arg.valid |= consts::FATTR_MODE;
            arg.mode = mode;
        }
        if let Some(uid) = changes.uid {
            arg.valid |= consts::FATTR_UID;
            arg.uid = uid;
        }
        if let Some(gid) = changes.gid {
            arg.valid |= consts::FATTR_GID;
            arg.gid = gid;
        }
        if let Some(size) = changes.size {
            arg.valid |= consts::FATTR_SIZE;
            arg.size = size;
        }
        match changes.atime {
            Some(TimeOrNow::SpecificTime(t)) => {
                arg.valid |= consts::FATTR_ATIME;
                (arg.atime, arg.atimensec) = time_from_system_time(&t);
            }
            Some(TimeOrNow::Now) => arg.valid |= consts::FATTR_ATIME | consts::FATTR_ATIME_NOW,
            None => {}
        }
        match changes.mtime {
            Some(TimeOrNow::SpecificTime(t)) => {
                arg.valid |= consts::FATTR_MTIME;
                (arg.mtime, arg.mtimensec) = time_from_system_time(&t);
            }
            Some(TimeOrNow::Now) => arg.valid |= consts::FATTR_MTIME | consts::FATTR_MTIME_NOW,
            None => {}
        }
        if let Some(t) = changes.crtime {
            arg.valid |= consts::FATTR_CRTIME;
            (arg.crtime, arg.crtimensec) = time_from_system_time(&t);
        }
        if let Some(t) = changes.chgtime {
            arg.valid |= consts::FATTR_CHGTIME;
            (arg.chgtime, arg.chgtimensec) = time_from_system_time(&t);
        }
        if let Some(t) = changes.bkuptime {
            arg.valid |= consts::FATTR_BKUPTIME;
            (arg.bkuptime, arg.bkuptimensec) = time_from_system_time(&t);
        }
        if let Some(flags) = changes.flags {
            arg.valid |= consts::FATTR_FLAGS;
            arg.flags = flags.bits();
        }
        self.call(ctx, Opcode::SetAttrX, ino, arg.as_bytes())
    }

    fn readlink(&self, ctx: &CallContext, ino: NodeId) -> Result<PathBuf, Errno> {
        use std::os::unix::ffi::OsStringExt;
        self.gate(ctx)?;
        let reply = self.call(ctx, Opcode::ReadLink, ino, &[])?;
        Ok(PathBuf::from(OsString::from_vec(reply.data)))
    }

    fn mknod(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<Entry, Errno> {
        self.gate(ctx)?;
        let arg = abi::fuse_mknod_in { mode, rdev };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        let reply = self.call(ctx, Opcode::MkNod, parent, &payload)?;
        let entry: abi::fuse_entry_out = read_reply(&reply)?;
        self.finish_entry(parent, name, &entry)
    }

    fn mkdir(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
    ) -> Result<Entry, Errno> {
        self.gate(ctx)?;
        let arg = abi::fuse_mkdir_in { mode, padding: 0 };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        let reply = self.call(ctx, Opcode::MkDir, parent, &payload)?;
        let entry: abi::fuse_entry_out = read_reply(&reply)?;
        self.finish_entry(parent, name, &entry)
    }

    fn symlink(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        target: &OsStr,
    ) -> Result<Entry, Errno> {
        use std::os::unix::ffi::OsStrExt;
        self.gate(ctx)?;
        let mut payload = name_bytes(name)?;
        payload.extend_from_slice(target.as_bytes());
        payload.push(0);
        let reply = self.call(ctx, Opcode::SymLink, parent, &payload)?;
        let entry: abi::fuse_entry_out = read_reply(&reply)?;
        self.finish_entry(parent, name, &entry)
    }

    fn link(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        newparent: NodeId,
        newname: &OsStr,
    ) -> Result<Entry, Errno> {
        self.gate(ctx)?;
        let arg = abi::fuse_link_in { oldnodeid: ino.0 };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(newname)?);
        let reply = self.call(ctx, Opcode::Link, newparent, &payload)?;
        let entry: abi::fuse_entry_out = read_reply(&reply)?;
        // The link count of the original changed.
        if let Some(vnode) = self.known_vnode(ino.0) {
            vnode.invalidate_attr();
        }
        self.finish_entry(newparent, newname, &entry)
    }

    fn fresh_hidden_name(&self) -> OsString {
        let seq = self.hidden_seq.fetch_add(1, Ordering::Relaxed);
        OsString::from(format!(".fuse_hidden{:016x}", seq))
    }

    /// Renames an open file out of the way instead of unlinking it, so
    /// existing handles keep working. The real unlink follows the last
    /// close.
    fn hide_node(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        vnode: &Arc<Vnode>,
    ) -> Result<(), Errno> {
        let hidden_name = self.fresh_hidden_name();
        let arg = abi::fuse_rename_in { newdir: parent.0 };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        payload.extend_from_slice(&name_bytes(&hidden_name)?);
        self.call(ctx, Opcode::Rename, parent, &payload)?;
        vnode.set_hidden(HiddenRecord {
            parent,
            name: hidden_name.clone(),
        });
        {
            let mut meta = vnode.meta.lock();
            meta.parent = parent;
            meta.name = hidden_name.clone();
        }
        self.uncache_name(parent, name);
        self.links
            .lock()
            .insert((parent.0, hidden_name), vnode.ino.0);
        Ok(())
    }

    fn unlink(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.gate(ctx)?;
        let open_vnode = self
            .known_ino(parent, name)
            .and_then(|ino| self.known_vnode(ino))
            .filter(|v| v.open_refs() > 0);
        if let Some(vnode) = open_vnode {
            if !self.config.hard_remove {
                return self.hide_node(ctx, parent, name, &vnode);
            }
        }
        let payload = name_bytes(name)?;
        self.call(ctx, Opcode::Unlink, parent, &payload)?;
        if let Some(ino) = self.known_ino(parent, name) {
            if let Some(vnode) = self.known_vnode(ino) {
                // The node's own link count changed; siblings of a
                // multi-link file are left to refresh on their own.
                vnode.invalidate_attr();
            }
        }
        self.uncache_name(parent, name);
        Ok(())
    }

    fn rmdir(&self, ctx: &CallContext, parent: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.gate(ctx)?;
        let payload = name_bytes(name)?;
        self.call(ctx, Opcode::RmDir, parent, &payload)?;
        self.uncache_name(parent, name);
        Ok(())
    }

    fn rename(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
    ) -> Result<(), Errno> {
        self.gate(ctx)?;
        // An open target must survive being overwritten.
        let open_target = self
            .known_ino(newparent, newname)
            .and_then(|ino| self.known_vnode(ino))
            .filter(|v| v.open_refs() > 0);
        if let Some(target) = open_target {
            if !self.config.hard_remove {
                self.hide_node(ctx, newparent, newname, &target)?;
            }
        }
        let arg = abi::fuse_rename_in {
            newdir: newparent.0,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        payload.extend_from_slice(&name_bytes(newname)?);
        self.call(ctx, Opcode::Rename, parent, &payload)?;

        let moved = self.known_ino(parent, name);
        self.uncache_name(parent, name);
        self.uncache_name(newparent, newname);
        if let Some(ino) = moved {
            self.links
                .lock()
                .insert((newparent.0, newname.to_owned()), ino);
            if let Some(vnode) = self.known_vnode(ino) {
                let mut meta = vnode.meta.lock();
                meta.parent = newparent;
                meta.name = newname.to_owned();
                drop(meta);
                vnode.invalidate_attr();
            }
        }
        Ok(())
    }

    fn exchange(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        newparent: NodeId,
        newname: &OsStr,
        options: u64,
    ) -> Result<(), Errno> {
        self.gate(ctx)?;
        let a = self.lookup(ctx, parent, name)?;
        let b = self.lookup(ctx, newparent, newname)?;
        let va = self.vnode(a.ino);
        let vb = self.vnode(b.ino);
        // Neither side's cached pages may survive the swap.
        self.push_dirty(ctx, &va)?;
        self.push_dirty(ctx, &vb)?;

        let arg = abi::fuse_exchange_in {
            olddir: parent.0,
            newdir: newparent.0,
            options,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        payload.extend_from_slice(&name_bytes(newname)?);
        self.call(ctx, Opcode::Exchange, parent, &payload)?;

        va.pages.invalidate();
        vb.pages.invalidate();
        va.invalidate_attr();
        vb.invalidate_attr();
        {
            let mut links = self.links.lock();
            links.insert((parent.0, name.to_owned()), b.ino.0);
            links.insert((newparent.0, newname.to_owned()), a.ino.0);
        }
        self.name_cache.lock().clear();
        {
            let mut meta = va.meta.lock();
            meta.parent = newparent;
            meta.name = newname.to_owned();
        }
        {
            let mut meta = vb.meta.lock();
            meta.parent = parent;
            meta.name = name.to_owned();
        }
        Ok(())
    }

    fn open(&self, ctx: &CallContext, ino: NodeId, acc: OpenAccMode) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let window = Window::Open(ino.0, acc as i32);
        self.enter_window(window.clone());
        let result = self.open_locked(ctx, ino, acc, &vnode);
        self.leave_window(&window);
        result
    }

    fn open_locked(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        acc: OpenAccMode,
        vnode: &Arc<Vnode>,
    ) -> Result<(), Errno> {
        if vnode.reuse_file_handle(acc).is_some() {
            return Ok(());
        }
        let arg = abi::fuse_open_in {
            flags: acc as i32 as u32,
            unused: 0,
        };
        let reply = self.call(ctx, Opcode::Open, ino, arg.as_bytes())?;
        let out: abi::fuse_open_out = read_reply(&reply)?;
        let flags = FopenFlags::from_bits_truncate(out.open_flags);

        if vnode.open_refs() == 0 {
            self.first_open_cache_check(ctx, vnode, flags)?;
        }
        if flags.contains(FopenFlags::FOPEN_DIRECT_IO) {
            vnode.meta.lock().direct = true;
        }
        if flags.contains(FopenFlags::FOPEN_PURGE_ATTR) {
            vnode.invalidate_attr();
        }
        if flags.contains(FopenFlags::FOPEN_PURGE_UBC) {
            vnode.pages.invalidate();
        }
        vnode.insert_file_handle(acc, FileHandle(out.fh));
        Ok(())
    }

    /// First open of a node: decide whether cached pages survive. With
    /// auto_cache they survive iff size and mtime are unchanged; otherwise
    /// only an explicit keep-cache from the daemon preserves them.
    fn first_open_cache_check(
        &self,
        ctx: &CallContext,
        vnode: &Arc<Vnode>,
        flags: FopenFlags,
    ) -> Result<(), Errno> {
        if self.config.auto_cache {
            let attr = self.getattr(ctx, vnode.ino)?;
            let mut meta = vnode.meta.lock();
            let unchanged =
                meta.last_size == Some(attr.size) && meta.last_mtime == Some(attr.mtime);
            if !unchanged {
                vnode.pages.invalidate();
            }
            meta.last_size = Some(attr.size);
            meta.last_mtime = Some(attr.mtime);
        } else if !flags.contains(FopenFlags::FOPEN_KEEP_CACHE) {
            vnode.pages.invalidate();
        }
        Ok(())
    }

    fn release(&self, ctx: &CallContext, ino: NodeId, acc: OpenAccMode) -> Result<(), Errno> {
        let vnode = self.vnode(ino);
        if acc.writable() {
            if let Err(errno) = self.push_dirty(ctx, &vnode) {
                warn!("dirty push on close of {ino} failed: {errno}");
            }
        }
        let (released, last) = vnode.close_file_handle(acc);
        if let Some(fh) = released {
            let arg = abi::fuse_release_in {
                fh: fh.0,
                flags: acc as i32 as u32,
                release_flags: 0,
                lock_owner: 0,
            };
            if let Err(errno) = self.call(ctx, Opcode::Release, ino, arg.as_bytes()) {
                debug!("release of {ino} fh {fh} failed: {errno}");
            }
        }
        if last {
            if let Some(hidden) = vnode.take_hidden() {
                // The deferred unlink of a hidden file, now that the last
                // handle is gone.
                let payload = name_bytes(&hidden.name)?;
                if let Err(errno) = self.call(ctx, Opcode::Unlink, hidden.parent, &payload) {
                    warn!("hidden unlink of {:?} failed: {errno}", hidden.name);
                }
                self.uncache_name(hidden.parent, &hidden.name);
            }
        }
        Ok(())
    }

    fn effective_chunk(&self) -> usize {
        let max_write = self.session.negotiated().max_write as usize;
        let blocksize = self.session.blocksize() as usize;
        if max_write >= blocksize {
            (max_write / blocksize) * blocksize
        } else {
            max_write
        }
    }

    fn wire_read(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        fh: FileHandle,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, Errno> {
        let chunk_len = self.effective_chunk();
        let mut out = Vec::with_capacity(len);
        let mut at = offset;
        let end = offset + len as u64;
        while at < end {
            let want = ((end - at) as usize).min(chunk_len);
            let arg = abi::fuse_read_in {
                fh: fh.0,
                offset: at,
                size: want as u32,
                padding: 0,
            };
            let reply = self.call(ctx, Opcode::Read, ino, arg.as_bytes())?;
            let got = reply.data.len();
            if got > want {
                return Err(Errno::EIO);
            }
            out.extend_from_slice(&reply.data);
            at += got as u64;
            if got < want {
                break; // EOF
            }
        }
        Ok(out)
    }

    fn read(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        offset: u64,
        size: usize,
    ) -> Result<Vec<u8>, Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let fh = vnode.read_handle().ok_or(Errno::EBADF)?;
        let direct = self.config.direct_io || self.config.no_ubc || vnode.meta.lock().direct;
        if direct {
            return self.wire_read(ctx, ino, fh, offset, size);
        }

        // Cached read: clip to the known size. At EOF reads come up short;
        // past EOF they are invalid.
        let attr = self.getattr(ctx, ino)?;
        if offset > attr.size {
            return Err(Errno::EINVAL);
        }
        let len = size.min((attr.size - offset) as usize);
        if len == 0 {
            return Ok(Vec::new());
        }
        if let Some(data) = vnode.pages.read(offset, len) {
            return Ok(data);
        }
        let page = ubc::page_size();
        let astart = offset - offset % page;
        let aend = (offset + len as u64)
            .next_multiple_of(page)
            .min(attr.size);
        let data = self.wire_read(ctx, ino, fh, astart, (aend - astart) as usize)?;
        vnode.pages.store(astart, &data, false);
        let skip = (offset - astart) as usize;
        if data.len() < skip {
            return Ok(Vec::new());
        }
        Ok(data[skip..data.len().min(skip + len)].to_vec())
    }

    fn write(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Errno> {
        self.gate(ctx)?;
        if data.is_empty() {
            return Ok(0);
        }
        let vnode = self.vnode(ino);
        let fh = vnode.write_handle().ok_or(Errno::EBADF)?;
        let direct = self.config.direct_io || self.config.no_ubc || vnode.meta.lock().direct;

        if self.config.no_syncwrites && !direct {
            // Async writes land dirty in the page store; flush, fsync or
            // the last close pushes them.
            vnode.pages.store(offset, data, true);
            vnode.update_cached_size(offset + data.len() as u64);
            return Ok(data.len());
        }

        let written = self.wire_write(ctx, ino, fh, offset, data)?;
        if !direct {
            vnode.pages.update(offset, &data[..written]);
        }
        vnode.update_cached_size(offset + written as u64);
        Ok(written)
    }

    fn wire_write(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, Errno> {
        let shared: Arc<[u8]> = Arc::from(data);
        let chunk_len = self.effective_chunk();
        let mut written = 0usize;
        while written < data.len() {
            let chunk = (data.len() - written).min(chunk_len);
            let arg = abi::fuse_write_in {
                fh: fh.0,
                offset: offset + written as u64,
                size: chunk as u32,
                write_flags: 0,
            };
            let reply = self.call_data(
                ctx,
                Opcode::Write,
                ino,
                arg.as_bytes(),
                Some(SharedSlice::new(shared.clone(), written..written + chunk)),
            )?;
            let out: abi::fuse_write_out = read_reply(&reply)?;
            if out.size == 0 {
                return Err(Errno::EIO);
            }
            written += out.size as usize;
            if (out.size as usize) < chunk {
                break;
            }
        }
        Ok(written)
    }

    /// Pushes every dirty range of a node to the daemon.
    fn push_dirty(&self, ctx: &CallContext, vnode: &Arc<Vnode>) -> Result<(), Errno> {
        if !vnode.pages.has_dirty() {
            return Ok(());
        }
        let fh = vnode
            .write_handle()
            .or_else(|| vnode.any_handle())
            .ok_or(Errno::EIO)?;
        for (offset, data) in vnode.pages.take_dirty() {
            self.wire_write(ctx, vnode.ino, fh, offset, &data)?;
        }
        Ok(())
    }

    fn flush(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        self.push_dirty(ctx, &vnode)?;
        let Some(fh) = vnode.any_handle() else {
            return Ok(());
        };
        let arg = abi::fuse_flush_in {
            fh: fh.0,
            unused: 0,
            padding: 0,
            lock_owner: u64::from(ctx.caller.pid),
        };
        match self.call(ctx, Opcode::Flush, ino, arg.as_bytes()) {
            Err(errno) if errno == Errno::ENOSYS => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn fsync(&self, ctx: &CallContext, ino: NodeId, datasync: bool) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        self.push_dirty(ctx, &vnode)?;
        let fh = vnode.any_handle().ok_or(Errno::EBADF)?;
        let arg = abi::fuse_fsync_in {
            fh: fh.0,
            fsync_flags: u32::from(datasync),
            padding: 0,
        };
        match self.call(ctx, Opcode::FSync, ino, arg.as_bytes()) {
            Err(errno) if errno == Errno::ENOSYS => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn opendir(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let window = Window::Dir(ino.0);
        self.enter_window(window.clone());
        let result = (|| {
            if vnode.reuse_dir_handle().is_some() {
                return Ok(());
            }
            let arg = abi::fuse_open_in {
                flags: libc::O_RDONLY as u32,
                unused: 0,
            };
            let reply = self.call(ctx, Opcode::OpenDir, ino, arg.as_bytes())?;
            let out: abi::fuse_open_out = read_reply(&reply)?;
            vnode.insert_dir_handle(FileHandle(out.fh));
            Ok(())
        })();
        self.leave_window(&window);
        result
    }

    fn readdir(&self, ctx: &CallContext, ino: NodeId) -> Result<Vec<DirEntry>, Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let fh = vnode.dir_handle().ok_or(Errno::EBADF)?;
        let mut entries = Vec::new();
        let mut offset = 0u64;
        loop {
            let arg = abi::fuse_read_in {
                fh: fh.0,
                offset,
                size: READDIR_CHUNK,
                padding: 0,
            };
            let reply = self.call(ctx, Opcode::ReadDir, ino, arg.as_bytes())?;
            if reply.data.is_empty() {
                break;
            }
            let decoded = dirent::decode(&reply.data)?;
            let Some(last) = decoded.last() else { break };
            offset = last.offset;
            entries.extend(decoded.into_iter().filter(|entry| {
                !(self.config.no_apple_double && dirent::is_apple_double(&entry.name))
            }));
        }
        Ok(entries)
    }

    fn releasedir(&self, ctx: &CallContext, ino: NodeId) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        if let Some(fh) = vnode.close_dir_handle() {
            let arg = abi::fuse_release_in {
                fh: fh.0,
                flags: libc::O_RDONLY as u32,
                release_flags: 0,
                lock_owner: 0,
            };
            if let Err(errno) = self.call(ctx, Opcode::ReleaseDir, ino, arg.as_bytes()) {
                debug!("releasedir of {ino} failed: {errno}");
            }
        }
        Ok(())
    }

    fn fsyncdir(&self, ctx: &CallContext, ino: NodeId, datasync: bool) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let fh = vnode.dir_handle().ok_or(Errno::EBADF)?;
        let arg = abi::fuse_fsync_in {
            fh: fh.0,
            fsync_flags: u32::from(datasync),
            padding: 0,
        };
        match self.call(ctx, Opcode::FSyncDir, ino, arg.as_bytes()) {
            Err(errno) if errno == Errno::ENOSYS => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn statfs(&self, ctx: &CallContext) -> Result<Statfs, Errno> {
        self.gate(ctx)?;
        let reply = self.call(ctx, Opcode::StatFs, NodeId::ROOT, &[])?;
        let out: abi::fuse_statfs_out = read_reply(&reply)?;
        Ok(Statfs {
            blocks: out.st.blocks,
            bfree: out.st.bfree,
            bavail: out.st.bavail,
            files: out.st.files,
            ffree: out.st.ffree,
            bsize: out.st.bsize,
            namelen: out.st.namelen,
            frsize: out.st.frsize,
        })
    }

    fn access(&self, ctx: &CallContext, ino: NodeId, mask: AccessFlags) -> Result<(), Errno> {
        self.gate(ctx)?;
        if self.config.defer_permissions {
            return Ok(());
        }
        if self.config.default_permissions {
            let attr = self.getattr(ctx, ino)?;
            return local_access(&attr, &ctx.caller, mask);
        }
        let arg = abi::fuse_access_in {
            mask: mask.bits() as u32,
            padding: 0,
        };
        match self.call(ctx, Opcode::Access, ino, arg.as_bytes()) {
            Err(errno) if errno == Errno::ENOSYS => Ok(()),
            Err(errno) if errno == Errno::ENOENT => {
                self.soft_revoke(ino.0);
                Err(Errno::ENOENT)
            }
            other => other.map(|_| ()),
        }
    }

    fn create(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        acc: OpenAccMode,
    ) -> Result<Entry, Errno> {
        self.gate(ctx)?;
        let window = Window::Name(parent.0, name.to_owned());
        self.enter_window(window.clone());
        let result = self.create_locked(ctx, parent, name, mode, acc);
        self.leave_window(&window);
        result
    }

    fn create_locked(
        &self,
        ctx: &CallContext,
        parent: NodeId,
        name: &OsStr,
        mode: u32,
        acc: OpenAccMode,
    ) -> Result<Entry, Errno> {
        let arg = abi::fuse_create_in {
            flags: (acc as i32 | libc::O_CREAT) as u32,
            mode,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        match self.call(ctx, Opcode::Create, parent, &payload) {
            Ok(reply) => {
                let entry: abi::fuse_entry_out = read_reply(&reply)?;
                let open: abi::fuse_open_out = abi::fuse_open_out::read_from_prefix(
                    reply
                        .data
                        .get(size_of::<abi::fuse_entry_out>()..)
                        .ok_or(Errno::EIO)?,
                )
                .map(|(value, _)| value)
                .map_err(|_| Errno::EIO)?;
                let result = self.finish_entry(parent, name, &entry)?;
                let vnode = self.vnode(result.ino);
                vnode.insert_file_handle(acc, FileHandle(open.fh));
                Ok(result)
            }
            Err(errno) if errno == Errno::ENOSYS => {
                // Daemon without CREATE: the classic MKNOD+OPEN pair.
                let entry = self.mknod(ctx, parent, name, mode | libc::S_IFREG as u32, 0)?;
                self.open(ctx, entry.ino, acc)?;
                Ok(entry)
            }
            Err(errno) => Err(errno),
        }
    }

    fn xattr_name_allowed(&self, name: &OsStr) -> bool {
        use std::os::unix::ffi::OsStrExt;
        let bytes = name.as_bytes();
        if self.config.no_apple_xattr && bytes.starts_with(b"com.apple.") {
            return false;
        }
        if !self.config.extended_security && bytes.starts_with(b"com.apple.system.") {
            return false;
        }
        true
    }

    fn setxattr(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        name: &OsStr,
        value: &[u8],
        position: u32,
    ) -> Result<(), Errno> {
        self.gate(ctx)?;
        if !self.xattr_name_allowed(name) {
            return Err(Errno::EPERM);
        }
        let arg = abi::fuse_setxattr_in {
            size: value.len() as u32,
            flags: 0,
            position,
            padding: 0,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        payload.extend_from_slice(value);
        match self.call(ctx, Opcode::SetXAttr, ino, &payload) {
            Err(errno) if errno == Errno::ENOSYS => Err(Errno::ENOTSUP),
            other => other.map(|_| ()),
        }
    }

    fn getxattr(&self, ctx: &CallContext, ino: NodeId, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.gate(ctx)?;
        if !self.xattr_name_allowed(name) {
            return Err(Errno::ENODATA);
        }
        // Ask for the size first, then the value, as the host VFS does.
        let size = {
            let arg = abi::fuse_getxattr_in {
                size: 0,
                padding: 0,
                position: 0,
                padding2: 0,
            };
            let mut payload = arg.as_bytes().to_vec();
            payload.extend_from_slice(&name_bytes(name)?);
            let reply = match self.call(ctx, Opcode::GetXAttr, ino, &payload) {
                Err(errno) if errno == Errno::ENOSYS => return Err(Errno::ENOTSUP),
                other => other?,
            };
            let out: abi::fuse_getxattr_out = read_reply(&reply)?;
            out.size
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        let arg = abi::fuse_getxattr_in {
            size,
            padding: 0,
            position: 0,
            padding2: 0,
        };
        let mut payload = arg.as_bytes().to_vec();
        payload.extend_from_slice(&name_bytes(name)?);
        let reply = self.call(ctx, Opcode::GetXAttr, ino, &payload)?;
        Ok(reply.data)
    }

    fn listxattr(&self, ctx: &CallContext, ino: NodeId) -> Result<Vec<OsString>, Errno> {
        use std::os::unix::ffi::OsStrExt;
        self.gate(ctx)?;
        let size = {
            let arg = abi::fuse_getxattr_in {
                size: 0,
                padding: 0,
                position: 0,
                padding2: 0,
            };
            let reply = match self.call(ctx, Opcode::ListXAttr, ino, arg.as_bytes()) {
                Err(errno) if errno == Errno::ENOSYS => return Err(Errno::ENOTSUP),
                other => other?,
            };
            let out: abi::fuse_getxattr_out = read_reply(&reply)?;
            out.size
        };
        if size == 0 {
            return Ok(Vec::new());
        }
        let arg = abi::fuse_getxattr_in {
            size,
            padding: 0,
            position: 0,
            padding2: 0,
        };
        let reply = self.call(ctx, Opcode::ListXAttr, ino, arg.as_bytes())?;
        Ok(reply
            .data
            .split(|b| *b == 0)
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| OsStr::from_bytes(chunk).to_owned())
            .filter(|name| self.xattr_name_allowed(name))
            .collect())
    }

    fn removexattr(&self, ctx: &CallContext, ino: NodeId, name: &OsStr) -> Result<(), Errno> {
        self.gate(ctx)?;
        if !self.xattr_name_allowed(name) {
            return Err(Errno::ENODATA);
        }
        let payload = name_bytes(name)?;
        match self.call(ctx, Opcode::RemoveXAttr, ino, &payload) {
            Err(errno) if errno == Errno::ENOSYS => Err(Errno::ENOTSUP),
            other => other.map(|_| ()),
        }
    }

    fn getlk(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        owner: u64,
        lock: Lock,
    ) -> Result<Lock, Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let fh = vnode.any_handle().ok_or(Errno::EBADF)?;
        let arg = abi::fuse_lk_in {
            fh: fh.0,
            owner,
            lk: abi::fuse_file_lock {
                start: lock.range.0,
                end: lock.range.1,
                typ: lock.typ,
                pid: lock.pid,
            },
        };
        match self.call(ctx, Opcode::GetLk, ino, arg.as_bytes()) {
            Ok(reply) => {
                let out: abi::fuse_lk_out = read_reply(&reply)?;
                Ok(Lock::from_abi(&out.lk))
            }
            Err(errno) if errno == Errno::ENOSYS => {
                // No remote locks; the host falls back to local locking.
                Ok(Lock {
                    range: (0, 0),
                    typ: libc::F_UNLCK,
                    pid: 0,
                })
            }
            Err(errno) => Err(errno),
        }
    }

    fn setlk(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        owner: u64,
        lock: Lock,
        sleep: bool,
    ) -> Result<(), Errno> {
        self.gate(ctx)?;
        let vnode = self.vnode(ino);
        let fh = vnode.any_handle().ok_or(Errno::EBADF)?;
        let arg = abi::fuse_lk_in {
            fh: fh.0,
            owner,
            lk: abi::fuse_file_lock {
                start: lock.range.0,
                end: lock.range.1,
                typ: lock.typ,
                pid: lock.pid,
            },
        };
        let opcode = if sleep { Opcode::SetLkW } else { Opcode::SetLk };
        match self.call(ctx, opcode, ino, arg.as_bytes()) {
            Err(errno) if errno == Errno::ENOSYS => Ok(()),
            other => other.map(|_| ()),
        }
    }

    fn bmap(
        &self,
        ctx: &CallContext,
        ino: NodeId,
        blocksize: u32,
        block: u64,
    ) -> Result<u64, Errno> {
        self.gate(ctx)?;
        let arg = abi::fuse_bmap_in {
            block,
            blocksize,
            padding: 0,
        };
        let reply = self.call(ctx, Opcode::BMap, ino, arg.as_bytes())?;
        let out: abi::fuse_bmap_out = read_reply(&reply)?;
        Ok(out.block)
    }

    fn getxtimes(&self, ctx: &CallContext, ino: NodeId) -> Result<XTimes, Errno> {
        self.gate(ctx)?;
        let zeroed = XTimes {
            bkuptime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
        };
        if !self.session.negotiated().flags.contains(InitFlags::XTIMES) {
            return Ok(zeroed);
        }
        match self.call(ctx, Opcode::GetXTimes, ino, &[]) {
            Ok(reply) => {
                let out: abi::fuse_getxtimes_out = read_reply(&reply)?;
                Ok(XTimes {
                    bkuptime: system_time_from_time(out.bkuptime, out.bkuptimensec),
                    crtime: system_time_from_time(out.crtime, out.crtimensec),
                })
            }
            // Soft degrade: daemons without extended times report zeros.
            Err(errno) if errno == Errno::ENOSYS => Ok(zeroed),
            Err(errno) => Err(errno),
        }
    }

    fn setvolname(&self, ctx: &CallContext, name: &OsStr) -> Result<(), Errno> {
        use std::os::unix::ffi::OsStrExt;
        self.gate(ctx)?;
        if !self
            .session
            .negotiated()
            .flags
            .contains(InitFlags::VOL_RENAME)
        {
            return Err(Errno::ENOTSUP);
        }
        let mut payload = name.as_bytes().to_vec();
        payload.push(0);
        match self.call(ctx, Opcode::SetVolName, NodeId::ROOT, &payload) {
            Err(errno) if errno == Errno::ENOSYS => Err(Errno::ENOTSUP),
            other => other.map(|_| ()),
        }
    }
}

/// The default_permissions check: classic owner/group/other mode bits,
/// with root short-circuiting everything but execute-needs-a-bit.
fn local_access(attr: &FileAttr, caller: &Caller, mask: AccessFlags) -> Result<(), Errno> {
    if mask == AccessFlags::F_OK {
        return Ok(());
    }
    let mode = u32::from(attr.perm);
    if caller.uid == 0 {
        if mask.contains(AccessFlags::X_OK) && mode & 0o111 == 0 {
            return Err(Errno::EACCES);
        }
        return Ok(());
    }
    let shift = if caller.uid == attr.uid {
        6
    } else if caller.gid == attr.gid {
        3
    } else {
        0
    };
    let granted = (mode >> shift) & 0o7;
    let wanted = mask.mode_bits();
    if granted & wanted == wanted {
        Ok(())
    } else {
        Err(Errno::EACCES)
    }
}

impl MountHooks for VolumeShared {
    fn alter_vnode(&self, alter: &AlterVnode) -> Result<(), Errno> {
        let cmds = alter.cmds()?;
        let ubc_flags = alter.ubc()?;
        let vnode = self.known_vnode(alter.ino).ok_or(Errno::ENOENT)?;
        if cmds.contains(AlterVnodeCmd::UBC) {
            if ubc_flags.contains(UbcFlags::PUSH) {
                let ctx = CallContext::new(self.owner);
                self.push_dirty(&ctx, &vnode)?;
            }
            if ubc_flags.contains(UbcFlags::INVALIDATE) {
                vnode.pages.invalidate();
            }
        }
        if cmds.contains(AlterVnodeCmd::SIZE) {
            vnode.update_cached_size(alter.size);
            vnode.pages.truncate(alter.size);
        }
        if cmds.contains(AlterVnodeCmd::PURGE_ATTR) {
            vnode.invalidate_attr();
        }
        if cmds.contains(AlterVnodeCmd::PURGE_NAME) {
            self.links.lock().retain(|_, v| *v != alter.ino);
            self.name_cache.lock().retain(|_, entry| {
                !matches!(entry, NameEntry::Positive { ino, .. } if *ino == alter.ino)
            });
        }
        if cmds.contains(AlterVnodeCmd::NOTE) {
            debug!("fsevent note {:#x} for node {:#x}", alter.note, alter.ino);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attr_with(perm: u16, uid: u32, gid: u32) -> FileAttr {
        FileAttr {
            ino: NodeId(2),
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    #[test]
    fn local_access_owner_group_other() {
        let attr = attr_with(0o640, 501, 20);
        let owner = Caller::new(501, 20, 1);
        let group = Caller::new(502, 20, 1);
        let other = Caller::new(503, 21, 1);
        assert!(local_access(&attr, &owner, AccessFlags::R_OK | AccessFlags::W_OK).is_ok());
        assert!(local_access(&attr, &group, AccessFlags::R_OK).is_ok());
        assert_eq!(
            local_access(&attr, &group, AccessFlags::W_OK).unwrap_err(),
            Errno::EACCES
        );
        assert_eq!(
            local_access(&attr, &other, AccessFlags::R_OK).unwrap_err(),
            Errno::EACCES
        );
        assert!(local_access(&attr, &other, AccessFlags::F_OK).is_ok());
    }

    #[test]
    fn local_access_root_needs_an_execute_bit() {
        let root = Caller::new(0, 0, 1);
        let plain = attr_with(0o644, 501, 20);
        assert!(local_access(&plain, &root, AccessFlags::W_OK).is_ok());
        assert_eq!(
            local_access(&plain, &root, AccessFlags::X_OK).unwrap_err(),
            Errno::EACCES
        );
        let executable = attr_with(0o744, 501, 20);
        assert!(local_access(&executable, &root, AccessFlags::X_OK).is_ok());
    }

    #[test]
    fn attr_decode_round_trip() {
        let attr = attr_with(0o755, 1, 2);
        let wire = crate::ll::reply::fuse_attr_from_attr(&attr);
        let back = decode_attr(&wire).unwrap();
        assert_eq!(back, attr);
    }

    #[test]
    fn bad_names_are_rejected() {
        assert_eq!(name_bytes(OsStr::new("")).unwrap_err(), Errno::ENAMETOOLONG);
        assert_eq!(
            name_bytes(OsStr::new("a/b")).unwrap_err(),
            Errno::EINVAL
        );
        let long = "x".repeat(abi::NAME_MAX + 1);
        assert_eq!(
            name_bytes(OsStr::new(&long)).unwrap_err(),
            Errno::ENAMETOOLONG
        );
        assert_eq!(name_bytes(OsStr::new("ok.txt")).unwrap(), b"ok.txt\0");
    }
}
