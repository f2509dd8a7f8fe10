//! Shared test fixture: an in-memory path filesystem plus a mounted
//! device/volume/server triple.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use fusebus::AccessFlags;
use fusebus::Caller;
use fusebus::CallContext;
use fusebus::Device;
use fusebus::DirEntry;
use fusebus::Errno;
use fusebus::FileAttr;
use fusebus::FileHandle;
use fusebus::FileType;
use fusebus::Lock;
use fusebus::MountOption;
use fusebus::NodeId;
use fusebus::OpenFlags;
use fusebus::PathFilesystem;
use fusebus::Server;
use fusebus::ServerOptions;
use fusebus::SetAttrRequest;
use fusebus::Statfs;
use fusebus::Volume;
use fusebus::XTimes;

#[derive(Debug, Clone)]
struct MemNode {
    ino: u64,
    kind: FileType,
    mode: u16,
    uid: u32,
    gid: u32,
    nlink: u32,
    rdev: u32,
    data: Vec<u8>,
    target: Option<PathBuf>,
    xattrs: BTreeMap<OsString, Vec<u8>>,
    mtime: SystemTime,
    crtime: SystemTime,
    bkuptime: SystemTime,
}

impl MemNode {
    fn new(ino: u64, kind: FileType, mode: u16) -> MemNode {
        MemNode {
            ino,
            kind,
            mode,
            uid: 501,
            gid: 20,
            nlink: if kind == FileType::Directory { 2 } else { 1 },
            rdev: 0,
            data: Vec::new(),
            target: None,
            xattrs: BTreeMap::new(),
            mtime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            bkuptime: UNIX_EPOCH,
        }
    }

    fn attr(&self) -> FileAttr {
        FileAttr {
            ino: NodeId(self.ino),
            size: self.data.len() as u64,
            blocks: (self.data.len() as u64).div_ceil(512),
            atime: self.mtime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.crtime,
            kind: self.kind,
            perm: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: 4096,
            flags: 0,
        }
    }
}

/// An in-memory tree filesystem that records what the daemon asked of it.
pub struct MemFs {
    nodes: Mutex<HashMap<PathBuf, MemNode>>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    events: Mutex<Vec<String>>,
    case_insensitive: bool,
    volname: Mutex<String>,
}

impl MemFs {
    pub fn new() -> MemFs {
        Self::with_case_insensitivity(false)
    }

    pub fn with_case_insensitivity(case_insensitive: bool) -> MemFs {
        let mut nodes = HashMap::new();
        nodes.insert(PathBuf::from("/"), MemNode::new(1, FileType::Directory, 0o755));
        MemFs {
            nodes: Mutex::new(nodes),
            next_ino: AtomicU64::new(2),
            next_fh: AtomicU64::new(1),
            events: Mutex::new(Vec::new()),
            case_insensitive,
            volname: Mutex::new(String::from("memfs")),
        }
    }

    fn key(&self, path: &Path) -> PathBuf {
        if self.case_insensitive {
            PathBuf::from(path.to_string_lossy().to_lowercase())
        } else {
            path.to_path_buf()
        }
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    /// Everything the daemon was asked to do, in order.
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    /// How many recorded events start with `prefix`.
    pub fn count_events(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    pub fn clear_events(&self) {
        self.events.lock().unwrap().clear();
    }

    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }

    // Direct manipulation for test setup and assertions; none of this goes
    // through the wire.

    pub fn insert_file(&self, path: &str, content: &[u8]) {
        let mut node = MemNode::new(self.alloc_ino(), FileType::RegularFile, 0o644);
        node.data = content.to_vec();
        self.nodes.lock().unwrap().insert(self.key(Path::new(path)), node);
    }

    pub fn insert_dir(&self, path: &str) {
        let node = MemNode::new(self.alloc_ino(), FileType::Directory, 0o755);
        self.nodes.lock().unwrap().insert(self.key(Path::new(path)), node);
    }

    pub fn set_owner_mode(&self, path: &str, uid: u32, gid: u32, mode: u16) {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&self.key(Path::new(path))).unwrap();
        node.uid = uid;
        node.gid = gid;
        node.mode = mode;
    }

    /// Deletes a path without the transport noticing, to provoke the
    /// disappearing-inode handling.
    pub fn remove_behind_the_scenes(&self, path: &str) {
        self.nodes.lock().unwrap().remove(&self.key(Path::new(path)));
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.nodes
            .lock()
            .unwrap()
            .get(&self.key(Path::new(path)))
            .map(|node| node.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .contains_key(&self.key(Path::new(path)))
    }

    /// Paths currently carrying a hidden-rename name.
    pub fn hidden_paths(&self) -> Vec<String> {
        self.nodes
            .lock()
            .unwrap()
            .keys()
            .filter(|path| {
                path.file_name()
                    .and_then(OsStr::to_str)
                    .is_some_and(|name| name.starts_with(".fuse_hidden"))
            })
            .map(|path| path.to_string_lossy().into_owned())
            .collect()
    }

    pub fn volname(&self) -> String {
        self.volname.lock().unwrap().clone()
    }

    fn with_node<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut MemNode) -> T,
    ) -> Result<T, Errno> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.get_mut(&self.key(path)).ok_or(Errno::ENOENT)?;
        Ok(f(node))
    }
}

impl PathFilesystem for MemFs {
    fn getattr(&self, path: &Path) -> Result<FileAttr, Errno> {
        self.record(format!("getattr {}", path.display()));
        self.with_node(path, |node| node.attr())
    }

    fn setattr(
        &self,
        path: &Path,
        changes: &SetAttrRequest,
        _fh: Option<FileHandle>,
    ) -> Result<FileAttr, Errno> {
        self.record(format!("setattr {}", path.display()));
        self.with_node(path, |node| {
            if let Some(mode) = changes.mode {
                node.mode = (mode & 0o7777) as u16;
            }
            if let Some(uid) = changes.uid {
                node.uid = uid;
            }
            if let Some(gid) = changes.gid {
                node.gid = gid;
            }
            if let Some(size) = changes.size {
                node.data.resize(size as usize, 0);
            }
            if let Some(crtime) = changes.crtime {
                node.crtime = crtime;
            }
            if let Some(bkuptime) = changes.bkuptime {
                node.bkuptime = bkuptime;
            }
            node.attr()
        })
    }

    fn readlink(&self, path: &Path) -> Result<PathBuf, Errno> {
        self.record(format!("readlink {}", path.display()));
        self.with_node(path, |node| node.target.clone())?
            .ok_or(Errno::EINVAL)
    }

    fn mknod(&self, path: &Path, mode: u32, rdev: u32) -> Result<FileAttr, Errno> {
        self.record(format!("mknod {}", path.display()));
        let kind = FileType::from_mode(mode).unwrap_or(FileType::RegularFile);
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&self.key(path)) {
            return Err(Errno::EEXIST);
        }
        let mut node = MemNode::new(self.alloc_ino(), kind, (mode & 0o7777) as u16);
        node.rdev = rdev;
        let attr = node.attr();
        nodes.insert(self.key(path), node);
        Ok(attr)
    }

    fn mkdir(&self, path: &Path, mode: u32) -> Result<FileAttr, Errno> {
        self.record(format!("mkdir {}", path.display()));
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&self.key(path)) {
            return Err(Errno::EEXIST);
        }
        let node = MemNode::new(self.alloc_ino(), FileType::Directory, (mode & 0o7777) as u16);
        let attr = node.attr();
        nodes.insert(self.key(path), node);
        Ok(attr)
    }

    fn unlink(&self, path: &Path) -> Result<(), Errno> {
        self.record(format!("unlink {}", path.display()));
        self.nodes
            .lock()
            .unwrap()
            .remove(&self.key(path))
            .map(|_| ())
            .ok_or(Errno::ENOENT)
    }

    fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        self.record(format!("rmdir {}", path.display()));
        let mut nodes = self.nodes.lock().unwrap();
        let key = self.key(path);
        let has_children = nodes
            .keys()
            .any(|other| other != &key && other.parent() == Some(key.as_path()));
        if has_children {
            return Err(Errno::ENOTEMPTY);
        }
        nodes.remove(&key).map(|_| ()).ok_or(Errno::ENOENT)
    }

    fn symlink(&self, path: &Path, target: &Path) -> Result<FileAttr, Errno> {
        self.record(format!("symlink {} -> {}", path.display(), target.display()));
        let mut nodes = self.nodes.lock().unwrap();
        let mut node = MemNode::new(self.alloc_ino(), FileType::Symlink, 0o777);
        node.target = Some(target.to_path_buf());
        node.data = target.as_os_str().as_encoded_bytes().to_vec();
        let attr = node.attr();
        nodes.insert(self.key(path), node);
        Ok(attr)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Errno> {
        self.record(format!("rename {} -> {}", from.display(), to.display()));
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes.remove(&self.key(from)).ok_or(Errno::ENOENT)?;
        nodes.insert(self.key(to), node);
        Ok(())
    }

    fn link(&self, path: &Path, newpath: &Path) -> Result<FileAttr, Errno> {
        self.record(format!("link {} -> {}", path.display(), newpath.display()));
        let mut nodes = self.nodes.lock().unwrap();
        let mut node = nodes.get(&self.key(path)).ok_or(Errno::ENOENT)?.clone();
        node.nlink += 1;
        if let Some(original) = nodes.get_mut(&self.key(path)) {
            original.nlink += 1;
        }
        let attr = node.attr();
        nodes.insert(self.key(newpath), node);
        Ok(attr)
    }

    fn exchange(&self, path1: &Path, path2: &Path, _options: u64) -> Result<(), Errno> {
        self.record(format!(
            "exchange {} <-> {}",
            path1.display(),
            path2.display()
        ));
        let mut nodes = self.nodes.lock().unwrap();
        let a = nodes.remove(&self.key(path1)).ok_or(Errno::ENOENT)?;
        let b = match nodes.remove(&self.key(path2)) {
            Some(b) => b,
            None => {
                nodes.insert(self.key(path1), a);
                return Err(Errno::ENOENT);
            }
        };
        nodes.insert(self.key(path1), b);
        nodes.insert(self.key(path2), a);
        Ok(())
    }

    fn open(&self, path: &Path, _flags: OpenFlags) -> Result<FileHandle, Errno> {
        self.record(format!("open {}", path.display()));
        self.with_node(path, |_| ())?;
        Ok(FileHandle(self.next_fh.fetch_add(1, Ordering::Relaxed)))
    }

    fn read(&self, path: &Path, _fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        self.record(format!("read {} @{offset}+{size}", path.display()));
        self.with_node(path, |node| {
            let start = (offset as usize).min(node.data.len());
            let end = (start + size as usize).min(node.data.len());
            node.data[start..end].to_vec()
        })
    }

    fn write(&self, path: &Path, _fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        self.record(format!("write {} @{offset}+{}", path.display(), data.len()));
        self.with_node(path, |node| {
            let end = offset as usize + data.len();
            if node.data.len() < end {
                node.data.resize(end, 0);
            }
            node.data[offset as usize..end].copy_from_slice(data);
            data.len() as u32
        })
    }

    fn flush(&self, path: &Path, _fh: FileHandle) -> Result<(), Errno> {
        self.record(format!("flush {}", path.display()));
        Ok(())
    }

    fn release(&self, path: &Path, _fh: FileHandle, _flags: OpenFlags) -> Result<(), Errno> {
        self.record(format!("release {}", path.display()));
        Ok(())
    }

    fn fsync(&self, path: &Path, _fh: FileHandle, _datasync: bool) -> Result<(), Errno> {
        self.record(format!("fsync {}", path.display()));
        Ok(())
    }

    fn opendir(&self, path: &Path) -> Result<FileHandle, Errno> {
        self.record(format!("opendir {}", path.display()));
        self.with_node(path, |_| ())?;
        Ok(FileHandle(self.next_fh.fetch_add(1, Ordering::Relaxed)))
    }

    fn readdir(&self, path: &Path, _fh: FileHandle) -> Result<Vec<DirEntry>, Errno> {
        self.record(format!("readdir {}", path.display()));
        let nodes = self.nodes.lock().unwrap();
        let key = self.key(path);
        let mut entries = Vec::new();
        for (other, node) in nodes.iter() {
            if other.parent() == Some(key.as_path()) {
                if let Some(name) = other.file_name() {
                    entries.push(DirEntry {
                        ino: node.ino,
                        offset: 0,
                        kind: node.kind,
                        name: name.to_owned(),
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn releasedir(&self, path: &Path, _fh: FileHandle) -> Result<(), Errno> {
        self.record(format!("releasedir {}", path.display()));
        Ok(())
    }

    fn fsyncdir(&self, path: &Path, _fh: FileHandle, _datasync: bool) -> Result<(), Errno> {
        self.record(format!("fsyncdir {}", path.display()));
        Ok(())
    }

    fn statfs(&self, _path: &Path) -> Result<Statfs, Errno> {
        Ok(Statfs {
            blocks: 1024,
            bfree: 512,
            bavail: 512,
            files: 64,
            ffree: 32,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    fn setxattr(
        &self,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        _position: u32,
    ) -> Result<(), Errno> {
        self.record(format!("setxattr {} {:?}", path.display(), name));
        self.with_node(path, |node| {
            node.xattrs.insert(name.to_owned(), value.to_vec());
        })
    }

    fn getxattr(&self, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        self.record(format!("getxattr {} {:?}", path.display(), name));
        self.with_node(path, |node| node.xattrs.get(name).cloned())?
            .ok_or(Errno::ENODATA)
    }

    fn listxattr(&self, path: &Path) -> Result<Vec<OsString>, Errno> {
        self.record(format!("listxattr {}", path.display()));
        self.with_node(path, |node| node.xattrs.keys().cloned().collect())
    }

    fn removexattr(&self, path: &Path, name: &OsStr) -> Result<(), Errno> {
        self.record(format!("removexattr {} {:?}", path.display(), name));
        self.with_node(path, |node| node.xattrs.remove(name).map(|_| ()))?
            .ok_or(Errno::ENODATA)
    }

    fn access(&self, path: &Path, _mask: AccessFlags) -> Result<(), Errno> {
        self.record(format!("access {}", path.display()));
        self.with_node(path, |_| ())
    }

    fn create(
        &self,
        path: &Path,
        mode: u32,
        _flags: OpenFlags,
    ) -> Result<(FileAttr, FileHandle), Errno> {
        self.record(format!("create {}", path.display()));
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&self.key(path)) {
            return Err(Errno::EEXIST);
        }
        let node = MemNode::new(self.alloc_ino(), FileType::RegularFile, (mode & 0o7777) as u16);
        let attr = node.attr();
        nodes.insert(self.key(path), node);
        Ok((attr, FileHandle(self.next_fh.fetch_add(1, Ordering::Relaxed))))
    }

    fn getlk(
        &self,
        _path: &Path,
        _fh: FileHandle,
        _owner: u64,
        _lock: &Lock,
    ) -> Result<Option<Lock>, Errno> {
        // Defer to the daemon's local lock engine.
        Err(Errno::ENOSYS)
    }

    fn setlk(
        &self,
        _path: &Path,
        _fh: FileHandle,
        _owner: u64,
        _lock: &Lock,
        _sleep: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    fn setvolname(&self, name: &OsStr) -> Result<(), Errno> {
        self.record(format!("setvolname {name:?}"));
        *self.volname.lock().unwrap() = name.to_string_lossy().into_owned();
        Ok(())
    }

    fn getxtimes(&self, path: &Path) -> Result<XTimes, Errno> {
        self.record(format!("getxtimes {}", path.display()));
        self.with_node(path, |node| XTimes {
            bkuptime: node.bkuptime,
            crtime: node.crtime,
        })
    }
}

/// A mounted stack: device, daemon thread over a `MemFs`, and the volume.
pub struct Harness {
    pub device: Arc<Device>,
    pub fs: Arc<MemFs>,
    pub volume: Volume,
    pub owner: Caller,
    server: Option<JoinHandle<io::Result<()>>>,
}

pub const OWNER: Caller = Caller {
    uid: 501,
    gid: 20,
    pid: 4242,
};

impl Harness {
    pub fn mount(options: &[MountOption]) -> Harness {
        Self::mount_with(MemFs::new(), options, ServerOptions::default())
    }

    pub fn mount_with(fs: MemFs, options: &[MountOption], server_options: ServerOptions) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let device = Device::new(4);
        let handle = device.open(0, 1000).expect("slot 0 open");
        let fs = Arc::new(fs);
        let mut server = Server::with_options(fs.clone(), handle, server_options);
        let thread = std::thread::spawn(move || server.run());
        let volume = Volume::mount(&device, 0, options, OWNER).expect("mount");
        Harness {
            device,
            fs,
            volume,
            owner: OWNER,
            server: Some(thread),
        }
    }

    pub fn ctx(&self) -> CallContext {
        CallContext::new(self.owner)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.volume.unmount();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}
