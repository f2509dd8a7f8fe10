//! Driver-side per-inode state.
//!
//! Each vnode carries the attribute cache with its staleness deadline, the
//! handle table (at most one daemon handle per access mode, plus one for the
//! directory stream), the hidden-deletion record, and the cached pages.

use std::ffi::OsString;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::FileAttr;
use crate::ll::FileHandle;
use crate::ll::Generation;
use crate::ll::NodeId;
use crate::open_flags::OpenAccMode;

use super::ubc::PageCache;

#[derive(Debug)]
struct AttrCache {
    attr: Option<FileAttr>,
    valid_until: Option<Instant>,
}

/// One cached daemon handle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpenHandle {
    pub(crate) fh: FileHandle,
    pub(crate) refs: u32,
}

#[derive(Debug, Default)]
struct HandleTable {
    /// Indexed by access mode: read-only, write-only, read-write.
    file: [Option<OpenHandle>; 3],
    dir: Option<OpenHandle>,
}

fn acc_slot(acc: OpenAccMode) -> usize {
    match acc {
        OpenAccMode::O_RDONLY => 0,
        OpenAccMode::O_WRONLY => 1,
        OpenAccMode::O_RDWR => 2,
    }
}

/// Where a deferred UNLINK must eventually land.
#[derive(Debug, Clone)]
pub(crate) struct HiddenRecord {
    pub(crate) parent: NodeId,
    pub(crate) name: OsString,
}

#[derive(Debug)]
pub(crate) struct VnodeMeta {
    pub(crate) parent: NodeId,
    pub(crate) name: OsString,
    pub(crate) hidden: Option<HiddenRecord>,
    /// Last observed size and mtime, for the auto_cache comparison.
    pub(crate) last_size: Option<u64>,
    pub(crate) last_mtime: Option<SystemTime>,
    /// The daemon asked for direct I/O on this file.
    pub(crate) direct: bool,
}

/// Driver-side state of one inode.
#[derive(Debug)]
pub(crate) struct Vnode {
    pub(crate) ino: NodeId,
    pub(crate) generation: Generation,
    attr: Mutex<AttrCache>,
    handles: Mutex<HandleTable>,
    pub(crate) meta: Mutex<VnodeMeta>,
    nlookup: AtomicU64,
    pub(crate) pages: PageCache,
}

impl Vnode {
    pub(crate) fn new(
        ino: NodeId,
        generation: Generation,
        parent: NodeId,
        name: OsString,
    ) -> Vnode {
        Vnode {
            ino,
            generation,
            attr: Mutex::new(AttrCache {
                attr: None,
                valid_until: None,
            }),
            handles: Mutex::new(HandleTable::default()),
            meta: Mutex::new(VnodeMeta {
                parent,
                name,
                hidden: None,
                last_size: None,
                last_mtime: None,
                direct: false,
            }),
            nlookup: AtomicU64::new(0),
            pages: PageCache::new(),
        }
    }

    // --- lookup count ---

    pub(crate) fn nlookup_inc(&self) {
        self.nlookup.fetch_add(1, Ordering::Relaxed);
    }

    /// Drains the count for a FORGET.
    pub(crate) fn nlookup_take(&self) -> u64 {
        self.nlookup.swap(0, Ordering::Relaxed)
    }

    // --- attribute cache ---

    /// The cached attributes, when still fresh.
    pub(crate) fn attr(&self) -> Option<FileAttr> {
        let cache = self.attr.lock();
        match cache.valid_until {
            Some(deadline) if Instant::now() < deadline => cache.attr,
            _ => None,
        }
    }

    /// Caches attributes for `ttl`; `None` disables caching for this node
    /// (the no_attrcache mount).
    pub(crate) fn store_attr(&self, attr: &FileAttr, ttl: Option<Duration>) {
        let mut cache = self.attr.lock();
        match ttl {
            Some(ttl) => {
                cache.attr = Some(*attr);
                cache.valid_until = Some(Instant::now() + ttl);
            }
            None => {
                cache.attr = None;
                cache.valid_until = None;
            }
        }
    }

    pub(crate) fn invalidate_attr(&self) {
        let mut cache = self.attr.lock();
        cache.attr = None;
        cache.valid_until = None;
    }

    /// Rewrites the cached size in place (the alter-vnode ioctl and
    /// write extension path).
    pub(crate) fn update_cached_size(&self, size: u64) {
        let mut cache = self.attr.lock();
        if let Some(attr) = &mut cache.attr {
            attr.size = size;
        }
    }

    // --- handle table ---

    /// Reuses an existing handle for this access mode, bumping its
    /// reference count.
    pub(crate) fn reuse_file_handle(&self, acc: OpenAccMode) -> Option<FileHandle> {
        let mut handles = self.handles.lock();
        let slot = &mut handles.file[acc_slot(acc)];
        slot.as_mut().map(|h| {
            h.refs += 1;
            h.fh
        })
    }

    pub(crate) fn insert_file_handle(&self, acc: OpenAccMode, fh: FileHandle) {
        let mut handles = self.handles.lock();
        handles.file[acc_slot(acc)] = Some(OpenHandle { fh, refs: 1 });
    }

    /// A handle suitable for reading: the read-only slot, else read-write.
    pub(crate) fn read_handle(&self) -> Option<FileHandle> {
        let handles = self.handles.lock();
        handles.file[0].or(handles.file[2]).map(|h| h.fh)
    }

    /// A handle suitable for writing: the write-only slot, else read-write.
    pub(crate) fn write_handle(&self) -> Option<FileHandle> {
        let handles = self.handles.lock();
        handles.file[1].or(handles.file[2]).map(|h| h.fh)
    }

    /// Any file handle at all (FLUSH, FSYNC).
    pub(crate) fn any_handle(&self) -> Option<FileHandle> {
        let handles = self.handles.lock();
        handles.file.iter().flatten().next().map(|h| h.fh)
    }

    /// Drops one reference on the access mode's handle. Returns the handle
    /// to RELEASE when its slot emptied, and whether that was the last open
    /// of the whole vnode.
    pub(crate) fn close_file_handle(&self, acc: OpenAccMode) -> (Option<FileHandle>, bool) {
        let mut handles = self.handles.lock();
        let slot = &mut handles.file[acc_slot(acc)];
        let mut released = None;
        if let Some(handle) = slot {
            handle.refs -= 1;
            if handle.refs == 0 {
                released = Some(handle.fh);
                *slot = None;
            }
        }
        let last = handles.file.iter().all(Option::is_none);
        (released, last)
    }

    /// Total references across every file handle slot.
    pub(crate) fn open_refs(&self) -> u32 {
        let handles = self.handles.lock();
        handles.file.iter().flatten().map(|h| h.refs).sum()
    }

    pub(crate) fn reuse_dir_handle(&self) -> Option<FileHandle> {
        let mut handles = self.handles.lock();
        handles.dir.as_mut().map(|h| {
            h.refs += 1;
            h.fh
        })
    }

    pub(crate) fn insert_dir_handle(&self, fh: FileHandle) {
        self.handles.lock().dir = Some(OpenHandle { fh, refs: 1 });
    }

    pub(crate) fn dir_handle(&self) -> Option<FileHandle> {
        self.handles.lock().dir.map(|h| h.fh)
    }

    pub(crate) fn close_dir_handle(&self) -> Option<FileHandle> {
        let mut handles = self.handles.lock();
        let mut released = None;
        if let Some(handle) = &mut handles.dir {
            handle.refs -= 1;
            if handle.refs == 0 {
                released = Some(handle.fh);
                handles.dir = None;
            }
        }
        released
    }

    // --- hidden deletions ---

    pub(crate) fn set_hidden(&self, record: HiddenRecord) {
        self.meta.lock().hidden = Some(record);
    }

    pub(crate) fn take_hidden(&self) -> Option<HiddenRecord> {
        self.meta.lock().hidden.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FileType;
    use std::time::UNIX_EPOCH;

    fn vnode() -> Vnode {
        Vnode::new(NodeId(2), Generation(0), NodeId::ROOT, OsString::from("f"))
    }

    fn attr() -> FileAttr {
        FileAttr {
            ino: NodeId(2),
            size: 10,
            blocks: 1,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }

    #[test]
    fn attr_cache_expires() {
        let v = vnode();
        assert_eq!(v.attr(), None);
        v.store_attr(&attr(), Some(Duration::from_millis(20)));
        assert!(v.attr().is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(v.attr(), None);
    }

    #[test]
    fn attr_cache_disabled_by_none_ttl() {
        let v = vnode();
        v.store_attr(&attr(), None);
        assert_eq!(v.attr(), None);
    }

    #[test]
    fn handle_reuse_per_access_mode() {
        let v = vnode();
        assert_eq!(v.reuse_file_handle(OpenAccMode::O_RDONLY), None);
        v.insert_file_handle(OpenAccMode::O_RDONLY, FileHandle(7));
        assert_eq!(
            v.reuse_file_handle(OpenAccMode::O_RDONLY),
            Some(FileHandle(7))
        );
        assert_eq!(v.open_refs(), 2);
        // A read-write handle backs reads and writes alike.
        v.insert_file_handle(OpenAccMode::O_RDWR, FileHandle(9));
        assert_eq!(v.read_handle(), Some(FileHandle(7)));
        assert_eq!(v.write_handle(), Some(FileHandle(9)));
    }

    #[test]
    fn close_releases_on_last_reference() {
        let v = vnode();
        v.insert_file_handle(OpenAccMode::O_RDONLY, FileHandle(7));
        v.reuse_file_handle(OpenAccMode::O_RDONLY);
        let (released, last) = v.close_file_handle(OpenAccMode::O_RDONLY);
        assert_eq!(released, None);
        assert!(!last);
        let (released, last) = v.close_file_handle(OpenAccMode::O_RDONLY);
        assert_eq!(released, Some(FileHandle(7)));
        assert!(last);
    }

    #[test]
    fn nlookup_drains_for_forget() {
        let v = vnode();
        v.nlookup_inc();
        v.nlookup_inc();
        assert_eq!(v.nlookup_take(), 2);
        assert_eq!(v.nlookup_take(), 0);
    }
}
