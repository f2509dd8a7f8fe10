//! Wire-level types shared by the driver and daemon halves.
//!
//! Everything that crosses the endpoint is described here: the framing
//! structures and opcodes in [`fuse_abi`], the errno convention in [`errno`],
//! payload decomposition in [`argument`], parsed inbound requests in
//! [`request`] and reply serialization in [`reply`]. The codec performs no
//! I/O of its own.

use std::fmt;

pub(crate) mod argument;
pub mod errno;
pub mod fuse_abi;
#[allow(missing_docs)]
pub mod reply;
#[allow(missing_docs)]
pub mod request;

pub use errno::Errno;

/// A per-session request identifier. Nonzero, and never reused while an
/// interrupt for it may still arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Unique(pub u64);

impl fmt::Display for Unique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A node (inode) identifier. The root of every mount is [`NodeId::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl NodeId {
    /// The fixed id of the root node.
    pub const ROOT: NodeId = NodeId(fuse_abi::ROOT_ID);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An opaque file handle chosen by the daemon on OPEN/CREATE/OPENDIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Distinguishes incarnations of a node id after the allocator wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Generation(pub u64);

/// A protocol revision as negotiated by INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// A byte-range lock as carried by GETLK/SETLK/SETLKW.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lock {
    /// Start and end offset of the locked range.
    pub range: (u64, u64),
    /// `F_RDLCK`, `F_WRLCK` or `F_UNLCK`.
    pub typ: i32,
    /// Owning process, for GETLK replies.
    pub pid: u32,
}

impl Lock {
    pub(crate) fn from_abi(lk: &fuse_abi::fuse_file_lock) -> Lock {
        Lock {
            range: (lk.start, lk.end),
            typ: lk.typ,
            pid: lk.pid,
        }
    }
}
