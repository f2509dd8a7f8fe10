//! Parsed view of one inbound frame on the daemon side.
//!
//! A request describes the operation the driver half wants the daemon to
//! perform. Parsing is eager: an unknown opcode or a truncated payload is an
//! error, and the session loop treats either as fatal for the session.

use std::convert::TryFrom;
use std::error;
use std::ffi::OsStr;
use std::fmt;
use std::mem;

use super::NodeId;
use super::Unique;
use super::argument::ArgumentIterator;
use super::fuse_abi as abi;
use super::fuse_abi::Opcode;

/// Error that may occur while parsing a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestError {
    /// Not enough data for the frame header.
    ShortReadHeader(usize),
    /// The header announces more bytes than were delivered.
    ShortRead(usize, usize),
    /// The peer sent an operation tag this codec does not know.
    UnknownOpcode(u32),
    /// The payload is too short for the declared opcode.
    InsufficientData(Opcode),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::ShortReadHeader(len) => write!(
                f,
                "Short read of frame header ({} < {})",
                len,
                mem::size_of::<abi::fuse_in_header>()
            ),
            RequestError::ShortRead(len, total) => {
                write!(f, "Short read of frame ({len} < {total})")
            }
            RequestError::UnknownOpcode(opcode) => write!(f, "Unknown opcode ({opcode})"),
            RequestError::InsufficientData(opcode) => {
                write!(f, "Insufficient payload for {opcode:?}")
            }
        }
    }
}

impl error::Error for RequestError {}

/// The operation (and arguments) carried by one request.
#[derive(Debug)]
pub enum Operation<'a> {
    Lookup {
        name: &'a OsStr,
    },
    Forget {
        arg: &'a abi::fuse_forget_in,
    },
    GetAttr,
    SetAttr {
        arg: &'a abi::fuse_setattr_in,
    },
    ReadLink,
    SymLink {
        name: &'a OsStr,
        link: &'a OsStr,
    },
    MkNod {
        arg: &'a abi::fuse_mknod_in,
        name: &'a OsStr,
    },
    MkDir {
        arg: &'a abi::fuse_mkdir_in,
        name: &'a OsStr,
    },
    Unlink {
        name: &'a OsStr,
    },
    RmDir {
        name: &'a OsStr,
    },
    Rename {
        arg: &'a abi::fuse_rename_in,
        name: &'a OsStr,
        newname: &'a OsStr,
    },
    Link {
        arg: &'a abi::fuse_link_in,
        name: &'a OsStr,
    },
    Open {
        arg: &'a abi::fuse_open_in,
    },
    Read {
        arg: &'a abi::fuse_read_in,
    },
    Write {
        arg: &'a abi::fuse_write_in,
        data: &'a [u8],
    },
    StatFs,
    Release {
        arg: &'a abi::fuse_release_in,
    },
    FSync {
        arg: &'a abi::fuse_fsync_in,
    },
    SetXAttr {
        arg: &'a abi::fuse_setxattr_in,
        name: &'a OsStr,
        value: &'a [u8],
    },
    GetXAttr {
        arg: &'a abi::fuse_getxattr_in,
        name: &'a OsStr,
    },
    ListXAttr {
        arg: &'a abi::fuse_getxattr_in,
    },
    RemoveXAttr {
        name: &'a OsStr,
    },
    Flush {
        arg: &'a abi::fuse_flush_in,
    },
    Init {
        arg: &'a abi::fuse_init_in,
    },
    OpenDir {
        arg: &'a abi::fuse_open_in,
    },
    ReadDir {
        arg: &'a abi::fuse_read_in,
    },
    ReleaseDir {
        arg: &'a abi::fuse_release_in,
    },
    FSyncDir {
        arg: &'a abi::fuse_fsync_in,
    },
    GetLk {
        arg: &'a abi::fuse_lk_in,
    },
    SetLk {
        arg: &'a abi::fuse_lk_in,
    },
    SetLkW {
        arg: &'a abi::fuse_lk_in,
    },
    Access {
        arg: &'a abi::fuse_access_in,
    },
    Create {
        arg: &'a abi::fuse_create_in,
        name: &'a OsStr,
    },
    Interrupt {
        arg: &'a abi::fuse_interrupt_in,
    },
    BMap {
        arg: &'a abi::fuse_bmap_in,
    },
    SetVolName {
        name: &'a OsStr,
    },
    GetXTimes,
    Exchange {
        arg: &'a abi::fuse_exchange_in,
        oldname: &'a OsStr,
        newname: &'a OsStr,
    },
    SetAttrX {
        arg: &'a abi::fuse_setattr_x_in,
    },
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Lookup { name } => write!(f, "LOOKUP name {name:?}"),
            Operation::Forget { arg } => write!(f, "FORGET nlookup {}", arg.nlookup),
            Operation::GetAttr => write!(f, "GETATTR"),
            Operation::SetAttr { arg } => write!(f, "SETATTR valid {:#x}", arg.valid),
            Operation::ReadLink => write!(f, "READLINK"),
            Operation::SymLink { name, link } => {
                write!(f, "SYMLINK name {name:?}, link {link:?}")
            }
            Operation::MkNod { arg, name } => write!(
                f,
                "MKNOD name {name:?}, mode {:#05o}, rdev {}",
                arg.mode, arg.rdev
            ),
            Operation::MkDir { arg, name } => {
                write!(f, "MKDIR name {name:?}, mode {:#05o}", arg.mode)
            }
            Operation::Unlink { name } => write!(f, "UNLINK name {name:?}"),
            Operation::RmDir { name } => write!(f, "RMDIR name {name:?}"),
            Operation::Rename { arg, name, newname } => write!(
                f,
                "RENAME name {name:?}, newdir {:#018x}, newname {newname:?}",
                arg.newdir
            ),
            Operation::Link { arg, name } => {
                write!(f, "LINK name {name:?}, oldnodeid {:#018x}", arg.oldnodeid)
            }
            Operation::Open { arg } => write!(f, "OPEN flags {:#x}", arg.flags),
            Operation::Read { arg } => write!(
                f,
                "READ fh {}, offset {}, size {}",
                arg.fh, arg.offset, arg.size
            ),
            Operation::Write { arg, .. } => write!(
                f,
                "WRITE fh {}, offset {}, size {}, write flags {:#x}",
                arg.fh, arg.offset, arg.size, arg.write_flags
            ),
            Operation::StatFs => write!(f, "STATFS"),
            Operation::Release { arg } => write!(
                f,
                "RELEASE fh {}, flags {:#x}, release flags {:#x}",
                arg.fh, arg.flags, arg.release_flags
            ),
            Operation::FSync { arg } => {
                write!(f, "FSYNC fh {}, fsync flags {:#x}", arg.fh, arg.fsync_flags)
            }
            Operation::SetXAttr { arg, name, .. } => write!(
                f,
                "SETXATTR name {name:?}, size {}, flags {:#x}",
                arg.size, arg.flags
            ),
            Operation::GetXAttr { arg, name } => {
                write!(f, "GETXATTR name {name:?}, size {}", arg.size)
            }
            Operation::ListXAttr { arg } => write!(f, "LISTXATTR size {}", arg.size),
            Operation::RemoveXAttr { name } => write!(f, "REMOVEXATTR name {name:?}"),
            Operation::Flush { arg } => {
                write!(f, "FLUSH fh {}, lock owner {}", arg.fh, arg.lock_owner)
            }
            Operation::Init { arg } => write!(
                f,
                "INIT {}.{}, flags {:#x}, max readahead {}",
                arg.major, arg.minor, arg.flags, arg.max_readahead
            ),
            Operation::OpenDir { arg } => write!(f, "OPENDIR flags {:#x}", arg.flags),
            Operation::ReadDir { arg } => write!(
                f,
                "READDIR fh {}, offset {}, size {}",
                arg.fh, arg.offset, arg.size
            ),
            Operation::ReleaseDir { arg } => {
                write!(f, "RELEASEDIR fh {}, flags {:#x}", arg.fh, arg.flags)
            }
            Operation::FSyncDir { arg } => write!(
                f,
                "FSYNCDIR fh {}, fsync flags {:#x}",
                arg.fh, arg.fsync_flags
            ),
            Operation::GetLk { arg } => write!(f, "GETLK fh {}, owner {}", arg.fh, arg.owner),
            Operation::SetLk { arg } => write!(f, "SETLK fh {}, owner {}", arg.fh, arg.owner),
            Operation::SetLkW { arg } => write!(f, "SETLKW fh {}, owner {}", arg.fh, arg.owner),
            Operation::Access { arg } => write!(f, "ACCESS mask {:#05o}", arg.mask),
            Operation::Create { arg, name } => write!(
                f,
                "CREATE name {name:?}, mode {:#05o}, flags {:#x}",
                arg.mode, arg.flags
            ),
            Operation::Interrupt { arg } => write!(f, "INTERRUPT unique {}", arg.unique),
            Operation::BMap { arg } => {
                write!(f, "BMAP blocksize {}, block {}", arg.blocksize, arg.block)
            }
            Operation::SetVolName { name } => write!(f, "SETVOLNAME name {name:?}"),
            Operation::GetXTimes => write!(f, "GETXTIMES"),
            Operation::Exchange {
                arg,
                oldname,
                newname,
            } => write!(
                f,
                "EXCHANGE olddir {:#018x}, oldname {oldname:?}, newdir {:#018x}, newname {newname:?}, options {:#x}",
                arg.olddir, arg.newdir, arg.options
            ),
            Operation::SetAttrX { arg } => write!(f, "SETATTR_X valid {:#x}", arg.valid),
        }
    }
}

impl<'a> Operation<'a> {
    fn parse(opcode: Opcode, data: &mut ArgumentIterator<'a>) -> Option<Operation<'a>> {
        Some(match opcode {
            Opcode::Lookup => Operation::Lookup {
                name: data.fetch_str()?,
            },
            Opcode::Forget => Operation::Forget { arg: data.fetch()? },
            Opcode::GetAttr => Operation::GetAttr,
            Opcode::SetAttr => Operation::SetAttr { arg: data.fetch()? },
            Opcode::ReadLink => Operation::ReadLink,
            Opcode::SymLink => Operation::SymLink {
                name: data.fetch_str()?,
                link: data.fetch_str()?,
            },
            Opcode::MkNod => Operation::MkNod {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::MkDir => Operation::MkDir {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Unlink => Operation::Unlink {
                name: data.fetch_str()?,
            },
            Opcode::RmDir => Operation::RmDir {
                name: data.fetch_str()?,
            },
            Opcode::Rename => Operation::Rename {
                arg: data.fetch()?,
                name: data.fetch_str()?,
                newname: data.fetch_str()?,
            },
            Opcode::Link => Operation::Link {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Open => Operation::Open { arg: data.fetch()? },
            Opcode::Read => Operation::Read { arg: data.fetch()? },
            Opcode::Write => {
                let arg: &abi::fuse_write_in = data.fetch()?;
                let data = data.fetch_all();
                if data.len() != arg.size as usize {
                    return None;
                }
                Operation::Write { arg, data }
            }
            Opcode::StatFs => Operation::StatFs,
            Opcode::Release => Operation::Release { arg: data.fetch()? },
            Opcode::FSync => Operation::FSync { arg: data.fetch()? },
            Opcode::SetXAttr => {
                let arg: &abi::fuse_setxattr_in = data.fetch()?;
                let name = data.fetch_str()?;
                let value = data.fetch_all();
                if value.len() != arg.size as usize {
                    return None;
                }
                Operation::SetXAttr { arg, name, value }
            }
            Opcode::GetXAttr => Operation::GetXAttr {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::ListXAttr => Operation::ListXAttr { arg: data.fetch()? },
            Opcode::RemoveXAttr => Operation::RemoveXAttr {
                name: data.fetch_str()?,
            },
            Opcode::Flush => Operation::Flush { arg: data.fetch()? },
            Opcode::Init => Operation::Init { arg: data.fetch()? },
            Opcode::OpenDir => Operation::OpenDir { arg: data.fetch()? },
            Opcode::ReadDir => Operation::ReadDir { arg: data.fetch()? },
            Opcode::ReleaseDir => Operation::ReleaseDir { arg: data.fetch()? },
            Opcode::FSyncDir => Operation::FSyncDir { arg: data.fetch()? },
            Opcode::GetLk => Operation::GetLk { arg: data.fetch()? },
            Opcode::SetLk => Operation::SetLk { arg: data.fetch()? },
            Opcode::SetLkW => Operation::SetLkW { arg: data.fetch()? },
            Opcode::Access => Operation::Access { arg: data.fetch()? },
            Opcode::Create => Operation::Create {
                arg: data.fetch()?,
                name: data.fetch_str()?,
            },
            Opcode::Interrupt => Operation::Interrupt { arg: data.fetch()? },
            Opcode::BMap => Operation::BMap { arg: data.fetch()? },
            Opcode::SetVolName => Operation::SetVolName {
                name: data.fetch_str()?,
            },
            Opcode::GetXTimes => Operation::GetXTimes,
            Opcode::Exchange => Operation::Exchange {
                arg: data.fetch()?,
                oldname: data.fetch_str()?,
                newname: data.fetch_str()?,
            },
            Opcode::SetAttrX => Operation::SetAttrX { arg: data.fetch()? },
        })
    }
}

/// One parsed request frame.
#[derive(Debug)]
pub struct AnyRequest<'a> {
    header: &'a abi::fuse_in_header,
    operation: Operation<'a>,
}

impl<'a> AnyRequest<'a> {
    pub fn unique(&self) -> Unique {
        Unique(self.header.unique)
    }

    pub fn nodeid(&self) -> NodeId {
        NodeId(self.header.nodeid)
    }

    pub fn uid(&self) -> u32 {
        self.header.uid
    }

    pub fn gid(&self) -> u32 {
        self.header.gid
    }

    pub fn pid(&self) -> u32 {
        self.header.pid
    }

    pub fn operation(&self) -> &Operation<'a> {
        &self.operation
    }
}

impl fmt::Display for AnyRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FUSE({:3}) ino {:#018x}: {}",
            self.header.unique, self.header.nodeid, self.operation
        )
    }
}

impl<'a> TryFrom<&'a [u8]> for AnyRequest<'a> {
    type Error = RequestError;

    fn try_from(data: &'a [u8]) -> Result<Self, Self::Error> {
        let mut arguments = ArgumentIterator::new(data);
        let header: &abi::fuse_in_header = arguments
            .fetch()
            .ok_or(RequestError::ShortReadHeader(data.len()))?;
        let opcode = Opcode::try_from(header.opcode)
            .map_err(|_| RequestError::UnknownOpcode(header.opcode))?;
        if data.len() < header.len as usize {
            return Err(RequestError::ShortRead(data.len(), header.len as usize));
        }
        // Clip to the announced length; the receive buffer may be larger.
        let payload_len = header.len as usize - mem::size_of::<abi::fuse_in_header>();
        let mut payload = ArgumentIterator::new(&data[mem::size_of::<abi::fuse_in_header>()..][..payload_len]);
        let operation = Operation::parse(opcode, &mut payload)
            .ok_or(RequestError::InsufficientData(opcode))?;
        Ok(AnyRequest { header, operation })
    }
}
