//! Decoding of packed READDIR streams.
//!
//! The daemon returns a run of `{ino, off, namelen, type}` records, each
//! followed by the name padded to the dirent alignment; a short record
//! terminates the stream. Decoding turns that into host directory entries,
//! optionally hiding the AppleDouble litter some hosts ask to skip.

use std::ffi::OsStr;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;

use log::warn;
use zerocopy::FromBytes;

use crate::DirEntry;
use crate::FileType;
use crate::ll::Errno;
use crate::ll::fuse_abi as abi;

fn kind_from_dirent_type(typ: u32) -> FileType {
    match typ as u8 {
        libc::DT_FIFO => FileType::NamedPipe,
        libc::DT_CHR => FileType::CharDevice,
        libc::DT_DIR => FileType::Directory,
        libc::DT_BLK => FileType::BlockDevice,
        libc::DT_REG => FileType::RegularFile,
        libc::DT_LNK => FileType::Symlink,
        libc::DT_SOCK => FileType::Socket,
        other => {
            warn!("unknown dirent type {other}, treating as regular file");
            FileType::RegularFile
        }
    }
}

/// Whether a name is AppleDouble litter (`.DS_Store`, `._*`).
pub(crate) fn is_apple_double(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes == b".DS_Store" || bytes.starts_with(b"._")
}

/// Decodes one READDIR reply. A record with zero namelen is a protocol
/// error; a namelen beyond the maximum is fatal for the whole call. The
/// caller filters AppleDouble names afterwards so resume offsets survive
/// the filtering.
pub(crate) fn decode(stream: &[u8]) -> Result<Vec<DirEntry>, Errno> {
    let mut entries = Vec::new();
    let mut rest = stream;
    loop {
        let Ok((header, after)) = abi::fuse_dirent::read_from_prefix(rest) else {
            // Short record: end of stream.
            break;
        };
        if header.namelen == 0 {
            return Err(Errno::EIO);
        }
        if header.namelen as usize > abi::NAME_MAX {
            return Err(Errno::EIO);
        }
        let namelen = header.namelen as usize;
        if after.len() < namelen {
            return Err(Errno::EIO);
        }
        let name = OsStr::from_bytes(&after[..namelen]);
        let padded =
            (size_of::<abi::fuse_dirent>() + namelen).next_multiple_of(abi::DIRENT_ALIGN);
        let advance = padded - size_of::<abi::fuse_dirent>();
        entries.push(DirEntry {
            ino: header.ino,
            offset: header.off,
            kind: kind_from_dirent_type(header.typ),
            name: name.to_owned(),
        });
        rest = after.get(advance..).unwrap_or(&[]);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ll::Unique;
    use crate::ll::reply::DirEntList;
    use crate::ll::reply::Response;

    fn stream(names: &[(&str, FileType)]) -> Vec<u8> {
        let mut list = DirEntList::new(64 * 1024);
        for (i, (name, kind)) in names.iter().enumerate() {
            assert!(!list.push(i as u64 + 2, i as u64 + 1, *kind, OsStr::new(name)));
        }
        let frame = Response::new_directory(list).into_frame(Unique(1));
        frame[size_of::<abi::fuse_out_header>()..].to_vec()
    }

    #[test]
    fn decode_round_trip() {
        let bytes = stream(&[
            ("hello.txt", FileType::RegularFile),
            ("sub", FileType::Directory),
            ("link", FileType::Symlink),
        ]);
        let entries = decode(&bytes).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "hello.txt");
        assert_eq!(entries[0].ino, 2);
        assert_eq!(entries[1].kind, FileType::Directory);
        assert_eq!(entries[2].offset, 3);
    }

    #[test]
    fn apple_double_names_are_recognised() {
        for name in [".DS_Store", "._shadow", "._"] {
            assert!(is_apple_double(OsStr::new(name)), "{name}");
        }
        for name in ["DS_Store", ".dstore", "file._x", "_hidden"] {
            assert!(!is_apple_double(OsStr::new(name)), "{name}");
        }
    }

    #[test]
    fn zero_namelen_is_a_protocol_error() {
        let header = abi::fuse_dirent {
            ino: 2,
            off: 1,
            namelen: 0,
            typ: libc::DT_REG as u32,
        };
        let bytes = zerocopy::IntoBytes::as_bytes(&header).to_vec();
        assert_eq!(decode(&bytes).unwrap_err(), Errno::EIO);
    }

    #[test]
    fn oversized_name_is_fatal() {
        let header = abi::fuse_dirent {
            ino: 2,
            off: 1,
            namelen: abi::NAME_MAX as u32 + 1,
            typ: libc::DT_REG as u32,
        };
        let mut bytes = zerocopy::IntoBytes::as_bytes(&header).to_vec();
        bytes.extend_from_slice(&[b'x'; 300]);
        assert_eq!(decode(&bytes).unwrap_err(), Errno::EIO);
    }

    #[test]
    fn truncated_tail_terminates() {
        let bytes = stream(&[("solo", FileType::RegularFile)]);
        // A dangling half-header after the last record is a terminator.
        let mut with_tail = bytes.clone();
        with_tail.extend_from_slice(&[0u8; 7]);
        let entries = decode(&with_tail).unwrap();
        assert_eq!(entries.len(), 1);
    }
}
