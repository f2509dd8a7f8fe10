//! Full-stack smoke test over a real directory: a minimal passthrough
//! filesystem rooted in a tempdir, driven through the whole transport.

use std::ffi::OsStr;
use std::fs;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use fusebus::CallContext;
use fusebus::Caller;
use fusebus::Device;
use fusebus::DirEntry;
use fusebus::Errno;
use fusebus::FileAttr;
use fusebus::FileHandle;
use fusebus::FileType;
use fusebus::NodeId;
use fusebus::OpenAccMode;
use fusebus::OpenFlags;
use fusebus::PathFilesystem;
use fusebus::Server;
use fusebus::SetAttrRequest;
use fusebus::Volume;
use tempfile::TempDir;

struct DiskFs {
    root: PathBuf,
}

impl DiskFs {
    fn real(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rest) => self.root.join(rest),
            Err(_) => self.root.join(path),
        }
    }

    fn attr_of(path: &Path) -> Result<FileAttr, Errno> {
        let meta = fs::symlink_metadata(path).map_err(Errno::from)?;
        let kind = FileType::from_mode(meta.mode()).ok_or(Errno::EIO)?;
        let mtime = meta.modified().unwrap_or(UNIX_EPOCH);
        Ok(FileAttr {
            ino: NodeId(meta.ino()),
            size: meta.size(),
            blocks: meta.blocks(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime,
            ctime: mtime,
            crtime: meta.created().unwrap_or(UNIX_EPOCH),
            kind,
            perm: (meta.mode() & 0o7777) as u16,
            nlink: meta.nlink() as u32,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev() as u32,
            blksize: meta.blksize() as u32,
            flags: 0,
        })
    }
}

impl PathFilesystem for DiskFs {
    fn getattr(&self, path: &Path) -> Result<FileAttr, Errno> {
        Self::attr_of(&self.real(path))
    }

    fn setattr(
        &self,
        path: &Path,
        changes: &SetAttrRequest,
        _fh: Option<FileHandle>,
    ) -> Result<FileAttr, Errno> {
        let real = self.real(path);
        if let Some(size) = changes.size {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&real)
                .map_err(Errno::from)?;
            file.set_len(size).map_err(Errno::from)?;
        }
        Self::attr_of(&real)
    }

    fn create(
        &self,
        path: &Path,
        _mode: u32,
        _flags: OpenFlags,
    ) -> Result<(FileAttr, FileHandle), Errno> {
        let real = self.real(path);
        fs::File::create_new(&real).map_err(Errno::from)?;
        Ok((Self::attr_of(&real)?, FileHandle(0)))
    }

    fn open(&self, path: &Path, _flags: OpenFlags) -> Result<FileHandle, Errno> {
        fs::symlink_metadata(self.real(path)).map_err(Errno::from)?;
        Ok(FileHandle(0))
    }

    fn read(&self, path: &Path, _fh: FileHandle, offset: u64, size: u32) -> Result<Vec<u8>, Errno> {
        let mut file = fs::File::open(self.real(path)).map_err(Errno::from)?;
        file.seek(SeekFrom::Start(offset)).map_err(Errno::from)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]).map_err(Errno::from)? {
                0 => break,
                n => filled += n,
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write(&self, path: &Path, _fh: FileHandle, offset: u64, data: &[u8]) -> Result<u32, Errno> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(self.real(path))
            .map_err(Errno::from)?;
        file.seek(SeekFrom::Start(offset)).map_err(Errno::from)?;
        file.write_all(data).map_err(Errno::from)?;
        Ok(data.len() as u32)
    }

    fn flush(&self, _path: &Path, _fh: FileHandle) -> Result<(), Errno> {
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<(), Errno> {
        fs::remove_file(self.real(path)).map_err(Errno::from)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), Errno> {
        fs::rename(self.real(from), self.real(to)).map_err(Errno::from)
    }

    fn mkdir(&self, path: &Path, _mode: u32) -> Result<FileAttr, Errno> {
        let real = self.real(path);
        fs::create_dir(&real).map_err(Errno::from)?;
        Self::attr_of(&real)
    }

    fn rmdir(&self, path: &Path) -> Result<(), Errno> {
        fs::remove_dir(self.real(path)).map_err(Errno::from)
    }

    fn readdir(&self, path: &Path, _fh: FileHandle) -> Result<Vec<DirEntry>, Errno> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.real(path)).map_err(Errno::from)? {
            let entry = entry.map_err(Errno::from)?;
            let meta = entry.metadata().map_err(Errno::from)?;
            let kind = FileType::from_mode(meta.mode()).ok_or(Errno::EIO)?;
            entries.push(DirEntry {
                ino: meta.ino(),
                offset: 0,
                kind,
                name: entry.file_name(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

fn mount_tempdir() -> (TempDir, Volume, std::thread::JoinHandle<std::io::Result<()>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().expect("tempdir");
    let device = Device::new(1);
    let handle = device.open(0, std::process::id()).expect("open slot");
    let mut server = Server::new(
        DiskFs {
            root: dir.path().to_path_buf(),
        },
        handle,
    );
    let daemon = std::thread::spawn(move || server.run());
    let volume = Volume::mount(&device, 0, &[], Caller::current()).expect("mount");
    (dir, volume, daemon)
}

#[test]
fn create_write_read_against_a_real_directory() {
    let (dir, volume, daemon) = mount_tempdir();
    let ctx = CallContext::new(Caller::current());

    let entry = volume
        .create(&ctx, NodeId::ROOT, OsStr::new("note.txt"), 0o644, OpenAccMode::O_RDWR)
        .unwrap();
    volume
        .write(&ctx, entry.ino, 0, b"written through the transport")
        .unwrap();
    volume.flush(&ctx, entry.ino).unwrap();

    // Visible on the real filesystem.
    let on_disk = fs::read(dir.path().join("note.txt")).unwrap();
    assert_eq!(on_disk, b"written through the transport");

    // And readable back through the mount.
    let data = volume.read(&ctx, entry.ino, 8, 7).unwrap();
    assert_eq!(data, b"through");
    volume.release(&ctx, entry.ino, OpenAccMode::O_RDWR).unwrap();

    volume.unmount();
    daemon.join().unwrap().unwrap();
}

#[test]
fn listing_and_truncation_against_a_real_directory() {
    let (dir, volume, daemon) = mount_tempdir();
    let ctx = CallContext::new(Caller::current());

    fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
    fs::create_dir(dir.path().join("sub")).unwrap();

    volume.opendir(&ctx, NodeId::ROOT).unwrap();
    let names: Vec<_> = volume
        .readdir(&ctx, NodeId::ROOT)
        .unwrap()
        .into_iter()
        .map(|e| (e.name.to_string_lossy().into_owned(), e.kind))
        .collect();
    volume.releasedir(&ctx, NodeId::ROOT).unwrap();
    assert_eq!(
        names,
        vec![
            ("a.txt".to_string(), FileType::RegularFile),
            ("sub".to_string(), FileType::Directory),
        ]
    );

    let entry = volume.lookup(&ctx, NodeId::ROOT, OsStr::new("a.txt")).unwrap();
    assert_eq!(entry.attr.size, 10);
    let attr = volume
        .setattr(
            &ctx,
            entry.ino,
            &SetAttrRequest {
                size: Some(3),
                ..SetAttrRequest::default()
            },
        )
        .unwrap();
    assert_eq!(attr.size, 3);
    assert_eq!(fs::read(dir.path().join("a.txt")).unwrap(), b"012");

    volume.unmount();
    daemon.join().unwrap().unwrap();
}
