//! OS-portability layer.
//!
//! A narrow trait covering exactly the filesystem primitives the engine
//! needs — stat variants, positioned read/write, fsync, rename, and the
//! link/symlink/readdir family — rather than wrapping all of `std::fs`.
//! Keeping this seam small is what lets `scanner.rs`/`parityfile.rs` be
//! tested against an in-memory fake later without dragging in a real
//! filesystem.

use std::io;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct Metadata {
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nsecs: u32,
    pub inode: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

pub trait Vfs: Send + Sync {
    fn stat_ex(&self, path: &Path) -> io::Result<Metadata>;
    fn lstat(&self, path: &Path) -> io::Result<Metadata>;
    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
    fn write_at(&self, path: &Path, offset: u64, buf: &[u8]) -> io::Result<usize>;
    fn fsync(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn readlink(&self, path: &Path) -> io::Result<std::path::PathBuf>;
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
    fn hardlink(&self, original: &Path, link: &Path) -> io::Result<()>;
    fn opendir(&self, path: &Path) -> io::Result<Vec<std::path::PathBuf>>;
}

/// Direct passthrough to `std::fs` plus `libc` for the calls `std::fs`
/// doesn't expose (positioned I/O without disturbing a shared file
/// offset, raw inode numbers).
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixVfs;

impl Vfs for UnixVfs {
    fn stat_ex(&self, path: &Path) -> io::Result<Metadata> {
        metadata_of(std::fs::metadata(path)?)
    }

    fn lstat(&self, path: &Path) -> io::Result<Metadata> {
        metadata_of(std::fs::symlink_metadata(path)?)
    }

    fn read_at(&self, path: &Path, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        let file = std::fs::File::open(path)?;
        file.read_at(buf, offset)
    }

    fn write_at(&self, path: &Path, offset: u64, buf: &[u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        let file = std::fs::OpenOptions::new().write(true).create(true).open(path)?;
        file.write_at(buf, offset)
    }

    fn fsync(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::open(path)?;
        file.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn readlink(&self, path: &Path) -> io::Result<std::path::PathBuf> {
        std::fs::read_link(path)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    fn hardlink(&self, original: &Path, link: &Path) -> io::Result<()> {
        std::fs::hard_link(original, link)
    }

    fn opendir(&self, path: &Path) -> io::Result<Vec<std::path::PathBuf>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            out.push(entry?.path());
        }
        Ok(out)
    }
}

fn metadata_of(meta: std::fs::Metadata) -> io::Result<Metadata> {
    use std::os::unix::fs::MetadataExt;
    Ok(Metadata {
        size: meta.len(),
        mtime_secs: meta.mtime(),
        mtime_nsecs: meta.mtime_nsec() as u32,
        inode: meta.ino(),
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_at_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"").unwrap();
        let vfs = UnixVfs;
        vfs.write_at(&path, 4, b"data").unwrap();
        let mut buf = [0u8; 4];
        let n = vfs.read_at(&path, 4, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn stat_ex_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello").unwrap();
        let meta = UnixVfs.stat_ex(&path).unwrap();
        assert_eq!(meta.size, 5);
        assert!(!meta.is_dir);
    }
}
