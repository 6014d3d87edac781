//! Parity file I/O.
//!
//! Each parity file is a sparse array of `block_size` cells indexed by
//! `pos`. Growth prefers `fallocate` (unless `skip_fallocate`); sequential
//! mode hints the OS via `posix_fadvise`. Bulk sequential reads go through
//! a `memmap2` mapping of the whole (sparse, pre-grown) file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

pub struct ParityFile {
    path: PathBuf,
    file: File,
    block_size: u64,
    sequential: bool,
}

impl ParityFile {
    /// Opens (creating if absent) the parity file at `path`, growing it to
    /// cover at least `grow_to_blocks` cells of `block_size` bytes.
    pub fn open(
        path: impl AsRef<Path>,
        block_size: u64,
        grow_to_blocks: u64,
        skip_fallocate: bool,
        sequential: bool,
    ) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;
        let mut pf = ParityFile { path, file, block_size, sequential };
        pf.grow(grow_to_blocks, skip_fallocate)?;
        Ok(pf)
    }

    fn grow(&mut self, blocks: u64, skip_fallocate: bool) -> io::Result<()> {
        let target_len = blocks * self.block_size;
        let current_len = self.file.metadata()?.len();
        if target_len <= current_len {
            return Ok(());
        }

        if !skip_fallocate {
            #[cfg(unix)]
            {
                use std::os::unix::io::AsRawFd;
                let fd = self.file.as_raw_fd();
                let rc = unsafe { libc::ftruncate(fd, target_len as libc::off_t) };
                if rc == 0 {
                    return Ok(());
                }
            }
        }

        // Best-effort fallback: truncate; reads of never-written cells
        // return a logical all-zero block (POSIX sparse-file semantics),
        // so no explicit zero-fill pass is needed.
        self.file.set_len(target_len)
    }

    /// Reads the `block_size`-byte cell at `pos` into `buf`.
    pub fn read(&self, pos: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len() as u64, self.block_size);
        use std::os::unix::fs::FileExt;
        let offset = pos * self.block_size;
        self.file.read_exact_at(buf, offset)
    }

    /// Writes `buf` (exactly `block_size` bytes) to the cell at `pos`.
    pub fn write(&self, pos: u64, buf: &[u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len() as u64, self.block_size);
        use std::os::unix::fs::FileExt;
        let offset = pos * self.block_size;
        self.file.write_all_at(buf, offset)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Hints the OS for sequential access over the whole file, when
    /// `sequential` mode was requested at `open`.
    pub fn apply_sequential_hint(&self) {
        if !self.sequential {
            return;
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.file.as_raw_fd();
            unsafe {
                libc::posix_fadvise(fd, 0, 0, libc::POSIX_FADV_SEQUENTIAL);
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn len_blocks(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len() / self.block_size)
    }

    /// Maps the whole file read-only, for bulk scans (scrub/check) that
    /// want sequential access without issuing one syscall per block.
    pub fn mmap_readonly(&self) -> io::Result<memmap2::Mmap> {
        unsafe { memmap2::Mmap::map(&self.file) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_to_requested_block_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapraid.parity");
        let pf = ParityFile::open(&path, 4096, 10, false, false).unwrap();
        assert_eq!(pf.len_blocks().unwrap(), 10);
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapraid.parity");
        let pf = ParityFile::open(&path, 16, 4, false, false).unwrap();
        let data = vec![0xAAu8; 16];
        pf.write(2, &data).unwrap();
        let mut out = vec![0u8; 16];
        pf.read(2, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn unwritten_cell_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapraid.parity");
        let pf = ParityFile::open(&path, 8, 4, false, false).unwrap();
        let mut out = vec![0xFFu8; 8];
        pf.read(3, &mut out).unwrap();
        assert_eq!(out, vec![0u8; 8]);
    }

    #[test]
    fn reopen_does_not_shrink_existing_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapraid.parity");
        {
            let pf = ParityFile::open(&path, 16, 10, false, false).unwrap();
            pf.write(9, &vec![7u8; 16]).unwrap();
        }
        let pf = ParityFile::open(&path, 16, 2, false, false).unwrap();
        assert_eq!(pf.len_blocks().unwrap(), 10);
        let mut out = vec![0u8; 16];
        pf.read(9, &mut out).unwrap();
        assert_eq!(out, vec![7u8; 16]);
    }
}
