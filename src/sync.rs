//! Sync engine, built on top of `codec`, `model`, `index`, and
//! `parityfile`.
//!
//! The outer loop over `pos` is sequential; within one `pos`, every disk's
//! block is read, the codec runs once all reads complete, and parity is
//! written before the `CHG → BLK` transition. `tracing::info!` spans mark
//! each `sync` invocation and each autosave checkpoint.

use crate::codec;
use crate::error::EngineResult;
use crate::hash::{hash_block, HashAlgo, DIGEST_LEN};
use crate::index::ContentIndex;
use crate::model::{BlockKey, BlockState, DiskIndex};
use crate::parityfile::ParityFile;
use crate::scheduler::{Interrupt, Scheduler};
use rayon::prelude::*;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

pub trait DiskBlockSource: Send + Sync {
    fn read_block(&self, disk: DiskIndex, pos: u64, block_size: u64) -> io::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncReport {
    pub positions_scanned: u64,
    pub positions_written: u64,
    pub parity_bytes_written: u64,
    pub interrupted: bool,
}

pub struct SyncOptions {
    pub autosave_bytes: Option<u64>,
    pub skip_sign: bool,
    pub content_paths: Vec<std::path::PathBuf>,
    pub text_content: bool,
}

/// Runs a full sync pass. `parity_files` has one entry per parity level,
/// in level order (index 0 == level 1). Returns once every `pos` in
/// `0..row_count` has been visited or the interrupt fires at a `pos`
/// boundary, at which point at most one more `pos` plus one autosave of
/// extra work happens after the flag is observed.
pub fn sync(
    index: &mut ContentIndex,
    parity_files: &mut [ParityFile],
    source: &dyn DiskBlockSource,
    interrupt: &Interrupt,
    scheduler: &mut Scheduler,
    opts: &SyncOptions,
) -> EngineResult<SyncReport> {
    let _span = tracing::info_span!("sync").entered();
    let block_size = index.repo.block_size;
    let num_disks = index.repo.disks.len();
    let row_count = index.repo.row_count();
    let parity_level = parity_files.len() as u8;

    let mut report = SyncReport::default();
    let mut bytes_since_autosave: u64 = 0;

    for pos in 0..row_count {
        report.positions_scanned += 1;

        let any_pending = index
            .repo
            .disks
            .iter()
            .any(|d| index.repo.blocks.get(BlockKey { disk: d.index, pos }).needs_sync());

        if !any_pending {
            continue;
        }

        // Every disk's read is independent, so fan them out in parallel.
        let reads: Vec<(DiskIndex, io::Result<Vec<u8>>, Duration)> = index
            .repo
            .disks
            .par_iter()
            .map(|disk| {
                let (data, elapsed) = crate::scheduler::timed(|| read_disk_cell(source, disk.index, pos, block_size));
                (disk.index, data, elapsed)
            })
            .collect();

        let mut shards = Vec::with_capacity(num_disks);
        for (disk_idx, data, elapsed) in reads {
            scheduler.record_disk(disk_idx, elapsed);
            shards.push(data?);
        }

        let (parity, cpu_elapsed) = crate::scheduler::timed(|| codec::encode(&shards, parity_level, block_size as usize));
        scheduler.record_cpu(cpu_elapsed);
        let parity = parity?;

        for (level_idx, pf) in parity_files.iter_mut().enumerate() {
            let (result, elapsed) = crate::scheduler::timed(|| pf.write(pos, &parity[level_idx]));
            scheduler.record_parity(level_idx as u8 + 1, elapsed);
            result?;
            report.parity_bytes_written += block_size;
            bytes_since_autosave += block_size;
        }

        for (disk, data) in index.repo.disks.iter().zip(shards.iter()) {
            let key = BlockKey { disk: disk.index, pos };
            let current = index.repo.blocks.get(key).clone();
            if let BlockState::Chg { file, .. } = current {
                let digest = hash_block(index.hash_algo, &index.hash_seed, data);
                index.repo.blocks.set(key, BlockState::Blk { hash: digest, file });
            }
        }

        report.positions_written += 1;
        debug!(pos, "sync: position committed");

        if let Some(threshold) = opts.autosave_bytes {
            if bytes_since_autosave >= threshold {
                index.clear_past_hash = true;
                write_autosave(index, opts)?;
                bytes_since_autosave = 0;
                info!(pos, "sync: autosave checkpoint written");
            }
        }

        if interrupt.is_set() {
            index.clear_past_hash = true;
            write_autosave(index, opts)?;
            report.interrupted = true;
            info!(pos, "sync: interrupted, autosave written, exiting cleanly");
            return Ok(report);
        }
    }

    index.clear_past_hash = false;
    write_autosave(index, opts)?;
    info!(positions_written = report.positions_written, "sync: complete");
    Ok(report)
}

fn read_disk_cell(source: &dyn DiskBlockSource, disk: DiskIndex, pos: u64, block_size: u64) -> io::Result<Vec<u8>> {
    match source.read_block(disk, pos, block_size) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(vec![0u8; block_size as usize]),
        Err(e) => Err(e),
    }
}

fn write_autosave(index: &ContentIndex, opts: &SyncOptions) -> EngineResult<()> {
    if opts.content_paths.is_empty() {
        return Ok(());
    }
    let paths: Vec<&Path> = opts.content_paths.iter().map(|p| p.as_path()).collect();
    index.write_all(&paths, opts.text_content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashSeed;
    use crate::model::{FileEntry, Repository};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemDisks {
        data: Mutex<HashMap<(DiskIndex, u64), Vec<u8>>>,
    }

    impl DiskBlockSource for MemDisks {
        fn read_block(&self, disk: DiskIndex, pos: u64, block_size: u64) -> io::Result<Vec<u8>> {
            let guard = self.data.lock().unwrap();
            match guard.get(&(disk, pos)) {
                Some(v) => Ok(v.clone()),
                None => Ok(vec![0u8; block_size as usize]),
            }
        }
    }

    fn build_two_disk_repo(block_size: u64) -> (ContentIndex, MemDisks) {
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("disk0".into(), "/mnt/disk0".into());
        let d1 = repo.add_disk("disk1".into(), "/mnt/disk1".into());

        repo.files.insert(d0, FileEntry {
            id: 0, disk: d0, path: "a.bin".into(), size: block_size,
            mtime_secs: 0, mtime_nsecs: 0, inode: 1, blocks: vec![0],
        });
        repo.files.insert(d1, FileEntry {
            id: 0, disk: d1, path: "b.bin".into(), size: block_size,
            mtime_secs: 0, mtime_nsecs: 0, inode: 2, blocks: vec![0],
        });
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Chg { hash: [0u8; DIGEST_LEN], file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Chg { hash: [0u8; DIGEST_LEN], file: 0 });

        let index = ContentIndex::new(repo, HashAlgo::Murmur3, HashSeed([1u8; crate::hash::SEED_LEN]));

        let mut data = HashMap::new();
        data.insert((d0, 0u64), vec![b'A'; block_size as usize]);
        data.insert((d1, 0u64), vec![b'B'; block_size as usize]);
        (index, MemDisks { data: Mutex::new(data) })
    }

    #[test]
    fn s1_basic_sync_xors_two_disks_into_parity() {
        let block_size = 64u64;
        let (mut index, disks) = build_two_disk_repo(block_size);
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("snapraid.parity"), block_size, 1, false, false).unwrap()];

        let opts = SyncOptions { autosave_bytes: None, skip_sign: false, content_paths: vec![], text_content: false };
        let report = sync(&mut index, &mut parity, &disks, &Interrupt::new(), &mut Scheduler::new(), &opts).unwrap();

        assert_eq!(report.positions_written, 1);
        let mut buf = vec![0u8; block_size as usize];
        parity[0].read(0, &mut buf).unwrap();
        let expected: Vec<u8> = (0..block_size as usize).map(|_| b'A' ^ b'B').collect();
        assert_eq!(buf, expected);

        for disk in &index.repo.disks {
            let state = index.repo.blocks.get(BlockKey { disk: disk.index, pos: 0 }).clone();
            assert!(matches!(state, BlockState::Blk { .. }));
        }
    }

    #[test]
    fn idempotent_second_sync_writes_nothing() {
        let block_size = 32u64;
        let (mut index, disks) = build_two_disk_repo(block_size);
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("snapraid.parity"), block_size, 1, false, false).unwrap()];
        let opts = SyncOptions { autosave_bytes: None, skip_sign: false, content_paths: vec![], text_content: false };

        sync(&mut index, &mut parity, &disks, &Interrupt::new(), &mut Scheduler::new(), &opts).unwrap();
        let second = sync(&mut index, &mut parity, &disks, &Interrupt::new(), &mut Scheduler::new(), &opts).unwrap();

        assert_eq!(second.positions_written, 0);
        assert_eq!(second.parity_bytes_written, 0);
    }

    #[test]
    fn interrupt_stops_after_current_position_and_autosaves() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("disk0".into(), "/mnt/disk0".into());
        let mut data = HashMap::new();
        for pos in 0..5u64 {
            repo.blocks.set(BlockKey { disk: d0, pos }, BlockState::Chg { hash: [0u8; DIGEST_LEN], file: 0 });
            data.insert((d0, pos), vec![pos as u8; block_size as usize]);
        }
        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, HashSeed([2u8; crate::hash::SEED_LEN]));
        let disks = MemDisks { data: Mutex::new(data) };
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("snapraid.parity"), block_size, 5, false, false).unwrap()];

        let interrupt = Interrupt::new();
        interrupt.set();
        let content_path = dir.path().join("snapraid.content");
        let opts = SyncOptions {
            autosave_bytes: None,
            skip_sign: false,
            content_paths: vec![content_path.clone()],
            text_content: false,
        };

        let report = sync(&mut index, &mut parity, &disks, &interrupt, &mut Scheduler::new(), &opts).unwrap();
        assert!(report.interrupted);
        assert_eq!(report.positions_written, 1);
        assert!(content_path.exists());
    }
}
