//! Check / fix engine.
//!
//! `check` is scrub's verification pass widened to every in-scope `pos`
//! and stripped of any write: it reports verified/recovered/unrecoverable/
//! garbage counts only. `fix` runs the same verification but writes
//! recovered data back to the owning disk file(s) through a
//! `DiskBlockSink`, extending files to at least the recovered size.
//! Recovery at a `pos` succeeds iff the codec can reconstruct every
//! missing block there from at most `p` missing shards — the same
//! threshold `scrub.rs` uses, since both ultimately call `codec::recover`.

use crate::codec::{self, PresentShard};
use crate::error::EngineResult;
use crate::filter::Filter;
use crate::hash::hash_block;
use crate::index::ContentIndex;
use crate::model::{BlockKey, BlockState, DiskIndex};
use crate::parityfile::ParityFile;
use crate::sync::DiskBlockSource;
use std::io;
use tracing::{info, warn};

pub trait DiskBlockSink {
    fn write_block(&self, disk: DiskIndex, pos: u64, bytes: &[u8]) -> io::Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub verified: u64,
    pub recovered: u64,
    pub unrecoverable: u64,
    pub garbage: u64,
    /// Positions where a parity block disagreed with what the data shards
    /// produce, whether or not data recovery was also needed there.
    pub parity_errors: u64,
}

pub struct CheckOptions {
    /// Disk content with no model entry at all ("garbage"). Computed by
    /// the scanner pass that runs ahead of check/fix; defaults to 0 when
    /// the caller hasn't wired one up.
    pub known_garbage: u64,
    pub write_back: bool,
    /// `-e <error>` error-state selection. Positions whose error kind
    /// (`"missing"`, `"parity"`, `"unrecoverable"`) the filter excludes are
    /// skipped entirely, as if they were still clean.
    pub error_filter: Filter,
}

/// Checks recovered data shards against the hash already on record, so a
/// reconstruction built from a corrupted parity shard doesn't get accepted
/// as genuine.
fn recovered_matches_expected(index: &ContentIndex, missing: &[usize], disk_ids: &[DiskIndex], pos: u64, recovered: &[Vec<u8>]) -> bool {
    for (&disk_pos, bytes) in missing.iter().zip(recovered.iter()) {
        let disk = disk_ids[disk_pos];
        let expected = index.repo.blocks.get(BlockKey { disk, pos }).hash().copied();
        if let Some(expected) = expected {
            if hash_block(index.hash_algo, &index.hash_seed, bytes) != expected {
                return false;
            }
        }
    }
    true
}

/// Shared verification core for both `check` and `fix`: `opts.write_back`
/// controls whether recovered bytes are written to `sink` or only counted.
pub fn run(
    index: &mut ContentIndex,
    parity_files: &mut [ParityFile],
    source: &dyn DiskBlockSource,
    sink: Option<&dyn DiskBlockSink>,
    opts: &CheckOptions,
) -> EngineResult<CheckReport> {
    let _span = tracing::info_span!("checkfix", fix = opts.write_back).entered();
    let block_size = index.repo.block_size;
    let num_disks = index.repo.disks.len();
    let parity_level = parity_files.len() as u8;
    let row_count = index.repo.row_count();
    let disk_ids: Vec<DiskIndex> = index.repo.disks.iter().map(|d| d.index).collect();

    let mut report = CheckReport { garbage: opts.known_garbage, ..Default::default() };

    for pos in 0..row_count {
        let in_scope = index
            .repo
            .disks
            .iter()
            .any(|d| matches!(index.repo.blocks.get(BlockKey { disk: d.index, pos }), BlockState::Blk { .. } | BlockState::Chg { .. }));
        if !in_scope {
            continue;
        }

        let mut data_blocks = Vec::with_capacity(num_disks);
        let mut missing: Vec<usize> = Vec::new();

        for (i, disk) in index.repo.disks.iter().enumerate() {
            let key = BlockKey { disk: disk.index, pos };
            let expected = index.repo.blocks.get(key).hash().copied();
            match source.read_block(disk.index, pos, block_size) {
                Ok(bytes) => {
                    let ok = match expected {
                        Some(h) => hash_block(index.hash_algo, &index.hash_seed, &bytes) == h,
                        None => true,
                    };
                    if !ok {
                        missing.push(i);
                    }
                    data_blocks.push(bytes);
                }
                Err(_) => {
                    missing.push(i);
                    data_blocks.push(vec![0u8; block_size as usize]);
                }
            }
        }

        let mut parity_blocks = Vec::with_capacity(parity_files.len());
        for pf in parity_files.iter() {
            let mut buf = vec![0u8; block_size as usize];
            let _ = pf.read(pos, &mut buf);
            parity_blocks.push(buf);
        }

        if missing.is_empty() {
            // Data is known good; any disagreement here is parity corruption
            // on its own, independent of recovery.
            let recomputed = codec::encode(&data_blocks, parity_level, block_size as usize)?;
            let parity_mismatched: Vec<usize> = parity_blocks
                .iter()
                .zip(recomputed.iter())
                .enumerate()
                .filter(|(_, (a, b))| a != b)
                .map(|(i, _)| i)
                .collect();

            if parity_mismatched.is_empty() {
                report.verified += 1;
                continue;
            }

            if !opts.error_filter.allows_error("parity") {
                continue;
            }

            report.parity_errors += 1;
            warn!(pos, count = parity_mismatched.len(), "check: parity block(s) disagree with data");
            if opts.write_back {
                for &pfi in &parity_mismatched {
                    parity_files[pfi].write(pos, &recomputed[pfi])?;
                }
            }
            continue;
        }

        if missing.len() > parity_level as usize {
            if !opts.error_filter.allows_error("unrecoverable") {
                continue;
            }
            report.unrecoverable += 1;
            warn!(pos, missing = missing.len(), "check: unrecoverable");
            continue;
        }

        if !opts.error_filter.allows_error("missing") {
            continue;
        }

        let present_data: Vec<PresentShard> = data_blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| !missing.contains(i))
            .map(|(i, d)| PresentShard { index: i, data: d.as_slice() })
            .collect();

        // Try every parity shard first, then fall back to excluding one at a
        // time: a parity shard corrupted at the same time as a data shard
        // would otherwise poison the reconstruction silently (it decodes
        // without error, just to the wrong bytes).
        let all_parity: Vec<usize> = (0..parity_blocks.len()).collect();
        let mut recovered_with: Option<(Vec<Vec<u8>>, Vec<usize>)> = None;

        let full_present: Vec<PresentShard> =
            all_parity.iter().map(|&i| PresentShard { index: i, data: parity_blocks[i].as_slice() }).collect();
        if let Ok(recovered) = codec::recover(num_disks, parity_level, block_size as usize, &present_data, &full_present, &missing) {
            if recovered_matches_expected(index, &missing, &disk_ids, pos, &recovered) {
                recovered_with = Some((recovered, Vec::new()));
            }
        }

        if recovered_with.is_none() {
            for excl in all_parity.iter().copied() {
                let usable: Vec<usize> = all_parity.iter().copied().filter(|&i| i != excl).collect();
                if missing.len() > usable.len() {
                    continue;
                }
                let present_parity: Vec<PresentShard> =
                    usable.iter().map(|&i| PresentShard { index: i, data: parity_blocks[i].as_slice() }).collect();
                if let Ok(recovered) = codec::recover(num_disks, parity_level, block_size as usize, &present_data, &present_parity, &missing) {
                    if recovered_matches_expected(index, &missing, &disk_ids, pos, &recovered) {
                        recovered_with = Some((recovered, vec![excl]));
                        break;
                    }
                }
            }
        }

        match recovered_with {
            Some((recovered, bad_parity)) => {
                report.recovered += 1;
                info!(pos, count = recovered.len(), "check: recovered block(s)");
                if !bad_parity.is_empty() {
                    report.parity_errors += 1;
                    warn!(pos, parity = ?bad_parity, "check: parity block disagreed during recovery");
                }

                for (&disk_idx, bytes) in missing.iter().zip(recovered.iter()) {
                    let disk = index.repo.disks[disk_idx].index;
                    if opts.write_back {
                        if let Some(sink) = sink {
                            sink.write_block(disk, pos, bytes)?;
                        }
                        let digest = hash_block(index.hash_algo, &index.hash_seed, bytes);
                        let key = BlockKey { disk, pos };
                        let file = index.repo.blocks.get(key).file().unwrap_or(0);
                        index.repo.blocks.set(key, BlockState::Blk { hash: digest, file });
                    }
                }

                if opts.write_back && !bad_parity.is_empty() {
                    let mut full_data = data_blocks.clone();
                    for (&disk_idx, bytes) in missing.iter().zip(recovered.iter()) {
                        full_data[disk_idx] = bytes.clone();
                    }
                    let recomputed = codec::encode(&full_data, parity_level, block_size as usize)?;
                    for &pfi in &bad_parity {
                        parity_files[pfi].write(pos, &recomputed[pfi])?;
                    }
                }
            }
            None => {
                report.unrecoverable += 1;
                warn!(pos, "check: recovery failed or produced unverifiable data");
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashAlgo, HashSeed};
    use crate::model::{FileEntry, Repository};
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemDisks {
        data: Mutex<HashMap<(DiskIndex, u64), Vec<u8>>>,
    }

    impl DiskBlockSource for MemDisks {
        fn read_block(&self, disk: DiskIndex, pos: u64, block_size: u64) -> io::Result<Vec<u8>> {
            match self.data.lock().unwrap().get(&(disk, pos)) {
                Some(v) => Ok(v.clone()),
                None => Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
    }

    impl DiskBlockSink for MemDisks {
        fn write_block(&self, disk: DiskIndex, pos: u64, bytes: &[u8]) -> io::Result<()> {
            self.data.lock().unwrap().insert((disk, pos), bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn s2_fix_recovers_a_zeroed_disk_block() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        let d1 = repo.add_disk("d1".into(), "/mnt/d1".into());
        repo.files.insert(d0, FileEntry { id: 0, disk: d0, path: "a.bin".into(), size: block_size, mtime_secs: 0, mtime_nsecs: 0, inode: 1, blocks: vec![0] });
        repo.files.insert(d1, FileEntry { id: 0, disk: d1, path: "b.bin".into(), size: block_size, mtime_secs: 0, mtime_nsecs: 0, inode: 2, blocks: vec![0] });

        let seed = HashSeed([6u8; crate::hash::SEED_LEN]);
        let good_a = vec![b'A'; block_size as usize];
        let good_b = vec![b'B'; block_size as usize];
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_a), file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_b), file: 0 });

        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, seed.clone());
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("p1"), block_size, 1, false, false).unwrap()];
        let good_parity = codec::encode(&[good_a.clone(), good_b.clone()], 1, block_size as usize).unwrap();
        parity[0].write(0, &good_parity[0]).unwrap();

        // disk1's file is missing entirely (e.g. zeroed out / deleted)
        let mut data = HashMap::new();
        data.insert((d0, 0u64), good_a);
        let disks = MemDisks { data: Mutex::new(data) };

        let opts = CheckOptions { known_garbage: 0, write_back: true, error_filter: Filter::new() };
        let report = run(&mut index, &mut parity, &disks, Some(&disks), &opts).unwrap();

        assert_eq!(report.recovered, 1);
        let recovered = disks.data.lock().unwrap().get(&(d1, 0)).cloned().unwrap();
        assert_eq!(recovered, good_b);
    }

    #[test]
    fn check_mode_never_writes() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        let d1 = repo.add_disk("d1".into(), "/mnt/d1".into());
        let seed = HashSeed([8u8; crate::hash::SEED_LEN]);
        let good_a = vec![b'A'; block_size as usize];
        let good_b = vec![b'B'; block_size as usize];
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_a), file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_b), file: 0 });

        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, seed.clone());
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("p1"), block_size, 1, false, false).unwrap()];
        let good_parity = codec::encode(&[good_a.clone(), good_b.clone()], 1, block_size as usize).unwrap();
        parity[0].write(0, &good_parity[0]).unwrap();

        let mut data = HashMap::new();
        data.insert((d0, 0u64), good_a);
        let disks = MemDisks { data: Mutex::new(data) };

        let opts = CheckOptions { known_garbage: 0, write_back: false, error_filter: Filter::new() };
        let report = run(&mut index, &mut parity, &disks, None, &opts).unwrap();
        assert_eq!(report.recovered, 1);
        assert!(disks.data.lock().unwrap().get(&(d1, 0)).is_none());
    }

    #[test]
    fn reports_pure_parity_corruption_when_data_is_intact() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        let d1 = repo.add_disk("d1".into(), "/mnt/d1".into());
        let seed = HashSeed([11u8; crate::hash::SEED_LEN]);
        let good_a = vec![b'A'; block_size as usize];
        let good_b = vec![b'B'; block_size as usize];
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_a), file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_b), file: 0 });

        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, seed);
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("p1"), block_size, 1, false, false).unwrap()];
        parity[0].write(0, &vec![0xFFu8; block_size as usize]).unwrap();

        let mut data = HashMap::new();
        data.insert((d0, 0u64), good_a);
        data.insert((d1, 0u64), good_b);
        let disks = MemDisks { data: Mutex::new(data) };

        let opts = CheckOptions { known_garbage: 0, write_back: true, error_filter: Filter::new() };
        let report = run(&mut index, &mut parity, &disks, None, &opts).unwrap();
        assert_eq!(report.verified, 0);
        assert_eq!(report.parity_errors, 1);

        let mut fixed = vec![0u8; block_size as usize];
        parity[0].read(0, &mut fixed).unwrap();
        let expected = codec::encode(&[vec![b'A'; block_size as usize], vec![b'B'; block_size as usize]], 1, block_size as usize).unwrap();
        assert_eq!(fixed, expected[0]);
    }

    #[test]
    fn error_filter_skips_excluded_kind() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        let d1 = repo.add_disk("d1".into(), "/mnt/d1".into());
        let seed = HashSeed([13u8; crate::hash::SEED_LEN]);
        let good_a = vec![b'A'; block_size as usize];
        let good_b = vec![b'B'; block_size as usize];
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_a), file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_b), file: 0 });

        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, seed);
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("p1"), block_size, 1, false, false).unwrap()];
        parity[0].write(0, &vec![0xFFu8; block_size as usize]).unwrap();

        let mut data = HashMap::new();
        data.insert((d0, 0u64), good_a);
        data.insert((d1, 0u64), good_b);
        let disks = MemDisks { data: Mutex::new(data) };

        let mut error_filter = Filter::new();
        error_filter.exclude_error("parity");
        let opts = CheckOptions { known_garbage: 0, write_back: true, error_filter };
        let report = run(&mut index, &mut parity, &disks, None, &opts).unwrap();
        assert_eq!(report.verified, 0);
        assert_eq!(report.parity_errors, 0);

        let mut untouched = vec![0u8; block_size as usize];
        parity[0].read(0, &mut untouched).unwrap();
        assert_eq!(untouched, vec![0xFFu8; block_size as usize]);
    }
}
