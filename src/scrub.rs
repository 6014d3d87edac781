//! Scrub engine.
//!
//! Selects a subset of `BLK` positions by age (`olderthan` days since the
//! recorded scrub timestamp) and by percentage (the oldest slice of
//! positions), re-reads every disk and parity block at each selected
//! `pos`, and classifies any mismatch as silent-data-corruption (a
//! minority disagrees) or unrecoverable (too many do). Recoverable
//! mismatches are repaired in place and the scrub timestamp is bumped.

use crate::codec::{self, PresentShard};
use crate::error::EngineResult;
use crate::hash::{hash_block, DIGEST_LEN};
use crate::index::{ContentIndex, ScrubInfo};
use crate::model::{BlockKey, BlockState, DiskIndex};
use crate::parityfile::ParityFile;
use crate::sync::DiskBlockSource;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Clean,
    SilentCorruption,
    Unrecoverable,
}

#[derive(Debug, Clone)]
pub struct ScrubFinding {
    pub pos: u64,
    pub classification: Classification,
    pub repaired: bool,
}

#[derive(Debug, Default, Clone)]
pub struct ScrubReport {
    pub checked: u64,
    pub clean: u64,
    pub silent_corruption: u64,
    pub unrecoverable: u64,
    pub repaired: u64,
    pub findings: Vec<ScrubFinding>,
}

pub struct ScrubSelection {
    pub older_than_days: Option<u32>,
    pub percentage: Option<u8>,
    pub now_unix: i64,
}

/// Picks the `BLK` positions due for verification: union of "older than
/// `olderthan` days" and "oldest `percentage%`".
pub fn select_positions(index: &ContentIndex, disk: DiskIndex, sel: &ScrubSelection) -> Vec<u64> {
    let mut candidates: Vec<(u64, i64)> = index
        .repo
        .blocks
        .iter_disk(disk)
        .filter(|(_, s)| matches!(s, BlockState::Blk { .. }))
        .map(|(k, _)| {
            let ts = index.scrub.get(k).map(|s| s.last_scrub_unix).unwrap_or(0);
            (k.pos, ts)
        })
        .collect();

    candidates.sort_by_key(|(_, ts)| *ts);

    let mut selected = std::collections::HashSet::new();

    if let Some(days) = sel.older_than_days {
        let cutoff = sel.now_unix - (days as i64) * 86_400;
        for (pos, ts) in &candidates {
            if *ts <= cutoff {
                selected.insert(*pos);
            }
        }
    }

    if let Some(pct) = sel.percentage {
        let take = (candidates.len() * pct as usize) / 100;
        for (pos, _) in candidates.iter().take(take) {
            selected.insert(*pos);
        }
    }

    let mut out: Vec<u64> = selected.into_iter().collect();
    out.sort_unstable();
    out
}

/// Re-verifies each selected `pos` across every disk plus parity,
/// repairing and re-timestamping when recovery succeeds.
pub fn scrub(
    index: &mut ContentIndex,
    parity_files: &mut [ParityFile],
    source: &dyn DiskBlockSource,
    positions: &[u64],
    now_unix: i64,
) -> EngineResult<ScrubReport> {
    let _span = tracing::info_span!("scrub").entered();
    let block_size = index.repo.block_size;
    let num_disks = index.repo.disks.len();
    let parity_level = parity_files.len() as u8;

    let mut report = ScrubReport::default();

    for &pos in positions {
        report.checked += 1;

        let mut data_blocks: Vec<Vec<u8>> = Vec::with_capacity(num_disks);
        let mut mismatched_disks: Vec<usize> = Vec::new();

        for (i, disk) in index.repo.disks.iter().enumerate() {
            let bytes = source.read_block(disk.index, pos, block_size).unwrap_or_else(|_| vec![0u8; block_size as usize]);
            let expected = index.repo.blocks.get(BlockKey { disk: disk.index, pos }).hash().copied();
            if let Some(expected) = expected {
                let actual = hash_block(index.hash_algo, &index.hash_seed, &bytes);
                if actual != expected {
                    mismatched_disks.push(i);
                }
            }
            data_blocks.push(bytes);
        }

        let mut parity_blocks = Vec::with_capacity(parity_files.len());
        for pf in parity_files.iter() {
            let mut buf = vec![0u8; block_size as usize];
            let _ = pf.read(pos, &mut buf);
            parity_blocks.push(buf);
        }
        let recomputed = codec::encode(&data_blocks, parity_level, block_size as usize)?;
        let parity_mismatched: Vec<usize> = parity_blocks
            .iter()
            .zip(recomputed.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect();

        let total_mismatches = mismatched_disks.len() + parity_mismatched.len();

        if total_mismatches == 0 {
            report.clean += 1;
            index.scrub.insert(BlockKey { disk: 0, pos }, ScrubInfo { last_scrub_unix: now_unix, has_parity: true });
            report.findings.push(ScrubFinding { pos, classification: Classification::Clean, repaired: false });
            continue;
        }

        if mismatched_disks.len() > parity_level as usize {
            report.unrecoverable += 1;
            warn!(pos, mismatches = total_mismatches, "scrub: unrecoverable mismatch");
            report.findings.push(ScrubFinding { pos, classification: Classification::Unrecoverable, repaired: false });
            continue;
        }

        report.silent_corruption += 1;
        let present_data: Vec<PresentShard> = data_blocks
            .iter()
            .enumerate()
            .filter(|(i, _)| !mismatched_disks.contains(i))
            .map(|(i, d)| PresentShard { index: i, data: d.as_slice() })
            .collect();
        let present_parity: Vec<PresentShard> = parity_blocks
            .iter()
            .enumerate()
            .map(|(i, p)| PresentShard { index: i, data: p.as_slice() })
            .collect();

        match codec::recover(num_disks, parity_level, block_size as usize, &present_data, &present_parity, &mismatched_disks) {
            Ok(recovered) => {
                for (&disk_idx, bytes) in mismatched_disks.iter().zip(recovered.iter()) {
                    let disk = index.repo.disks[disk_idx].index;
                    let digest = hash_block(index.hash_algo, &index.hash_seed, bytes);
                    index.repo.blocks.set(
                        BlockKey { disk, pos },
                        BlockState::Blk { hash: digest, file: index.repo.blocks.get(BlockKey { disk, pos }).file().unwrap_or(0) },
                    );
                }
                for &pfi in &parity_mismatched {
                    parity_files[pfi].write(pos, &recomputed[pfi])?;
                }
                index.scrub.insert(BlockKey { disk: 0, pos }, ScrubInfo { last_scrub_unix: now_unix, has_parity: true });
                report.repaired += 1;
                info!(pos, "scrub: repaired silent corruption");
                report.findings.push(ScrubFinding { pos, classification: Classification::SilentCorruption, repaired: true });
            }
            Err(_) => {
                report.unrecoverable += 1;
                report.findings.push(ScrubFinding { pos, classification: Classification::Unrecoverable, repaired: false });
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
        fn read_block(&self, disk: DiskIndex, pos: u64, block_size: u64) -> std::io::Result<Vec<u8>> {
            Ok(self.data.lock().unwrap().get(&(disk, pos)).cloned().unwrap_or_else(|| vec![0u8; block_size as usize]))
        }
    }

    #[test]
    fn select_positions_honors_percentage() {
        let mut repo = Repository::new(16, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        for pos in 0..10u64 {
            repo.blocks.set(BlockKey { disk: d0, pos }, BlockState::Blk { hash: [0u8; DIGEST_LEN], file: 0 });
        }
        let index = ContentIndex::new(repo, HashAlgo::Murmur3, HashSeed([1u8; crate::hash::SEED_LEN]));
        let sel = ScrubSelection { older_than_days: None, percentage: Some(30), now_unix: 0 };
        let positions = select_positions(&index, d0, &sel);
        assert_eq!(positions.len(), 3);
    }

    #[test]
    fn scrub_detects_and_repairs_flipped_bit() {
        let block_size = 16u64;
        let mut repo = Repository::new(block_size, 1);
        let d0 = repo.add_disk("d0".into(), "/mnt/d0".into());
        let d1 = repo.add_disk("d1".into(), "/mnt/d1".into());
        repo.files.insert(d0, FileEntry { id: 0, disk: d0, path: "a.bin".into(), size: block_size, mtime_secs: 0, mtime_nsecs: 0, inode: 1, blocks: vec![0] });
        repo.files.insert(d1, FileEntry { id: 0, disk: d1, path: "b.bin".into(), size: block_size, mtime_secs: 0, mtime_nsecs: 0, inode: 2, blocks: vec![0] });

        let good_a = vec![b'A'; block_size as usize];
        let good_b = vec![b'B'; block_size as usize];
        let seed = HashSeed([4u8; crate::hash::SEED_LEN]);
        repo.blocks.set(BlockKey { disk: d0, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_a), file: 0 });
        repo.blocks.set(BlockKey { disk: d1, pos: 0 }, BlockState::Blk { hash: hash_block(HashAlgo::Murmur3, &seed, &good_b), file: 0 });

        let mut index = ContentIndex::new(repo, HashAlgo::Murmur3, seed.clone());
        let dir = tempfile::tempdir().unwrap();
        let mut parity = vec![ParityFile::open(dir.path().join("p1"), block_size, 1, false, false).unwrap()];
        let good_parity = codec::encode(&[good_a.clone(), good_b.clone()], 1, block_size as usize).unwrap();
        parity[0].write(0, &good_parity[0]).unwrap();

        let mut corrupted_b = good_b.clone();
        corrupted_b[0] ^= 0xFF;
        let mut data = HashMap::new();
        data.insert((d0, 0u64), good_a);
        data.insert((d1, 0u64), corrupted_b);
        let source = MemDisks { data: Mutex::new(data) };

        let report = scrub(&mut index, &mut parity, &source, &[0], 1_000_000).unwrap();
        assert_eq!(report.silent_corruption, 1);
        assert_eq!(report.repaired, 1);
    }
}
