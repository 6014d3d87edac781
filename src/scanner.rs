//! Scanner & reconciler.
//!
//! Walks a disk's tree through the `Vfs` seam, then reconciles the result
//! against the loaded model with a three-way cascade: exact path match,
//! then `(size, mtime, inode)` identity matching for renames, then
//! first-block-hash matching for genuine copies. A safety gate refuses to
//! silently delete a disk's worth of history unless `force_empty` is set;
//! see DESIGN.md for the chosen threshold.

use crate::error::EngineResult;
use crate::filter::Filter;
use crate::hash::{hash_block, HashAlgo, HashSeed, DIGEST_LEN};
use crate::model::{BlockKey, BlockState, DiskIndex, FileEntry, Repository};
use crate::vfs::Vfs;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

/// The fraction of a disk's previously-known files that may disappear in
/// one scan before the safety gate refuses to proceed without
/// `force_empty`. Chosen as a conservative majority threshold: losing more
/// than half a disk's files in one pass is far more likely to be an
/// unmounted disk than real deletions; see DESIGN.md for the reasoning.
pub const DISAPPEARED_FRACTION_GATE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub path: String,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nsecs: u32,
    pub inode: u64,
}

/// Walks `root` on `disk`, applying `filter` to the path relative to
/// `root`. Directories are never filtered themselves — only the regular
/// files found inside them.
pub fn scan_disk(vfs: &dyn Vfs, root: &Path, filter: &Filter) -> io::Result<Vec<ScanEntry>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in vfs.opendir(&dir)? {
            let meta = vfs.lstat(&entry)?;
            let rel = entry
                .strip_prefix(root)
                .unwrap_or(&entry)
                .to_string_lossy()
                .into_owned();
            if meta.is_symlink {
                continue;
            }
            if meta.is_dir {
                stack.push(entry);
                continue;
            }
            if !filter.allows_path(&rel) {
                continue;
            }
            out.push(ScanEntry {
                path: rel,
                size: meta.size,
                mtime_secs: meta.mtime_secs,
                mtime_nsecs: meta.mtime_nsecs,
                inode: meta.inode,
            });
        }
    }
    Ok(out)
}

#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub unchanged: usize,
    pub changed: usize,
    pub renamed: usize,
    pub copied: usize,
    pub added: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub force_empty: bool,
    pub force_nocopy: bool,
}

/// Raised when the scan would delete more of a disk's history than
/// `DISAPPEARED_FRACTION_GATE` allows and `force_empty` was not given.
#[derive(Debug)]
pub struct TooManyDisappeared {
    pub disk: DiskIndex,
    pub previously_known: usize,
    pub still_present: usize,
}

impl std::fmt::Display for TooManyDisappeared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scan: {} of {} previously known files on disk {} are gone; rerun with force_empty if intentional",
            self.previously_known - self.still_present,
            self.previously_known,
            self.disk
        )
    }
}
impl std::error::Error for TooManyDisappeared {}

/// A block reader abstraction so the reconciler can hash file contents
/// for copy detection without owning the I/O layer itself.
pub trait BlockReader {
    fn read_block(&self, path: &str, index: u64, block_size: u64) -> io::Result<Vec<u8>>;
}

pub fn reconcile(
    repo: &mut Repository,
    disk: DiskIndex,
    scanned: &[ScanEntry],
    reader: &dyn BlockReader,
    algo: HashAlgo,
    seed: &HashSeed,
    cfg: ReconcileConfig,
) -> EngineResult<ReconcileReport> {
    let block_size = repo.block_size;
    let mut report = ReconcileReport::default();

    let loaded: Vec<FileEntry> = repo.files.iter_disk(disk).cloned().collect();
    let mut matched_ids: HashSet<u64> = HashSet::new();
    let by_path: HashMap<&str, &FileEntry> = loaded.iter().map(|f| (f.path.as_str(), f)).collect();
    let by_identity: HashMap<(u64, i64, u32, u64), Vec<&FileEntry>> = {
        let mut m: HashMap<(u64, i64, u32, u64), Vec<&FileEntry>> = HashMap::new();
        for f in &loaded {
            m.entry((f.size, f.mtime_secs, f.mtime_nsecs, f.inode)).or_default().push(f);
        }
        m
    };

    // First-block hash index over every still-loaded block, for
    // content-based copy detection.
    let mut first_block_hash_index: HashMap<[u8; DIGEST_LEN], &FileEntry> = HashMap::new();
    for f in &loaded {
        if let Some(&first_pos) = f.blocks.first() {
            if let Some(hash) = repo.blocks.get(BlockKey { disk, pos: first_pos }).hash() {
                first_block_hash_index.insert(*hash, f);
            }
        }
    }

    if !cfg.force_empty && !loaded.is_empty() {
        let still_present = scanned.len().min(loaded.len());
        let disappeared = loaded.len().saturating_sub(still_present);
        if (disappeared as f64) / (loaded.len() as f64) > DISAPPEARED_FRACTION_GATE {
            return Err(Box::new(TooManyDisappeared {
                disk,
                previously_known: loaded.len(),
                still_present,
            }));
        }
    }

    let mut new_entries: Vec<(ScanEntry, Option<FileEntry>)> = Vec::new();

    for entry in scanned {
        if let Some(old) = by_path.get(entry.path.as_str()) {
            matched_ids.insert(old.id);
            if old.size == entry.size && old.mtime_secs == entry.mtime_secs && old.mtime_nsecs == entry.mtime_nsecs {
                report.unchanged += 1;
            } else {
                report.changed += 1;
                mark_file_changed(repo, disk, old.id);
            }
            continue;
        }

        let identity_key = (entry.size, entry.mtime_secs, entry.mtime_nsecs, entry.inode);
        if let Some(candidates) = by_identity.get(&identity_key) {
            if candidates.len() == 1 && !matched_ids.contains(&candidates[0].id) {
                let old = candidates[0];
                matched_ids.insert(old.id);
                report.renamed += 1;
                rename_file(repo, disk, old.id, entry.path.clone());
                continue;
            }
        }

        if !cfg.force_nocopy && entry.size >= block_size {
            if let Ok(first_bytes) = reader.read_block(&entry.path, 0, block_size) {
                let digest = hash_block(algo, seed, &first_bytes);
                if let Some(candidate) = first_block_hash_index.get(&digest) {
                    if !matched_ids.contains(&candidate.id)
                        && verify_full_copy(repo, disk, candidate, entry, reader, algo, seed, block_size)
                    {
                        let id = candidate.id;
                        matched_ids.insert(id);
                        report.copied += 1;
                        rename_file(repo, disk, id, entry.path.clone());
                        continue;
                    }
                }
            }
        }

        report.added += 1;
        new_entries.push((entry.clone(), None));
    }

    for (entry, _) in new_entries {
        let blocks_needed = entry.size.div_ceil(block_size).max(1);
        let start_pos = repo.blocks.max_pos(disk).map(|p| p + 1).unwrap_or(0);
        let block_positions: Vec<u64> = (start_pos..start_pos + blocks_needed).collect();
        for &pos in &block_positions {
            repo.blocks.set(BlockKey { disk, pos }, BlockState::Chg { hash: [0u8; DIGEST_LEN], file: 0 });
        }
        let id = repo.files.insert(disk, FileEntry {
            id: 0,
            disk,
            path: entry.path,
            size: entry.size,
            mtime_secs: entry.mtime_secs,
            mtime_nsecs: entry.mtime_nsecs,
            inode: entry.inode,
            blocks: block_positions.clone(),
        });
        for &pos in &block_positions {
            repo.blocks.set(BlockKey { disk, pos }, BlockState::Chg { hash: [0u8; DIGEST_LEN], file: id });
        }
    }

    for old in &loaded {
        if !matched_ids.contains(&old.id) {
            report.deleted += 1;
            delete_file(repo, disk, old.id);
        }
    }

    Ok(report)
}

fn mark_file_changed(repo: &mut Repository, disk: DiskIndex, file_id: u64) {
    let positions = repo.files.get(disk, file_id).map(|f| f.blocks.clone()).unwrap_or_default();
    for pos in positions {
        let key = BlockKey { disk, pos };
        let file = repo.blocks.get(key).file().unwrap_or(file_id);
        repo.blocks.set(key, BlockState::Chg { hash: [0u8; DIGEST_LEN], file });
    }
}

fn rename_file(repo: &mut Repository, disk: DiskIndex, file_id: u64, new_path: String) {
    if let Some(f) = repo.files.get_mut(disk, file_id) {
        f.path = new_path;
    }
    let positions = repo.files.get(disk, file_id).map(|f| f.blocks.clone()).unwrap_or_default();
    for pos in positions {
        let key = BlockKey { disk, pos };
        let state = repo.blocks.get(key).clone();
        if let BlockState::Blk { hash, .. } = state {
            repo.blocks.set(key, BlockState::Rel { hash, file: file_id });
        }
    }
}

fn delete_file(repo: &mut Repository, disk: DiskIndex, file_id: u64) {
    let positions = repo.files.remove(disk, file_id).map(|f| f.blocks).unwrap_or_default();
    for pos in positions {
        let key = BlockKey { disk, pos };
        let state = repo.blocks.get(key).clone();
        match state {
            BlockState::Blk { hash, .. } => repo.blocks.set(key, BlockState::Deleted { hash }),
            BlockState::Chg { hash, .. } => repo.blocks.set(key, BlockState::Rel { hash, file: file_id }),
            other => repo.blocks.set(key, other),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn verify_full_copy(
    repo: &Repository,
    disk: DiskIndex,
    candidate: &FileEntry,
    entry: &ScanEntry,
    reader: &dyn BlockReader,
    algo: HashAlgo,
    seed: &HashSeed,
    block_size: u64,
) -> bool {
    if candidate.size != entry.size {
        return false;
    }
    for (i, &pos) in candidate.blocks.iter().enumerate() {
        let expected = match repo.blocks.get(BlockKey { disk, pos }).hash() {
            Some(h) => *h,
            None => return false,
        };
        let bytes = match reader.read_block(&entry.path, i as u64, block_size) {
            Ok(b) => b,
            Err(_) => return false,
        };
        if hash_block(algo, seed, &bytes) != expected {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct FakeReader {
        files: HashMap<String, Vec<u8>>,
    }

    impl BlockReader for FakeReader {
        fn read_block(&self, path: &str, index: u64, block_size: u64) -> io::Result<Vec<u8>> {
            let data = self.files.get(path).ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
            let start = (index * block_size) as usize;
            if start >= data.len() {
                return Ok(vec![0u8; block_size as usize]);
            }
            let end = (start + block_size as usize).min(data.len());
            let mut buf = data[start..end].to_vec();
            buf.resize(block_size as usize, 0);
            Ok(buf)
        }
    }

    fn seed() -> HashSeed {
        HashSeed([1u8; crate::hash::SEED_LEN])
    }

    #[test]
    fn rename_is_detected_via_identity_without_rehash() {
        let mut repo = Repository::new(16, 1);
        let disk = repo.add_disk("d1".into(), "/mnt/d1".into());
        let content = vec![9u8; 16];
        let h = hash_block(HashAlgo::Murmur3, &seed(), &content);
        repo.blocks.set(BlockKey { disk, pos: 0 }, BlockState::Blk { hash: h, file: 0 });
        repo.files.insert(disk, FileEntry {
            id: 0, disk, path: "a.bin".into(), size: 16,
            mtime_secs: 100, mtime_nsecs: 0, inode: 5, blocks: vec![0],
        });

        let scanned = vec![ScanEntry { path: "a2.bin".into(), size: 16, mtime_secs: 100, mtime_nsecs: 0, inode: 5 }];
        let reader = FakeReader { files: HashMap::from([("a2.bin".to_string(), content)]) };
        let report = reconcile(&mut repo, disk, &scanned, &reader, HashAlgo::Murmur3, &seed(), ReconcileConfig {
            force_empty: false,
            force_nocopy: false,
        }).unwrap();

        assert_eq!(report.renamed, 1);
        assert_eq!(report.deleted, 0);
        assert!(repo.files.by_path(disk, "a2.bin").is_some());
    }

    #[test]
    fn safety_gate_blocks_mass_disappearance() {
        let mut repo = Repository::new(16, 1);
        let disk = repo.add_disk("d1".into(), "/mnt/d1".into());
        for i in 0..10u64 {
            repo.blocks.set(BlockKey { disk, pos: i }, BlockState::Blk { hash: [0u8; DIGEST_LEN], file: 0 });
            repo.files.insert(disk, FileEntry {
                id: 0, disk, path: format!("f{i}.bin"), size: 16,
                mtime_secs: 0, mtime_nsecs: 0, inode: i, blocks: vec![i],
            });
        }
        let scanned = vec![ScanEntry { path: "f0.bin".into(), size: 16, mtime_secs: 0, mtime_nsecs: 0, inode: 0 }];
        let reader = FakeReader { files: HashMap::new() };
        let result = reconcile(&mut repo, disk, &scanned, &reader, HashAlgo::Murmur3, &seed(), ReconcileConfig {
            force_empty: false,
            force_nocopy: false,
        });
        assert!(result.is_err());
    }

    #[test]
    fn force_empty_overrides_safety_gate() {
        let mut repo = Repository::new(16, 1);
        let disk = repo.add_disk("d1".into(), "/mnt/d1".into());
        for i in 0..10u64 {
            repo.blocks.set(BlockKey { disk, pos: i }, BlockState::Blk { hash: [0u8; DIGEST_LEN], file: 0 });
            repo.files.insert(disk, FileEntry {
                id: 0, disk, path: format!("f{i}.bin"), size: 16,
                mtime_secs: 0, mtime_nsecs: 0, inode: i, blocks: vec![i],
            });
        }
        let scanned: Vec<ScanEntry> = Vec::new();
        let reader = FakeReader { files: HashMap::new() };
        let result = reconcile(&mut repo, disk, &scanned, &reader, HashAlgo::Murmur3, &seed(), ReconcileConfig {
            force_empty: true,
            force_nocopy: false,
        });
        assert!(result.is_ok());
        assert_eq!(result.unwrap().deleted, 10);
    }

    #[test]
    fn unrelated_directory_entries_are_ignored_without_a_real_fs() {
        let _ = PathBuf::from("/unused");
    }
}
