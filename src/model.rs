//! Block & disk model.
//!
//! Arena-indexed rather than pointer-linked: blocks live in one flat
//! `BlockTable` keyed by `(disk_index, pos)`, files in one flat `FileTable`
//! keyed by `(disk_index, file_id)`. A block's owning file is a `file_id`
//! looked up in the table, never a raw reference — this keeps the whole
//! model `Send`, cheaply cloned by index, and serializable without a
//! visitor, unlike a tree of `Rc<RefCell<_>>` nodes.

use crate::hash::DIGEST_LEN;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type DiskIndex = u16;
pub type FileId = u64;
pub type BlockPos = u64;

/// Lifecycle of one block slot at a given `(disk, pos)`. A hash is
/// defined if and only if the state is not `Empty` — enforced here by
/// keeping the digest out of the enum's `Empty`/`Deleted` variants
/// entirely, rather than as an `Option` every caller has to re-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BlockState {
    /// No file has ever claimed this slot.
    Empty,
    /// Stable, unchanged since the last successful sync.
    Blk { hash: [u8; DIGEST_LEN], file: FileId },
    /// Changed since the last sync; parity does not yet cover this content.
    Chg { hash: [u8; DIGEST_LEN], file: FileId },
    /// The file that owned this slot has moved or grown past it; content
    /// still readable but logically detached (a rename-without-parity-write
    /// leaves a trail of `Rel` slots behind).
    Rel { hash: [u8; DIGEST_LEN], file: FileId },
    /// The owning file was deleted; parity still covers the last known
    /// content until the next sync reclaims the slot.
    Deleted { hash: [u8; DIGEST_LEN] },
}

impl BlockState {
    pub fn hash(&self) -> Option<&[u8; DIGEST_LEN]> {
        match self {
            BlockState::Empty => None,
            BlockState::Blk { hash, .. }
            | BlockState::Chg { hash, .. }
            | BlockState::Rel { hash, .. }
            | BlockState::Deleted { hash } => Some(hash),
        }
    }

    pub fn file(&self) -> Option<FileId> {
        match self {
            BlockState::Blk { file, .. } | BlockState::Chg { file, .. } | BlockState::Rel { file, .. } => {
                Some(*file)
            }
            BlockState::Empty | BlockState::Deleted { .. } => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, BlockState::Empty)
    }

    pub fn needs_sync(&self) -> bool {
        matches!(self, BlockState::Chg { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub disk: DiskIndex,
    pub pos: BlockPos,
}

/// Flat store of every block slot across every disk. Lookups are by key,
/// never by walking a file's block list through pointers.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BlockTable {
    slots: HashMap<BlockKey, BlockState>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: BlockKey) -> &BlockState {
        self.slots.get(&key).unwrap_or(&BlockState::Empty)
    }

    pub fn set(&mut self, key: BlockKey, state: BlockState) {
        if state.is_empty() {
            self.slots.remove(&key);
        } else {
            self.slots.insert(key, state);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BlockKey, &BlockState)> {
        self.slots.iter()
    }

    pub fn iter_disk(&self, disk: DiskIndex) -> impl Iterator<Item = (&BlockKey, &BlockState)> {
        self.slots.iter().filter(move |(k, _)| k.disk == disk)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn max_pos(&self, disk: DiskIndex) -> Option<BlockPos> {
        self.iter_disk(disk).map(|(k, _)| k.pos).max()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: FileId,
    pub disk: DiskIndex,
    pub path: String,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nsecs: u32,
    pub inode: u64,
    /// Ordered block positions on `disk` this file occupies, last one
    /// possibly short of a full block.
    pub blocks: Vec<BlockPos>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub disk: DiskIndex,
    pub file: FileId,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FileTable {
    files: HashMap<FileKey, FileEntry>,
    next_id: FileId,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, disk: DiskIndex, mut entry: FileEntry) -> FileId {
        let id = self.next_id;
        self.next_id += 1;
        entry.id = id;
        entry.disk = disk;
        self.files.insert(FileKey { disk, file: id }, entry);
        id
    }

    pub fn get(&self, disk: DiskIndex, file: FileId) -> Option<&FileEntry> {
        self.files.get(&FileKey { disk, file })
    }

    pub fn get_mut(&mut self, disk: DiskIndex, file: FileId) -> Option<&mut FileEntry> {
        self.files.get_mut(&FileKey { disk, file })
    }

    pub fn remove(&mut self, disk: DiskIndex, file: FileId) -> Option<FileEntry> {
        self.files.remove(&FileKey { disk, file })
    }

    pub fn iter_disk(&self, disk: DiskIndex) -> impl Iterator<Item = &FileEntry> {
        self.files.values().filter(move |f| f.disk == disk)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn by_path(&self, disk: DiskIndex, path: &str) -> Option<&FileEntry> {
        self.files.values().find(|f| f.disk == disk && f.path == path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub index: DiskIndex,
    pub name: String,
    pub mount_point: String,
    pub uuid: Option<String>,
    pub device_id: Option<String>,
}

/// The top-level aggregate the sync/scrub/check engines operate over: the
/// disk set, the parity-level count, the block size, and the two flat
/// tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub block_size: u64,
    pub parity_level: u8,
    pub disks: Vec<DiskEntry>,
    pub blocks: BlockTable,
    pub files: FileTable,
}

impl Repository {
    pub fn new(block_size: u64, parity_level: u8) -> Self {
        Repository {
            block_size,
            parity_level,
            disks: Vec::new(),
            blocks: BlockTable::new(),
            files: FileTable::new(),
        }
    }

    pub fn add_disk(&mut self, name: String, mount_point: String) -> DiskIndex {
        let index = self.disks.len() as DiskIndex;
        self.disks.push(DiskEntry {
            index,
            name,
            mount_point,
            uuid: None,
            device_id: None,
        });
        index
    }

    pub fn disk_by_name(&self, name: &str) -> Option<&DiskEntry> {
        self.disks.iter().find(|d| d.name == name)
    }

    /// Highest `pos` any disk uses plus one — the row count the parity
    /// address space must cover.
    pub fn row_count(&self) -> BlockPos {
        self.disks
            .iter()
            .filter_map(|d| self.blocks.max_pos(d.index))
            .map(|p| p + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_state_hash_is_defined_iff_nonempty() {
        assert!(BlockState::Empty.hash().is_none());
        let blk = BlockState::Blk { hash: [1u8; DIGEST_LEN], file: 0 };
        assert!(blk.hash().is_some());
    }

    #[test]
    fn block_table_drops_empty_slots() {
        let mut table = BlockTable::new();
        let key = BlockKey { disk: 0, pos: 3 };
        table.set(key, BlockState::Blk { hash: [2u8; DIGEST_LEN], file: 1 });
        assert_eq!(table.len(), 1);
        table.set(key, BlockState::Empty);
        assert_eq!(table.len(), 0);
        assert!(table.get(key).is_empty());
    }

    #[test]
    fn file_table_assigns_increasing_ids() {
        let mut files = FileTable::new();
        let a = files.insert(0, FileEntry {
            id: 0,
            disk: 0,
            path: "a.txt".into(),
            size: 10,
            mtime_secs: 0,
            mtime_nsecs: 0,
            inode: 1,
            blocks: vec![0],
        });
        let b = files.insert(0, FileEntry {
            id: 0,
            disk: 0,
            path: "b.txt".into(),
            size: 20,
            mtime_secs: 0,
            mtime_nsecs: 0,
            inode: 2,
            blocks: vec![1],
        });
        assert_ne!(a, b);
        assert_eq!(files.get(0, a).unwrap().path, "a.txt");
    }

    #[test]
    fn repository_row_count_tracks_highest_pos() {
        let mut repo = Repository::new(4096, 2);
        let disk = repo.add_disk("d1".into(), "/mnt/d1".into());
        repo.blocks.set(
            BlockKey { disk, pos: 5 },
            BlockState::Blk { hash: [0u8; DIGEST_LEN], file: 0 },
        );
        assert_eq!(repo.row_count(), 6);
    }
}
