//! Content index I/O.
//!
//! The binary format is big-endian for fixed fields and little-endian
//! 7-bit-continuation varints for lengths/positions: magic `"SNAPCNT1"`,
//! a sequence of tagged records, then a 16-octet signature (a keyed hash
//! over everything before it, using the repository's hash seed). The
//! signature uses `blake3::Hasher` in its keyed mode, truncated to 16
//! octets to match the wire format's signature width.
//!
//! Multiple content-file paths can be configured; `write_all` implements
//! the atomic protocol: every path's `.tmp` sibling is written and fsynced
//! before any is renamed over the original, and a failure at any path
//! unlinks the temporaries and leaves prior state untouched.

use crate::error::{EngineResult, IndexError};
use crate::hash::{HashAlgo, HashSeed, DIGEST_LEN};
use crate::model::{BlockKey, BlockPos, BlockState, DiskEntry, FileEntry, Repository};
use std::io::Write;
use std::path::Path;

const MAGIC: &[u8; 8] = b"SNAPCNT1";
const SIG_LEN: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    BlkSize,
    Hash,
    PrevHash,
    Map,
    Disk,
    File,
    Blk,
    Chg,
    Rel,
    Inf,
    Hole,
    Info,
    Flags,
}

impl Tag {
    fn byte(self) -> u8 {
        match self {
            Tag::BlkSize => 0,
            Tag::Hash => 1,
            Tag::PrevHash => 2,
            Tag::Map => 3,
            Tag::Disk => 4,
            Tag::File => 5,
            Tag::Blk => 6,
            Tag::Chg => 7,
            Tag::Rel => 8,
            Tag::Inf => 9,
            Tag::Hole => 10,
            Tag::Info => 11,
            Tag::Flags => 12,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0 => Tag::BlkSize,
            1 => Tag::Hash,
            2 => Tag::PrevHash,
            3 => Tag::Map,
            4 => Tag::Disk,
            5 => Tag::File,
            6 => Tag::Blk,
            7 => Tag::Chg,
            8 => Tag::Rel,
            9 => Tag::Inf,
            10 => Tag::Hole,
            11 => Tag::Info,
            12 => Tag::Flags,
            _ => return None,
        })
    }
}

const FLAG_CLEAR_PAST_HASH: u8 = 1 << 0;

/// Per-position scrub bookkeeping (`info` record). Kept alongside the
/// repository rather than inside `BlockState` since it is orthogonal to a
/// block's lifecycle — it survives across `BLK`/`CHG` transitions.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ScrubInfo {
    pub last_scrub_unix: i64,
    pub has_parity: bool,
}

/// The full persisted projection: the model plus hash algorithm
/// generations and scrub bookkeeping not represented in `Repository`.
#[derive(Debug, Clone)]
pub struct ContentIndex {
    pub repo: Repository,
    pub hash_algo: HashAlgo,
    pub hash_seed: HashSeed,
    pub prev_hash: Option<(HashAlgo, HashSeed)>,
    pub scrub: std::collections::HashMap<BlockKey, ScrubInfo>,
    /// The position one past the last `BLK` block in the loaded index.
    /// Parity files must be opened at least this large: a sync resuming
    /// from this index trusts every `BLK` block below this position and
    /// rebuilds everything at or beyond it.
    pub loaded_paritymax: BlockPos,
    /// Set when the index being loaded was last written mid-sync (the
    /// run was interrupted before reaching a clean finish). `CHG`/`DELETED`
    /// hashes from that run can't be trusted and are discarded on load.
    pub clear_past_hash: bool,
}

impl ContentIndex {
    pub fn new(repo: Repository, hash_algo: HashAlgo, hash_seed: HashSeed) -> Self {
        ContentIndex {
            repo,
            hash_algo,
            hash_seed,
            prev_hash: None,
            scrub: std::collections::HashMap::new(),
            loaded_paritymax: 0,
            clear_past_hash: false,
        }
    }

    /// Informational only (no Non-goal conflict): suggests switching the
    /// active hash algorithm when the repository has been running the same
    /// one for its whole recorded lifetime and a rehash has never been
    /// attempted. Mirrors the original's `besthash` suggestion.
    pub fn suggest_rehash(&self) -> Option<HashAlgo> {
        if self.prev_hash.is_some() {
            return None;
        }
        match self.hash_algo {
            HashAlgo::Murmur3 => Some(HashAlgo::Spooky2),
            HashAlgo::Spooky2 => Some(HashAlgo::Murmur3),
        }
    }

    /// Writes to every configured path atomically: each gets a `.tmp`
    /// sibling, fsynced, and none is renamed into place until all have
    /// succeeded.
    pub fn write_all(&self, paths: &[impl AsRef<Path>], text: bool) -> EngineResult<()> {
        let payload = if text { self.encode_text() } else { self.encode_binary() };

        let mut tmp_paths = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            let tmp = tmp_path(path);
            let result = (|| -> std::io::Result<()> {
                let mut f = std::fs::File::create(&tmp)?;
                f.write_all(&payload)?;
                f.sync_all()?;
                Ok(())
            })();
            if let Err(e) = result {
                for t in &tmp_paths {
                    let _ = std::fs::remove_file(t);
                }
                let _ = std::fs::remove_file(&tmp);
                return Err(Box::new(IndexError::Io(e)));
            }
            tmp_paths.push(tmp);
        }

        for (path, tmp) in paths.iter().zip(tmp_paths.iter()) {
            std::fs::rename(tmp, path.as_ref()).map_err(IndexError::Io)?;
        }
        Ok(())
    }

    /// Reads one content file. Per the original's `no_conf`, this never
    /// requires a pre-existing `Repository` — the record stream carries
    /// everything needed to reconstruct one.
    pub fn read(path: impl AsRef<Path>, skip_sign: bool) -> EngineResult<Self> {
        let bytes = std::fs::read(path.as_ref()).map_err(IndexError::Io)?;
        if bytes.starts_with(b"# snapshield content") {
            decode_text(&bytes).map_err(|e| Box::new(e) as _)
        } else {
            decode_binary(&bytes, skip_sign).map_err(|e| Box::new(e) as _)
        }
    }

    fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);

        write_record(&mut out, Tag::BlkSize, |buf| {
            buf.extend_from_slice(&(self.repo.block_size as u32).to_be_bytes());
        });
        write_record(&mut out, Tag::Hash, |buf| {
            buf.push(self.hash_algo.id());
            buf.extend_from_slice(&self.hash_seed.0);
        });
        if let Some((algo, seed)) = &self.prev_hash {
            write_record(&mut out, Tag::PrevHash, |buf| {
                buf.push(algo.id());
                buf.extend_from_slice(&seed.0);
            });
        }
        if self.clear_past_hash {
            write_record(&mut out, Tag::Flags, |buf| {
                buf.push(FLAG_CLEAR_PAST_HASH);
            });
        }

        for disk in &self.repo.disks {
            write_record(&mut out, Tag::Map, |buf| {
                buf.extend_from_slice(&disk.index.to_be_bytes());
                write_lp_string(buf, &disk.name);
                write_lp_string(buf, disk.uuid.as_deref().unwrap_or(""));
            });
            let total_blocks = self.repo.blocks.max_pos(disk.index).map(|p| p + 1).unwrap_or(0);
            write_record(&mut out, Tag::Disk, |buf| {
                buf.extend_from_slice(&disk.index.to_be_bytes());
                write_varint(buf, total_blocks);
            });
        }

        let mut files: Vec<&FileEntry> = self.repo.files.iter().collect();
        files.sort_by(|a, b| (a.disk, a.path.as_str()).cmp(&(b.disk, b.path.as_str())));
        for file in files {
            write_record(&mut out, Tag::File, |buf| {
                buf.extend_from_slice(&file.disk.to_be_bytes());
                write_varint(buf, file.size);
                buf.extend_from_slice(&file.mtime_secs.to_be_bytes());
                buf.extend_from_slice(&file.mtime_nsecs.to_be_bytes());
                write_varint(buf, file.inode);
                write_lp_string(buf, &file.path);
            });
        }

        let mut blocks: Vec<(&BlockKey, &BlockState)> = self.repo.blocks.iter().collect();
        blocks.sort_by_key(|(key, _)| (key.disk, key.pos));
        for (key, state) in blocks {
            let tag = match state {
                BlockState::Blk { .. } => Tag::Blk,
                BlockState::Chg { .. } => Tag::Chg,
                BlockState::Rel { .. } => Tag::Rel,
                BlockState::Deleted { .. } => Tag::Inf,
                BlockState::Empty => continue,
            };
            write_record(&mut out, tag, |buf| {
                buf.extend_from_slice(&key.disk.to_be_bytes());
                write_varint(buf, key.pos);
                if let Some(h) = state.hash() {
                    buf.extend_from_slice(h);
                }
            });
        }

        let mut scrub_entries: Vec<(&BlockKey, &ScrubInfo)> = self.scrub.iter().collect();
        scrub_entries.sort_by_key(|(key, _)| (key.disk, key.pos));
        for (key, info) in scrub_entries {
            write_record(&mut out, Tag::Info, |buf| {
                buf.extend_from_slice(&key.disk.to_be_bytes());
                write_varint(buf, key.pos);
                buf.extend_from_slice(&info.last_scrub_unix.to_be_bytes());
                buf.push(info.has_parity as u8);
            });
        }

        let sig = sign(&self.hash_seed, &out);
        out.extend_from_slice(&sig);
        out
    }

    fn encode_text(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("# snapshield content v1\n");
        out.push_str(&format!("blksize {}\n", self.repo.block_size));
        out.push_str(&format!("hash {} {}\n", self.hash_algo.id(), crate::hash::hex(&self.hash_seed.0)));
        if let Some((algo, seed)) = &self.prev_hash {
            out.push_str(&format!("prevhash {} {}\n", algo.id(), crate::hash::hex(&seed.0)));
        }
        if self.clear_past_hash {
            out.push_str("flags clear_past_hash\n");
        }
        for disk in &self.repo.disks {
            out.push_str(&format!("map {} {} {}\n", disk.index, disk.name, disk.uuid.as_deref().unwrap_or("-")));
        }
        let mut files: Vec<&FileEntry> = self.repo.files.iter().collect();
        files.sort_by(|a, b| (a.disk, a.path.as_str()).cmp(&(b.disk, b.path.as_str())));
        for file in files {
            out.push_str(&format!(
                "file {} {} {} {} {} {}\n",
                file.disk, file.size, file.mtime_secs, file.mtime_nsecs, file.inode, file.path
            ));
        }
        let mut blocks: Vec<(&BlockKey, &BlockState)> = self.repo.blocks.iter().collect();
        blocks.sort_by_key(|(key, _)| (key.disk, key.pos));
        for (key, state) in blocks {
            let (tag, hash) = match state {
                BlockState::Blk { hash, .. } => ("blk", Some(hash)),
                BlockState::Chg { hash, .. } => ("chg", Some(hash)),
                BlockState::Rel { hash, .. } => ("rel", Some(hash)),
                BlockState::Deleted { hash } => ("inf", Some(hash)),
                BlockState::Empty => continue,
            };
            match hash {
                Some(h) => out.push_str(&format!("{tag} {} {} {}\n", key.disk, key.pos, crate::hash::hex(h))),
                None => out.push_str(&format!("{tag} {} {}\n", key.disk, key.pos)),
            }
        }
        out.into_bytes()
    }
}

fn sign(seed: &HashSeed, payload: &[u8]) -> [u8; SIG_LEN] {
    let key = *blake3::hash(&seed.0).as_bytes();
    let mut hasher = blake3::Hasher::new_keyed(&key);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut out = [0u8; SIG_LEN];
    out.copy_from_slice(&digest.as_bytes()[..SIG_LEN]);
    out
}

fn write_record(out: &mut Vec<u8>, tag: Tag, body: impl FnOnce(&mut Vec<u8>)) {
    let mut buf = Vec::new();
    body(&mut buf);
    out.push(tag.byte());
    write_varint(out, buf.len() as u64);
    out.extend_from_slice(&buf);
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn write_lp_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as u64);
    out.extend_from_slice(s.as_bytes());
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], IndexError> {
        if self.pos + n > self.data.len() {
            return Err(IndexError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, IndexError> {
        Ok(self.take(1)?[0])
    }

    fn u16_be(&mut self) -> Result<u16, IndexError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32_be(&mut self) -> Result<u32, IndexError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn i64_be(&mut self) -> Result<i64, IndexError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn varint(&mut self) -> Result<u64, IndexError> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(IndexError::Truncated);
            }
        }
        Ok(value)
    }

    fn lp_string(&mut self) -> Result<String, IndexError> {
        let len = self.varint()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

fn decode_binary(bytes: &[u8], skip_sign: bool) -> Result<ContentIndex, IndexError> {
    if bytes.len() < MAGIC.len() + SIG_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(IndexError::BadMagic);
    }
    let payload_end = bytes.len() - SIG_LEN;
    let payload = &bytes[..payload_end];
    let sig = &bytes[payload_end..];

    let mut cursor = Cursor::new(&bytes[MAGIC.len()..payload_end]);

    let mut block_size: u32 = 0;
    let mut hash_algo = HashAlgo::Murmur3;
    let mut hash_seed = HashSeed([0u8; crate::hash::SEED_LEN]);
    let mut prev_hash: Option<(HashAlgo, HashSeed)> = None;
    let mut clear_past_hash = false;
    let mut disks: Vec<DiskEntry> = Vec::new();
    let mut files: Vec<FileEntry> = Vec::new();
    let mut blocks: Vec<(BlockKey, BlockState)> = Vec::new();
    let mut scrub = std::collections::HashMap::new();

    while cursor.pos < cursor.data.len() {
        let tag_byte = cursor.u8()?;
        let tag = Tag::from_byte(tag_byte).ok_or(IndexError::UnknownTag(tag_byte))?;
        let len = cursor.varint()? as usize;
        let body = cursor.take(len)?;
        let mut rec = Cursor::new(body);

        match tag {
            Tag::BlkSize => block_size = rec.u32_be()?,
            Tag::Hash => {
                let id = rec.u8()?;
                let seed = rec.take(crate::hash::SEED_LEN)?;
                hash_algo = HashAlgo::from_id(id).ok_or(IndexError::UnknownTag(id))?;
                hash_seed = HashSeed(seed.try_into().unwrap());
            }
            Tag::PrevHash => {
                let id = rec.u8()?;
                let seed = rec.take(crate::hash::SEED_LEN)?;
                let algo = HashAlgo::from_id(id).ok_or(IndexError::UnknownTag(id))?;
                prev_hash = Some((algo, HashSeed(seed.try_into().unwrap())));
            }
            Tag::Flags => {
                let mask = rec.u8()?;
                clear_past_hash = mask & FLAG_CLEAR_PAST_HASH != 0;
            }
            Tag::Map => {
                let disk_index = rec.u16_be()?;
                let name = rec.lp_string()?;
                let uuid = rec.lp_string()?;
                disks.push(DiskEntry {
                    index: disk_index,
                    name,
                    mount_point: String::new(),
                    uuid: if uuid.is_empty() { None } else { Some(uuid) },
                    device_id: None,
                });
            }
            Tag::Disk => {
                let _disk_index = rec.u16_be()?;
                let _total_blocks = rec.varint()?;
            }
            Tag::File => {
                let disk_index = rec.u16_be()?;
                let size = rec.varint()?;
                let mtime_secs = rec.i64_be()?;
                let mtime_nsecs = rec.u32_be()?;
                let inode = rec.varint()?;
                let path = rec.lp_string()?;
                files.push(FileEntry {
                    id: 0,
                    disk: disk_index,
                    path,
                    size,
                    mtime_secs,
                    mtime_nsecs,
                    inode,
                    blocks: Vec::new(),
                });
            }
            Tag::Blk | Tag::Chg | Tag::Rel | Tag::Inf => {
                let disk_index = rec.u16_be()?;
                let pos = rec.varint()?;
                let key = BlockKey { disk: disk_index, pos };
                let has_hash = rec.data.len() - rec.pos >= DIGEST_LEN;
                let hash: [u8; DIGEST_LEN] = if has_hash {
                    rec.take(DIGEST_LEN)?.try_into().unwrap()
                } else {
                    [0u8; DIGEST_LEN]
                };
                let state = match tag {
                    Tag::Blk => BlockState::Blk { hash, file: 0 },
                    Tag::Chg => BlockState::Chg { hash, file: 0 },
                    Tag::Rel => BlockState::Rel { hash, file: 0 },
                    Tag::Inf => BlockState::Deleted { hash },
                    _ => unreachable!(),
                };
                blocks.push((key, state));
            }
            Tag::Hole => {
                let _disk_index = rec.u16_be()?;
                let _pos = rec.varint()?;
            }
            Tag::Info => {
                let disk_index = rec.u16_be()?;
                let pos = rec.varint()?;
                let last_scrub_unix = rec.i64_be()?;
                let has_parity = rec.u8()? != 0;
                scrub.insert(
                    BlockKey { disk: disk_index, pos },
                    ScrubInfo { last_scrub_unix, has_parity },
                );
            }
        }
    }

    if !skip_sign {
        let expected = sign(&hash_seed, payload);
        if expected != sig {
            return Err(IndexError::Signature);
        }
    }

    let loaded_paritymax = last_blk_position(&blocks);
    if clear_past_hash {
        clear_stale_hashes(&mut blocks);
    }

    let mut repo = Repository::new(block_size as u64, disks.len().clamp(1, 6) as u8);
    repo.disks = disks;
    for file in files {
        repo.files.insert(file.disk, file);
    }
    for (key, state) in blocks {
        repo.blocks.set(key, state);
    }

    Ok(ContentIndex {
        repo,
        hash_algo,
        hash_seed,
        prev_hash,
        scrub,
        loaded_paritymax,
        clear_past_hash,
    })
}

/// The position one past the highest `BLK` block, per `loaded_paritymax`'s
/// definition.
fn last_blk_position(blocks: &[(BlockKey, BlockState)]) -> BlockPos {
    blocks
        .iter()
        .filter(|(_, s)| matches!(s, BlockState::Blk { .. }))
        .map(|(k, _)| k.pos + 1)
        .max()
        .unwrap_or(0)
}

/// Discards hashes on `CHG`/`DELETED` blocks carried over from an
/// interrupted sync; they must be reread rather than trusted.
fn clear_stale_hashes(blocks: &mut [(BlockKey, BlockState)]) {
    for (_, state) in blocks.iter_mut() {
        match state {
            BlockState::Chg { hash, .. } | BlockState::Deleted { hash } => {
                *hash = [0u8; DIGEST_LEN];
            }
            _ => {}
        }
    }
}

fn decode_text(bytes: &[u8]) -> Result<ContentIndex, IndexError> {
    let text = String::from_utf8_lossy(bytes);
    let mut block_size: u64 = 0;
    let mut hash_algo = HashAlgo::Murmur3;
    let mut hash_seed = HashSeed([0u8; crate::hash::SEED_LEN]);
    let mut prev_hash = None;
    let mut clear_past_hash = false;
    let mut disks: Vec<DiskEntry> = Vec::new();
    let mut files: Vec<FileEntry> = Vec::new();
    let mut blocks: Vec<(BlockKey, BlockState)> = Vec::new();

    for line in text.lines() {
        if line.starts_with('#') || line.is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.splitn(7, ' ').collect();
        match parts[0] {
            "blksize" => block_size = parts[1].parse().map_err(|_| IndexError::Truncated)?,
            "hash" => {
                hash_algo = HashAlgo::from_id(parts[1].parse().map_err(|_| IndexError::Truncated)?)
                    .ok_or(IndexError::UnknownTag(0))?;
                hash_seed = parse_hex_seed(parts[2])?;
            }
            "prevhash" => {
                let algo = HashAlgo::from_id(parts[1].parse().map_err(|_| IndexError::Truncated)?)
                    .ok_or(IndexError::UnknownTag(0))?;
                prev_hash = Some((algo, parse_hex_seed(parts[2])?));
            }
            "flags" => {
                clear_past_hash = parts.get(1) == Some(&"clear_past_hash");
            }
            "map" => {
                disks.push(DiskEntry {
                    index: parts[1].parse().map_err(|_| IndexError::Truncated)?,
                    name: parts[2].to_string(),
                    mount_point: String::new(),
                    uuid: if parts.get(3) == Some(&"-") { None } else { parts.get(3).map(|s| s.to_string()) },
                    device_id: None,
                });
            }
            "file" => {
                files.push(FileEntry {
                    id: 0,
                    disk: parts[1].parse().map_err(|_| IndexError::Truncated)?,
                    size: parts[2].parse().map_err(|_| IndexError::Truncated)?,
                    mtime_secs: parts[3].parse().map_err(|_| IndexError::Truncated)?,
                    mtime_nsecs: parts[4].parse().map_err(|_| IndexError::Truncated)?,
                    inode: parts[5].parse().map_err(|_| IndexError::Truncated)?,
                    path: parts.get(6).copied().unwrap_or("").to_string(),
                    blocks: Vec::new(),
                });
            }
            "blk" | "chg" | "rel" | "inf" => {
                let disk = parts[1].parse().map_err(|_| IndexError::Truncated)?;
                let pos = parts[2].parse().map_err(|_| IndexError::Truncated)?;
                let hash = match parts.get(3) {
                    Some(h) => parse_hex_digest(h)?,
                    None => [0u8; DIGEST_LEN],
                };
                let state = match parts[0] {
                    "blk" => BlockState::Blk { hash, file: 0 },
                    "chg" => BlockState::Chg { hash, file: 0 },
                    "rel" => BlockState::Rel { hash, file: 0 },
                    _ => BlockState::Deleted { hash },
                };
                blocks.push((BlockKey { disk, pos }, state));
            }
            _ => {}
        }
    }

    let loaded_paritymax = last_blk_position(&blocks);
    if clear_past_hash {
        clear_stale_hashes(&mut blocks);
    }

    let mut repo = Repository::new(block_size, disks.len().clamp(1, 6) as u8);
    repo.disks = disks;
    for file in files {
        repo.files.insert(file.disk, file);
    }
    for (key, state) in blocks {
        repo.blocks.set(key, state);
    }
    Ok(ContentIndex {
        repo,
        hash_algo,
        hash_seed,
        prev_hash,
        scrub: std::collections::HashMap::new(),
        loaded_paritymax,
        clear_past_hash,
    })
}

fn parse_hex_seed(s: &str) -> Result<HashSeed, IndexError> {
    let bytes = parse_hex(s)?;
    if bytes.len() != crate::hash::SEED_LEN {
        return Err(IndexError::Truncated);
    }
    let mut out = [0u8; crate::hash::SEED_LEN];
    out.copy_from_slice(&bytes);
    Ok(HashSeed(out))
}

fn parse_hex_digest(s: &str) -> Result<[u8; DIGEST_LEN], IndexError> {
    let bytes = parse_hex(s)?;
    if bytes.len() != DIGEST_LEN {
        return Err(IndexError::Truncated);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_hex(s: &str) -> Result<Vec<u8>, IndexError> {
    if s.len() % 2 != 0 {
        return Err(IndexError::Truncated);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| IndexError::Truncated))
        .collect()
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    std::path::PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ContentIndex {
        let mut repo = Repository::new(4096, 2);
        let disk = repo.add_disk("disk1".into(), "/mnt/disk1".into());
        repo.files.insert(disk, FileEntry {
            id: 0,
            disk,
            path: "a/b.txt".into(),
            size: 4096,
            mtime_secs: 1000,
            mtime_nsecs: 0,
            inode: 42,
            blocks: vec![0],
        });
        repo.blocks.set(
            BlockKey { disk, pos: 0 },
            BlockState::Blk { hash: [7u8; DIGEST_LEN], file: 0 },
        );
        ContentIndex::new(repo, HashAlgo::Murmur3, HashSeed([3u8; crate::hash::SEED_LEN]))
    }

    #[test]
    fn binary_round_trips() {
        let idx = sample();
        let bytes = idx.encode_binary();
        let decoded = decode_binary(&bytes, false).unwrap();
        assert_eq!(decoded.repo.block_size, 4096);
        assert_eq!(decoded.repo.disks.len(), 1);
        assert_eq!(decoded.repo.files.len(), 1);
        assert_eq!(decoded.repo.blocks.len(), 1);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let idx = sample();
        let mut bytes = idx.encode_binary();
        let last = bytes.len() - 1;
        bytes[0] ^= 0xff;
        let _ = last;
        assert!(matches!(decode_binary(&bytes, false), Err(IndexError::Signature)));
        assert!(decode_binary(&bytes, true).is_ok());
    }

    #[test]
    fn text_round_trips() {
        let idx = sample();
        let bytes = idx.encode_text();
        let decoded = decode_text(&bytes).unwrap();
        assert_eq!(decoded.repo.files.len(), 1);
        assert_eq!(decoded.repo.blocks.len(), 1);
    }

    #[test]
    fn write_all_is_atomic_across_paths() {
        let dir = tempfile::tempdir().unwrap();
        let idx = sample();
        let p1 = dir.path().join("a.content");
        let p2 = dir.path().join("b.content");
        idx.write_all(&[&p1, &p2], false).unwrap();
        assert!(p1.exists());
        assert!(p2.exists());
        assert!(!dir.path().join("a.content.tmp").exists());
    }
}
