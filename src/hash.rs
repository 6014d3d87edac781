//! Keyed 128-bit block hashing.
//!
//! Two algorithms are supported, selectable per repository: a Murmur3-class
//! fast hash and a SpookyHash-class alternate. Both take a 16-octet seed and
//! produce a 16-octet digest. During a rehash transition both the active and
//! previous `(algo, seed)` pairs are kept live so a read can be checked
//! against either.
//!
//! BLAKE3 (see `index.rs`) covers the content-index signature, a fixed
//! unkeyed-by-default hash; this module instead needs two interchangeable,
//! seed-keyed 128-bit algorithms so a repository can migrate between them
//! without re-architecting the block format.

use serde::{Deserialize, Serialize};
use std::fmt;

pub const SEED_LEN: usize = 16;
pub const DIGEST_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgo {
    Murmur3,
    Spooky2,
}

impl HashAlgo {
    pub fn id(self) -> u8 {
        match self {
            HashAlgo::Murmur3 => 0,
            HashAlgo::Spooky2 => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(HashAlgo::Murmur3),
            1 => Some(HashAlgo::Spooky2),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSeed(pub [u8; SEED_LEN]);

impl HashSeed {
    /// Generates a seed from a cryptographic source, as required at
    /// repository init.
    pub fn generate() -> Self {
        use rand::TryRngCore;
        let mut bytes = [0u8; SEED_LEN];
        rand::rngs::OsRng.try_fill_bytes(&mut bytes).expect("OS RNG failure");
        HashSeed(bytes)
    }

    fn halves(&self) -> (u64, u64) {
        let lo = u64::from_le_bytes(self.0[0..8].try_into().unwrap());
        let hi = u64::from_le_bytes(self.0[8..16].try_into().unwrap());
        (lo, hi)
    }
}

impl fmt::Debug for HashSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashSeed({})", hex(&self.0))
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 128-bit digest of a block. Callers are responsible for padding the final
/// block of a file's logical tail to `block_size` with zeros before calling
/// this.
pub fn hash_block(algo: HashAlgo, seed: &HashSeed, data: &[u8]) -> [u8; DIGEST_LEN] {
    match algo {
        HashAlgo::Murmur3 => murmur3_x64_128(data, seed),
        HashAlgo::Spooky2 => spooky_v2_128(data, seed),
    }
}

/// Checks `digest` against either the active or previous `(algo, seed)`
/// pair, as required during a rehash transition.
pub fn verify_block(
    data: &[u8],
    digest: &[u8; DIGEST_LEN],
    algo: HashAlgo,
    seed: &HashSeed,
    prev: Option<(HashAlgo, &HashSeed)>,
) -> bool {
    if hash_block(algo, seed, data) == *digest {
        return true;
    }
    if let Some((prev_algo, prev_seed)) = prev {
        return hash_block(prev_algo, prev_seed, data) == *digest;
    }
    false
}

// ---------------------------------------------------------------------
// Murmur3 x64 128 (Austin Appleby, public domain), keyed with a 128-bit
// seed split into two 64-bit lanes instead of the usual single u32 seed.
// ---------------------------------------------------------------------

fn murmur3_x64_128(data: &[u8], seed: &HashSeed) -> [u8; DIGEST_LEN] {
    const C1: u64 = 0x87c3_7b91_1142_53d5;
    const C2: u64 = 0x4cf5_ad43_2745_937f;

    let (mut h1, mut h2) = seed.halves();
    let len = data.len();
    let nblocks = len / 16;

    for i in 0..nblocks {
        let off = i * 16;
        let mut k1 = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        let mut k2 = u64::from_le_bytes(data[off + 8..off + 16].try_into().unwrap());

        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(27).wrapping_add(h2).wrapping_mul(5).wrapping_add(0x52dc_e729);

        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        h2 = h2.rotate_left(31).wrapping_add(h1).wrapping_mul(5).wrapping_add(0x3849_5ab5);
    }

    let tail = &data[nblocks * 16..];
    let mut k1: u64 = 0;
    let mut k2: u64 = 0;
    for (i, &b) in tail.iter().enumerate().rev() {
        if i >= 8 {
            k2 ^= (b as u64) << ((i - 8) * 8);
        } else {
            k1 ^= (b as u64) << (i * 8);
        }
    }
    if !tail.is_empty() {
        k2 = k2.wrapping_mul(C2).rotate_left(33).wrapping_mul(C1);
        h2 ^= k2;
        k1 = k1.wrapping_mul(C1).rotate_left(31).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= len as u64;
    h2 ^= len as u64;
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);
    h1 = fmix64(h1);
    h2 = fmix64(h2);
    h1 = h1.wrapping_add(h2);
    h2 = h2.wrapping_add(h1);

    let mut out = [0u8; DIGEST_LEN];
    out[0..8].copy_from_slice(&h1.to_le_bytes());
    out[8..16].copy_from_slice(&h2.to_le_bytes());
    out
}

fn fmix64(mut k: u64) -> u64 {
    k ^= k >> 33;
    k = k.wrapping_mul(0xff51_afd7_ed55_8ccd);
    k ^= k >> 33;
    k = k.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    k ^= k >> 33;
    k
}

// ---------------------------------------------------------------------
// SpookyHash-class alternate (Bob Jenkins, public domain). A compact
// single-pass variant of SpookyV2's short mix: 12-byte-word short hash with
// end mixing, keyed with two 64-bit seeds.
// ---------------------------------------------------------------------

const SC_CONST: u64 = 0xdead_beef_dead_beef;

fn spooky_v2_128(data: &[u8], seed: &HashSeed) -> [u8; DIGEST_LEN] {
    let (seed1, seed2) = seed.halves();
    let mut h = [seed1, seed2, SC_CONST, seed1];

    let len = data.len();
    let nwords = len / 8;
    for i in 0..nwords {
        let off = i * 8;
        let word = u64::from_le_bytes(data[off..off + 8].try_into().unwrap());
        spooky_short_mix(&mut h, word);
    }

    let tail = &data[nwords * 8..];
    let mut last = [0u8; 8];
    last[..tail.len()].copy_from_slice(tail);
    let last_word = u64::from_le_bytes(last) ^ (len as u64);
    spooky_short_mix(&mut h, last_word);

    spooky_short_end(&mut h);

    let mut out = [0u8; DIGEST_LEN];
    out[0..8].copy_from_slice(&h[0].to_le_bytes());
    out[8..16].copy_from_slice(&h[1].to_le_bytes());
    out
}

fn spooky_short_mix(h: &mut [u64; 4], data: u64) {
    h[3] = h[3].wrapping_add(data);
    h[2] ^= h[3];
    h[3] = h[3].rotate_left(15);
    h[0] = h[0].wrapping_add(h[3]);

    h[0] = h[0].wrapping_add(h[1]);
    h[1] ^= h[0];
    h[0] = h[0].rotate_left(52);
    h[2] = h[2].wrapping_add(h[0]);

    h[2] = h[2].wrapping_add(h[3]);
    h[3] ^= h[2];
    h[2] = h[2].rotate_left(26);
    h[1] = h[1].wrapping_add(h[2]);

    h[1] = h[1].wrapping_add(h[0]);
    h[0] ^= h[1];
    h[1] = h[1].rotate_left(51);
    h[3] = h[3].wrapping_add(h[1]);
}

fn spooky_short_end(h: &mut [u64; 4]) {
    for _ in 0..3 {
        h[3] ^= h[2];
        h[2] = h[2].rotate_left(15);
        h[3] = h[3].wrapping_add(h[2]);

        h[0] ^= h[3];
        h[3] = h[3].rotate_left(52);
        h[0] = h[0].wrapping_add(h[3]);

        h[1] ^= h[0];
        h[0] = h[0].rotate_left(26);
        h[1] = h[1].wrapping_add(h[0]);

        h[2] ^= h[1];
        h[1] = h[1].rotate_left(51);
        h[2] = h[2].wrapping_add(h[1]);
    }
}
