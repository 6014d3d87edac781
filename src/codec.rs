//! Parity codec.
//!
//! The low-level Galois-field math is out of scope here — it is consumed
//! only by its contract: `encode` turns `d` equal-sized data shards into
//! `p` parity shards, `recover` reconstructs whichever data shards are
//! marked missing given enough surviving shards (data or parity) to cover
//! the gap. This module is a thin, pure wrapper around `reed_solomon_simd`
//! (`ReedSolomonEncoder`, `ReedSolomonDecoder::add_original_shard`/
//! `add_recovery_shard`/`decode`), generalized to an arbitrary `(d, p)`
//! with `p` in `1..=6`.

use reed_solomon_simd::{ReedSolomonDecoder, ReedSolomonEncoder};

pub const MAX_PARITY_LEVEL: u8 = 6;

#[derive(Debug)]
pub enum CodecError {
    TooFewShards,
    TooManyMissing { missing: usize, available_parity: usize },
    ShardLengthMismatch,
    BadParityLevel(u8),
    Rs(reed_solomon_simd::Error),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::TooFewShards => write!(f, "codec: need at least one data shard"),
            CodecError::TooManyMissing { missing, available_parity } => write!(
                f,
                "codec: {missing} data shard(s) missing, only {available_parity} parity shard(s) available"
            ),
            CodecError::ShardLengthMismatch => write!(f, "codec: shards must share one block length"),
            CodecError::BadParityLevel(level) => write!(f, "codec: parity level {level} outside 1..=6"),
            CodecError::Rs(e) => write!(f, "codec: {e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<reed_solomon_simd::Error> for CodecError {
    fn from(e: reed_solomon_simd::Error) -> Self {
        CodecError::Rs(e)
    }
}

/// Computes `p` parity shards from `d` data shards, all sharing `shard_len`
/// bytes. Missing inputs must already be zero-filled by the caller — a
/// hole in a disk still contributes a defined (all-zero) shard to parity.
pub fn encode(data: &[Vec<u8>], parity_level: u8, shard_len: usize) -> Result<Vec<Vec<u8>>, CodecError> {
    if data.is_empty() {
        return Err(CodecError::TooFewShards);
    }
    if parity_level == 0 || parity_level > MAX_PARITY_LEVEL {
        return Err(CodecError::BadParityLevel(parity_level));
    }
    if data.iter().any(|s| s.len() != shard_len) {
        return Err(CodecError::ShardLengthMismatch);
    }

    let mut encoder = ReedSolomonEncoder::new(data.len(), parity_level as usize, shard_len)?;
    for shard in data {
        encoder.add_original_shard(shard)?;
    }
    let result = encoder.encode()?;
    Ok(result.recovery_iter().map(|s| s.to_vec()).collect())
}

/// One shard plus its original index, as fed to `recover`.
pub struct PresentShard<'a> {
    pub index: usize,
    pub data: &'a [u8],
}

/// Reconstructs the full set of `d` data shards given a partial view: every
/// shard the caller still has (data or parity, by original index) and the
/// indices of data shards known to be missing. Returns the missing shards
/// in the same order as `missing_indices`.
pub fn recover(
    total_data: usize,
    parity_level: u8,
    shard_len: usize,
    present_data: &[PresentShard<'_>],
    present_parity: &[PresentShard<'_>],
    missing_indices: &[usize],
) -> Result<Vec<Vec<u8>>, CodecError> {
    if total_data == 0 {
        return Err(CodecError::TooFewShards);
    }
    if parity_level == 0 || parity_level > MAX_PARITY_LEVEL {
        return Err(CodecError::BadParityLevel(parity_level));
    }
    if missing_indices.is_empty() {
        return Ok(Vec::new());
    }
    if missing_indices.len() > present_parity.len() {
        return Err(CodecError::TooManyMissing {
            missing: missing_indices.len(),
            available_parity: present_parity.len(),
        });
    }
    for shard in present_data.iter().map(|s| s.data).chain(present_parity.iter().map(|s| s.data)) {
        if shard.len() != shard_len {
            return Err(CodecError::ShardLengthMismatch);
        }
    }

    let mut decoder = ReedSolomonDecoder::new(total_data, parity_level as usize, shard_len)?;
    for shard in present_data {
        decoder.add_original_shard(shard.index, shard.data)?;
    }
    for shard in present_parity {
        decoder.add_recovery_shard(shard.index, shard.data)?;
    }
    let result = decoder.decode()?;

    let mut out = Vec::with_capacity(missing_indices.len());
    for &idx in missing_indices {
        let restored = result
            .restored_original(idx)
            .ok_or(CodecError::Rs(reed_solomon_simd::Error::NotEnoughShards))?;
        out.push(restored.to_vec());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shards(n: usize, len: usize, seed: u8) -> Vec<Vec<u8>> {
        (0..n)
            .map(|i| vec![seed.wrapping_add(i as u8); len])
            .collect()
    }

    #[test]
    fn round_trips_without_loss() {
        let data = shards(4, 64, 1);
        let parity = encode(&data, 2, 64).unwrap();
        assert_eq!(parity.len(), 2);
    }

    #[test]
    fn recovers_single_missing_data_shard() {
        let data = shards(4, 64, 5);
        let parity = encode(&data, 2, 64).unwrap();

        let present_data: Vec<PresentShard> = data
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(i, d)| PresentShard { index: i, data: d })
            .collect();
        let present_parity: Vec<PresentShard> = parity
            .iter()
            .enumerate()
            .map(|(i, p)| PresentShard { index: i, data: p })
            .collect();

        let recovered = recover(4, 2, 64, &present_data, &present_parity, &[1]).unwrap();
        assert_eq!(recovered[0], data[1]);
    }

    #[test]
    fn fails_when_more_missing_than_parity() {
        let data = shards(4, 32, 2);
        let parity = encode(&data, 1, 32).unwrap();
        let present_parity: Vec<PresentShard> = parity
            .iter()
            .enumerate()
            .map(|(i, p)| PresentShard { index: i, data: p })
            .collect();
        let err = recover(4, 1, 32, &[], &present_parity, &[0, 1]).unwrap_err();
        assert!(matches!(err, CodecError::TooManyMissing { .. }));
    }

    #[test]
    fn rejects_mismatched_shard_lengths() {
        let data = vec![vec![0u8; 16], vec![0u8; 8]];
        let err = encode(&data, 1, 16).unwrap_err();
        assert!(matches!(err, CodecError::ShardLengthMismatch));
    }
}
