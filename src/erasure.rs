//! Reed-Solomon `(k, n)` coding over GF(2^8).
//!
//! A segment is zero-padded to a multiple of `k`, split into `k` data
//! blocks, and extended with `n - k` parity blocks. Any `k` of the `n`
//! blocks reconstruct the segment exactly. Encoding is deterministic, which
//! convergent uploads rely on for share-level deduplication.

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised while constructing a codec or encoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodingError {
    /// Parameters violated `1 <= k <= n <= 255`.
    #[error("invalid encoding parameters k={k} n={n}")]
    BadParameters {
        /// Needed blocks.
        k: u8,
        /// Total blocks.
        n: u8,
    },
    /// The underlying field arithmetic rejected the operation.
    #[error("reed-solomon encode failed: {0}")]
    Encode(String),
}

/// Errors raised while reconstructing a segment from blocks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodingError {
    /// Fewer than `k` distinct blocks were supplied.
    #[error("need {needed} blocks to decode, have {have}")]
    NotEnoughShares {
        /// Blocks required (`k`).
        needed: usize,
        /// Distinct blocks available.
        have: usize,
    },
    /// A supplied block had the wrong length for this segment.
    #[error("block {sharenum} is {actual} bytes, expected {expected}")]
    BlockLength {
        /// Share number of the offending block.
        sharenum: u8,
        /// Observed length.
        actual: usize,
        /// Required length.
        expected: usize,
    },
    /// A block number was outside `0..n`.
    #[error("block number {0} out of range")]
    BadShareNumber(u8),
    /// The underlying field arithmetic failed to reconstruct.
    #[error("reed-solomon reconstruct failed: {0}")]
    Reconstruct(String),
}

/// A `(k, n)` erasure codec.
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    k: u8,
    n: u8,
}

impl ErasureCodec {
    /// Validates parameters and builds a codec.
    pub fn new(k: u8, n: u8) -> Result<Self, CodingError> {
        if k == 0 || k > n {
            return Err(CodingError::BadParameters { k, n });
        }
        Ok(Self { k, n })
    }

    /// Blocks needed to reconstruct.
    pub fn needed(&self) -> u8 {
        self.k
    }

    /// Total blocks produced.
    pub fn total(&self) -> u8 {
        self.n
    }

    /// The per-block length for a segment of `segment_len` bytes.
    pub fn block_len(&self, segment_len: usize) -> usize {
        segment_len.div_ceil(self.k as usize)
    }

    /// Splits `segment` into `n` blocks, any `k` of which reconstruct it.
    pub fn encode(&self, segment: &[u8]) -> Result<Vec<Vec<u8>>, CodingError> {
        let k = self.k as usize;
        let n = self.n as usize;
        let block_len = self.block_len(segment.len());
        if block_len == 0 {
            return Ok(vec![Vec::new(); n]);
        }
        let mut blocks: Vec<Vec<u8>> = vec![vec![0u8; block_len]; n];
        for (i, chunk) in segment.chunks(block_len).enumerate() {
            blocks[i][..chunk.len()].copy_from_slice(chunk);
        }
        if n > k {
            let rs = ReedSolomon::new(k, n - k)
                .map_err(|err| CodingError::Encode(err.to_string()))?;
            rs.encode(&mut blocks)
                .map_err(|err| CodingError::Encode(err.to_string()))?;
        }
        Ok(blocks)
    }

    /// Reconstructs a `segment_len`-byte segment from any `k` blocks.
    ///
    /// `blocks` maps share number to block bytes; extra entries beyond `k`
    /// are used opportunistically by the reconstruction.
    pub fn decode(
        &self,
        blocks: &BTreeMap<u8, Vec<u8>>,
        segment_len: usize,
    ) -> Result<Vec<u8>, DecodingError> {
        let k = self.k as usize;
        let n = self.n as usize;
        if segment_len == 0 {
            return Ok(Vec::new());
        }
        let block_len = self.block_len(segment_len);
        if blocks.len() < k {
            return Err(DecodingError::NotEnoughShares {
                needed: k,
                have: blocks.len(),
            });
        }
        let mut shards: Vec<Option<Vec<u8>>> = vec![None; n];
        for (&num, block) in blocks {
            if usize::from(num) >= n {
                return Err(DecodingError::BadShareNumber(num));
            }
            if block.len() != block_len {
                return Err(DecodingError::BlockLength {
                    sharenum: num,
                    actual: block.len(),
                    expected: block_len,
                });
            }
            shards[usize::from(num)] = Some(block.clone());
        }
        if n > k && shards[..k].iter().any(Option::is_none) {
            let rs = ReedSolomon::new(k, n - k)
                .map_err(|err| DecodingError::Reconstruct(err.to_string()))?;
            rs.reconstruct_data(&mut shards)
                .map_err(|err| DecodingError::Reconstruct(err.to_string()))?;
        }
        let mut segment = Vec::with_capacity(block_len * k);
        for shard in shards.into_iter().take(k) {
            match shard {
                Some(bytes) => segment.extend_from_slice(&bytes),
                None => {
                    return Err(DecodingError::NotEnoughShares {
                        needed: k,
                        have: blocks.len(),
                    })
                }
            }
        }
        segment.truncate(segment_len);
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn every_k_subset_reconstructs() {
        let codec = ErasureCodec::new(3, 6).unwrap();
        let segment = sample(1000);
        let blocks = codec.encode(&segment).unwrap();
        assert_eq!(blocks.len(), 6);

        // All 3-subsets of 6 blocks.
        for a in 0..6u8 {
            for b in (a + 1)..6 {
                for c in (b + 1)..6 {
                    let subset: BTreeMap<u8, Vec<u8>> = [a, b, c]
                        .into_iter()
                        .map(|i| (i, blocks[i as usize].clone()))
                        .collect();
                    let decoded = codec.decode(&subset, segment.len()).unwrap();
                    assert_eq!(decoded, segment, "subset {a},{b},{c}");
                }
            }
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let codec = ErasureCodec::new(4, 9).unwrap();
        let segment = sample(4096);
        assert_eq!(codec.encode(&segment).unwrap(), codec.encode(&segment).unwrap());
    }

    #[test]
    fn short_segment_pads_with_zeros() {
        let codec = ErasureCodec::new(3, 5).unwrap();
        // 10 bytes over k=3 gives 4-byte blocks with 2 bytes of padding.
        let segment = sample(10);
        let blocks = codec.encode(&segment).unwrap();
        assert!(blocks.iter().all(|b| b.len() == 4));
        let subset: BTreeMap<u8, Vec<u8>> =
            [(0u8, blocks[0].clone()), (3, blocks[3].clone()), (4, blocks[4].clone())]
                .into_iter()
                .collect();
        assert_eq!(codec.decode(&subset, 10).unwrap(), segment);
    }

    #[test]
    fn too_few_blocks_fails() {
        let codec = ErasureCodec::new(3, 10).unwrap();
        let blocks = codec.encode(&sample(100)).unwrap();
        let subset: BTreeMap<u8, Vec<u8>> =
            [(1u8, blocks[1].clone()), (2, blocks[2].clone())].into_iter().collect();
        assert_eq!(
            codec.decode(&subset, 100),
            Err(DecodingError::NotEnoughShares { needed: 3, have: 2 })
        );
    }

    #[test]
    fn wrong_block_length_fails() {
        let codec = ErasureCodec::new(2, 4).unwrap();
        let blocks = codec.encode(&sample(64)).unwrap();
        let mut truncated = blocks[0].clone();
        truncated.pop();
        let subset: BTreeMap<u8, Vec<u8>> =
            [(0u8, truncated), (1, blocks[1].clone())].into_iter().collect();
        assert!(matches!(
            codec.decode(&subset, 64),
            Err(DecodingError::BlockLength { sharenum: 0, .. })
        ));
    }

    #[test]
    fn k_equal_n_is_plain_splitting() {
        let codec = ErasureCodec::new(4, 4).unwrap();
        let segment = sample(17);
        let blocks = codec.encode(&segment).unwrap();
        let all: BTreeMap<u8, Vec<u8>> = blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (i as u8, b.clone()))
            .collect();
        assert_eq!(codec.decode(&all, 17).unwrap(), segment);
    }

    #[test]
    fn zero_k_is_rejected() {
        assert!(matches!(
            ErasureCodec::new(0, 4),
            Err(CodingError::BadParameters { .. })
        ));
        assert!(ErasureCodec::new(5, 4).is_err());
    }
}
