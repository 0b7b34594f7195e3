//! Binary hash trees with incremental inclusion proofs.
//!
//! Trees are complete: leaves are padded out to a power of two with the
//! empty-leaf hash `SHA256d(tag)`. Internal nodes hash
//! `SHA256d(tag || left || right)`. Nodes are stored heap style, the root at
//! index 0 and leaf `j` at index `padded - 1 + j`, which is the index space
//! share containers use on the wire.

use crate::crypto::tagged_hash;
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised when a hash chain or signature fails to check out.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrityError {
    /// A recomputed hash disagreed with a trusted value.
    #[error("hash mismatch at {context}")]
    HashMismatch {
        /// Where the disagreement was found.
        context: String,
    },
    /// A signature failed to verify.
    #[error("signature verification failed: {0}")]
    BadSignature(String),
    /// A chain was missing the node needed to continue upward.
    #[error("missing hash tree node {0}")]
    MissingNode(usize),
    /// A chain verified internally but never met a trusted node.
    #[error("hash chain does not reach a trusted root")]
    Unanchored,
    /// A leaf index was outside the tree.
    #[error("leaf index {index} out of range for {leaves} leaves")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of real leaves.
        leaves: usize,
    },
}

fn padded_leaves(leaf_count: usize) -> usize {
    leaf_count.max(1).next_power_of_two()
}

fn sibling(index: usize) -> usize {
    // Children of p sit at 2p+1 and 2p+2; odd indices are left children.
    if index % 2 == 1 {
        index + 1
    } else {
        index - 1
    }
}

fn parent(index: usize) -> usize {
    (index - 1) / 2
}

fn combine(tag: &[u8], index: usize, value: &[u8; 32], sib: &[u8; 32]) -> [u8; 32] {
    if index % 2 == 1 {
        tagged_hash(tag, &[value, sib])
    } else {
        tagged_hash(tag, &[sib, value])
    }
}

/// A fully materialized hash tree over an ordered sequence of leaf digests.
#[derive(Debug, Clone)]
pub struct HashTree {
    tag: &'static [u8],
    leaf_count: usize,
    nodes: Vec<[u8; 32]>,
}

impl HashTree {
    /// Builds the tree for `leaves` under the given domain tag.
    pub fn new(tag: &'static [u8], leaves: &[[u8; 32]]) -> Self {
        let padded = padded_leaves(leaves.len());
        let empty = tagged_hash(tag, &[]);
        let mut nodes = vec![[0u8; 32]; 2 * padded - 1];
        for (j, slot) in nodes[padded - 1..].iter_mut().enumerate() {
            *slot = *leaves.get(j).unwrap_or(&empty);
        }
        for i in (0..padded - 1).rev() {
            let left = nodes[2 * i + 1];
            let right = nodes[2 * i + 2];
            nodes[i] = tagged_hash(tag, &[&left, &right]);
        }
        Self {
            tag,
            leaf_count: leaves.len(),
            nodes,
        }
    }

    /// The root digest.
    pub fn root(&self) -> [u8; 32] {
        self.nodes[0]
    }

    /// Number of real (unpadded) leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// The stored digest of leaf `index`.
    pub fn leaf(&self, index: usize) -> Result<[u8; 32], IntegrityError> {
        if index >= self.leaf_count {
            return Err(IntegrityError::IndexOutOfRange {
                index,
                leaves: self.leaf_count,
            });
        }
        let padded = padded_leaves(self.leaf_count);
        Ok(self.nodes[padded - 1 + index])
    }

    /// The sibling chain proving leaf `index`, as `(node_index, digest)`
    /// pairs ordered leaf to root.
    pub fn needed_hashes(&self, index: usize) -> Result<Vec<(usize, [u8; 32])>, IntegrityError> {
        if index >= self.leaf_count {
            return Err(IntegrityError::IndexOutOfRange {
                index,
                leaves: self.leaf_count,
            });
        }
        let padded = padded_leaves(self.leaf_count);
        let mut pos = padded - 1 + index;
        let mut chain = Vec::new();
        while pos > 0 {
            let sib = sibling(pos);
            chain.push((sib, self.nodes[sib]));
            pos = parent(pos);
        }
        Ok(chain)
    }

    /// Every node of the tree as `(node_index, digest)` pairs. Shares store
    /// their block tree in this form so readers can pick any chain.
    pub fn all_nodes(&self) -> Vec<(usize, [u8; 32])> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, h)| (i, *h))
            .collect()
    }
}

/// Checks a sibling chain against an externally trusted root.
pub fn verify_chain(
    tag: &[u8],
    leaf_count: usize,
    index: usize,
    leaf: &[u8; 32],
    chain: &[(usize, [u8; 32])],
    root: &[u8; 32],
) -> Result<(), IntegrityError> {
    if index >= leaf_count {
        return Err(IntegrityError::IndexOutOfRange {
            index,
            leaves: leaf_count,
        });
    }
    let provided: HashMap<usize, [u8; 32]> = chain.iter().copied().collect();
    let padded = padded_leaves(leaf_count);
    let mut pos = padded - 1 + index;
    let mut current = *leaf;
    while pos > 0 {
        let sib = sibling(pos);
        let sib_hash = provided
            .get(&sib)
            .ok_or(IntegrityError::MissingNode(sib))?;
        current = combine(tag, pos, &current, sib_hash);
        pos = parent(pos);
    }
    if current == *root {
        Ok(())
    } else {
        Err(IntegrityError::HashMismatch {
            context: format!("leaf {index}"),
        })
    }
}

/// A hash tree being reassembled from remotely supplied nodes.
///
/// The root is pinned first (it comes from a verified UEB or a signed
/// version block); leaves are then admitted only when their chain reproduces
/// a node already trusted. Verified nodes are cached so later chains can be
/// shorter and repeated verification is free.
#[derive(Debug, Clone)]
pub struct IncompleteHashTree {
    tag: &'static [u8],
    leaf_count: usize,
    nodes: Vec<Option<[u8; 32]>>,
}

impl IncompleteHashTree {
    /// Creates an empty tree expecting `leaf_count` leaves.
    pub fn new(tag: &'static [u8], leaf_count: usize) -> Self {
        let padded = padded_leaves(leaf_count);
        Self {
            tag,
            leaf_count,
            nodes: vec![None; 2 * padded - 1],
        }
    }

    /// Pins the trusted root digest.
    pub fn set_root(&mut self, root: [u8; 32]) {
        self.nodes[0] = Some(root);
    }

    /// Returns the cached digest of leaf `index`, if already verified.
    pub fn leaf(&self, index: usize) -> Option<[u8; 32]> {
        let padded = padded_leaves(self.leaf_count);
        self.nodes.get(padded - 1 + index).copied().flatten()
    }

    /// Verifies `leaf` at `index` using `chain`, caching the whole verified
    /// path on success. Nothing is cached on failure.
    pub fn add_leaf(
        &mut self,
        index: usize,
        leaf: [u8; 32],
        chain: &[(usize, [u8; 32])],
    ) -> Result<(), IntegrityError> {
        if index >= self.leaf_count {
            return Err(IntegrityError::IndexOutOfRange {
                index,
                leaves: self.leaf_count,
            });
        }
        let provided: HashMap<usize, [u8; 32]> = chain.iter().copied().collect();
        let padded = padded_leaves(self.leaf_count);
        let mut pos = padded - 1 + index;
        let mut current = leaf;
        let mut accepted: Vec<(usize, [u8; 32])> = vec![(pos, leaf)];
        loop {
            if let Some(trusted) = self.nodes[pos] {
                if trusted != current {
                    return Err(IntegrityError::HashMismatch {
                        context: format!("node {pos}"),
                    });
                }
                for (idx, hash) in accepted {
                    self.nodes[idx] = Some(hash);
                }
                return Ok(());
            }
            if pos == 0 {
                // Computed a root but nothing trusted to compare it against.
                return Err(IntegrityError::Unanchored);
            }
            let sib = sibling(pos);
            let sib_hash = match self.nodes[sib] {
                Some(hash) => hash,
                None => *provided
                    .get(&sib)
                    .ok_or(IntegrityError::MissingNode(sib))?,
            };
            accepted.push((sib, sib_hash));
            current = combine(self.tag, pos, &current, &sib_hash);
            pos = parent(pos);
            accepted.push((pos, current));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{BLOCK_HASH_TAG, SHARE_HASH_TAG};

    fn leaves(count: usize) -> Vec<[u8; 32]> {
        (0..count)
            .map(|i| {
                let mut leaf = [0u8; 32];
                leaf[0] = i as u8;
                leaf
            })
            .collect()
    }

    #[test]
    fn chains_verify_for_every_leaf() {
        for count in [1usize, 2, 3, 4, 5, 7, 8, 9] {
            let tree = HashTree::new(BLOCK_HASH_TAG, &leaves(count));
            let root = tree.root();
            for i in 0..count {
                let chain = tree.needed_hashes(i).unwrap();
                let leaf = tree.leaf(i).unwrap();
                verify_chain(BLOCK_HASH_TAG, count, i, &leaf, &chain, &root)
                    .unwrap_or_else(|err| panic!("count={count} leaf={i}: {err}"));
            }
        }
    }

    #[test]
    fn tampered_leaf_is_rejected() {
        let tree = HashTree::new(BLOCK_HASH_TAG, &leaves(6));
        let chain = tree.needed_hashes(2).unwrap();
        let mut leaf = tree.leaf(2).unwrap();
        leaf[0] ^= 1;
        let err = verify_chain(BLOCK_HASH_TAG, 6, 2, &leaf, &chain, &tree.root()).unwrap_err();
        assert!(matches!(err, IntegrityError::HashMismatch { .. }));
    }

    #[test]
    fn tag_is_part_of_the_root() {
        let tree_a = HashTree::new(BLOCK_HASH_TAG, &leaves(4));
        let tree_b = HashTree::new(SHARE_HASH_TAG, &leaves(4));
        assert_ne!(tree_a.root(), tree_b.root());
    }

    #[test]
    fn out_of_range_leaf_is_an_error() {
        let tree = HashTree::new(BLOCK_HASH_TAG, &leaves(3));
        assert!(matches!(
            tree.needed_hashes(3),
            Err(IntegrityError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn incomplete_tree_accepts_and_caches() {
        let all = leaves(5);
        let tree = HashTree::new(SHARE_HASH_TAG, &all);
        let mut partial = IncompleteHashTree::new(SHARE_HASH_TAG, 5);
        partial.set_root(tree.root());

        let chain = tree.needed_hashes(1).unwrap();
        partial.add_leaf(1, all[1], &chain).unwrap();
        assert_eq!(partial.leaf(1), Some(all[1]));

        // Sibling of leaf 1 was cached by the first chain, so leaf 0 now
        // verifies with an empty chain.
        partial.add_leaf(0, all[0], &[]).unwrap();
    }

    #[test]
    fn incomplete_tree_rejects_bad_leaf_without_caching() {
        let all = leaves(4);
        let tree = HashTree::new(SHARE_HASH_TAG, &all);
        let mut partial = IncompleteHashTree::new(SHARE_HASH_TAG, 4);
        partial.set_root(tree.root());

        let chain = tree.needed_hashes(2).unwrap();
        let mut bad = all[2];
        bad[5] ^= 0xff;
        assert!(partial.add_leaf(2, bad, &chain).is_err());
        assert_eq!(partial.leaf(2), None);
        // The genuine leaf still goes through afterwards.
        partial.add_leaf(2, all[2], &chain).unwrap();
    }

    #[test]
    fn incomplete_tree_without_root_is_unanchored() {
        let all = leaves(2);
        let tree = HashTree::new(SHARE_HASH_TAG, &all);
        let mut partial = IncompleteHashTree::new(SHARE_HASH_TAG, 2);
        let chain = tree.needed_hashes(0).unwrap();
        assert_eq!(
            partial.add_leaf(0, all[0], &chain),
            Err(IntegrityError::Unanchored)
        );
    }
}
