//! Immutable encode-and-upload engine.
//!
//! The pipeline: segment the plaintext, derive the (possibly convergent)
//! readkey, encrypt, erasure-code each segment, build the hash trees, then
//! walk the permuted server ring placing one share per server. Erasure
//! coding, hashing, and encryption run on the blocking pool so the reactor
//! stays free for I/O.

use crate::cap::{
    convergent_readkey, storage_index_from_readkey, Capability, ChkRead, LitCap, LIT_SIZE_LIMIT,
};
use crate::crypto::{
    ctr_transform, random_key16, sha256d, tagged_hash, BLOCK_HASH_TAG, CRYPTTEXT_HASH_TAG,
    PLAINTEXT_HASH_TAG, SHARE_HASH_TAG,
};
use crate::erasure::{CodingError, ErasureCodec};
use crate::grid::client::{Client, GridServer};
use crate::grid::select::servers_of_happiness;
use crate::hashtree::HashTree;
use crate::layout::{
    encode_hash_entries, encode_ueb_section, hash_entries_len, SegmentGeometry, ShareOffsets,
    UriExtension,
};
use crate::{ServerId, ShareNum, StorageIndex};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use thiserror::Error;

/// Errors surfaced by an upload.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The placement could not reach `happy` distinct servers.
    #[error(
        "not enough shares: {placed} placed across {servers} servers, happiness {happiness} < {happy}"
    )]
    NotEnoughShares {
        /// Shares placed or already present.
        placed: usize,
        /// Distinct servers holding them.
        servers: usize,
        /// Achieved happiness.
        happiness: usize,
        /// Required happiness.
        happy: u8,
    },
    /// Erasure coding failed.
    #[error(transparent)]
    Coding(#[from] CodingError),
    /// A worker task died.
    #[error("upload worker failed: {0}")]
    Internal(String),
}

struct SegmentProduct {
    plain_leaf: [u8; 32],
    crypt_leaf: [u8; 32],
    blocks: Vec<Vec<u8>>,
    block_leaves: Vec<[u8; 32]>,
}

fn build_segment(
    readkey: [u8; 16],
    codec: &ErasureCodec,
    offset: u64,
    mut segment: Vec<u8>,
) -> Result<SegmentProduct, CodingError> {
    let plain_leaf = tagged_hash(PLAINTEXT_HASH_TAG, &[&segment]);
    ctr_transform(&readkey, offset, &mut segment);
    let crypt_leaf = tagged_hash(CRYPTTEXT_HASH_TAG, &[&segment]);
    let blocks = codec.encode(&segment)?;
    let block_leaves = blocks
        .iter()
        .map(|block| tagged_hash(BLOCK_HASH_TAG, &[block]))
        .collect();
    Ok(SegmentProduct {
        plain_leaf,
        crypt_leaf,
        blocks,
        block_leaves,
    })
}

struct TailSections {
    ptree: Vec<u8>,
    ctree: Vec<u8>,
    block_trees: Vec<Vec<u8>>,
    chains: Vec<Vec<u8>>,
    ueb_section: Vec<u8>,
}

fn tree_entries(tree: &HashTree) -> Vec<(u32, [u8; 32])> {
    tree.all_nodes()
        .into_iter()
        .map(|(i, h)| (i as u32, h))
        .collect()
}

struct Uploader<'a> {
    client: &'a Client,
    plaintext: &'a [u8],
    readkey: [u8; 16],
    si: StorageIndex,
    codec: ErasureCodec,
    geo: SegmentGeometry,
    plan: ShareOffsets,
    renew: [u8; 32],
    cancel: [u8; 32],
    candidates: Vec<GridServer>,
    attempted: HashSet<ServerId>,
    /// Shares with an open bucket still being written.
    active: BTreeMap<ShareNum, GridServer>,
    /// Shares fully present on a server (already there or closed by us).
    done: BTreeMap<ShareNum, ServerId>,
}

impl<'a> Uploader<'a> {
    fn happiness(&self) -> usize {
        let placements: BTreeMap<ShareNum, BTreeSet<ServerId>> = self
            .done
            .iter()
            .map(|(share, id)| (*share, BTreeSet::from([*id])))
            .chain(
                self.active
                    .iter()
                    .map(|(share, server)| (*share, BTreeSet::from([server.id()]))),
            )
            .collect();
        servers_of_happiness(&placements)
    }

    fn placement_failure(&self) -> UploadError {
        let servers: BTreeSet<ServerId> = self
            .done
            .values()
            .copied()
            .chain(self.active.values().map(|s| s.id()))
            .collect();
        UploadError::NotEnoughShares {
            placed: self.done.len() + self.active.len(),
            servers: servers.len(),
            happiness: self.happiness(),
            happy: self.client.config().happy,
        }
    }

    async fn check_happy(&self) -> Result<(), UploadError> {
        if self.happiness() < usize::from(self.client.config().happy) {
            // Leave half-written buckets to lease expiry after telling the
            // servers we are done with them.
            for (&share, server) in &self.active {
                let _ = server.connection.bucket_abort(self.si, share).await;
            }
            return Err(self.placement_failure());
        }
        Ok(())
    }

    /// Offers `share` to `server`; returns false if the server refused.
    async fn offer(&mut self, server: &GridServer, share: ShareNum) -> bool {
        match server
            .connection
            .allocate_buckets(
                self.si,
                self.renew,
                self.cancel,
                vec![share],
                self.plan.own_size,
            )
            .await
        {
            Ok(result) => {
                self.client.note_success(server.id());
                if result.already_have.contains(&share) {
                    self.done.insert(share, server.id());
                } else {
                    self.active.insert(share, server.clone());
                }
                true
            }
            Err(err) => {
                eprintln!(
                    "server {} refused share {share}: {err}",
                    hex::encode(server.id())
                );
                self.client.note_failure(server.id());
                false
            }
        }
    }

    /// First pass: one share per server along the permuted ring, then the
    /// leftovers round-robin across the servers that accepted.
    async fn place_initial(&mut self) -> Result<(), UploadError> {
        let mut queue: VecDeque<ShareNum> = (0..self.client.config().n).collect();
        let mut accepting: Vec<GridServer> = Vec::new();
        let candidates = self.candidates.clone();
        for server in &candidates {
            let Some(&share) = queue.front() else { break };
            self.attempted.insert(server.id());
            if self.offer(server, share).await {
                queue.pop_front();
                accepting.push(server.clone());
            }
        }
        if !queue.is_empty() && !accepting.is_empty() {
            let mut turn = 0usize;
            'shares: while let Some(share) = queue.pop_front() {
                for _ in 0..accepting.len() {
                    let server = accepting[turn % accepting.len()].clone();
                    turn += 1;
                    if self.offer(&server, share).await {
                        continue 'shares;
                    }
                }
                // No server will take this share; it stays unplaced.
                break;
            }
        }
        self.check_happy().await
    }

    /// Recomputes the blocks of a single share for segments `0..upto`.
    async fn recompute_blocks(&self, share: ShareNum, upto: u64) -> Result<Vec<Vec<u8>>, UploadError> {
        let readkey = self.readkey;
        let codec = self.codec.clone();
        let geo = self.geo;
        let plaintext: Vec<u8> = self.plaintext.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut blocks = Vec::with_capacity(upto as usize);
            for seg in 0..upto {
                let start = (seg * geo.segment_size) as usize;
                let end = start + geo.segment_len(seg) as usize;
                let mut segment = plaintext[start..end].to_vec();
                ctr_transform(&readkey, seg * geo.segment_size, &mut segment);
                let mut encoded = codec.encode(&segment)?;
                blocks.push(std::mem::take(&mut encoded[usize::from(share)]));
            }
            Ok::<_, CodingError>(blocks)
        })
        .await
        .map_err(|err| UploadError::Internal(err.to_string()))?
        .map_err(UploadError::from)
    }

    /// Moves a failed share onto the next untried server, rewriting what
    /// has been produced so far.
    async fn replace(
        &mut self,
        share: ShareNum,
        written_segments: u64,
        sections: Option<&TailSections>,
    ) -> Result<(), UploadError> {
        self.active.remove(&share);
        self.done.remove(&share);
        let candidates = self.candidates.clone();
        for server in candidates {
            if self.attempted.contains(&server.id()) {
                continue;
            }
            self.attempted.insert(server.id());
            if !self.offer(&server, share).await {
                continue;
            }
            if self.done.contains_key(&share) {
                // The replacement server already holds the share.
                return Ok(());
            }
            println!(
                "GRID|mod=UPLOAD|evt=REPLACE|share={share}|server={}",
                hex::encode(server.id())
            );
            let blocks = self.recompute_blocks(share, written_segments).await?;
            match self.rewrite(&server, share, blocks, sections).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    eprintln!(
                        "server {} refused share {share}: {err}",
                        hex::encode(server.id())
                    );
                    self.client.note_failure(server.id());
                    self.active.remove(&share);
                    continue;
                }
            }
        }
        // Out of candidates for this share.
        self.check_happy().await
    }

    /// Replays a share onto a fresh bucket: header, blocks written so far,
    /// and the tail sections when the upload has already produced them.
    async fn rewrite(
        &self,
        server: &GridServer,
        share: ShareNum,
        blocks: Vec<Vec<u8>>,
        sections: Option<&TailSections>,
    ) -> Result<(), crate::grid::backend::StorageError> {
        server
            .connection
            .bucket_write(self.si, share, 0, self.plan.encode())
            .await?;
        for (seg, block) in blocks.into_iter().enumerate() {
            let offset = self.plan.data_offset + self.geo.block_offset(seg as u64);
            server
                .connection
                .bucket_write(self.si, share, offset, block)
                .await?;
        }
        if let Some(sections) = sections {
            self.write_tail(server, share, sections).await?;
        }
        Ok(())
    }

    async fn write_tail(
        &self,
        server: &GridServer,
        share: ShareNum,
        sections: &TailSections,
    ) -> Result<(), crate::grid::backend::StorageError> {
        let writes = [
            (self.plan.plaintext_hash_tree, &sections.ptree),
            (self.plan.crypttext_hash_tree, &sections.ctree),
            (
                self.plan.block_hash_tree,
                &sections.block_trees[usize::from(share)],
            ),
            (self.plan.share_hash_chain, &sections.chains[usize::from(share)]),
            (self.plan.uri_extension, &sections.ueb_section),
        ];
        for (offset, bytes) in writes {
            server
                .connection
                .bucket_write(self.si, share, offset, bytes.clone())
                .await?;
        }
        server.connection.bucket_close(self.si, share).await
    }
}

/// Uploads `plaintext` and returns the capability naming it.
///
/// Inputs at or below the literal threshold come back as `LIT` without any
/// server contact. Larger files are placed across the permuted ring and the
/// upload succeeds only if the happiness predicate is met.
pub async fn upload(client: &Client, plaintext: &[u8]) -> Result<Capability, UploadError> {
    if plaintext.len() <= LIT_SIZE_LIMIT {
        return Ok(Capability::Lit(LitCap {
            data: plaintext.to_vec(),
        }));
    }
    let cfg = client.config().clone();
    let codec = ErasureCodec::new(cfg.k, cfg.n)?;
    let readkey = match &cfg.convergence_secret {
        Some(secret) => convergent_readkey(
            secret,
            cfg.k,
            cfg.n,
            cfg.segment_size,
            &sha256d(plaintext),
        ),
        None => random_key16(),
    };
    let si = storage_index_from_readkey(&readkey);
    let geo = SegmentGeometry::new(plaintext.len() as u64, cfg.segment_size, cfg.k);

    // Section sizes are all known before any byte is produced, so the whole
    // container can be laid out and allocated up front.
    let segment_nodes = 2 * (geo.num_segments as usize).next_power_of_two() - 1;
    let share_padded = usize::from(cfg.n).next_power_of_two();
    let chain_entries = share_padded.trailing_zeros() as usize;
    let ueb_len = UriExtension {
        k: cfg.k,
        n: cfg.n,
        segment_size: geo.segment_size,
        tail_segment_size: geo.tail_segment_size,
        num_segments: geo.num_segments,
        size: geo.size,
        share_root: [0u8; 32],
        crypttext_root: [0u8; 32],
        plaintext_root: [0u8; 32],
    }
    .encode()
    .len() as u64;
    let plan = ShareOffsets::plan(
        geo.share_data_size(),
        hash_entries_len(segment_nodes),
        hash_entries_len(segment_nodes),
        hash_entries_len(segment_nodes),
        hash_entries_len(chain_entries),
        4 + ueb_len,
    );

    let mut uploader = Uploader {
        client,
        plaintext,
        readkey,
        si,
        codec: codec.clone(),
        geo,
        plan: plan.clone(),
        renew: client.renew_secret_for(&si),
        cancel: client.cancel_secret_for(&si),
        candidates: client.candidate_servers(&si),
        attempted: HashSet::new(),
        active: BTreeMap::new(),
        done: BTreeMap::new(),
    };
    uploader.place_initial().await?;

    // Headers first so a share is self-describing from its first byte.
    let header = plan.encode();
    let open_shares: Vec<ShareNum> = uploader.active.keys().copied().collect();
    for share in open_shares {
        let server = uploader.active[&share].clone();
        if let Err(err) = server
            .connection
            .bucket_write(si, share, 0, header.clone())
            .await
        {
            eprintln!("write of share {share} failed: {err}");
            client.note_failure(server.id());
            uploader.replace(share, 0, None).await?;
        }
    }

    let mut plain_leaves = Vec::with_capacity(geo.num_segments as usize);
    let mut crypt_leaves = Vec::with_capacity(geo.num_segments as usize);
    let mut block_leaves: Vec<Vec<[u8; 32]>> =
        vec![Vec::with_capacity(geo.num_segments as usize); usize::from(cfg.n)];

    for seg in 0..geo.num_segments {
        let start = (seg * geo.segment_size) as usize;
        let end = start + geo.segment_len(seg) as usize;
        let segment = plaintext[start..end].to_vec();
        let codec_for_worker = codec.clone();
        let offset = seg * geo.segment_size;
        let product = tokio::task::spawn_blocking(move || {
            build_segment(readkey, &codec_for_worker, offset, segment)
        })
        .await
        .map_err(|err| UploadError::Internal(err.to_string()))??;

        plain_leaves.push(product.plain_leaf);
        crypt_leaves.push(product.crypt_leaf);
        for (share, leaf) in product.block_leaves.iter().enumerate() {
            block_leaves[share].push(*leaf);
        }

        let offset_in_share = plan.data_offset + geo.block_offset(seg);
        let writers: Vec<(ShareNum, GridServer)> = uploader
            .active
            .iter()
            .map(|(s, srv)| (*s, srv.clone()))
            .collect();
        for (share, server) in writers {
            let block = product.blocks[usize::from(share)].clone();
            if let Err(err) = server
                .connection
                .bucket_write(si, share, offset_in_share, block)
                .await
            {
                eprintln!("write of share {share} failed: {err}");
                client.note_failure(server.id());
                uploader.replace(share, seg + 1, None).await?;
            }
        }
    }

    // All leaves are in; finish the trees and the UEB.
    let plaintext_tree = HashTree::new(PLAINTEXT_HASH_TAG, &plain_leaves);
    let crypttext_tree = HashTree::new(CRYPTTEXT_HASH_TAG, &crypt_leaves);
    let block_trees: Vec<HashTree> = block_leaves
        .iter()
        .map(|leaves| HashTree::new(BLOCK_HASH_TAG, leaves))
        .collect();
    let share_roots: Vec<[u8; 32]> = block_trees.iter().map(|t| t.root()).collect();
    let share_tree = HashTree::new(SHARE_HASH_TAG, &share_roots);
    let ueb = UriExtension {
        k: cfg.k,
        n: cfg.n,
        segment_size: geo.segment_size,
        tail_segment_size: geo.tail_segment_size,
        num_segments: geo.num_segments,
        size: geo.size,
        share_root: share_tree.root(),
        crypttext_root: crypttext_tree.root(),
        plaintext_root: plaintext_tree.root(),
    };
    let ueb_bytes = ueb.encode();
    let ueb_hash = ueb.ueb_hash();

    let mut chains = Vec::with_capacity(usize::from(cfg.n));
    for share in 0..usize::from(cfg.n) {
        let chain = share_tree
            .needed_hashes(share)
            .map_err(|err| UploadError::Internal(err.to_string()))?;
        let entries: Vec<(u32, [u8; 32])> =
            chain.into_iter().map(|(i, h)| (i as u32, h)).collect();
        chains.push(encode_hash_entries(&entries));
    }
    let sections = TailSections {
        ptree: encode_hash_entries(&tree_entries(&plaintext_tree)),
        ctree: encode_hash_entries(&tree_entries(&crypttext_tree)),
        block_trees: block_trees
            .iter()
            .map(|tree| encode_hash_entries(&tree_entries(tree)))
            .collect(),
        chains,
        ueb_section: encode_ueb_section(&ueb_bytes),
    };

    let writers: Vec<(ShareNum, GridServer)> = uploader
        .active
        .iter()
        .map(|(s, srv)| (*s, srv.clone()))
        .collect();
    for (share, server) in writers {
        match uploader.write_tail(&server, share, &sections).await {
            Ok(()) => {
                uploader.active.remove(&share);
                uploader.done.insert(share, server.id());
            }
            Err(err) => {
                eprintln!("write of share {share} failed: {err}");
                client.note_failure(server.id());
                uploader
                    .replace(share, geo.num_segments, Some(&sections))
                    .await?;
                // A successful replacement lands directly in `done`.
                if let Some(server) = uploader.active.remove(&share) {
                    uploader.done.insert(share, server.id());
                }
            }
        }
    }

    let happiness = uploader.happiness();
    if happiness < usize::from(cfg.happy) {
        return Err(uploader.placement_failure());
    }
    println!(
        "GRID|mod=UPLOAD|evt=DONE|si={}|shares={}|happiness={happiness}",
        hex::encode(si),
        uploader.done.len()
    );
    Ok(Capability::Chk(ChkRead {
        readkey,
        ueb_hash,
        k: cfg.k,
        n: cfg.n,
        size: geo.size,
    }))
}
