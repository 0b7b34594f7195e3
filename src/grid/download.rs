//! Verified immutable download engine.
//!
//! Nothing a server returns is believed until it hangs off the capability:
//! the UEB must hash to the value in the readcap, every share's block tree
//! root must chain into the UEB's share root, and every block must chain
//! into its share's block tree before a byte of it is decoded. A share that
//! fails any check is evicted for the rest of the download and replaced
//! from the remaining candidates.

use crate::cap::ChkRead;
use crate::crypto::{ctr_transform, tagged_hash, BLOCK_HASH_TAG, CRYPTTEXT_HASH_TAG, SHARE_HASH_TAG};
use crate::erasure::ErasureCodec;
use crate::grid::client::{Client, GridServer};
use crate::hashtree::IncompleteHashTree;
use crate::layout::{
    decode_hash_entries, decode_ueb_section, SegmentGeometry, Section, ShareOffsets, UriExtension,
    MAX_HEADER_LEN,
};
use crate::{ShareNum, StorageIndex};
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors surfaced by a download.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Fewer than `k` valid shares could be assembled.
    #[error("unrecoverable file: {usable} usable shares, need {needed}")]
    Unrecoverable {
        /// Shares required (`k`).
        needed: u8,
        /// Valid shares available when the download gave up.
        usable: usize,
    },
    /// The capability kind cannot be downloaded by this engine.
    #[error("capability is not downloadable: {0}")]
    NotDownloadable(String),
    /// A worker task died.
    #[error("download worker failed: {0}")]
    Internal(String),
}

/// One share on one server.
#[derive(Clone)]
struct ShareSource {
    server: GridServer,
    sharenum: ShareNum,
}

/// Incrementally widening view of which servers hold which shares.
struct ShareFinder {
    si: StorageIndex,
    candidates: Vec<GridServer>,
    next_candidate: usize,
    found: Vec<ShareSource>,
    seen_shares: BTreeMap<ShareNum, usize>,
}

impl ShareFinder {
    fn new(client: &Client, si: StorageIndex) -> Self {
        Self {
            si,
            candidates: client.candidate_servers(&si),
            next_candidate: 0,
            found: Vec::new(),
            seen_shares: BTreeMap::new(),
        }
    }

    /// Queries servers in permuted order until `min_distinct` distinct
    /// shares are known or the ring is exhausted.
    async fn ensure(&mut self, client: &Client, min_distinct: usize) {
        while self.seen_shares.len() < min_distinct && self.next_candidate < self.candidates.len()
        {
            let server = self.candidates[self.next_candidate].clone();
            self.next_candidate += 1;
            match server.connection.get_buckets(self.si).await {
                Ok(buckets) => {
                    client.note_success(server.id());
                    for (&sharenum, _) in &buckets {
                        *self.seen_shares.entry(sharenum).or_insert(0) += 1;
                        self.found.push(ShareSource {
                            server: server.clone(),
                            sharenum,
                        });
                    }
                }
                Err(err) => {
                    eprintln!("share query failed on server {}: {err}", hex::encode(server.id()));
                    client.note_failure(server.id());
                }
            }
        }
    }

    /// Queries one more server regardless of how many shares are known.
    async fn widen(&mut self, client: &Client) -> bool {
        if self.next_candidate >= self.candidates.len() {
            return false;
        }
        let target = self.seen_shares.len() + 1;
        let before = self.next_candidate;
        self.ensure(client, target).await;
        self.next_candidate > before
    }

    fn take_source(&mut self, exclude: &[ShareNum]) -> Option<ShareSource> {
        let position = self
            .found
            .iter()
            .position(|source| !exclude.contains(&source.sharenum))?;
        Some(self.found.remove(position))
    }
}

/// A share that passed admission: its chains verified against the UEB.
struct ActiveShare {
    source: ShareSource,
    offsets: ShareOffsets,
    block_tree: IncompleteHashTree,
    block_nodes: HashMap<usize, [u8; 32]>,
}

impl ActiveShare {
    fn chain_for(&self, leaf_count: usize, index: usize) -> Vec<(usize, [u8; 32])> {
        // Sibling chain assembled from the share's stored node table; bad
        // entries are caught by verification, not here.
        let padded = leaf_count.max(1).next_power_of_two();
        let mut pos = padded - 1 + index;
        let mut chain = Vec::new();
        while pos > 0 {
            let sibling = if pos % 2 == 1 { pos + 1 } else { pos - 1 };
            if let Some(hash) = self.block_nodes.get(&sibling) {
                chain.push((sibling, *hash));
            }
            pos = (pos - 1) / 2;
        }
        chain
    }
}

struct Downloader<'a> {
    client: &'a Client,
    cap: &'a ChkRead,
    si: StorageIndex,
    finder: ShareFinder,
    ueb: UriExtension,
    geo: SegmentGeometry,
    codec: ErasureCodec,
    share_tree: IncompleteHashTree,
    crypttext_tree: IncompleteHashTree,
    crypttext_nodes: Option<(ShareNum, HashMap<usize, [u8; 32]>)>,
    active: Vec<ActiveShare>,
}

/// Downloads the whole file named by `cap`.
pub async fn download(client: &Client, cap: &ChkRead) -> Result<Vec<u8>, DownloadError> {
    download_range(client, cap, 0, cap.size).await
}

/// Downloads `length` bytes at `offset`, fetching only the overlapping
/// segments.
pub async fn download_range(
    client: &Client,
    cap: &ChkRead,
    offset: u64,
    length: u64,
) -> Result<Vec<u8>, DownloadError> {
    let si = cap.storage_index();
    let end = offset.saturating_add(length).min(cap.size);
    if offset >= end {
        return Ok(Vec::new());
    }

    let mut finder = ShareFinder::new(client, si);
    finder.ensure(client, usize::from(cap.k)).await;

    let (ueb, geo) = fetch_ueb(client, cap, &mut finder).await?;
    let codec = ErasureCodec::new(ueb.k, ueb.n)
        .map_err(|err| DownloadError::Internal(err.to_string()))?;
    let mut share_tree = IncompleteHashTree::new(SHARE_HASH_TAG, usize::from(ueb.n));
    share_tree.set_root(ueb.share_root);
    let mut crypttext_tree =
        IncompleteHashTree::new(CRYPTTEXT_HASH_TAG, geo.num_segments as usize);
    crypttext_tree.set_root(ueb.crypttext_root);

    let mut downloader = Downloader {
        client,
        cap,
        si,
        finder,
        ueb,
        geo,
        codec,
        share_tree,
        crypttext_tree,
        crypttext_nodes: None,
        active: Vec::new(),
    };
    downloader.fill_active().await?;

    let mut plaintext = Vec::with_capacity((end - offset) as usize);
    for seg in downloader.geo.segment_range(offset, end - offset) {
        let segment = downloader.fetch_segment(seg).await?;
        let seg_start = seg * downloader.geo.segment_size;
        let from = offset.saturating_sub(seg_start) as usize;
        let to = (end - seg_start).min(segment.len() as u64) as usize;
        plaintext.extend_from_slice(&segment[from..to]);
    }
    println!(
        "GRID|mod=DOWNLOAD|evt=DONE|si={}|bytes={}",
        hex::encode(si),
        plaintext.len()
    );
    Ok(plaintext)
}

/// Reads and validates the UEB from any share that can produce it.
async fn fetch_ueb(
    client: &Client,
    cap: &ChkRead,
    finder: &mut ShareFinder,
) -> Result<(UriExtension, SegmentGeometry), DownloadError> {
    let mut tried = 0usize;
    loop {
        finder.ensure(client, usize::from(cap.k).max(tried + 1)).await;
        let Some(source) = finder.found.first().cloned() else {
            if finder.widen(client).await {
                continue;
            }
            return Err(DownloadError::Unrecoverable {
                needed: cap.k,
                usable: 0,
            });
        };
        tried += 1;
        match try_fetch_ueb(cap, &source).await {
            Ok(result) => {
                finder.found.retain(|s| {
                    s.sharenum != source.sharenum
                        || s.server.id() != source.server.id()
                });
                finder.found.insert(0, source);
                return Ok(result);
            }
            Err(reason) => {
                eprintln!(
                    "evicting share {} on server {}: {reason}",
                    source.sharenum,
                    hex::encode(source.server.id())
                );
                finder.found.retain(|s| {
                    s.sharenum != source.sharenum
                        || s.server.id() != source.server.id()
                });
            }
        }
    }
}

async fn try_fetch_ueb(
    cap: &ChkRead,
    source: &ShareSource,
) -> Result<(UriExtension, SegmentGeometry), String> {
    let si = cap.storage_index();
    let header = source
        .server
        .connection
        .bucket_read(si, source.sharenum, 0, MAX_HEADER_LEN as u64)
        .await
        .map_err(|err| err.to_string())?;
    let offsets = ShareOffsets::decode(&header).map_err(|err| err.to_string())?;
    let (ueb_off, ueb_len) = offsets.section_range(Section::UriExtension);
    let section = source
        .server
        .connection
        .bucket_read(si, source.sharenum, ueb_off, ueb_len)
        .await
        .map_err(|err| err.to_string())?;
    let ueb_bytes = decode_ueb_section(&section).map_err(|err| err.to_string())?;
    let ueb = UriExtension::decode(&ueb_bytes).map_err(|err| err.to_string())?;
    if ueb.ueb_hash() != cap.ueb_hash {
        return Err("ueb hash mismatch".to_string());
    }
    if ueb.k != cap.k || ueb.n != cap.n || ueb.size != cap.size {
        return Err("ueb disagrees with capability".to_string());
    }
    let geometry = SegmentGeometry::from_ueb(&ueb);
    Ok((ueb, geometry))
}

impl<'a> Downloader<'a> {
    /// Admits shares until `k` are active, fetching and verifying each
    /// share's hash chains on the way in.
    async fn fill_active(&mut self) -> Result<(), DownloadError> {
        while self.active.len() < usize::from(self.ueb.k) {
            let exclude: Vec<ShareNum> = self.active.iter().map(|s| s.source.sharenum).collect();
            self.finder
                .ensure(self.client, usize::from(self.ueb.k) + exclude.len())
                .await;
            let Some(source) = self.finder.take_source(&exclude) else {
                if self.finder.widen(self.client).await {
                    continue;
                }
                return Err(DownloadError::Unrecoverable {
                    needed: self.ueb.k,
                    usable: self.active.len(),
                });
            };
            match self.admit(&source).await {
                Ok(share) => self.active.push(share),
                Err(reason) => {
                    eprintln!(
                        "evicting share {} on server {}: {reason}",
                        source.sharenum,
                        hex::encode(source.server.id())
                    );
                }
            }
        }
        Ok(())
    }

    /// Verifies a candidate share's block tree root against the share tree.
    async fn admit(&mut self, source: &ShareSource) -> Result<ActiveShare, String> {
        let conn = &source.server.connection;
        let header = conn
            .bucket_read(self.si, source.sharenum, 0, MAX_HEADER_LEN as u64)
            .await
            .map_err(|err| err.to_string())?;
        let offsets = ShareOffsets::decode(&header).map_err(|err| err.to_string())?;

        let (chain_off, chain_len) = offsets.section_range(Section::ShareHashChain);
        let chain_bytes = conn
            .bucket_read(self.si, source.sharenum, chain_off, chain_len)
            .await
            .map_err(|err| err.to_string())?;
        let chain: Vec<(usize, [u8; 32])> = decode_hash_entries(&chain_bytes)
            .map_err(|err| err.to_string())?
            .into_iter()
            .map(|(i, h)| (i as usize, h))
            .collect();

        let (btree_off, btree_len) = offsets.section_range(Section::BlockHashTree);
        let btree_bytes = conn
            .bucket_read(self.si, source.sharenum, btree_off, btree_len)
            .await
            .map_err(|err| err.to_string())?;
        let block_nodes: HashMap<usize, [u8; 32]> = decode_hash_entries(&btree_bytes)
            .map_err(|err| err.to_string())?
            .into_iter()
            .map(|(i, h)| (i as usize, h))
            .collect();
        let block_root = *block_nodes.get(&0).ok_or("block tree missing root")?;

        // The share's block tree root must chain into the verified UEB.
        self.share_tree
            .add_leaf(usize::from(source.sharenum), block_root, &chain)
            .map_err(|err| err.to_string())?;

        let mut block_tree =
            IncompleteHashTree::new(BLOCK_HASH_TAG, self.geo.num_segments as usize);
        block_tree.set_root(block_root);

        // Lazily pull the crypttext tree from the first admitted share,
        // remembering who supplied it in case it turns out bad.
        if self.crypttext_nodes.is_none() {
            let (ct_off, ct_len) = offsets.section_range(Section::CrypttextHashTree);
            let ct_bytes = conn
                .bucket_read(self.si, source.sharenum, ct_off, ct_len)
                .await
                .map_err(|err| err.to_string())?;
            let nodes: HashMap<usize, [u8; 32]> = decode_hash_entries(&ct_bytes)
                .map_err(|err| err.to_string())?
                .into_iter()
                .map(|(i, h)| (i as usize, h))
                .collect();
            self.crypttext_nodes = Some((source.sharenum, nodes));
        }

        Ok(ActiveShare {
            source: source.clone(),
            offsets,
            block_tree,
            block_nodes,
        })
    }

    /// Fetches, verifies, decodes, and decrypts one segment.
    async fn fetch_segment(&mut self, seg: u64) -> Result<Vec<u8>, DownloadError> {
        let seg_len = self.geo.segment_len(seg) as usize;
        let block_len = self.geo.block_len(seg);
        loop {
            // Blocks for the segment are fetched from all active shares
            // concurrently; one segment's blocks bound the in-flight memory.
            let fetches = self.active.iter().map(|share| {
                let conn = share.source.server.connection.clone();
                let si = self.si;
                let sharenum = share.source.sharenum;
                let offset =
                    share.offsets.data_offset + self.geo.block_offset(seg);
                async move { (sharenum, conn.bucket_read(si, sharenum, offset, block_len).await) }
            });
            let results = join_all(fetches).await;

            let mut failed: Vec<ShareNum> = Vec::new();
            let mut blocks: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
            for (sharenum, result) in results {
                match result {
                    Ok(bytes) if bytes.len() as u64 == block_len => {
                        blocks.insert(sharenum, bytes);
                    }
                    Ok(_) => failed.push(sharenum),
                    Err(err) => {
                        eprintln!("block read failed for share {sharenum}: {err}");
                        failed.push(sharenum);
                    }
                }
            }

            // Verify each block against its share's block tree.
            for share in &mut self.active {
                let sharenum = share.source.sharenum;
                let Some(block) = blocks.get(&sharenum) else { continue };
                let leaf = tagged_hash(BLOCK_HASH_TAG, &[block]);
                let chain = share.chain_for(self.geo.num_segments as usize, seg as usize);
                if share
                    .block_tree
                    .add_leaf(seg as usize, leaf, &chain)
                    .is_err()
                {
                    blocks.remove(&sharenum);
                    failed.push(sharenum);
                }
            }

            if failed.is_empty() && blocks.len() >= usize::from(self.ueb.k) {
                let segment = self
                    .codec
                    .decode(&blocks, seg_len)
                    .map_err(|err| DownloadError::Internal(err.to_string()))?;

                // The decoded ciphertext must chain into the UEB as well.
                let leaf = tagged_hash(CRYPTTEXT_HASH_TAG, &[&segment]);
                let chain = self.crypttext_chain(seg as usize);
                if self
                    .crypttext_tree
                    .add_leaf(seg as usize, leaf, &chain)
                    .is_err()
                {
                    // The cached crypttext table was bad; drop it along with
                    // the share that supplied it, then retry the segment.
                    let provider = self.crypttext_nodes.take().map(|(num, _)| num);
                    if let Some(position) = provider.and_then(|num| {
                        self.active.iter().position(|s| s.source.sharenum == num)
                    }) {
                        let victim = self.active.remove(position);
                        self.evict(victim, "crypttext chain mismatch");
                    }
                    self.refresh_crypttext_nodes().await?;
                    self.fill_active().await?;
                    continue;
                }

                let readkey = self.cap.readkey;
                let offset = seg * self.geo.segment_size;
                let segment = tokio::task::spawn_blocking(move || {
                    let mut segment = segment;
                    ctr_transform(&readkey, offset, &mut segment);
                    segment
                })
                .await
                .map_err(|err| DownloadError::Internal(err.to_string()))?;
                return Ok(segment);
            }

            // Evict every share that failed this round and refill.
            for sharenum in failed {
                if let Some(position) = self
                    .active
                    .iter()
                    .position(|s| s.source.sharenum == sharenum)
                {
                    let victim = self.active.remove(position);
                    self.evict(victim, "integrity failure");
                }
            }
            self.fill_active().await?;
        }
    }

    /// Refetches the crypttext node table from any remaining active share.
    async fn refresh_crypttext_nodes(&mut self) -> Result<(), DownloadError> {
        for share in &self.active {
            let (ct_off, ct_len) = share.offsets.section_range(Section::CrypttextHashTree);
            let fetched = share
                .source
                .server
                .connection
                .bucket_read(self.si, share.source.sharenum, ct_off, ct_len)
                .await;
            if let Ok(bytes) = fetched {
                if let Ok(entries) = decode_hash_entries(&bytes) {
                    let nodes = entries.into_iter().map(|(i, h)| (i as usize, h)).collect();
                    self.crypttext_nodes = Some((share.source.sharenum, nodes));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn crypttext_chain(&self, seg: usize) -> Vec<(usize, [u8; 32])> {
        let Some((_, nodes)) = &self.crypttext_nodes else {
            return Vec::new();
        };
        let padded = (self.geo.num_segments as usize).max(1).next_power_of_two();
        let mut pos = padded - 1 + seg;
        let mut chain = Vec::new();
        while pos > 0 {
            let sibling = if pos % 2 == 1 { pos + 1 } else { pos - 1 };
            if let Some(hash) = nodes.get(&sibling) {
                chain.push((sibling, *hash));
            }
            pos = (pos - 1) / 2;
        }
        chain
    }

    fn evict(&self, victim: ActiveShare, reason: &str) {
        eprintln!(
            "evicting share {} on server {}: {reason}",
            victim.source.sharenum,
            hex::encode(victim.source.server.id())
        );
    }
}
