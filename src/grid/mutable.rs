//! Mutable slot publish, retrieve, and repair.
//!
//! A mutable file is its signing keypair. Each version carries a
//! monotonically increasing sequence number and a signature over
//! `(seqnum, root-hash, encoding parameters)`; writers race through the
//! servers' atomic test-and-set, and readers take the highest sequence
//! number for which `k` shares with a matching root verify.

use crate::cap::{readkey_from_writekey, MutableRead, MutableWrite};
use crate::crypto::{
    ctr_transform, random_bytes32, random_key16, tagged_hash, truncate16, CryptoError,
    SigningKeypair, BLOCK_HASH_TAG, MUTABLE_DATA_KEY_TAG, MUTABLE_PRIVKEY_KEY_TAG,
    SHARE_HASH_TAG, WRITE_ENABLER_TAG,
};
use crate::erasure::{CodingError, ErasureCodec};
use crate::grid::client::{Client, GridServer};
use crate::grid::select::servers_of_happiness;
use crate::grid::server::{SlotSecrets, SlotTestWrite, TestOp, TestVector};
use crate::hashtree::{verify_chain, HashTree};
use crate::slot::{SdmfHeader, SdmfShare, SEQNUM_OFFSET};
use crate::{ServerId, ShareNum, StorageIndex};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// A version observed during a scan, for diagnostics and repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSeen {
    /// Sequence number of the version.
    pub seqnum: u64,
    /// Root hash of the version's share tree.
    pub root_hash: [u8; 32],
    /// Distinct shares seen carrying it.
    pub shares: usize,
}

/// Errors surfaced by publish and repair.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Another writer won the race; retry or merge at the caller's option.
    #[error("uncoordinated write; winning seqnum {winning_seqnum}")]
    Uncoordinated {
        /// Highest sequence number observed on the slot.
        winning_seqnum: u64,
    },
    /// Too few servers acknowledged the write.
    #[error("publish reached happiness {happiness}, need {happy}")]
    NotEnoughServers {
        /// Achieved happiness.
        happiness: usize,
        /// Required happiness.
        happy: u8,
    },
    /// The signing key could not be recovered from any share.
    #[error("cannot recover signing key: {0}")]
    NoSigningKey(String),
    /// Key handling failed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Erasure coding failed.
    #[error(transparent)]
    Coding(#[from] CodingError),
    /// The existing shares are inconsistent with their own root hash.
    #[error("repair found shares inconsistent with root hash")]
    InconsistentShares,
}

/// Errors surfaced by retrieve.
#[derive(Debug, Error)]
pub enum RetrieveError {
    /// No version had `k` verified shares with one root hash.
    #[error("unrecoverable mutable file ({reason}); {} versions seen", versions.len())]
    Unrecoverable {
        /// Why nothing was recoverable.
        reason: String,
        /// Every `(seqnum, root)` pair observed, for repair tooling.
        versions: Vec<VersionSeen>,
    },
    /// Block reassembly failed after verification; indicates share damage
    /// below the hash chains, which should not happen.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Outcome of a repair pass.
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// Sequence number that was re-spread.
    pub seqnum: u64,
    /// Shares now confirmed present.
    pub present: usize,
    /// Shares this pass wrote.
    pub newly_written: usize,
}

/// Per-server write enabler for a mutable slot.
pub fn write_enabler(writekey: &[u8; 16], server_id: &ServerId) -> [u8; 32] {
    tagged_hash(WRITE_ENABLER_TAG, &[writekey, server_id])
}

fn privkey_key(writekey: &[u8; 16]) -> [u8; 16] {
    truncate16(tagged_hash(MUTABLE_PRIVKEY_KEY_TAG, &[writekey]))
}

fn data_key(readkey: &[u8; 16], iv: &[u8; 16]) -> [u8; 16] {
    truncate16(tagged_hash(MUTABLE_DATA_KEY_TAG, &[readkey, iv]))
}

fn secrets_for(client: &Client, writekey: &[u8; 16], si: &StorageIndex, server: &GridServer) -> SlotSecrets {
    SlotSecrets {
        write_enabler: write_enabler(writekey, &server.id()),
        renew_secret: client.renew_secret_for(si),
        cancel_secret: client.cancel_secret_for(si),
    }
}

/// One share as seen on one server during a scan.
struct SeenShare {
    server: GridServer,
    sharenum: ShareNum,
    share: SdmfShare,
}

/// Reads and signature-verifies every share reachable for `si`.
async fn scan(
    client: &Client,
    si: StorageIndex,
    fingerprint: &[u8; 32],
) -> (Vec<SeenShare>, Vec<GridServer>) {
    let candidates = client.candidate_servers(&si);
    let mut seen = Vec::new();
    for server in &candidates {
        match server
            .connection
            .slot_readv(si, None, vec![(0, u64::MAX)])
            .await
        {
            Ok(reads) => {
                client.note_success(server.id());
                for (sharenum, mut vectors) in reads {
                    let Some(bytes) = vectors.pop() else { continue };
                    let Ok(share) = SdmfShare::decode(&bytes) else {
                        eprintln!(
                            "discarding unparseable share {sharenum} from server {}",
                            hex::encode(server.id())
                        );
                        continue;
                    };
                    if share.verify(fingerprint).is_err() {
                        eprintln!(
                            "discarding share {sharenum} with bad signature from server {}",
                            hex::encode(server.id())
                        );
                        continue;
                    }
                    seen.push(SeenShare {
                        server: server.clone(),
                        sharenum,
                        share,
                    });
                }
            }
            Err(err) => {
                eprintln!("slot read failed on server {}: {err}", hex::encode(server.id()));
                client.note_failure(server.id());
            }
        }
    }
    (seen, candidates)
}

fn versions_of(seen: &[SeenShare]) -> Vec<VersionSeen> {
    let mut groups: BTreeMap<(u64, [u8; 32]), BTreeSet<ShareNum>> = BTreeMap::new();
    for entry in seen {
        groups
            .entry((entry.share.header.seqnum, entry.share.header.root_hash))
            .or_default()
            .insert(entry.sharenum);
    }
    groups
        .into_iter()
        .rev()
        .map(|((seqnum, root_hash), shares)| VersionSeen {
            seqnum,
            root_hash,
            shares: shares.len(),
        })
        .collect()
}

/// Checks one share's chain against its version's root hash.
fn chains_ok(share: &SdmfShare, sharenum: ShareNum) -> bool {
    let leaf = tagged_hash(BLOCK_HASH_TAG, &[&share.share_data]);
    let block_root = match share.block_hash_tree.iter().find(|(i, _)| *i == 0) {
        Some((_, root)) => *root,
        None => return false,
    };
    // SDMF shares carry a single block, so the block tree root is its leaf.
    if block_root != leaf {
        return false;
    }
    let chain: Vec<(usize, [u8; 32])> = share
        .share_hash_chain
        .iter()
        .map(|(i, h)| (*i as usize, *h))
        .collect();
    verify_chain(
        SHARE_HASH_TAG,
        usize::from(share.header.n),
        usize::from(sharenum),
        &block_root,
        &chain,
        &share.header.root_hash,
    )
    .is_ok()
}

/// Builds the full share set for one new version.
fn build_version(
    keypair: &SigningKeypair,
    writekey: &[u8; 16],
    readkey: &[u8; 16],
    k: u8,
    n: u8,
    seqnum: u64,
    contents: &[u8],
) -> Result<Vec<SdmfShare>, PublishError> {
    let codec = ErasureCodec::new(k, n)?;
    let iv: [u8; 16] = truncate16(random_bytes32());
    let mut crypttext = contents.to_vec();
    ctr_transform(&data_key(readkey, &iv), 0, &mut crypttext);

    let blocks = codec.encode(&crypttext)?;
    let leaves: Vec<[u8; 32]> = blocks
        .iter()
        .map(|block| tagged_hash(BLOCK_HASH_TAG, &[block]))
        .collect();
    let share_tree = HashTree::new(SHARE_HASH_TAG, &leaves);
    let header = SdmfHeader {
        seqnum,
        root_hash: share_tree.root(),
        iv,
        k,
        n,
        segment_size: crypttext.len() as u64,
        data_length: crypttext.len() as u64,
    };
    let signature = keypair.sign(&header.signed_prefix());
    let pubkey = keypair.verify_key().to_bytes();
    let mut enc_privkey = keypair.to_bytes();
    ctr_transform(&privkey_key(writekey), 0, &mut enc_privkey);

    let mut shares = Vec::with_capacity(usize::from(n));
    for (sharenum, block) in blocks.into_iter().enumerate() {
        let chain = share_tree
            .needed_hashes(sharenum)
            .map_err(|err| PublishError::NoSigningKey(err.to_string()))?
            .into_iter()
            .map(|(i, h)| (i as u32, h))
            .collect();
        shares.push(SdmfShare {
            header,
            pubkey: pubkey.clone(),
            signature: signature.clone(),
            share_hash_chain: chain,
            block_hash_tree: vec![(0, leaves[sharenum])],
            share_data: block,
            enc_privkey: enc_privkey.clone(),
        });
    }
    Ok(shares)
}

/// Creates a new mutable file holding `contents`; returns its write cap.
pub async fn create(client: &Client, contents: &[u8]) -> Result<MutableWrite, PublishError> {
    let keypair = SigningKeypair::generate();
    let writekey = random_key16();
    let writecap = MutableWrite {
        writekey,
        fingerprint: keypair.verify_key().fingerprint(),
    };
    publish_with_keypair(client, &writecap, &keypair, contents).await?;
    Ok(writecap)
}

/// Recovers the signing keypair from any share's in-band encrypted copy.
async fn recover_keypair(
    client: &Client,
    writecap: &MutableWrite,
) -> Result<SigningKeypair, PublishError> {
    let si = writecap.storage_index();
    let (seen, _) = scan(client, si, &writecap.fingerprint).await;
    for entry in &seen {
        let mut material = entry.share.enc_privkey.clone();
        ctr_transform(&privkey_key(&writecap.writekey), 0, &mut material);
        if let Ok(keypair) = SigningKeypair::from_bytes(&material) {
            if keypair.verify_key().fingerprint() == writecap.fingerprint {
                return Ok(keypair);
            }
        }
    }
    Err(PublishError::NoSigningKey(
        "no share yielded the signing key".to_string(),
    ))
}

/// Publishes `contents` as the next version of the file; returns the new
/// sequence number.
pub async fn publish(
    client: &Client,
    writecap: &MutableWrite,
    contents: &[u8],
) -> Result<u64, PublishError> {
    let keypair = recover_keypair(client, writecap).await?;
    publish_with_keypair(client, writecap, &keypair, contents).await
}

async fn publish_with_keypair(
    client: &Client,
    writecap: &MutableWrite,
    keypair: &SigningKeypair,
    contents: &[u8],
) -> Result<u64, PublishError> {
    let si = writecap.storage_index();
    let readkey = readkey_from_writekey(&writecap.writekey);
    let cfg = client.config().clone();

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let (seen, candidates) = scan(client, si, &writecap.fingerprint).await;
        // Encoding parameters are fixed at creation; later versions reuse
        // what the slot already carries.
        let (k, n) = seen
            .first()
            .map(|entry| (entry.share.header.k, entry.share.header.n))
            .unwrap_or((cfg.k, cfg.n));
        let max_seen = seen.iter().map(|s| s.share.header.seqnum).max().unwrap_or(0);
        let new_seq = max_seen + 1;
        let shares = build_version(
            keypair,
            &writecap.writekey,
            &readkey,
            k,
            n,
            new_seq,
            contents,
        )?;

        // Targets: keep a share where it already lives, spread the rest in
        // permuted order.
        let mut targets: BTreeMap<ShareNum, GridServer> = BTreeMap::new();
        for entry in &seen {
            targets.entry(entry.sharenum).or_insert(entry.server.clone());
        }
        let occupied: BTreeSet<ServerId> = targets.values().map(|s| s.id()).collect();
        let mut spare = candidates
            .iter()
            .filter(|s| !occupied.contains(&s.id()))
            .cloned();
        for sharenum in 0..n {
            if let std::collections::btree_map::Entry::Vacant(slot) = targets.entry(sharenum) {
                match spare.next() {
                    Some(server) => {
                        slot.insert(server);
                    }
                    None => break,
                }
            }
        }

        // The guard every write carries: nobody may have written this
        // sequence number (or later) already.
        let guard = TestVector {
            offset: SEQNUM_OFFSET,
            op: TestOp::Le,
            specimen: (new_seq - 1).to_be_bytes().to_vec(),
        };

        let mut placements: BTreeMap<ShareNum, BTreeSet<ServerId>> = BTreeMap::new();
        let mut winning = 0u64;
        for (sharenum, server) in &targets {
            let share_bytes = shares[usize::from(*sharenum)].encode();
            // Truncate to the new length; a shorter version must not leave
            // the previous version's tail behind.
            let new_length = Some(share_bytes.len() as u64);
            let mut tw = BTreeMap::new();
            tw.insert(
                *sharenum,
                SlotTestWrite {
                    tests: vec![guard.clone()],
                    writes: vec![(0, share_bytes)],
                    new_length,
                },
            );
            let secrets = secrets_for(client, &writecap.writekey, &si, server);
            match server
                .connection
                .slot_testv_and_readv_and_writev(si, secrets, tw, vec![(SEQNUM_OFFSET, 8)])
                .await
            {
                Ok((true, _)) => {
                    client.note_success(server.id());
                    placements
                        .entry(*sharenum)
                        .or_default()
                        .insert(server.id());
                }
                Ok((false, reads)) => {
                    // Read back the competitor's sequence number.
                    for vectors in reads.values() {
                        if let Some(bytes) = vectors.first() {
                            if let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) {
                                winning = winning.max(u64::from_be_bytes(raw));
                            }
                        }
                    }
                    eprintln!(
                        "write of share {sharenum} lost to seqnum {winning} on slot {}",
                        hex::encode(si)
                    );
                }
                Err(err) => {
                    eprintln!("slot write failed on server {}: {err}", hex::encode(server.id()));
                    client.note_failure(server.id());
                }
            }
        }

        if winning >= new_seq {
            if attempt >= cfg.publish_retries {
                return Err(PublishError::Uncoordinated {
                    winning_seqnum: winning,
                });
            }
            // Lost a race; take another lap with fresh state.
            continue;
        }

        let happiness = servers_of_happiness(&placements);
        if happiness < usize::from(cfg.happy) {
            return Err(PublishError::NotEnoughServers {
                happiness,
                happy: cfg.happy,
            });
        }
        println!(
            "GRID|mod=MUTABLE|evt=PUBLISHED|si={}|seq={new_seq}|happiness={happiness}",
            hex::encode(si)
        );
        return Ok(new_seq);
    }
}

/// Retrieves the best recoverable version: `(seqnum, plaintext)`.
pub async fn retrieve(
    client: &Client,
    readcap: &MutableRead,
) -> Result<(u64, Vec<u8>), RetrieveError> {
    let si = readcap.storage_index();
    let (seen, _) = scan(client, si, &readcap.fingerprint).await;
    let versions = versions_of(&seen);
    if seen.is_empty() {
        return Err(RetrieveError::Unrecoverable {
            reason: "no shares found".to_string(),
            versions,
        });
    }

    // Group verified shares by version, newest first.
    let mut groups: BTreeMap<(u64, [u8; 32]), BTreeMap<ShareNum, &SeenShare>> = BTreeMap::new();
    for entry in &seen {
        if chains_ok(&entry.share, entry.sharenum) {
            groups
                .entry((entry.share.header.seqnum, entry.share.header.root_hash))
                .or_default()
                .entry(entry.sharenum)
                .or_insert(entry);
        } else {
            eprintln!(
                "discarding share {} with broken hash chain from server {}",
                entry.sharenum,
                hex::encode(entry.server.id())
            );
        }
    }

    let top_seq = groups.keys().map(|(seq, _)| *seq).max();
    for ((seqnum, _root), members) in groups.iter().rev() {
        let Some(first) = members.values().next() else { continue };
        let header = first.share.header;
        if members.len() < usize::from(header.k) {
            continue;
        }
        let codec = ErasureCodec::new(header.k, header.n)
            .map_err(|err| RetrieveError::Decode(err.to_string()))?;
        let blocks: BTreeMap<ShareNum, Vec<u8>> = members
            .iter()
            .map(|(num, entry)| (*num, entry.share.share_data.clone()))
            .collect();
        let mut plaintext = codec
            .decode(&blocks, header.data_length as usize)
            .map_err(|err| RetrieveError::Decode(err.to_string()))?;
        ctr_transform(&data_key(&readcap.readkey, &header.iv), 0, &mut plaintext);
        println!(
            "GRID|mod=MUTABLE|evt=RETRIEVED|si={}|seq={seqnum}|shares={}",
            hex::encode(si),
            members.len()
        );
        return Ok((*seqnum, plaintext));
    }

    // Nothing recoverable; say why.
    let reason = match top_seq {
        Some(seq) if versions.iter().filter(|v| v.seqnum == seq).count() > 1 => {
            "uncoordinated write".to_string()
        }
        _ => "not enough shares".to_string(),
    };
    Err(RetrieveError::Unrecoverable { reason, versions })
}

/// Re-spreads the best recoverable version back to `n` distinct shares
/// without bumping the sequence number. Running it twice is a no-op the
/// second time.
pub async fn repair(client: &Client, writecap: &MutableWrite) -> Result<RepairReport, PublishError> {
    let si = writecap.storage_index();
    let readcap = writecap.readcap();
    let (seqnum, plaintext) = retrieve(client, &readcap)
        .await
        .map_err(|err| PublishError::NoSigningKey(err.to_string()))?;

    let (seen, candidates) = scan(client, si, &writecap.fingerprint).await;
    let Some(best) = seen.iter().find(|s| s.share.header.seqnum == seqnum) else {
        return Err(PublishError::InconsistentShares);
    };
    let header = best.share.header;
    let keypair = recover_keypair(client, writecap).await?;

    // Rebuild the full share set for the surviving version. Coding is
    // deterministic, so the recomputed root must match the signed one.
    let readkey = readkey_from_writekey(&writecap.writekey);
    let codec = ErasureCodec::new(header.k, header.n)?;
    let mut crypttext = plaintext;
    ctr_transform(&data_key(&readkey, &header.iv), 0, &mut crypttext);
    let blocks = codec.encode(&crypttext)?;
    let leaves: Vec<[u8; 32]> = blocks
        .iter()
        .map(|block| tagged_hash(BLOCK_HASH_TAG, &[block]))
        .collect();
    let share_tree = HashTree::new(SHARE_HASH_TAG, &leaves);
    if share_tree.root() != header.root_hash {
        return Err(PublishError::InconsistentShares);
    }
    let pubkey = keypair.verify_key().to_bytes();
    let mut enc_privkey = keypair.to_bytes();
    ctr_transform(&privkey_key(&writecap.writekey), 0, &mut enc_privkey);

    // Shares already carrying this version stay put.
    let mut present: BTreeMap<ShareNum, ServerId> = BTreeMap::new();
    for entry in &seen {
        if entry.share.header.seqnum == seqnum
            && entry.share.header.root_hash == header.root_hash
        {
            present.entry(entry.sharenum).or_insert(entry.server.id());
        }
    }

    let occupied: BTreeSet<ServerId> = present.values().copied().collect();
    let mut spare = candidates
        .iter()
        .filter(|s| !occupied.contains(&s.id()))
        .cloned();
    let mut newly_written = 0usize;
    for sharenum in 0..header.n {
        if present.contains_key(&sharenum) {
            continue;
        }
        let Some(server) = spare.next() else { break };
        let chain = share_tree
            .needed_hashes(usize::from(sharenum))
            .map_err(|_| PublishError::InconsistentShares)?
            .into_iter()
            .map(|(i, h)| (i as u32, h))
            .collect();
        let share = SdmfShare {
            header,
            pubkey: pubkey.clone(),
            signature: best.share.signature.clone(),
            share_hash_chain: chain,
            block_hash_tree: vec![(0, leaves[usize::from(sharenum)])],
            share_data: blocks[usize::from(sharenum)].clone(),
            enc_privkey: enc_privkey.clone(),
        };
        // Equal-seqnum replacement is allowed: the test admits anything at
        // or below this exact version.
        let mut specimen = seqnum.to_be_bytes().to_vec();
        specimen.extend_from_slice(&header.root_hash);
        let share_bytes = share.encode();
        let new_length = Some(share_bytes.len() as u64);
        let mut tw = BTreeMap::new();
        tw.insert(
            sharenum,
            SlotTestWrite {
                tests: vec![TestVector {
                    offset: SEQNUM_OFFSET,
                    op: TestOp::Le,
                    specimen,
                }],
                writes: vec![(0, share_bytes)],
                new_length,
            },
        );
        let secrets = secrets_for(client, &writecap.writekey, &si, &server);
        match server
            .connection
            .slot_testv_and_readv_and_writev(si, secrets, tw, vec![])
            .await
        {
            Ok((true, _)) => {
                present.insert(sharenum, server.id());
                newly_written += 1;
            }
            Ok((false, _)) => {}
            Err(err) => {
                eprintln!("slot write failed on server {}: {err}", hex::encode(server.id()));
                client.note_failure(server.id());
            }
        }
    }
    println!(
        "GRID|mod=MUTABLE|evt=REPAIRED|si={}|seq={seqnum}|present={}|new={newly_written}",
        hex::encode(si),
        present.len()
    );
    Ok(RepairReport {
        seqnum,
        present: present.len(),
        newly_written,
    })
}
