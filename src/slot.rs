//! Mutable slot containers and the SDMF share format.
//!
//! A server holds one container per `(storage-index, share-number)`. The
//! container header carries the write enabler that gates updates; the data
//! area is the version block signed by the file's keypair. Readers trust
//! nothing in the data area until the signature and hash chains check out.

use crate::crypto::VerifyKey;
use crate::hashtree::IntegrityError;
use crate::layout::{decode_hash_entries, encode_hash_entries, LayoutError};
use thiserror::Error;

/// Magic prefix of every mutable slot container.
pub const MUTABLE_MAGIC: &[u8; 27] = b"Tahoe mutable container v1\n";

/// Byte offset of the data area within a container.
pub const DATA_AREA_OFFSET: u64 = 27 + 20 + 32 + 8;

/// Offset of the sequence number within the data area; publish test vectors
/// point here.
pub const SEQNUM_OFFSET: u64 = 1;

/// Offset of the root hash within the data area.
pub const ROOT_HASH_OFFSET: u64 = 9;

/// Length of the fixed SDMF header including the offsets table.
pub const SDMF_HEADER_LEN: usize = 99;

const SIGNED_PREFIX_LEN: usize = 75;
const SDMF_VERSION: u8 = 0;

/// Errors specific to slot containers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    /// Structural problem in the container or data area.
    #[error(transparent)]
    Layout(#[from] LayoutError),
    /// The embedded signature or a hash disagreed.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// A whole mutable container as persisted by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableContainer {
    /// Identifier of the server this write enabler was derived for.
    pub write_enabler_nodeid: [u8; 20],
    /// Secret gating writes to this slot on this server.
    pub write_enabler: [u8; 32],
    /// The data area (a serialized version block).
    pub data: Vec<u8>,
}

impl MutableContainer {
    /// Serializes the container.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_AREA_OFFSET as usize + self.data.len());
        out.extend_from_slice(MUTABLE_MAGIC);
        out.extend_from_slice(&self.write_enabler_nodeid);
        out.extend_from_slice(&self.write_enabler);
        out.extend_from_slice(&(self.data.len() as u64).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parses a container, checking magic and length consistency.
    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        if bytes.len() < DATA_AREA_OFFSET as usize {
            return Err(LayoutError::Truncated("mutable container"));
        }
        if &bytes[..27] != MUTABLE_MAGIC {
            return Err(LayoutError::BadMagic);
        }
        let mut write_enabler_nodeid = [0u8; 20];
        write_enabler_nodeid.copy_from_slice(&bytes[27..47]);
        let mut write_enabler = [0u8; 32];
        write_enabler.copy_from_slice(&bytes[47..79]);
        let declared = u64::from_be_bytes(bytes[79..87].try_into().expect("8 bytes"));
        let data = bytes[87..].to_vec();
        if declared != data.len() as u64 {
            return Err(LayoutError::Field {
                field: "data_length",
                reason: format!("declared {declared}, container holds {}", data.len()),
            });
        }
        Ok(Self {
            write_enabler_nodeid,
            write_enabler,
            data,
        })
    }
}

/// The fixed header fields of an SDMF version block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdmfHeader {
    /// Monotonically increasing version counter.
    pub seqnum: u64,
    /// Root of the share hash tree for this version.
    pub root_hash: [u8; 32],
    /// Initialization vector folded into the data-key derivation.
    pub iv: [u8; 16],
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Total shares produced.
    pub n: u8,
    /// Segment size; SDMF files are a single segment.
    pub segment_size: u64,
    /// Crypttext length in bytes.
    pub data_length: u64,
}

/// A complete SDMF share: header, keys, proofs, and this share's block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdmfShare {
    /// Fixed header fields, covered by the signature.
    pub header: SdmfHeader,
    /// Serialized public key of the file's keypair.
    pub pubkey: Vec<u8>,
    /// Signature over the header by the file's keypair.
    pub signature: Vec<u8>,
    /// Chain linking this share's block tree root into `root_hash`.
    pub share_hash_chain: Vec<(u32, [u8; 32])>,
    /// This share's block hash tree, all nodes.
    pub block_hash_tree: Vec<(u32, [u8; 32])>,
    /// This share's erasure-coded block of the crypttext.
    pub share_data: Vec<u8>,
    /// The signing key, AES-CTR encrypted under a writekey derivative.
    pub enc_privkey: Vec<u8>,
}

impl SdmfHeader {
    /// The bytes the file signature covers.
    pub fn signed_prefix(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SIGNED_PREFIX_LEN);
        out.push(SDMF_VERSION);
        out.extend_from_slice(&self.seqnum.to_be_bytes());
        out.extend_from_slice(&self.root_hash);
        out.extend_from_slice(&self.iv);
        out.push(self.k);
        out.push(self.n);
        out.extend_from_slice(&self.segment_size.to_be_bytes());
        out.extend_from_slice(&self.data_length.to_be_bytes());
        out
    }

    /// Parses the fixed header from the front of a data area.
    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        if bytes.len() < SIGNED_PREFIX_LEN {
            return Err(LayoutError::Truncated("sdmf header"));
        }
        match bytes[0] {
            SDMF_VERSION => {}
            other => return Err(LayoutError::UnsupportedMutableVersion(other)),
        }
        let mut root_hash = [0u8; 32];
        root_hash.copy_from_slice(&bytes[9..41]);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&bytes[41..57]);
        Ok(Self {
            seqnum: u64::from_be_bytes(bytes[1..9].try_into().expect("8 bytes")),
            root_hash,
            iv,
            k: bytes[57],
            n: bytes[58],
            segment_size: u64::from_be_bytes(bytes[59..67].try_into().expect("8 bytes")),
            data_length: u64::from_be_bytes(bytes[67..75].try_into().expect("8 bytes")),
        })
    }
}

impl SdmfShare {
    /// Serializes the share as a data area.
    pub fn encode(&self) -> Vec<u8> {
        let chain = encode_hash_entries(&self.share_hash_chain);
        let btree = encode_hash_entries(&self.block_hash_tree);
        let sig_off = SDMF_HEADER_LEN + self.pubkey.len();
        let chain_off = sig_off + self.signature.len();
        let btree_off = chain_off + chain.len();
        let data_off = btree_off + btree.len();
        let priv_off = data_off + self.share_data.len();
        let eof = priv_off + self.enc_privkey.len();

        let mut out = Vec::with_capacity(eof);
        out.extend_from_slice(&self.header.signed_prefix());
        for offset in [sig_off, chain_off, btree_off, data_off, priv_off, eof] {
            out.extend_from_slice(&(offset as u32).to_be_bytes());
        }
        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&chain);
        out.extend_from_slice(&btree);
        out.extend_from_slice(&self.share_data);
        out.extend_from_slice(&self.enc_privkey);
        out
    }

    /// Parses a data area back into a share.
    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let header = SdmfHeader::decode(bytes)?;
        if bytes.len() < SDMF_HEADER_LEN {
            return Err(LayoutError::Truncated("sdmf offsets"));
        }
        let mut offsets = [0usize; 6];
        for (i, slot) in offsets.iter_mut().enumerate() {
            let start = SIGNED_PREFIX_LEN + i * 4;
            *slot = u32::from_be_bytes(bytes[start..start + 4].try_into().expect("4 bytes")) as usize;
        }
        let [sig_off, chain_off, btree_off, data_off, priv_off, eof] = offsets;
        let ordered = [SDMF_HEADER_LEN, sig_off, chain_off, btree_off, data_off, priv_off, eof];
        if ordered.windows(2).any(|pair| pair[0] > pair[1]) || eof != bytes.len() {
            return Err(LayoutError::Field {
                field: "offsets",
                reason: "sections out of order or wrong length".to_string(),
            });
        }
        Ok(Self {
            header,
            pubkey: bytes[SDMF_HEADER_LEN..sig_off].to_vec(),
            signature: bytes[sig_off..chain_off].to_vec(),
            share_hash_chain: decode_hash_entries(&bytes[chain_off..btree_off])?,
            block_hash_tree: decode_hash_entries(&bytes[btree_off..data_off])?,
            share_data: bytes[data_off..priv_off].to_vec(),
            enc_privkey: bytes[priv_off..eof].to_vec(),
        })
    }

    /// Checks the embedded signature and that the embedded public key is the
    /// one named by `expected_fingerprint`.
    pub fn verify(&self, expected_fingerprint: &[u8; 32]) -> Result<(), SlotError> {
        let key = VerifyKey::from_bytes(&self.pubkey)
            .map_err(|err| IntegrityError::BadSignature(err.to_string()))?;
        if &key.fingerprint() != expected_fingerprint {
            return Err(IntegrityError::HashMismatch {
                context: "pubkey fingerprint".to_string(),
            }
            .into());
        }
        key.verify(&self.header.signed_prefix(), &self.signature)
            .map_err(|err| IntegrityError::BadSignature(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigningKeypair;

    fn sample_share(keypair: &SigningKeypair, seqnum: u64) -> SdmfShare {
        let header = SdmfHeader {
            seqnum,
            root_hash: [0x42; 32],
            iv: [0x17; 16],
            k: 3,
            n: 10,
            segment_size: 26,
            data_length: 26,
        };
        let signature = keypair.sign(&header.signed_prefix());
        SdmfShare {
            header,
            pubkey: keypair.verify_key().to_bytes(),
            signature,
            share_hash_chain: vec![(2, [1u8; 32]), (5, [2u8; 32])],
            block_hash_tree: vec![(0, [3u8; 32])],
            share_data: b"block bytes".to_vec(),
            enc_privkey: vec![9u8; 40],
        }
    }

    #[test]
    fn container_roundtrip() {
        let container = MutableContainer {
            write_enabler_nodeid: [1u8; 20],
            write_enabler: [2u8; 32],
            data: b"data area".to_vec(),
        };
        let decoded = MutableContainer::decode(&container.encode()).unwrap();
        assert_eq!(decoded, container);
    }

    #[test]
    fn container_rejects_bad_magic_and_length() {
        let container = MutableContainer {
            write_enabler_nodeid: [1u8; 20],
            write_enabler: [2u8; 32],
            data: vec![0u8; 8],
        };
        let mut bytes = container.encode();
        bytes[0] ^= 1;
        assert_eq!(MutableContainer::decode(&bytes), Err(LayoutError::BadMagic));

        let mut short = container.encode();
        short.pop();
        assert!(MutableContainer::decode(&short).is_err());
    }

    #[test]
    fn share_roundtrip_and_header_view() {
        let keypair = SigningKeypair::generate();
        let share = sample_share(&keypair, 7);
        let encoded = share.encode();
        assert_eq!(SdmfShare::decode(&encoded).unwrap(), share);
        // Header-only parse agrees with the full parse.
        let header = SdmfHeader::decode(&encoded).unwrap();
        assert_eq!(header, share.header);
        assert_eq!(header.seqnum, 7);
    }

    #[test]
    fn signature_covers_the_header() {
        let keypair = SigningKeypair::generate();
        let fingerprint = keypair.verify_key().fingerprint();
        let share = sample_share(&keypair, 3);
        share.verify(&fingerprint).unwrap();

        let mut tampered = share.clone();
        tampered.header.seqnum = 4;
        assert!(tampered.verify(&fingerprint).is_err());

        // A different keypair with a matching signature still fails because
        // the fingerprint pins the expected key.
        let other = SigningKeypair::generate();
        let mut resigned = share.clone();
        resigned.pubkey = other.verify_key().to_bytes();
        resigned.signature = other.sign(&resigned.header.signed_prefix());
        assert!(resigned.verify(&fingerprint).is_err());
    }

    #[test]
    fn mdmf_version_byte_is_rejected_for_now() {
        let keypair = SigningKeypair::generate();
        let mut bytes = sample_share(&keypair, 1).encode();
        bytes[0] = 1;
        assert_eq!(
            SdmfHeader::decode(&bytes),
            Err(LayoutError::UnsupportedMutableVersion(1))
        );
    }

    #[test]
    fn seqnum_offset_points_at_the_sequence_number() {
        let keypair = SigningKeypair::generate();
        let share = sample_share(&keypair, 0x0102030405060708);
        let bytes = share.encode();
        let start = SEQNUM_OFFSET as usize;
        assert_eq!(&bytes[start..start + 8], &share.header.seqnum.to_be_bytes());
    }
}
