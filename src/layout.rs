//! Bit-exact codec for the immutable share container and the URI extension
//! block.
//!
//! A share is a header, an offsets table, the ciphertext blocks, four hash
//! sections, and the URI extension block, in that order. All integers are
//! big-endian. Version 1 headers use 32-bit sizes; version 2 switches every
//! size and offset to 64 bits and is chosen automatically when a share would
//! overflow 32 bits.

use crate::crypto::{tagged_hash, UEB_TAG};
use std::fmt::Write as _;
use thiserror::Error;

/// Largest encoded header across versions; readers fetch this many bytes
/// before parsing.
pub const MAX_HEADER_LEN: usize = 65;

const V1_HEADER_LEN: usize = 1 + 3 * 4 + 5 * 4;
const V2_HEADER_LEN: usize = 1 + 3 * 8 + 5 * 8;

/// Errors produced while encoding or decoding share containers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// Input ended before the structure was complete.
    #[error("truncated {0}")]
    Truncated(&'static str),
    /// The container version byte was not a known version.
    #[error("unsupported container version {0}")]
    BadVersion(u8),
    /// A structural field was inconsistent with the container.
    #[error("bad field {field}: {reason}")]
    Field {
        /// Field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
    /// The mutable container magic was wrong.
    #[error("bad mutable container magic")]
    BadMagic,
    /// The mutable data area used a version this build does not handle.
    #[error("unsupported mutable share version {0}")]
    UnsupportedMutableVersion(u8),
}

/// The sections of an immutable share, in container order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    /// Ciphertext blocks.
    Data,
    /// Plaintext segment hash tree.
    PlaintextHashTree,
    /// Crypttext segment hash tree.
    CrypttextHashTree,
    /// This share's block hash tree.
    BlockHashTree,
    /// Chain linking this share's block tree root into the share tree.
    ShareHashChain,
    /// The URI extension block.
    UriExtension,
}

/// Parsed (or planned) header and offsets table of an immutable share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareOffsets {
    /// Container version, 1 or 2.
    pub version: u8,
    /// Total container length in bytes.
    pub own_size: u64,
    /// Length of the ciphertext block section.
    pub data_size: u64,
    /// Offset of the first ciphertext byte; equals the header length.
    pub data_offset: u64,
    /// Offset of the plaintext hash tree section.
    pub plaintext_hash_tree: u64,
    /// Offset of the crypttext hash tree section.
    pub crypttext_hash_tree: u64,
    /// Offset of the block hash tree section.
    pub block_hash_tree: u64,
    /// Offset of the share hash chain section.
    pub share_hash_chain: u64,
    /// Offset of the URI extension section.
    pub uri_extension: u64,
}

impl ShareOffsets {
    /// Lays out a share from its section lengths, choosing the smallest
    /// header version that fits.
    pub fn plan(
        data_size: u64,
        plaintext_tree_len: u64,
        crypttext_tree_len: u64,
        block_tree_len: u64,
        share_chain_len: u64,
        ueb_section_len: u64,
    ) -> Self {
        let body = data_size
            + plaintext_tree_len
            + crypttext_tree_len
            + block_tree_len
            + share_chain_len
            + ueb_section_len;
        let version = if V1_HEADER_LEN as u64 + body <= u64::from(u32::MAX) {
            1
        } else {
            2
        };
        let header_len = if version == 1 {
            V1_HEADER_LEN as u64
        } else {
            V2_HEADER_LEN as u64
        };
        let data_offset = header_len;
        let plaintext_hash_tree = data_offset + data_size;
        let crypttext_hash_tree = plaintext_hash_tree + plaintext_tree_len;
        let block_hash_tree = crypttext_hash_tree + crypttext_tree_len;
        let share_hash_chain = block_hash_tree + block_tree_len;
        let uri_extension = share_hash_chain + share_chain_len;
        let own_size = uri_extension + ueb_section_len;
        Self {
            version,
            own_size,
            data_size,
            data_offset,
            plaintext_hash_tree,
            crypttext_hash_tree,
            block_hash_tree,
            share_hash_chain,
            uri_extension,
        }
    }

    /// Encoded header length for this version.
    pub fn header_len(&self) -> usize {
        if self.version == 1 {
            V1_HEADER_LEN
        } else {
            V2_HEADER_LEN
        }
    }

    /// Serializes the header and offsets table.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len());
        out.push(self.version);
        let fields = [
            self.own_size,
            self.data_size,
            self.data_offset,
            self.plaintext_hash_tree,
            self.crypttext_hash_tree,
            self.block_hash_tree,
            self.share_hash_chain,
            self.uri_extension,
        ];
        for value in fields {
            if self.version == 1 {
                out.extend_from_slice(&(value as u32).to_be_bytes());
            } else {
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
        out
    }

    /// Parses a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let version = *bytes.first().ok_or(LayoutError::Truncated("share header"))?;
        let width = match version {
            1 => 4,
            2 => 8,
            other => return Err(LayoutError::BadVersion(other)),
        };
        let needed = 1 + 8 * width;
        if bytes.len() < needed {
            return Err(LayoutError::Truncated("share header"));
        }
        let mut fields = [0u64; 8];
        for (i, field) in fields.iter_mut().enumerate() {
            let start = 1 + i * width;
            *field = read_be(&bytes[start..start + width]);
        }
        let offsets = Self {
            version,
            own_size: fields[0],
            data_size: fields[1],
            data_offset: fields[2],
            plaintext_hash_tree: fields[3],
            crypttext_hash_tree: fields[4],
            block_hash_tree: fields[5],
            share_hash_chain: fields[6],
            uri_extension: fields[7],
        };
        offsets.check()?;
        Ok(offsets)
    }

    fn check(&self) -> Result<(), LayoutError> {
        let ordered = [
            self.data_offset,
            self.plaintext_hash_tree,
            self.crypttext_hash_tree,
            self.block_hash_tree,
            self.share_hash_chain,
            self.uri_extension,
            self.own_size,
        ];
        if ordered.windows(2).any(|pair| pair[0] > pair[1]) {
            return Err(LayoutError::Field {
                field: "offsets",
                reason: "sections out of order".to_string(),
            });
        }
        if self.data_offset != self.header_len() as u64 {
            return Err(LayoutError::Field {
                field: "data_offset",
                reason: format!("expected {}, got {}", self.header_len(), self.data_offset),
            });
        }
        if self.plaintext_hash_tree - self.data_offset != self.data_size {
            return Err(LayoutError::Field {
                field: "data_size",
                reason: "does not match section bounds".to_string(),
            });
        }
        Ok(())
    }

    /// The `(offset, length)` of a section within the container.
    pub fn section_range(&self, section: Section) -> (u64, u64) {
        match section {
            Section::Data => (self.data_offset, self.data_size),
            Section::PlaintextHashTree => (
                self.plaintext_hash_tree,
                self.crypttext_hash_tree - self.plaintext_hash_tree,
            ),
            Section::CrypttextHashTree => (
                self.crypttext_hash_tree,
                self.block_hash_tree - self.crypttext_hash_tree,
            ),
            Section::BlockHashTree => (
                self.block_hash_tree,
                self.share_hash_chain - self.block_hash_tree,
            ),
            Section::ShareHashChain => (
                self.share_hash_chain,
                self.uri_extension - self.share_hash_chain,
            ),
            Section::UriExtension => (self.uri_extension, self.own_size - self.uri_extension),
        }
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for &byte in bytes {
        value = (value << 8) | u64::from(byte);
    }
    value
}

/// Encoded length of a hash entry section holding `count` entries.
pub fn hash_entries_len(count: usize) -> u64 {
    4 + 36 * count as u64
}

/// Serializes `(node_index, digest)` pairs as a hash section.
pub fn encode_hash_entries(entries: &[(u32, [u8; 32])]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * 36);
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (index, hash) in entries {
        out.extend_from_slice(&index.to_be_bytes());
        out.extend_from_slice(hash);
    }
    out
}

/// Parses a hash section back into `(node_index, digest)` pairs.
pub fn decode_hash_entries(bytes: &[u8]) -> Result<Vec<(u32, [u8; 32])>, LayoutError> {
    if bytes.len() < 4 {
        return Err(LayoutError::Truncated("hash section"));
    }
    let count = u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
    let body = &bytes[4..];
    if body.len() != count * 36 {
        return Err(LayoutError::Field {
            field: "hash section",
            reason: format!("{count} entries but {} body bytes", body.len()),
        });
    }
    let mut entries = Vec::with_capacity(count);
    for chunk in body.chunks(36) {
        let index = u32::from_be_bytes(chunk[..4].try_into().expect("4 bytes"));
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&chunk[4..]);
        entries.push((index, hash));
    }
    Ok(entries)
}

/// Serializes the URI extension section (length-prefixed UEB bytes).
pub fn encode_ueb_section(ueb_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ueb_bytes.len());
    out.extend_from_slice(&(ueb_bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(ueb_bytes);
    out
}

/// Parses the URI extension section.
pub fn decode_ueb_section(bytes: &[u8]) -> Result<Vec<u8>, LayoutError> {
    if bytes.len() < 4 {
        return Err(LayoutError::Truncated("uri extension section"));
    }
    let len = u32::from_be_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
    let body = &bytes[4..];
    if body.len() != len {
        return Err(LayoutError::Field {
            field: "uri extension",
            reason: format!("declared {len} bytes, section holds {}", body.len()),
        });
    }
    Ok(body.to_vec())
}

/// The URI extension block: terminal metadata anchoring every hash tree of
/// an immutable file. Its double-SHA-256 is bound into the read capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriExtension {
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Total shares produced.
    pub n: u8,
    /// Full segment length in bytes.
    pub segment_size: u64,
    /// Length of the final segment.
    pub tail_segment_size: u64,
    /// Number of segments.
    pub num_segments: u64,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Root of the share hash tree.
    pub share_root: [u8; 32],
    /// Root of the crypttext segment hash tree.
    pub crypttext_root: [u8; 32],
    /// Root of the plaintext segment hash tree.
    pub plaintext_root: [u8; 32],
}

impl UriExtension {
    /// Serializes the block as deterministic newline-delimited records.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        let _ = writeln!(out, "k:{}", self.k);
        let _ = writeln!(out, "n:{}", self.n);
        let _ = writeln!(out, "segment_size:{}", self.segment_size);
        let _ = writeln!(out, "tail_segment_size:{}", self.tail_segment_size);
        let _ = writeln!(out, "num_segments:{}", self.num_segments);
        let _ = writeln!(out, "size:{}", self.size);
        let _ = writeln!(out, "share_root:{}", hex::encode(self.share_root));
        let _ = writeln!(out, "crypttext_root:{}", hex::encode(self.crypttext_root));
        let _ = writeln!(out, "plaintext_root:{}", hex::encode(self.plaintext_root));
        out.into_bytes()
    }

    /// Parses a block emitted by [`UriExtension::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, LayoutError> {
        let text = std::str::from_utf8(bytes).map_err(|_| LayoutError::Field {
            field: "ueb",
            reason: "not ASCII".to_string(),
        })?;
        let mut lines = text.lines();
        let k = field_u64(&mut lines, "k")?;
        let n = field_u64(&mut lines, "n")?;
        if k == 0 || n == 0 || k > n || n > 255 {
            return Err(LayoutError::Field {
                field: "k",
                reason: format!("invalid parameters k={k} n={n}"),
            });
        }
        Ok(Self {
            k: k as u8,
            n: n as u8,
            segment_size: field_u64(&mut lines, "segment_size")?,
            tail_segment_size: field_u64(&mut lines, "tail_segment_size")?,
            num_segments: field_u64(&mut lines, "num_segments")?,
            size: field_u64(&mut lines, "size")?,
            share_root: field_hash(&mut lines, "share_root")?,
            crypttext_root: field_hash(&mut lines, "crypttext_root")?,
            plaintext_root: field_hash(&mut lines, "plaintext_root")?,
        })
    }

    /// The hash bound into CHK capabilities.
    pub fn ueb_hash(&self) -> [u8; 32] {
        tagged_hash(UEB_TAG, &[&self.encode()])
    }
}

fn field_tail<'a, I>(lines: &mut I, name: &'static str) -> Result<&'a str, LayoutError>
where
    I: Iterator<Item = &'a str>,
{
    let line = lines.next().ok_or(LayoutError::Truncated("ueb"))?;
    line.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(LayoutError::Field {
            field: name,
            reason: "missing record".to_string(),
        })
}

fn field_u64<'a, I>(lines: &mut I, name: &'static str) -> Result<u64, LayoutError>
where
    I: Iterator<Item = &'a str>,
{
    field_tail(lines, name)?
        .parse::<u64>()
        .map_err(|err| LayoutError::Field {
            field: name,
            reason: err.to_string(),
        })
}

fn field_hash<'a, I>(lines: &mut I, name: &'static str) -> Result<[u8; 32], LayoutError>
where
    I: Iterator<Item = &'a str>,
{
    let raw = field_tail(lines, name)?;
    let bytes = hex::decode(raw).map_err(|err| LayoutError::Field {
        field: name,
        reason: err.to_string(),
    })?;
    bytes.as_slice().try_into().map_err(|_| LayoutError::Field {
        field: name,
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

/// Segment and block geometry of an immutable file.
///
/// Derived from `(size, segment_size, k)`; every share stores one block per
/// segment, all full-segment blocks equally sized and the tail block
/// possibly shorter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentGeometry {
    /// Plaintext size in bytes.
    pub size: u64,
    /// Full segment length.
    pub segment_size: u64,
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Number of segments.
    pub num_segments: u64,
    /// Length of the final segment.
    pub tail_segment_size: u64,
}

impl SegmentGeometry {
    /// Computes the geometry for a file of `size` bytes; `size` must be
    /// positive (empty files are literals or empty mutable versions).
    pub fn new(size: u64, segment_size: u64, k: u8) -> Self {
        let num_segments = size.div_ceil(segment_size).max(1);
        let tail_segment_size = size - (num_segments - 1) * segment_size;
        Self {
            size,
            segment_size,
            k,
            num_segments,
            tail_segment_size,
        }
    }

    /// Rebuilds the geometry a UEB describes.
    pub fn from_ueb(ueb: &UriExtension) -> Self {
        Self {
            size: ueb.size,
            segment_size: ueb.segment_size,
            k: ueb.k,
            num_segments: ueb.num_segments,
            tail_segment_size: ueb.tail_segment_size,
        }
    }

    /// Length of segment `index`.
    pub fn segment_len(&self, index: u64) -> u64 {
        if index + 1 == self.num_segments {
            self.tail_segment_size
        } else {
            self.segment_size
        }
    }

    /// Block length of a full (non-tail) segment.
    pub fn full_block_len(&self) -> u64 {
        self.segment_size.div_ceil(u64::from(self.k))
    }

    /// Block length for segment `index`.
    pub fn block_len(&self, index: u64) -> u64 {
        self.segment_len(index).div_ceil(u64::from(self.k))
    }

    /// Offset of segment `index`'s block within a share's data section.
    pub fn block_offset(&self, index: u64) -> u64 {
        index * self.full_block_len()
    }

    /// Total data-section length of one share.
    pub fn share_data_size(&self) -> u64 {
        (self.num_segments - 1) * self.full_block_len() + self.block_len(self.num_segments - 1)
    }

    /// Segments overlapping the byte range `[offset, offset + length)`.
    pub fn segment_range(&self, offset: u64, length: u64) -> std::ops::Range<u64> {
        if length == 0 || offset >= self.size {
            return 0..0;
        }
        let end = (offset + length).min(self.size);
        let first = offset / self.segment_size;
        let last = (end - 1) / self.segment_size;
        first..last + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ueb() -> UriExtension {
        UriExtension {
            k: 3,
            n: 10,
            segment_size: 131072,
            tail_segment_size: 4096,
            num_segments: 8,
            size: 921_600,
            share_root: [0xaa; 32],
            crypttext_root: [0xbb; 32],
            plaintext_root: [0xcc; 32],
        }
    }

    #[test]
    fn ueb_roundtrip_reproduces_all_fields() {
        let ueb = sample_ueb();
        let decoded = UriExtension::decode(&ueb.encode()).unwrap();
        assert_eq!(decoded, ueb);
        assert_eq!(decoded.ueb_hash(), ueb.ueb_hash());
    }

    #[test]
    fn ueb_hash_changes_with_contents() {
        let ueb = sample_ueb();
        let mut other = sample_ueb();
        other.size += 1;
        assert_ne!(ueb.ueb_hash(), other.ueb_hash());
    }

    #[test]
    fn ueb_rejects_shuffled_records() {
        let text = String::from_utf8(sample_ueb().encode()).unwrap();
        let mut lines: Vec<&str> = text.lines().collect();
        lines.swap(0, 1);
        let shuffled = lines.join("\n");
        assert!(UriExtension::decode(shuffled.as_bytes()).is_err());
    }

    #[test]
    fn header_roundtrip_v1() {
        let offsets = ShareOffsets::plan(1000, 40, 40, 76, 112, 300);
        assert_eq!(offsets.version, 1);
        let encoded = offsets.encode();
        assert_eq!(encoded.len(), offsets.header_len());
        let decoded = ShareOffsets::decode(&encoded).unwrap();
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn header_switches_to_v2_for_large_shares() {
        let offsets = ShareOffsets::plan(u64::from(u32::MAX), 40, 40, 76, 112, 300);
        assert_eq!(offsets.version, 2);
        let decoded = ShareOffsets::decode(&offsets.encode()).unwrap();
        assert_eq!(decoded, offsets);
        assert!(decoded.own_size > u64::from(u32::MAX));
    }

    #[test]
    fn header_rejects_bad_version_and_disorder() {
        assert!(matches!(
            ShareOffsets::decode(&[9u8; 65]),
            Err(LayoutError::BadVersion(9))
        ));
        let mut offsets = ShareOffsets::plan(100, 40, 40, 76, 112, 300);
        offsets.block_hash_tree = offsets.share_hash_chain + 1;
        assert!(ShareOffsets::decode(&offsets.encode()).is_err());
    }

    #[test]
    fn section_ranges_tile_the_container() {
        let offsets = ShareOffsets::plan(1000, 40, 44, 76, 112, 300);
        let sections = [
            Section::Data,
            Section::PlaintextHashTree,
            Section::CrypttextHashTree,
            Section::BlockHashTree,
            Section::ShareHashChain,
            Section::UriExtension,
        ];
        let mut cursor = offsets.data_offset;
        for section in sections {
            let (start, len) = offsets.section_range(section);
            assert_eq!(start, cursor);
            cursor = start + len;
        }
        assert_eq!(cursor, offsets.own_size);
    }

    #[test]
    fn hash_entries_roundtrip() {
        let entries = vec![(0u32, [1u8; 32]), (5, [2u8; 32]), (17, [3u8; 32])];
        let encoded = encode_hash_entries(&entries);
        assert_eq!(encoded.len() as u64, hash_entries_len(entries.len()));
        assert_eq!(decode_hash_entries(&encoded).unwrap(), entries);
        assert!(decode_hash_entries(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn ueb_section_roundtrip() {
        let ueb_bytes = sample_ueb().encode();
        let section = encode_ueb_section(&ueb_bytes);
        assert_eq!(decode_ueb_section(&section).unwrap(), ueb_bytes);
    }

    #[test]
    fn geometry_covers_tail_segments() {
        let geo = SegmentGeometry::new(300_000, 131_072, 3);
        assert_eq!(geo.num_segments, 3);
        assert_eq!(geo.tail_segment_size, 300_000 - 2 * 131_072);
        assert_eq!(geo.segment_len(0), 131_072);
        assert_eq!(geo.segment_len(2), geo.tail_segment_size);
        // Blocks tile the share data section.
        let total: u64 = (0..geo.num_segments).map(|i| geo.block_len(i)).sum();
        assert_eq!(total, geo.share_data_size());
        assert_eq!(geo.block_offset(1), geo.full_block_len());
    }

    #[test]
    fn geometry_exact_multiple_has_full_tail() {
        let geo = SegmentGeometry::new(262_144, 131_072, 3);
        assert_eq!(geo.num_segments, 2);
        assert_eq!(geo.tail_segment_size, 131_072);
    }

    #[test]
    fn segment_range_selects_overlap() {
        let geo = SegmentGeometry::new(400_000, 131_072, 3);
        assert_eq!(geo.segment_range(0, 400_000), 0..4);
        assert_eq!(geo.segment_range(0, 1), 0..1);
        assert_eq!(geo.segment_range(131_072, 1), 1..2);
        assert_eq!(geo.segment_range(131_071, 2), 0..2);
        assert_eq!(geo.segment_range(0, 0), 0..0);
        assert_eq!(geo.segment_range(500_000, 10), 0..0);
    }
}
