//! Capability URI codec and the derivation lattice.
//!
//! A capability is a self-authenticating string naming a file at a privilege
//! level. Emission and parsing round-trip byte for byte; the one-way
//! derivations `writekey -> readkey -> storage-index` are what make handing
//! out a weaker capability safe.

use crate::crypto::{
    sha256d, tagged_hash, truncate16, CHK_KEY_TAG, READKEY_TO_STORAGE_INDEX_TAG,
    SSK_STORAGE_INDEX_TAG, WRITEKEY_TO_READKEY_TAG,
};
use crate::StorageIndex;
use data_encoding::Encoding;
use once_cell::sync::Lazy;
use std::fmt;
use thiserror::Error;

/// Files at or below this size are inlined into a `LIT` capability.
///
/// At 55 bytes the base32 payload of a LIT URI is still shorter than the
/// fixed-size CHK form, so nothing is gained by contacting servers.
pub const LIT_SIZE_LIMIT: usize = 55;

/// RFC 4648 base32, lowercase alphabet, no padding.
pub static BASE32: Lazy<Encoding> = Lazy::new(|| {
    let mut spec = data_encoding::Specification::new();
    spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
    spec.encoding().expect("valid base32 alphabet")
});

/// Errors produced while parsing a capability string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CapabilityParseError {
    /// The string did not start with the `URI:` scheme marker.
    #[error("capability must start with URI:")]
    MissingScheme,
    /// The tag was not one of the known capability kinds.
    #[error("unknown capability tag: {0}")]
    UnknownTag(String),
    /// A required field was absent.
    #[error("missing field: {0}")]
    MissingField(&'static str),
    /// More fields were present than the tag allows.
    #[error("trailing fields after {0} capability")]
    TrailingFields(&'static str),
    /// A base32 field failed to decode.
    #[error("invalid base32 in {field}: {reason}")]
    Base32 {
        /// Field name.
        field: &'static str,
        /// Decoder message.
        reason: String,
    },
    /// A binary field had the wrong decoded length.
    #[error("{field} must be {expected} bytes, got {actual}")]
    BadLength {
        /// Field name.
        field: &'static str,
        /// Required decoded length.
        expected: usize,
        /// Observed decoded length.
        actual: usize,
    },
    /// A decimal field was empty, non-canonical, or out of range.
    #[error("invalid number in {0}")]
    InvalidNumber(&'static str),
    /// Erasure parameters violated `1 <= k <= n <= 255`.
    #[error("invalid encoding parameters k={k} n={n}")]
    BadParameters {
        /// Needed shares.
        k: u64,
        /// Total shares.
        n: u64,
    },
}

/// An immutable read capability (`URI:CHK:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkRead {
    /// AES key for the file's crypttext; also the root of the CHK lattice.
    pub readkey: [u8; 16],
    /// Double-SHA-256 of the URI extension block.
    pub ueb_hash: [u8; 32],
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Total shares produced.
    pub n: u8,
    /// Plaintext size in bytes.
    pub size: u64,
}

impl ChkRead {
    /// The 16-byte storage index servers file this cap's shares under.
    pub fn storage_index(&self) -> StorageIndex {
        storage_index_from_readkey(&self.readkey)
    }

    /// Attenuates to the verify capability.
    pub fn verifier(&self) -> ChkVerify {
        ChkVerify {
            storage_index: self.storage_index(),
            ueb_hash: self.ueb_hash,
            k: self.k,
            n: self.n,
            size: self.size,
        }
    }
}

/// An immutable verify capability (`URI:CHK-Verifier:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChkVerify {
    /// Storage index of the shares.
    pub storage_index: StorageIndex,
    /// Double-SHA-256 of the URI extension block.
    pub ueb_hash: [u8; 32],
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Total shares produced.
    pub n: u8,
    /// Plaintext size in bytes.
    pub size: u64,
}

/// A literal capability inlining the whole file (`URI:LIT:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LitCap {
    /// The file contents.
    pub data: Vec<u8>,
}

/// A mutable write capability (`URI:SSK:` / `URI:MDMF:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableWrite {
    /// Secret granting write access; everything else derives from it.
    pub writekey: [u8; 16],
    /// Fingerprint of the file's signing public key.
    pub fingerprint: [u8; 32],
}

impl MutableWrite {
    /// Attenuates to the read capability.
    pub fn readcap(&self) -> MutableRead {
        MutableRead {
            readkey: readkey_from_writekey(&self.writekey),
            fingerprint: self.fingerprint,
        }
    }

    /// The storage index, shared by every privilege level of this file.
    pub fn storage_index(&self) -> StorageIndex {
        storage_index_from_fingerprint(&self.fingerprint)
    }
}

/// A mutable read capability (`URI:SSK-RO:` / `URI:MDMF-RO:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableRead {
    /// Key decrypting the file's crypttext.
    pub readkey: [u8; 16],
    /// Fingerprint of the file's signing public key.
    pub fingerprint: [u8; 32],
}

impl MutableRead {
    /// The storage index, shared by every privilege level of this file.
    pub fn storage_index(&self) -> StorageIndex {
        storage_index_from_fingerprint(&self.fingerprint)
    }

    /// Attenuates to the verify capability.
    pub fn verifier(&self) -> MutableVerify {
        MutableVerify {
            storage_index: self.storage_index(),
            fingerprint: self.fingerprint,
        }
    }
}

/// A mutable verify capability (`URI:SSK-Verifier:` / `URI:MDMF-Verifier:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableVerify {
    /// Storage index of the slot.
    pub storage_index: StorageIndex,
    /// Fingerprint of the file's signing public key.
    pub fingerprint: [u8; 32],
}

/// A parsed capability of any kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Immutable read.
    Chk(ChkRead),
    /// Immutable verify.
    ChkVerify(ChkVerify),
    /// Literal file.
    Lit(LitCap),
    /// SDMF mutable write.
    SskWrite(MutableWrite),
    /// SDMF mutable read.
    SskRead(MutableRead),
    /// SDMF mutable verify.
    SskVerify(MutableVerify),
    /// MDMF mutable write.
    MdmfWrite(MutableWrite),
    /// MDMF mutable read.
    MdmfRead(MutableRead),
    /// MDMF mutable verify.
    MdmfVerify(MutableVerify),
    /// A directory whose serialized entries live in the wrapped file.
    Dir2(Box<Capability>),
    /// An opaque `ro.`-prefixed capability preserved for forward compatibility.
    Unknown(String),
}

impl Capability {
    /// Parses a capability string, rejecting malformed input.
    pub fn parse(input: &str) -> Result<Self, CapabilityParseError> {
        if input.starts_with("ro.") {
            return Ok(Self::Unknown(input.to_string()));
        }
        let body = input
            .strip_prefix("URI:")
            .ok_or(CapabilityParseError::MissingScheme)?;
        let mut fields = body.split(':');
        let tag = fields
            .next()
            .ok_or(CapabilityParseError::MissingField("tag"))?;
        if let Some(inner_tag) = tag.strip_prefix("DIR2") {
            let inner_tag = match inner_tag {
                "" => "SSK",
                "-RO" => "SSK-RO",
                "-Verifier" => "SSK-Verifier",
                "-MDMF" => "MDMF",
                "-MDMF-RO" => "MDMF-RO",
                "-MDMF-Verifier" => "MDMF-Verifier",
                "-CHK" => "CHK",
                "-LIT" => "LIT",
                _ => return Err(CapabilityParseError::UnknownTag(tag.to_string())),
            };
            let inner = parse_tagged(inner_tag, fields)?;
            return Ok(Self::Dir2(Box::new(inner)));
        }
        parse_tagged(tag, fields)
    }

    /// Attenuates to the verify capability, where one exists.
    pub fn verifier(&self) -> Option<Capability> {
        match self {
            Self::Chk(cap) => Some(Self::ChkVerify(cap.verifier())),
            Self::ChkVerify(cap) => Some(Self::ChkVerify(cap.clone())),
            Self::SskWrite(cap) => Some(Self::SskVerify(cap.readcap().verifier())),
            Self::SskRead(cap) => Some(Self::SskVerify(cap.verifier())),
            Self::SskVerify(cap) => Some(Self::SskVerify(cap.clone())),
            Self::MdmfWrite(cap) => Some(Self::MdmfVerify(cap.readcap().verifier())),
            Self::MdmfRead(cap) => Some(Self::MdmfVerify(cap.verifier())),
            Self::MdmfVerify(cap) => Some(Self::MdmfVerify(cap.clone())),
            Self::Dir2(inner) => inner.verifier().map(|v| Self::Dir2(Box::new(v))),
            Self::Lit(_) | Self::Unknown(_) => None,
        }
    }

    /// Attenuates a write capability to its read-only form; identity on
    /// capabilities that already lack write authority.
    pub fn readonly(&self) -> Capability {
        match self {
            Self::SskWrite(cap) => Self::SskRead(cap.readcap()),
            Self::MdmfWrite(cap) => Self::MdmfRead(cap.readcap()),
            Self::Dir2(inner) => Self::Dir2(Box::new(inner.readonly())),
            other => other.clone(),
        }
    }

    /// The storage index, for capabilities that reference stored shares.
    pub fn storage_index(&self) -> Option<StorageIndex> {
        match self {
            Self::Chk(cap) => Some(cap.storage_index()),
            Self::ChkVerify(cap) => Some(cap.storage_index),
            Self::SskWrite(cap) | Self::MdmfWrite(cap) => Some(cap.storage_index()),
            Self::SskRead(cap) | Self::MdmfRead(cap) => Some(cap.storage_index()),
            Self::SskVerify(cap) | Self::MdmfVerify(cap) => Some(cap.storage_index),
            Self::Dir2(inner) => inner.storage_index(),
            Self::Lit(_) | Self::Unknown(_) => None,
        }
    }
}

fn parse_tagged<'a, I>(tag: &str, mut fields: I) -> Result<Capability, CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    let cap = match tag {
        "CHK" => {
            let readkey = fixed16(&mut fields, "readkey")?;
            let ueb_hash = fixed32(&mut fields, "ueb_hash")?;
            let (k, n, size) = params(&mut fields)?;
            Capability::Chk(ChkRead {
                readkey,
                ueb_hash,
                k,
                n,
                size,
            })
        }
        "CHK-Verifier" => {
            let storage_index = fixed16(&mut fields, "storage_index")?;
            let ueb_hash = fixed32(&mut fields, "ueb_hash")?;
            let (k, n, size) = params(&mut fields)?;
            Capability::ChkVerify(ChkVerify {
                storage_index,
                ueb_hash,
                k,
                n,
                size,
            })
        }
        "LIT" => {
            let field = fields
                .next()
                .ok_or(CapabilityParseError::MissingField("data"))?;
            let data = b32_decode(field, "data")?;
            Capability::Lit(LitCap { data })
        }
        "SSK" => Capability::SskWrite(write_body(&mut fields)?),
        "SSK-RO" => Capability::SskRead(read_body(&mut fields)?),
        "SSK-Verifier" => Capability::SskVerify(verify_body(&mut fields)?),
        "MDMF" => Capability::MdmfWrite(write_body(&mut fields)?),
        "MDMF-RO" => Capability::MdmfRead(read_body(&mut fields)?),
        "MDMF-Verifier" => Capability::MdmfVerify(verify_body(&mut fields)?),
        other => return Err(CapabilityParseError::UnknownTag(other.to_string())),
    };
    if fields.next().is_some() {
        return Err(CapabilityParseError::TrailingFields(match cap {
            Capability::Chk(_) => "CHK",
            Capability::ChkVerify(_) => "CHK-Verifier",
            Capability::Lit(_) => "LIT",
            Capability::SskWrite(_) => "SSK",
            Capability::SskRead(_) => "SSK-RO",
            Capability::SskVerify(_) => "SSK-Verifier",
            Capability::MdmfWrite(_) => "MDMF",
            Capability::MdmfRead(_) => "MDMF-RO",
            Capability::MdmfVerify(_) => "MDMF-Verifier",
            _ => "capability",
        }));
    }
    Ok(cap)
}

fn write_body<'a, I>(fields: &mut I) -> Result<MutableWrite, CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    Ok(MutableWrite {
        writekey: fixed16(fields, "writekey")?,
        fingerprint: fixed32(fields, "fingerprint")?,
    })
}

fn read_body<'a, I>(fields: &mut I) -> Result<MutableRead, CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    Ok(MutableRead {
        readkey: fixed16(fields, "readkey")?,
        fingerprint: fixed32(fields, "fingerprint")?,
    })
}

fn verify_body<'a, I>(fields: &mut I) -> Result<MutableVerify, CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    Ok(MutableVerify {
        storage_index: fixed16(fields, "storage_index")?,
        fingerprint: fixed32(fields, "fingerprint")?,
    })
}

fn b32_decode(field: &str, name: &'static str) -> Result<Vec<u8>, CapabilityParseError> {
    BASE32
        .decode(field.as_bytes())
        .map_err(|err| CapabilityParseError::Base32 {
            field: name,
            reason: err.to_string(),
        })
}

fn fixed16<'a, I>(fields: &mut I, name: &'static str) -> Result<[u8; 16], CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    let field = fields.next().ok_or(CapabilityParseError::MissingField(name))?;
    let bytes = b32_decode(field, name)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CapabilityParseError::BadLength {
            field: name,
            expected: 16,
            actual: bytes.len(),
        })
}

fn fixed32<'a, I>(fields: &mut I, name: &'static str) -> Result<[u8; 32], CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    let field = fields.next().ok_or(CapabilityParseError::MissingField(name))?;
    let bytes = b32_decode(field, name)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| CapabilityParseError::BadLength {
            field: name,
            expected: 32,
            actual: bytes.len(),
        })
}

fn decimal<'a, I>(fields: &mut I, name: &'static str) -> Result<u64, CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    let field = fields.next().ok_or(CapabilityParseError::MissingField(name))?;
    // Reject non-canonical forms so emit(parse(x)) == x holds.
    if field.is_empty() || (field.len() > 1 && field.starts_with('0')) {
        return Err(CapabilityParseError::InvalidNumber(name));
    }
    field
        .parse::<u64>()
        .map_err(|_| CapabilityParseError::InvalidNumber(name))
}

fn params<'a, I>(fields: &mut I) -> Result<(u8, u8, u64), CapabilityParseError>
where
    I: Iterator<Item = &'a str>,
{
    let k = decimal(fields, "k")?;
    let n = decimal(fields, "n")?;
    let size = decimal(fields, "size")?;
    if k == 0 || n == 0 || k > n || n > 255 {
        return Err(CapabilityParseError::BadParameters { k, n });
    }
    Ok((k as u8, n as u8, size))
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Chk(cap) => write!(
                f,
                "URI:CHK:{}:{}:{}:{}:{}",
                BASE32.encode(&cap.readkey),
                BASE32.encode(&cap.ueb_hash),
                cap.k,
                cap.n,
                cap.size
            ),
            Self::ChkVerify(cap) => write!(
                f,
                "URI:CHK-Verifier:{}:{}:{}:{}:{}",
                BASE32.encode(&cap.storage_index),
                BASE32.encode(&cap.ueb_hash),
                cap.k,
                cap.n,
                cap.size
            ),
            Self::Lit(cap) => write!(f, "URI:LIT:{}", BASE32.encode(&cap.data)),
            Self::SskWrite(cap) => write!(
                f,
                "URI:SSK:{}:{}",
                BASE32.encode(&cap.writekey),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::SskRead(cap) => write!(
                f,
                "URI:SSK-RO:{}:{}",
                BASE32.encode(&cap.readkey),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::SskVerify(cap) => write!(
                f,
                "URI:SSK-Verifier:{}:{}",
                BASE32.encode(&cap.storage_index),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::MdmfWrite(cap) => write!(
                f,
                "URI:MDMF:{}:{}",
                BASE32.encode(&cap.writekey),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::MdmfRead(cap) => write!(
                f,
                "URI:MDMF-RO:{}:{}",
                BASE32.encode(&cap.readkey),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::MdmfVerify(cap) => write!(
                f,
                "URI:MDMF-Verifier:{}:{}",
                BASE32.encode(&cap.storage_index),
                BASE32.encode(&cap.fingerprint)
            ),
            Self::Dir2(inner) => {
                let rendered = inner.to_string();
                let body = rendered
                    .strip_prefix("URI:")
                    .unwrap_or(rendered.as_str());
                match body.split_once(':') {
                    Some(("SSK", rest)) => write!(f, "URI:DIR2:{rest}"),
                    Some(("SSK-RO", rest)) => write!(f, "URI:DIR2-RO:{rest}"),
                    Some(("SSK-Verifier", rest)) => write!(f, "URI:DIR2-Verifier:{rest}"),
                    Some((tag, rest)) => write!(f, "URI:DIR2-{tag}:{rest}"),
                    None => write!(f, "URI:DIR2-{body}"),
                }
            }
            Self::Unknown(raw) => write!(f, "{raw}"),
        }
    }
}

impl std::str::FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::parse(input)
    }
}

/// Derives the readkey a write capability attenuates to.
pub fn readkey_from_writekey(writekey: &[u8; 16]) -> [u8; 16] {
    truncate16(tagged_hash(WRITEKEY_TO_READKEY_TAG, &[writekey]))
}

/// Derives the storage index of an immutable file from its readkey.
pub fn storage_index_from_readkey(readkey: &[u8; 16]) -> StorageIndex {
    truncate16(tagged_hash(READKEY_TO_STORAGE_INDEX_TAG, &[readkey]))
}

/// Derives the storage index of a mutable file from its pubkey fingerprint.
pub fn storage_index_from_fingerprint(fingerprint: &[u8; 32]) -> StorageIndex {
    truncate16(tagged_hash(SSK_STORAGE_INDEX_TAG, &[fingerprint]))
}

/// Derives the convergent CHK readkey for `plaintext`.
///
/// Identical plaintext, parameters, and convergence secret yield the same
/// key, so repeated uploads deduplicate. Parameters are folded in as
/// fixed-width big-endian integers to keep distinct tuples distinct.
pub fn convergent_readkey(
    convergence_secret: &[u8],
    k: u8,
    n: u8,
    segment_size: u64,
    plaintext_hash: &[u8; 32],
) -> [u8; 16] {
    truncate16(tagged_hash(
        CHK_KEY_TAG,
        &[
            convergence_secret,
            &u64::from(k).to_be_bytes(),
            &u64::from(n).to_be_bytes(),
            &segment_size.to_be_bytes(),
            plaintext_hash,
        ],
    ))
}

/// Convenience wrapper deriving the convergent key from the plaintext itself.
pub fn convergent_readkey_for_plaintext(
    convergence_secret: &[u8],
    k: u8,
    n: u8,
    segment_size: u64,
    plaintext: &[u8],
) -> [u8; 16] {
    convergent_readkey(
        convergence_secret,
        k,
        n,
        segment_size,
        &sha256d(plaintext),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chk() -> Capability {
        Capability::Chk(ChkRead {
            readkey: [0x11; 16],
            ueb_hash: [0x22; 32],
            k: 3,
            n: 10,
            size: 1_048_576,
        })
    }

    #[test]
    fn chk_roundtrip_is_identity() {
        let cap = sample_chk();
        let rendered = cap.to_string();
        assert!(rendered.starts_with("URI:CHK:"));
        let parsed = Capability::parse(&rendered).unwrap();
        assert_eq!(parsed, cap);
        assert_eq!(parsed.to_string(), rendered);
    }

    #[test]
    fn all_variants_roundtrip() {
        let write = MutableWrite {
            writekey: [3u8; 16],
            fingerprint: [4u8; 32],
        };
        let caps = vec![
            sample_chk(),
            Capability::ChkVerify(match sample_chk() {
                Capability::Chk(c) => c.verifier(),
                _ => unreachable!(),
            }),
            Capability::Lit(LitCap {
                data: b"Hello\n".to_vec(),
            }),
            Capability::SskWrite(write.clone()),
            Capability::SskRead(write.readcap()),
            Capability::SskVerify(write.readcap().verifier()),
            Capability::MdmfWrite(write.clone()),
            Capability::MdmfRead(write.readcap()),
            Capability::MdmfVerify(write.readcap().verifier()),
            Capability::Dir2(Box::new(Capability::SskWrite(write.clone()))),
            Capability::Dir2(Box::new(Capability::MdmfRead(write.readcap()))),
            Capability::Dir2(Box::new(sample_chk())),
        ];
        for cap in caps {
            let rendered = cap.to_string();
            let parsed = Capability::parse(&rendered).unwrap();
            assert_eq!(parsed, cap, "{rendered}");
            assert_eq!(parsed.to_string(), rendered);
        }
    }

    #[test]
    fn dir2_tags_map_to_inner_kinds() {
        let write = MutableWrite {
            writekey: [7u8; 16],
            fingerprint: [8u8; 32],
        };
        let dir = Capability::Dir2(Box::new(Capability::SskWrite(write)));
        let rendered = dir.to_string();
        assert!(rendered.starts_with("URI:DIR2:"), "{rendered}");
        match Capability::parse(&rendered).unwrap() {
            Capability::Dir2(inner) => assert!(matches!(*inner, Capability::SskWrite(_))),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn opaque_ro_caps_survive() {
        let raw = "ro.bigcorp-cloud-cap-v9:abcdef";
        let parsed = Capability::parse(raw).unwrap();
        assert_eq!(parsed, Capability::Unknown(raw.to_string()));
        assert_eq!(parsed.to_string(), raw);
    }

    #[test]
    fn malformed_caps_are_rejected() {
        for input in [
            "CHK:nope",
            "URI:BOGUS:aaaa",
            "URI:CHK:aaaa",
            "URI:CHK:!!!!:aaaa:3:10:5",
            "URI:LIT:abc:extra",
            "URI:SSK:aaaa",
        ] {
            assert!(Capability::parse(input).is_err(), "{input}");
        }
        // k > n is not a valid parameter set.
        let cap = format!(
            "URI:CHK:{}:{}:10:3:100",
            BASE32.encode(&[1u8; 16]),
            BASE32.encode(&[2u8; 32])
        );
        assert!(matches!(
            Capability::parse(&cap),
            Err(CapabilityParseError::BadParameters { .. })
        ));
        // Leading zeros would break byte-exact round-trips.
        let cap = format!(
            "URI:CHK:{}:{}:03:10:100",
            BASE32.encode(&[1u8; 16]),
            BASE32.encode(&[2u8; 32])
        );
        assert!(Capability::parse(&cap).is_err());
    }

    #[test]
    fn lattice_derivations_are_stable() {
        let writekey = [9u8; 16];
        let readkey = readkey_from_writekey(&writekey);
        assert_ne!(readkey, writekey);
        // Deterministic across calls and equal on every node.
        assert_eq!(readkey, readkey_from_writekey(&writekey));
        let si = storage_index_from_readkey(&readkey);
        assert_eq!(si, storage_index_from_readkey(&readkey));
        assert_ne!(si[..], readkey[..]);
    }

    #[test]
    fn write_and_read_caps_share_storage_index() {
        let write = MutableWrite {
            writekey: [5u8; 16],
            fingerprint: [6u8; 32],
        };
        assert_eq!(write.storage_index(), write.readcap().storage_index());
        assert_eq!(
            write.readcap().verifier().storage_index,
            write.storage_index()
        );
    }

    #[test]
    fn convergent_key_separates_parameters() {
        let hash = sha256d(b"same plaintext");
        let a = convergent_readkey(b"", 3, 10, 131072, &hash);
        let b = convergent_readkey(b"", 3, 10, 131072, &hash);
        assert_eq!(a, b);
        assert_ne!(a, convergent_readkey(b"", 2, 10, 131072, &hash));
        assert_ne!(a, convergent_readkey(b"s", 3, 10, 131072, &hash));
    }

    #[test]
    fn lit_size_limit_is_55() {
        assert_eq!(LIT_SIZE_LIMIT, 55);
    }
}
