//! Hashing, symmetric encryption, and signature primitives.
//!
//! Every keyed derivation in the protocol is a double-SHA-256 over a unique
//! ASCII tag followed by the input material. The tags are wire-format
//! constants; changing one changes every capability and storage-index the
//! crate produces.

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use ed25519_dalek::{Signer, Verifier};
use rand::RngCore;
use rand_core::OsRng;
use rsa::pkcs1::{
    DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey,
};
use rsa::signature::SignatureEncoding;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// Derives a mutable readkey from its writekey.
pub const WRITEKEY_TO_READKEY_TAG: &[u8] = b"allmydata_mutable_writekey_to_readkey_v1";
/// Derives an immutable storage-index from a readkey.
pub const READKEY_TO_STORAGE_INDEX_TAG: &[u8] =
    b"allmydata_immutable_readkey_to_storage_index_v1";
/// Derives a mutable-file fingerprint from its public key bytes.
pub const PUBKEY_TO_FINGERPRINT_TAG: &[u8] = b"allmydata_mutable_pubkey_to_fingerprint_v1";
/// Derives a mutable storage-index from a pubkey fingerprint.
pub const SSK_STORAGE_INDEX_TAG: &[u8] = b"SSK_storage_index_v1";
/// Derives the convergent encryption key for immutable content.
pub const CHK_KEY_TAG: &[u8] = b"CHK_key_v1";
/// Hashes a serialized URI extension block.
pub const UEB_TAG: &[u8] = b"UEB_v1";
/// Leaf and node tag of per-share block hash trees.
pub const BLOCK_HASH_TAG: &[u8] = b"block_hash_v1";
/// Leaf and node tag of the cross-share hash tree.
pub const SHARE_HASH_TAG: &[u8] = b"share_hash_v1";
/// Leaf and node tag of the plaintext segment hash tree.
pub const PLAINTEXT_HASH_TAG: &[u8] = b"plaintext_hash_v1";
/// Leaf and node tag of the crypttext segment hash tree.
pub const CRYPTTEXT_HASH_TAG: &[u8] = b"crypttext_hash_v1";
/// Derives per-storage-index lease renewal secrets.
pub const LEASE_RENEW_TAG: &[u8] = b"allmydata_lease_renew_secret_v1";
/// Derives per-storage-index lease cancellation secrets.
pub const LEASE_CANCEL_TAG: &[u8] = b"allmydata_lease_cancel_secret_v1";
/// Derives the per-server write enabler for a mutable slot.
pub const WRITE_ENABLER_TAG: &[u8] = b"allmydata_mutable_write_enabler_v1";
/// Derives the data encryption key of a mutable version from readkey and IV.
pub const MUTABLE_DATA_KEY_TAG: &[u8] = b"allmydata_mutable_data_key_v1";
/// Derives the key protecting the in-band encrypted signing key.
pub const MUTABLE_PRIVKEY_KEY_TAG: &[u8] = b"allmydata_mutable_privkey_key_v1";

/// Single SHA-256.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Double SHA-256: `SHA256(SHA256(x))`.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// Double SHA-256 over a domain tag followed by the given parts, in order.
pub fn tagged_hash(tag: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    for part in parts {
        hasher.update(part);
    }
    let first: [u8; 32] = hasher.finalize().into();
    sha256(&first)
}

/// Truncates a 32-byte digest to the 16-byte key/index width.
pub fn truncate16(digest: [u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&digest[..16]);
    out
}

/// Returns 16 random bytes from the operating system generator.
pub fn random_key16() -> [u8; 16] {
    let mut key = [0u8; 16];
    OsRng.fill_bytes(&mut key);
    key
}

/// Returns 32 random bytes from the operating system generator.
pub fn random_bytes32() -> [u8; 32] {
    let mut out = [0u8; 32];
    OsRng.fill_bytes(&mut out);
    out
}

/// Applies the AES-128-CTR keystream to `data` in place.
///
/// The counter block is 128 bits, big-endian, initialized to zero, so the
/// same call decrypts what it encrypted. `offset` is a byte position into
/// the keystream, letting segments be processed out of order.
pub fn ctr_transform(key: &[u8; 16], offset: u64, data: &mut [u8]) {
    let iv = [0u8; 16];
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.seek(offset);
    cipher.apply_keystream(data);
}

const SCHEME_ED25519: u8 = 1;
const SCHEME_RSA: u8 = 2;
const RSA_BITS: usize = 2048;

/// Errors reported by key handling and signature verification.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material failed to parse or had the wrong length.
    #[error("key decode error: {0}")]
    Key(String),
    /// A signature failed to parse or verify.
    #[error("signature error: {0}")]
    Signature(String),
    /// The scheme tag byte was not a known signature scheme.
    #[error("unknown signature scheme {0}")]
    UnknownScheme(u8),
    /// Key generation failed.
    #[error("key generation error: {0}")]
    Generate(String),
}

/// A mutable-file signing keypair.
///
/// New files use ed25519; RSA-2048 with PKCS#1 v1.5 padding remains readable
/// and writable for files created by older clients.
#[derive(Clone)]
pub enum SigningKeypair {
    /// Ed25519 keypair.
    Ed25519(ed25519_dalek::SigningKey),
    /// RSA-2048 keypair.
    Rsa(rsa::RsaPrivateKey),
}

impl SigningKeypair {
    /// Generates a fresh ed25519 keypair.
    pub fn generate() -> Self {
        Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    /// Generates a fresh RSA-2048 keypair. Slow; kept for compatibility.
    pub fn generate_rsa() -> Result<Self, CryptoError> {
        let key = rsa::RsaPrivateKey::new(&mut OsRng, RSA_BITS)
            .map_err(|err| CryptoError::Generate(err.to_string()))?;
        Ok(Self::Rsa(key))
    }

    /// Signs `message`, returning the raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => key.sign(message).to_bytes().to_vec(),
            Self::Rsa(key) => {
                let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                signer.sign(message).to_vec()
            }
        }
    }

    /// Returns the verification half of this keypair.
    pub fn verify_key(&self) -> VerifyKey {
        match self {
            Self::Ed25519(key) => VerifyKey::Ed25519(key.verifying_key()),
            Self::Rsa(key) => VerifyKey::Rsa(rsa::RsaPublicKey::from(key)),
        }
    }

    /// Serializes the keypair as a scheme tag byte followed by key material.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => {
                let mut out = vec![SCHEME_ED25519];
                out.extend_from_slice(&key.to_bytes());
                out
            }
            Self::Rsa(key) => {
                let mut out = vec![SCHEME_RSA];
                // PKCS#1 DER; infallible for a well-formed key.
                let der = key.to_pkcs1_der().expect("serialize RSA private key");
                out.extend_from_slice(der.as_bytes());
                out
            }
        }
    }

    /// Parses a keypair previously produced by [`SigningKeypair::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (scheme, material) = split_scheme(bytes)?;
        match scheme {
            SCHEME_ED25519 => {
                let seed: [u8; 32] = material
                    .try_into()
                    .map_err(|_| CryptoError::Key(format!("ed25519 seed length {}", material.len())))?;
                Ok(Self::Ed25519(ed25519_dalek::SigningKey::from_bytes(&seed)))
            }
            SCHEME_RSA => rsa::RsaPrivateKey::from_pkcs1_der(material)
                .map(Self::Rsa)
                .map_err(|err| CryptoError::Key(err.to_string())),
            other => Err(CryptoError::UnknownScheme(other)),
        }
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ed25519(_) => write!(f, "SigningKeypair::Ed25519"),
            Self::Rsa(_) => write!(f, "SigningKeypair::Rsa"),
        }
    }
}

/// The public half of a mutable-file keypair.
#[derive(Debug, Clone)]
pub enum VerifyKey {
    /// Ed25519 verifying key.
    Ed25519(ed25519_dalek::VerifyingKey),
    /// RSA-2048 public key.
    Rsa(rsa::RsaPublicKey),
}

impl VerifyKey {
    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        match self {
            Self::Ed25519(key) => {
                let sig = ed25519_dalek::Signature::from_slice(signature)
                    .map_err(|err| CryptoError::Signature(err.to_string()))?;
                key.verify(message, &sig)
                    .map_err(|err| CryptoError::Signature(err.to_string()))
            }
            Self::Rsa(key) => {
                let sig = rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|err| CryptoError::Signature(err.to_string()))?;
                let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
                verifier
                    .verify(message, &sig)
                    .map_err(|err| CryptoError::Signature(err.to_string()))
            }
        }
    }

    /// Serializes the key as a scheme tag byte followed by key material.
    ///
    /// The tag byte is included in the fingerprint, binding the scheme.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(key) => {
                let mut out = vec![SCHEME_ED25519];
                out.extend_from_slice(key.as_bytes());
                out
            }
            Self::Rsa(key) => {
                let mut out = vec![SCHEME_RSA];
                let der = key.to_pkcs1_der().expect("serialize RSA public key");
                out.extend_from_slice(der.as_bytes());
                out
            }
        }
    }

    /// Parses a key previously produced by [`VerifyKey::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (scheme, material) = split_scheme(bytes)?;
        match scheme {
            SCHEME_ED25519 => {
                let raw: [u8; 32] = material
                    .try_into()
                    .map_err(|_| CryptoError::Key(format!("ed25519 key length {}", material.len())))?;
                ed25519_dalek::VerifyingKey::from_bytes(&raw)
                    .map(Self::Ed25519)
                    .map_err(|err| CryptoError::Key(err.to_string()))
            }
            SCHEME_RSA => rsa::RsaPublicKey::from_pkcs1_der(material)
                .map(Self::Rsa)
                .map_err(|err| CryptoError::Key(err.to_string())),
            other => Err(CryptoError::UnknownScheme(other)),
        }
    }

    /// The 32-byte fingerprint bound into mutable capabilities.
    pub fn fingerprint(&self) -> [u8; 32] {
        tagged_hash(PUBKEY_TO_FINGERPRINT_TAG, &[&self.to_bytes()])
    }
}

fn split_scheme(bytes: &[u8]) -> Result<(u8, &[u8]), CryptoError> {
    match bytes.split_first() {
        Some((scheme, rest)) => Ok((*scheme, rest)),
        None => Err(CryptoError::Key("empty key material".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_differs_from_sha256() {
        let single = sha256(b"grid");
        let double = sha256d(b"grid");
        assert_ne!(single, double);
        assert_eq!(double, sha256(&single));
    }

    #[test]
    fn tagged_hash_separates_domains() {
        let a = tagged_hash(BLOCK_HASH_TAG, &[b"payload"]);
        let b = tagged_hash(SHARE_HASH_TAG, &[b"payload"]);
        assert_ne!(a, b);
        // Concatenation order matters.
        let c = tagged_hash(BLOCK_HASH_TAG, &[b"pay", b"load"]);
        assert_eq!(a, c);
    }

    #[test]
    fn ctr_roundtrip_and_seek() {
        let key = [7u8; 16];
        let mut data = b"a segment of plaintext bytes".to_vec();
        let original = data.clone();
        ctr_transform(&key, 0, &mut data);
        assert_ne!(data, original);
        ctr_transform(&key, 0, &mut data);
        assert_eq!(data, original);

        // Encrypting a suffix at its absolute offset matches the whole-buffer
        // keystream.
        let mut whole = original.clone();
        ctr_transform(&key, 0, &mut whole);
        let mut tail = original[10..].to_vec();
        ctr_transform(&key, 10, &mut tail);
        assert_eq!(&whole[10..], &tail[..]);
    }

    #[test]
    fn ed25519_sign_verify_roundtrip() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign(b"version block");
        let vk = keypair.verify_key();
        assert!(vk.verify(b"version block", &sig).is_ok());
        assert!(vk.verify(b"other bytes", &sig).is_err());
    }

    #[test]
    fn keypair_serialization_roundtrip() {
        let keypair = SigningKeypair::generate();
        let restored = SigningKeypair::from_bytes(&keypair.to_bytes()).unwrap();
        let sig = restored.sign(b"msg");
        assert!(keypair.verify_key().verify(b"msg", &sig).is_ok());

        let vk = keypair.verify_key();
        let vk2 = VerifyKey::from_bytes(&vk.to_bytes()).unwrap();
        assert_eq!(vk.fingerprint(), vk2.fingerprint());
    }

    #[test]
    fn rsa_sign_verify_roundtrip() {
        let keypair = SigningKeypair::generate_rsa().unwrap();
        let sig = keypair.sign(b"legacy version block");
        let vk = VerifyKey::from_bytes(&keypair.verify_key().to_bytes()).unwrap();
        assert!(vk.verify(b"legacy version block", &sig).is_ok());
        assert!(vk.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn fingerprint_binds_scheme_tag() {
        let kp = SigningKeypair::generate();
        let bytes = kp.verify_key().to_bytes();
        assert_eq!(bytes[0], 1);
        assert!(VerifyKey::from_bytes(&[9u8, 1, 2, 3]).is_err());
    }
}
