//! At-rest sealing for durable blobs.
//!
//! Envelope layout: `magic(8) | version(4, le) | nonce(24) | ciphertext | tag(16)`.

use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use zeroize::Zeroize;

const ENVELOPE_MAGIC: [u8; 8] = *b"HAVENCR1";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 36;
const NONCE_SIZE: usize = 24;
const TAG_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;
const MAX_AAD_LEN: usize = 8 * 1024;
const MAX_PLAINTEXT: usize = 16 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("plaintext too large: {size} > {max}")]
    PlaintextTooLarge { size: usize, max: usize },

    #[error("aad required but empty")]
    AadRequired,

    #[error("aad too large: {size} > {max}")]
    AadTooLarge { size: usize, max: usize },

    #[error("malformed envelope")]
    MalformedEnvelope,

    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("authentication failed")]
    AuthenticationFailed,
}

pub trait CryptoProvider: Send + Sync {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

fn fill_random(out: &mut [u8]) -> Result<(), CryptoError> {
    getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
}

fn check_aad(aad: &[u8]) -> Result<(), CryptoError> {
    if aad.is_empty() {
        return Err(CryptoError::AadRequired);
    }
    if aad.len() > MAX_AAD_LEN {
        return Err(CryptoError::AadTooLarge {
            size: aad.len(),
            max: MAX_AAD_LEN,
        });
    }
    Ok(())
}

/// Single-key XChaCha20-Poly1305 sealer for the device's local store.
pub struct BlobSealer {
    key: Secret<[u8; KEY_SIZE]>,
    sealed: AtomicU64,
    open_failures: AtomicU64,
}

impl BlobSealer {
    pub fn new(key_bytes: &[u8]) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }
        let mut k = [0u8; KEY_SIZE];
        k.copy_from_slice(key_bytes);
        let sealer = Self {
            key: Secret::new(k),
            sealed: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        };
        k.zeroize();
        Ok(sealer)
    }

    /// Fresh random key. The caller is responsible for keeping it in the
    /// platform keystore.
    pub fn generate_key() -> Result<Secret<[u8; KEY_SIZE]>, CryptoError> {
        let mut k = [0u8; KEY_SIZE];
        fill_random(&mut k)?;
        Ok(Secret::new(k))
    }

    pub fn sealed_count(&self) -> u64 {
        self.sealed.load(Ordering::Relaxed)
    }

    pub fn open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::Relaxed)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    fn open(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < HEADER_SIZE + TAG_SIZE || envelope[0..8] != ENVELOPE_MAGIC {
            return Err(CryptoError::MalformedEnvelope);
        }
        check_aad(aad)?;

        let mut version = [0u8; 4];
        version.copy_from_slice(&envelope[8..12]);
        let version = u32::from_le_bytes(version);
        if version != CURRENT_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }

        let nonce = XNonce::from_slice(&envelope[12..HEADER_SIZE]);
        let tag_start = envelope.len() - TAG_SIZE;
        let tag = Tag::from_slice(&envelope[tag_start..]);

        let mut buffer = envelope[HEADER_SIZE..tag_start].to_vec();
        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, tag)
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::AuthenticationFailed);
        }
        Ok(buffer)
    }
}

impl std::fmt::Debug for BlobSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobSealer")
            .field("sealed", &self.sealed_count())
            .finish_non_exhaustive()
    }
}

impl CryptoProvider for BlobSealer {
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT {
            return Err(CryptoError::PlaintextTooLarge {
                size: plaintext.len(),
                max: MAX_PLAINTEXT,
            });
        }
        check_aad(aad)?;

        let mut nonce = [0u8; NONCE_SIZE];
        fill_random(&mut nonce)?;

        let pt_end = HEADER_SIZE + plaintext.len();
        let mut out = vec![0u8; pt_end + TAG_SIZE];
        out[0..8].copy_from_slice(&ENVELOPE_MAGIC);
        out[8..12].copy_from_slice(&CURRENT_VERSION.to_le_bytes());
        out[12..HEADER_SIZE].copy_from_slice(&nonce);
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = match self.cipher().encrypt_in_place_detached(
            XNonce::from_slice(&nonce),
            aad,
            &mut out[HEADER_SIZE..pt_end],
        ) {
            Ok(tag) => tag,
            Err(_) => {
                out.zeroize();
                return Err(CryptoError::EncryptionFailed);
            }
        };
        out[pt_end..].copy_from_slice(&tag);

        self.sealed.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    fn decrypt(&self, envelope: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let result = self.open(envelope, aad);
        if result.is_err() {
            self.open_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}
