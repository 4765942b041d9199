//! Single-unit AES-GCM sealing
//!
//! Sealed unit format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: GCM tag]
//! ```
//!
//! A fresh nonce is drawn for every unit, so one key can seal any number of
//! units without nonce reuse (2^32 units per key keeps the collision bound
//! negligible for random 96-bit nonces).

use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit, Payload},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
};
use lockbox_core::{LockboxError, LockboxResult};
use rand::RngCore;
use zeroize::Zeroize;

use crate::{NONCE_SIZE, TAG_SIZE};

type Aes192Gcm = AesGcm<Aes192, U12>;

/// Accepted raw key lengths in bytes
pub const VALID_KEY_LENGTHS: [usize; 3] = [16, 24, 32];

/// A caller-supplied AES key (128, 192 or 256 bit). Zeroized on drop.
#[derive(Clone)]
pub struct EncryptionKey {
    bytes: Vec<u8>,
}

impl EncryptionKey {
    /// Validate and copy a raw key. Fails with `InvalidKey` unless the length
    /// is 16, 24 or 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> LockboxResult<Self> {
        if !VALID_KEY_LENGTHS.contains(&bytes.len()) {
            return Err(LockboxError::InvalidKey { len: bytes.len() });
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Generate a random key of the given length.
    pub fn generate(len: usize) -> LockboxResult<Self> {
        if !VALID_KEY_LENGTHS.contains(&len) {
            return Err(LockboxError::InvalidKey { len });
        }
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// AES-GCM instance keyed once and reused for every unit of a stream.
pub(crate) enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

impl Cipher {
    pub(crate) fn new(key: &EncryptionKey) -> LockboxResult<Self> {
        let bytes = key.as_bytes();
        let invalid = |_| LockboxError::InvalidKey { len: bytes.len() };
        let cipher = match bytes.len() {
            16 => Self::Aes128(Aes128Gcm::new_from_slice(bytes).map_err(invalid)?),
            24 => Self::Aes192(Aes192Gcm::new_from_slice(bytes).map_err(invalid)?),
            32 => Self::Aes256(Aes256Gcm::new_from_slice(bytes).map_err(invalid)?),
            len => return Err(LockboxError::InvalidKey { len }),
        };
        Ok(cipher)
    }

    /// Returns `[nonce][ciphertext][tag]`.
    pub(crate) fn seal(&self, plaintext: &[u8], aad: &[u8]) -> LockboxResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<U12>::from_slice(&nonce_bytes);
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        let ciphertext = match self {
            Self::Aes128(c) => c.encrypt(nonce, payload),
            Self::Aes192(c) => c.encrypt(nonce, payload),
            Self::Aes256(c) => c.encrypt(nonce, payload),
        }
        .map_err(|e| LockboxError::MalformedInput(format!("encryption failed: {e}")))?;

        let mut unit = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        unit.extend_from_slice(&nonce_bytes);
        unit.extend_from_slice(&ciphertext);
        Ok(unit)
    }

    pub(crate) fn open(&self, unit: &[u8], aad: &[u8]) -> LockboxResult<Vec<u8>> {
        if unit.len() < NONCE_SIZE {
            return Err(LockboxError::MalformedInput(format!(
                "sealed unit too short: {} bytes (nonce alone is {NONCE_SIZE})",
                unit.len()
            )));
        }
        // Nonce present but no room for a tag: treat as truncated ciphertext
        if unit.len() < NONCE_SIZE + TAG_SIZE {
            return Err(LockboxError::Authentication);
        }

        let (nonce_bytes, ciphertext) = unit.split_at(NONCE_SIZE);
        let nonce = Nonce::<U12>::from_slice(nonce_bytes);
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        match self {
            Self::Aes128(c) => c.decrypt(nonce, payload),
            Self::Aes192(c) => c.decrypt(nonce, payload),
            Self::Aes256(c) => c.decrypt(nonce, payload),
        }
        .map_err(|_| LockboxError::Authentication)
    }
}

/// Seal `plaintext` under `key` with a fresh random nonce.
///
/// Returns: `[12-byte nonce][ciphertext][16-byte tag]`
pub fn seal(key: &EncryptionKey, plaintext: &[u8]) -> LockboxResult<Vec<u8>> {
    seal_with_aad(key, plaintext, &[])
}

/// Seal with additional authenticated data that must be presented again to open.
pub fn seal_with_aad(key: &EncryptionKey, plaintext: &[u8], aad: &[u8]) -> LockboxResult<Vec<u8>> {
    Cipher::new(key)?.seal(plaintext, aad)
}

/// Open a unit produced by [`seal`].
///
/// Fails with `MalformedInput` if the unit is shorter than a nonce and with
/// `Authentication` for a wrong key, corrupted bytes, or a truncated unit.
pub fn open(key: &EncryptionKey, unit: &[u8]) -> LockboxResult<Vec<u8>> {
    open_with_aad(key, unit, &[])
}

/// Open a unit produced by [`seal_with_aad`] with the same `aad`.
pub fn open_with_aad(key: &EncryptionKey, unit: &[u8], aad: &[u8]) -> LockboxResult<Vec<u8>> {
    Cipher::new(key)?.open(unit, aad)
}
