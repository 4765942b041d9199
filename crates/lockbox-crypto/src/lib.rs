//! lockbox-crypto: authenticated encryption at rest
//!
//! Two layers:
//!   - `cipher`: one self-contained AES-GCM unit, `[nonce][ciphertext][tag]`
//!   - `stream`: bounded-memory chunking of arbitrary-length content into
//!     length-prefixed units
//!
//! On-disk format of an encrypted file:
//! ```text
//! frame*  where  frame = [u32 BE: L][12-byte nonce][L - 28 bytes ciphertext][16-byte tag]
//! AAD(chunk i) = i (8 bytes, big-endian) || final flag (1 byte)
//! ```
//!
//! The key length picks the cipher: 16 → AES-128-GCM, 24 → AES-192-GCM,
//! 32 → AES-256-GCM. Keys are supplied per call and never stored.

pub mod cipher;
pub mod stream;

pub use cipher::{open, open_with_aad, seal, seal_with_aad, EncryptionKey};
pub use stream::{
    decrypt_stream, encrypt_stream, validate_chunk_size, ChunkDecryptor, ChunkEncryptor,
    DecryptReader,
};

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed unit adds on top of its plaintext
pub const UNIT_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Size of the big-endian length prefix in front of each chunk
pub const FRAME_HEADER_SIZE: usize = 4;

/// Largest plaintext chunk accepted by the codec (16 MiB)
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Largest sealed unit a frame may declare
pub const MAX_FRAME_LEN: usize = MAX_CHUNK_SIZE + UNIT_OVERHEAD;
