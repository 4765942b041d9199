//! Chunked streaming encryption/decryption with bounded memory
//!
//! Plaintext is cut into `chunk_size` pieces; each piece is sealed on its own
//! and written as a length-prefixed frame:
//! ```text
//! [4 bytes: u32 BE sealed length][12-byte nonce][ciphertext][16-byte tag]
//! ```
//!
//! The AAD of chunk `i` is `i (8 bytes BE) || final flag (1 byte)`. Neither value
//! is stored: the reader derives the index from position and finality from
//! whether another frame follows, so reordering, dropping trailing chunks, or
//! appending frames all fail authentication.
//!
//! Empty input still produces one (final, empty) chunk, so an empty encrypted
//! file is distinguishable from a truncated one.

use std::io::{self, Read, Write};

use lockbox_core::{LockboxError, LockboxResult};
use tracing::debug;

use crate::cipher::{Cipher, EncryptionKey};
use crate::{FRAME_HEADER_SIZE, MAX_CHUNK_SIZE, MAX_FRAME_LEN};

/// Reject chunk sizes the frame format cannot carry.
pub fn validate_chunk_size(chunk_size: usize) -> LockboxResult<()> {
    if chunk_size == 0 {
        return Err(LockboxError::Config("chunk_size must be > 0".into()));
    }
    if chunk_size > MAX_CHUNK_SIZE {
        return Err(LockboxError::Config(format!(
            "chunk_size {chunk_size} exceeds maximum {MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

/// Start encrypting `reader` into framed chunks of `chunk_size` plaintext bytes.
pub fn encrypt_stream<R: Read>(
    key: &EncryptionKey,
    reader: R,
    chunk_size: usize,
) -> LockboxResult<ChunkEncryptor<R>> {
    ChunkEncryptor::new(key, reader, chunk_size)
}

/// Start decrypting framed chunks read from `reader`.
pub fn decrypt_stream<R: Read>(key: &EncryptionKey, reader: R) -> LockboxResult<ChunkDecryptor<R>> {
    ChunkDecryptor::new(key, reader)
}

/// Lazy sequence of encrypted frames. Holds at most two plaintext chunks.
pub struct ChunkEncryptor<R> {
    reader: R,
    cipher: Cipher,
    chunk_size: usize,
    index: u64,
    lookahead: Option<Vec<u8>>,
    plaintext_len: u64,
    done: bool,
}

impl<R: Read> ChunkEncryptor<R> {
    pub fn new(key: &EncryptionKey, reader: R, chunk_size: usize) -> LockboxResult<Self> {
        validate_chunk_size(chunk_size)?;
        Ok(Self {
            reader,
            cipher: Cipher::new(key)?,
            chunk_size,
            index: 0,
            lookahead: None,
            plaintext_len: 0,
            done: false,
        })
    }

    /// Plaintext bytes consumed so far
    pub fn plaintext_len(&self) -> u64 {
        self.plaintext_len
    }

    /// Frames produced so far
    pub fn chunks(&self) -> u64 {
        self.index
    }

    /// Produce the next frame, or `None` once the final chunk has been emitted.
    pub fn next_frame(&mut self) -> LockboxResult<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let current = match self.lookahead.take() {
            Some(chunk) => chunk,
            None => self.read_chunk()?,
        };

        // A short chunk means EOF; a full one needs a peek to know
        let is_final = if current.len() < self.chunk_size {
            true
        } else {
            let next = self.read_chunk()?;
            if next.is_empty() {
                true
            } else {
                self.lookahead = Some(next);
                false
            }
        };

        let sealed = self.cipher.seal(&current, &chunk_aad(self.index, is_final))?;
        let sealed_len = u32::try_from(sealed.len()).map_err(|_| {
            LockboxError::MalformedInput(format!("sealed chunk too large: {}", sealed.len()))
        })?;

        self.index += 1;
        self.plaintext_len += current.len() as u64;
        if is_final {
            self.done = true;
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + sealed.len());
        frame.extend_from_slice(&sealed_len.to_be_bytes());
        frame.extend_from_slice(&sealed);
        Ok(Some(frame))
    }

    /// Drain every frame into `writer`. Returns the plaintext length.
    pub fn encrypt_to<W: Write + ?Sized>(mut self, writer: &mut W) -> LockboxResult<u64> {
        while let Some(frame) = self.next_frame()? {
            writer
                .write_all(&frame)
                .map_err(|e| LockboxError::from_io(e, "writing encrypted chunk"))?;
        }
        debug!(
            chunks = self.index,
            bytes = self.plaintext_len,
            "encrypted stream"
        );
        Ok(self.plaintext_len)
    }

    fn read_chunk(&mut self) -> LockboxResult<Vec<u8>> {
        let mut buf = vec![0u8; self.chunk_size];
        let filled = read_full(&mut self.reader, &mut buf)
            .map_err(|e| LockboxError::from_io(e, "reading plaintext"))?;
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for ChunkEncryptor<R> {
    type Item = LockboxResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_frame() {
            Ok(frame) => frame.map(Ok),
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Lazy, non-restartable sequence of plaintext chunks.
pub struct ChunkDecryptor<R> {
    reader: R,
    cipher: Cipher,
    index: u64,
    lookahead: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl<R: Read> ChunkDecryptor<R> {
    pub fn new(key: &EncryptionKey, reader: R) -> LockboxResult<Self> {
        Ok(Self {
            reader,
            cipher: Cipher::new(key)?,
            index: 0,
            lookahead: None,
            started: false,
            done: false,
        })
    }

    /// Chunks verified so far
    pub fn chunks(&self) -> u64 {
        self.index
    }

    /// Verify and return the next plaintext chunk, or `None` after the final one.
    pub fn next_plaintext(&mut self) -> LockboxResult<Option<Vec<u8>>> {
        if self.done {
            return Ok(None);
        }

        let current = match self.lookahead.take() {
            Some(frame) => frame,
            None if self.started => return Ok(None),
            None => {
                self.started = true;
                self.read_frame()?.ok_or_else(|| {
                    LockboxError::MalformedInput("encrypted content has no chunks".into())
                })?
            }
        };

        let next = self.read_frame()?;
        let is_final = next.is_none();
        self.lookahead = next;

        let plaintext = self.cipher.open(&current, &chunk_aad(self.index, is_final))?;
        self.index += 1;
        if is_final {
            self.done = true;
        }
        Ok(Some(plaintext))
    }

    /// Drain every plaintext chunk into `writer`. Returns the plaintext length.
    pub fn decrypt_to<W: Write + ?Sized>(mut self, writer: &mut W) -> LockboxResult<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.next_plaintext()? {
            writer
                .write_all(&chunk)
                .map_err(|e| LockboxError::from_io(e, "writing plaintext"))?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    fn read_frame(&mut self) -> LockboxResult<Option<Vec<u8>>> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut header)
            .map_err(|e| LockboxError::from_io(e, "reading encrypted chunk"))?;
        if got == 0 {
            return Ok(None);
        }
        if got < FRAME_HEADER_SIZE {
            debug!(chunk = self.index, got, "truncated chunk header");
            return Err(LockboxError::Authentication);
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(LockboxError::MalformedInput(format!(
                "chunk declares {len} bytes (maximum {MAX_FRAME_LEN})"
            )));
        }

        let mut body = vec![0u8; len];
        let got = read_full(&mut self.reader, &mut body)
            .map_err(|e| LockboxError::from_io(e, "reading encrypted chunk"))?;
        if got < len {
            debug!(chunk = self.index, got, expected = len, "truncated chunk body");
            return Err(LockboxError::Authentication);
        }
        Ok(Some(body))
    }
}

impl<R: Read> Iterator for ChunkDecryptor<R> {
    type Item = LockboxResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_plaintext() {
            Ok(chunk) => chunk.map(Ok),
            Err(e) => {
                self.done = true;
                self.lookahead = None;
                Some(Err(e))
            }
        }
    }
}

/// `io::Read` over a [`ChunkDecryptor`].
///
/// The first chunk is verified on construction, so a wrong key surfaces before
/// any plaintext is handed out. Later failures come back as `io::Error`s of
/// kind `InvalidData`; `LockboxError::from_io` recovers the typed error.
pub struct DecryptReader<R> {
    chunks: ChunkDecryptor<R>,
    buf: Vec<u8>,
    pos: usize,
    failed: bool,
}

impl<R: Read> DecryptReader<R> {
    pub fn new(mut chunks: ChunkDecryptor<R>) -> LockboxResult<Self> {
        let buf = chunks.next_plaintext()?.unwrap_or_default();
        Ok(Self {
            chunks,
            buf,
            pos: 0,
            failed: false,
        })
    }
}

impl<R: Read> Read for DecryptReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.failed {
            return Err(LockboxError::MalformedInput(
                "stream aborted after an earlier error".into(),
            )
            .into_io());
        }

        while self.pos == self.buf.len() {
            match self.chunks.next_plaintext() {
                Ok(Some(chunk)) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Ok(None) => return Ok(0),
                Err(e) => {
                    self.failed = true;
                    return Err(e.into_io());
                }
            }
        }

        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// AAD: chunk_index (8 bytes BE) || final flag
fn chunk_aad(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = u8::from(is_final);
    aad
}

/// Fill `buf` unless EOF comes first. Returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
