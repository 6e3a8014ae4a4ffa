//! Chunk counts and byte ranges
//!
//! Chunk indices are 1-based. For chunk `i` the stored ciphertext range is
//! `[(i-1)*(C+O), (i-1)*(C+O) + C+O-1]`, clamped to the stored length for
//! the final (short) chunk.

use anyhow::Result;

/// Default plaintext chunk size (10 MB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    /// Plaintext bytes per chunk
    pub chunk_size: u64,
    /// Bytes added to every chunk by encryption
    pub overhead: u64,
}

/// Inclusive ciphertext byte range for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
    /// True when this range ends at the last stored byte
    pub eof: bool,
}

impl ByteRange {
    /// Number of bytes in the range.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl ChunkLayout {
    pub fn new(chunk_size: u64, overhead: u64) -> Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        Ok(Self {
            chunk_size,
            overhead,
        })
    }

    /// Size of a full chunk once encrypted.
    pub fn sealed_chunk_size(&self) -> u64 {
        self.chunk_size + self.overhead
    }

    /// Number of chunks needed for `plaintext_len` bytes. Empty input has none.
    /// Fails when the count does not fit a chunk index.
    pub fn chunk_count(&self, plaintext_len: u64) -> Result<u32> {
        let chunks = plaintext_len.div_ceil(self.chunk_size);
        u32::try_from(chunks).map_err(|_| {
            anyhow::anyhow!(
                "{plaintext_len} bytes needs {chunks} chunks of {}, more than a chunk index can address",
                self.chunk_size
            )
        })
    }

    /// Total stored length for `plaintext_len` bytes of plaintext.
    pub fn ciphertext_length(&self, plaintext_len: u64) -> u64 {
        let chunks = plaintext_len.div_ceil(self.chunk_size);
        plaintext_len.saturating_add(chunks.saturating_mul(self.overhead))
    }

    /// Plaintext bytes recovered from `ciphertext_len` stored bytes.
    pub fn plaintext_length(&self, ciphertext_len: u64) -> u64 {
        let chunks = ciphertext_len.div_ceil(self.sealed_chunk_size());
        ciphertext_len.saturating_sub(chunks * self.overhead)
    }

    /// Half-open plaintext range `[start, end)` covered by 1-based `chunk`.
    pub fn plaintext_range(&self, chunk: u32, plaintext_len: u64) -> Result<(u64, u64)> {
        if chunk == 0 {
            anyhow::bail!("chunk indices start at 1");
        }
        let start = (chunk as u64 - 1) * self.chunk_size;
        if start >= plaintext_len {
            anyhow::bail!(
                "chunk {chunk} starts past end of input ({start} >= {plaintext_len})"
            );
        }
        let end = (start + self.chunk_size).min(plaintext_len);
        Ok((start, end))
    }

    /// Exact sealed length of 1-based `chunk` in an object of
    /// `plaintext_len` plaintext bytes.
    pub fn sealed_len(&self, chunk: u32, plaintext_len: u64) -> Result<u64> {
        let (start, end) = self.plaintext_range(chunk, plaintext_len)?;
        Ok(end - start + self.overhead)
    }

    /// Inclusive ciphertext range for 1-based `chunk` of an object whose
    /// stored length is `total_length`.
    pub fn byte_range(&self, chunk: u32, total_length: u64) -> Result<ByteRange> {
        if chunk == 0 {
            anyhow::bail!("chunk indices start at 1");
        }
        if total_length == 0 {
            anyhow::bail!("object is empty");
        }

        let sealed = self.sealed_chunk_size();
        let start = (chunk as u64 - 1) * sealed;
        if start >= total_length {
            anyhow::bail!("chunk {chunk} is past the end of a {total_length}-byte object");
        }

        let mut end = start + sealed - 1;
        let mut eof = false;
        if end >= total_length - 1 {
            end = total_length - 1;
            eof = true;
        }

        Ok(ByteRange { start, end, eof })
    }
}
