//! Checksum utilities for content verification
//!
//! Object stores report a single-part object's entity tag as the hex MD5 of
//! its bytes, so MD5 is the equality oracle between local, origin and stored
//! content. Uploads additionally carry the base64 form of the same digest
//! (`Content-MD5`), which is why [`Digest`] keeps both encodings together.

use crate::error::{CommonError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// MD5 digest held as lowercase hex plus its base64 transport encoding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    hex: String,
    encoded: String,
}

impl Digest {
    fn from_raw(raw: [u8; 16]) -> Self {
        Self {
            hex: hex::encode(raw),
            encoded: BASE64.encode(raw),
        }
    }

    /// Digest of an in-memory buffer
    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_raw(md5::compute(data).0)
    }

    /// Digest of any synchronous reader, consumed to EOF
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            context.consume(&buffer[..bytes_read]);
        }

        Ok(Self::from_raw(context.compute().0))
    }

    /// Digest of a file, streamed so large artifacts are never held in memory
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = tokio::fs::File::open(path.as_ref()).await?;
        let mut context = md5::Context::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let bytes_read = file.read(&mut buffer).await?;
            if bytes_read == 0 {
                break;
            }
            context.consume(&buffer[..bytes_read]);
        }

        Ok(Self::from_raw(context.compute().0))
    }

    /// Parse a hex MD5 as written in repository index files
    pub fn from_hex(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        let bytes = hex::decode(trimmed).map_err(|e| CommonError::InvalidDigest {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

        let raw: [u8; 16] = bytes.try_into().map_err(|_| CommonError::InvalidDigest {
            value: value.to_string(),
            reason: "expected 16 bytes".to_string(),
        })?;

        Ok(Self::from_raw(raw))
    }

    /// Parse a store entity tag. Multipart tags (`<hex>-<parts>`) are not
    /// content digests and are rejected.
    pub fn from_etag(etag: &str) -> Result<Self> {
        Self::from_hex(etag.trim_matches('"'))
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Base64 form, suitable for a `Content-MD5` header
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    pub fn matches_etag(&self, etag: &str) -> bool {
        etag.trim_matches('"').eq_ignore_ascii_case(&self.hex)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// MD5 and SHA-256 accumulated over a body that arrives in chunks
pub struct StreamingDigest {
    md5: md5::Context,
    sha256: Sha256,
    consumed: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self {
            md5: md5::Context::new(),
            sha256: Sha256::new(),
            consumed: 0,
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.md5.consume(chunk);
        self.sha256.update(chunk);
        self.consumed += chunk.len() as u64;
    }

    /// Bytes seen so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// The MD5 digest and the lowercase hex SHA-256
    pub fn finish(self) -> (Digest, String) {
        (
            Digest::from_raw(self.md5.compute().0),
            hex::encode(self.sha256.finalize()),
        )
    }
}

impl Default for StreamingDigest {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 of a buffer as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a buffer against a declared SHA-256
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
