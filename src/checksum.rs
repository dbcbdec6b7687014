/*!
 * Content hashing for the backup pipeline
 *
 * Lowercase hex SHA-256 is the journal's canonical file identity. Mount
 * destinations are digested as their bytes are written, so a completed
 * copy already knows its hash without a second pass; sources, ADB pulls
 * and the verify/cleanup passes hash from disk through the same
 * accumulator.
 */

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read granularity for whole-file hashing
const HASH_CHUNK: usize = 128 * 1024;

/// SHA-256 accumulator shared by the copy loop and whole-file hashing.
pub struct StreamingHasher {
    digest: Sha256,
}

impl StreamingHasher {
    pub fn new() -> Self {
        Self {
            digest: Sha256::new(),
        }
    }

    /// Fold one chunk into the digest, as the copy loop does per write.
    pub fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
    }

    /// Fold an entire reader into the digest. Returns the bytes consumed.
    pub fn consume<R: Read>(&mut self, reader: &mut R) -> Result<u64> {
        let mut buf = vec![0u8; HASH_CHUNK];
        let mut consumed = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(consumed);
            }
            self.digest.update(&buf[..n]);
            consumed += n as u64;
        }
    }

    /// The finished digest as lowercase hex.
    pub fn finish(self) -> String {
        hex::encode(self.digest.finalize())
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash a file already on disk. The copy path avoids this for freshly
/// written destinations by digesting during the write.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = StreamingHasher::new();
    hasher.consume(&mut file)?;
    Ok(hasher.finish())
}
