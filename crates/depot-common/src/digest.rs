//! Digest utilities for Depot
//!
//! SHA-256 content digests and MD5 ETags, computed in one streaming
//! pass, plus the composite multipart ETag rule.

use md5::Md5;
use sha2::{Digest, Sha256};

/// Digests of a payload after a full pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digests {
    /// Hex-encoded SHA-256 of the payload
    pub sha256: String,
    /// Hex-encoded MD5 of the payload (single-part ETag)
    pub md5: String,
    pub len: u64,
}

/// Streaming calculator producing SHA-256 and MD5 in one pass
pub struct DigestWriter {
    sha256: Sha256,
    md5: Md5,
    len: u64,
}

impl DigestWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sha256: Sha256::new(),
            md5: Md5::new(),
            len: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.sha256.update(data);
        self.md5.update(data);
        self.len += data.len() as u64;
    }

    #[must_use]
    pub fn finalize(self) -> Digests {
        Digests {
            sha256: hex::encode(self.sha256.finalize()),
            md5: hex::encode(self.md5.finalize()),
            len: self.len,
        }
    }
}

impl Default for DigestWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex SHA-256 of a full in-memory payload
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hex MD5 of a full in-memory payload
#[must_use]
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Composite multipart ETag: hex MD5 of the concatenated per-part MD5
/// bytes, suffixed with `-N` where N is the part count.
///
/// Part etags are the hex MD5 strings recorded at part upload, in
/// ascending part-number order.
pub fn composite_etag<'a>(part_etags: impl IntoIterator<Item = &'a str>) -> Result<String, hex::FromHexError> {
    let mut concat = Vec::new();
    let mut count = 0usize;
    for etag in part_etags {
        concat.extend_from_slice(&hex::decode(etag)?);
        count += 1;
    }
    Ok(format!("{}-{count}", hex::encode(Md5::digest(&concat))))
}
