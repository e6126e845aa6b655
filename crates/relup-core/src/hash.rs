//! SHA-256 content hashing for archives and patches.
//!
//! Hashes travel through the manifest as lowercase hex strings.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Buffer size for reading files during hash computation.
const HASH_BUFFER_SIZE: usize = 8192;

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of a file, read in chunks.
pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BUFFER_SIZE];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let hash = hex::encode(hasher.finalize());
    tracing::debug!(path = %path.display(), hash = %hash, "hashed file");
    Ok(hash)
}

/// Compare two hex digests in constant time, ignoring ASCII case.
pub fn digests_match(expected: &str, actual: &str) -> bool {
    let expected = expected.to_ascii_lowercase();
    let actual = actual.to_ascii_lowercase();
    expected.len() == actual.len() && expected.as_bytes().ct_eq(actual.as_bytes()).unwrap_u8() == 1
}

/// Whether `data` hashes to `expected_hex`.
pub fn verify_bytes(data: &[u8], expected_hex: &str) -> bool {
    digests_match(expected_hex, &sha256_hex(data))
}
