//! Record encoding for the file store.
//!
//! Records are JSON, gzip-compressed on disk. File names are the SHA-256 of
//! the key so arbitrary cache keys (query signatures included) map to safe
//! file names.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{StorageError, StorageResult};

/// File extension of stored records.
pub const RECORD_EXTENSION: &str = "json.gz";

/// Stable file stem for a key.
pub fn key_digest(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    format!("{:x}", digest)
}

/// File name of the record holding `key`.
///
/// Format: `{sha256(key)}.json.gz`
pub fn record_file_name(key: &str) -> String {
    format!("{}.{}", key_digest(key), RECORD_EXTENSION)
}

/// Compress text to gzip bytes.
pub fn compress(text: &str) -> StorageResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(text.as_bytes())
        .map_err(|e| StorageError::Serialization(format!("Failed to gzip record: {}", e)))?;

    encoder
        .finish()
        .map_err(|e| StorageError::Serialization(format!("Failed to finish gzip encoding: {}", e)))
}

/// Decompress gzip bytes to text.
///
/// Returns `None` if decompression fails (treated as a corrupt record).
pub fn decompress(data: &[u8]) -> Option<String> {
    let mut decoder = GzDecoder::new(data);
    let mut text = String::new();

    if let Err(e) = decoder.read_to_string(&mut text) {
        warn!(error = %e, "Failed to decompress stored record");
        return None;
    }

    Some(text)
}
