// SPDX-License-Identifier: Apache-2.0

//! Helpers for reading image layer blobs: transparent gunzip and tar entry
//! extraction, shared by the file fetcher and the bundle classifier.

use std::io::Read;

use flate2::read::GzDecoder;
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Decompress a layer blob when it is gzip-compressed, otherwise return it
/// unchanged.
pub(crate) fn maybe_gunzip(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() >= 2 && bytes[..2] == GZIP_MAGIC {
        let mut decoder = GzDecoder::new(bytes);
        let mut out = Vec::new();
        if decoder.read_to_end(&mut out).is_ok() {
            return out;
        }
    }
    bytes.to_vec()
}

/// Read the regular-file entries of a tar archive as `(path, bytes)` pairs.
/// Returns `None` when the blob is not a tar archive.
pub(crate) fn tar_entries(bytes: &[u8]) -> Option<Vec<(String, Vec<u8>)>> {
    let mut archive = Archive::new(bytes);
    let mut out = Vec::new();
    let entries = archive.entries().ok()?;
    for entry in entries {
        let mut entry = entry.ok()?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().ok()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).ok()?;
        out.push((path, contents));
    }
    Some(out)
}
