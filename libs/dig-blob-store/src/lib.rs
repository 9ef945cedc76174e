//! Content-addressed blob repository.
//!
//! Blobs are identified by the SHA-256 of their *uncompressed* bytes and
//! persisted gzip-compressed under a sharded directory layout
//! (`data/AA/BB/.../RR`, §3/§6). Writes go through a temp file in the
//! store's `tmp/` directory followed by an atomic rename, so concurrent
//! puts of identical content are safe and a crash never leaves a partial
//! file at the canonical path.

use dig_errors::{DigError, DigResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Concrete stream type returned by [`BlobStore::get`].
pub type GzReader = GzDecoder<io::Take<File>>;

pub struct BlobStore {
    data_root: PathBuf,
    tmp_root: PathBuf,
}

impl BlobStore {
    /// `store_root` is a store's top-level directory; `data/` and `tmp/`
    /// are created beneath it on first use.
    pub fn new(store_root: impl AsRef<Path>) -> DigResult<Self> {
        let store_root = store_root.as_ref();
        let data_root = store_root.join("data");
        let tmp_root = store_root.join("tmp");
        fs::create_dir_all(&data_root)?;
        fs::create_dir_all(&tmp_root)?;
        Ok(BlobStore { data_root, tmp_root })
    }

    /// Sharded on-disk path for a given uncompressed-content sha256 hex
    /// digest: the 64 hex characters split into 2-hex segments, all but
    /// the last forming directories.
    pub fn path_for(&self, sha256_hex: &str) -> DigResult<PathBuf> {
        if sha256_hex.len() != 64 || !sha256_hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DigError::validation(format!(
                "invalid sha256 hex: {sha256_hex}"
            )));
        }
        let mut path = self.data_root.clone();
        let chunks: Vec<&str> = sha256_hex
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect();
        for seg in &chunks[..chunks.len() - 1] {
            path.push(seg);
        }
        path.push(chunks[chunks.len() - 1]);
        Ok(path)
    }

    /// Compress `reader` while hashing its plaintext, write to a temp
    /// file, then atomically rename into place. Returns the hex sha256
    /// of the uncompressed content.
    pub fn put<R: Read>(&self, mut reader: R) -> DigResult<String> {
        let tmp_path = self.tmp_root.join(format!("put-{}", uniq_suffix()));
        let mut hasher = Sha256::new();
        {
            let tmp_file = File::create(&tmp_path)?;
            let mut encoder = GzEncoder::new(tmp_file, Compression::default());
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                encoder.write_all(&buf[..n])?;
            }
            encoder.finish()?;
        }

        let digest = hasher.finalize();
        let sha256_hex = hex::encode(digest);
        let dest = self.path_for(&sha256_hex)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp_path, &dest)?;
        Ok(sha256_hex)
    }

    pub fn put_bytes(&self, bytes: &[u8]) -> DigResult<String> {
        self.put(io::Cursor::new(bytes))
    }

    pub fn has(&self, sha256_hex: &str) -> DigResult<bool> {
        Ok(self.path_for(sha256_hex)?.is_file())
    }

    /// Size in bytes of the decompressed content, without materializing
    /// the full blob in memory.
    pub fn uncompressed_len(&self, sha256_hex: &str) -> DigResult<u64> {
        let path = self.path_for(sha256_hex)?;
        let file = File::open(&path).map_err(|_| {
            DigError::not_found(format!("blob {sha256_hex} not found"))
        })?;
        let mut decoder = GzDecoder::new(file);
        let mut count = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            count += n as u64;
        }
        Ok(count)
    }

    /// Gzip-compressed file size on disk.
    pub fn compressed_len(&self, sha256_hex: &str) -> DigResult<u64> {
        let path = self.path_for(sha256_hex)?;
        let meta = fs::metadata(&path).map_err(|_| {
            DigError::not_found(format!("blob {sha256_hex} not found"))
        })?;
        Ok(meta.len())
    }

    /// Read the full decompressed blob into memory. Convenience wrapper
    /// around [`Self::get`] for small files and tests.
    pub fn get_bytes(&self, sha256_hex: &str) -> DigResult<Vec<u8>> {
        let mut out = Vec::new();
        self.get(sha256_hex, None, None)?.read_to_end(&mut out)?;
        Ok(out)
    }

    /// Open a gunzipped read stream over the blob, bounded to the
    /// `[offset, offset+length)` window of the *compressed* on-disk
    /// file (§4.1). `not_found` if the blob is absent; `bad_range` if
    /// the window exceeds the compressed file size.
    pub fn get(
        &self,
        sha256_hex: &str,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> DigResult<GzReader> {
        let path = self.path_for(sha256_hex)?;
        let mut file = File::open(&path).map_err(|_| {
            DigError::not_found(format!("blob {sha256_hex} not found"))
        })?;
        let compressed_len = file.metadata()?.len();
        let start = offset.unwrap_or(0);
        let take_len = length.unwrap_or(compressed_len.saturating_sub(start));
        if start > compressed_len || start + take_len > compressed_len {
            return Err(DigError::validation(format!(
                "bad_range: offset {start} + length {take_len} exceeds compressed size {compressed_len}"
            )));
        }
        file.seek(SeekFrom::Start(start))?;
        Ok(GzDecoder::new(file.take(take_len)))
    }

    /// Read an exact `length`-byte window starting at `offset` bytes
    /// into the *decompressed* content (distinct from [`Self::get`],
    /// whose range is over the compressed on-disk file). Used by the
    /// challenge engine to read individual segments without
    /// materializing the whole blob (§4.5). `bad_range` if the window
    /// runs past the end of the decompressed content.
    pub fn read_decompressed_range(
        &self,
        sha256_hex: &str,
        offset: u64,
        length: u64,
    ) -> DigResult<Vec<u8>> {
        let path = self.path_for(sha256_hex)?;
        let file = File::open(&path).map_err(|_| {
            DigError::not_found(format!("blob {sha256_hex} not found"))
        })?;
        let mut decoder = GzDecoder::new(file);

        let mut discard = vec![0u8; 64 * 1024];
        let mut remaining = offset;
        while remaining > 0 {
            let want = remaining.min(discard.len() as u64) as usize;
            let n = decoder.read(&mut discard[..want])?;
            if n == 0 {
                return Err(DigError::validation(format!(
                    "bad_range: offset {offset} exceeds decompressed size of {sha256_hex}"
                )));
            }
            remaining -= n as u64;
        }

        let mut out = vec![0u8; length as usize];
        let mut filled = 0usize;
        while filled < out.len() {
            let n = decoder.read(&mut out[filled..])?;
            if n == 0 {
                return Err(DigError::validation(format!(
                    "bad_range: offset {offset} + length {length} exceeds decompressed size of {sha256_hex}"
                )));
            }
            filled += n;
        }
        Ok(out)
    }

    /// Decompress the full blob, re-hash it, and compare to its own
    /// sha256 path. Surfaces on-disk corruption (§4.1, §8).
    pub fn verify(&self, sha256_hex: &str) -> DigResult<bool> {
        let path = self.path_for(sha256_hex)?;
        let file = File::open(&path).map_err(|_| {
            DigError::not_found(format!("blob {sha256_hex} not found"))
        })?;
        let mut decoder = GzDecoder::new(file);
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        Ok(actual == sha256_hex)
    }
}

fn uniq_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("{nanos}-{:?}", std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_roundtrips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let digest = store.put_bytes(b"hello").unwrap();
        assert_eq!(
            digest,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(store.has(&digest).unwrap());
        let got = store.get_bytes(&digest).unwrap();
        assert_eq!(got, b"hello");
        assert!(store.verify(&digest).unwrap());
    }

    #[test]
    fn sharded_path_splits_into_two_hex_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let digest = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        let path = store.path_for(digest).unwrap();
        assert!(path.ends_with("24"));
        assert!(path.to_string_lossy().contains("/2c/f2/"));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let err = store.get_bytes(&"ab".repeat(32)).unwrap_err();
        assert!(matches!(err, DigError::NotFound(_)));
    }

    #[test]
    fn duplicate_puts_of_identical_content_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let d1 = store.put_bytes(b"same content").unwrap();
        let d2 = store.put_bytes(b"same content").unwrap();
        assert_eq!(d1, d2);
        assert_eq!(store.get_bytes(&d1).unwrap(), b"same content");
    }

    #[test]
    fn bad_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path()).unwrap();
        let digest = store.put_bytes(b"hello").unwrap();
        let compressed_len = store.compressed_len(&digest).unwrap();
        let err = store.get(&digest, Some(0), Some(compressed_len + 10)).unwrap_err();
        assert!(matches!(err, DigError::Validation(_)));
    }
}
