//! Replication Controller (§4.9): push and pull generations between
//! peers over the mTLS transport, with per-file integrity checks,
//! peer blacklisting, and single-flight-per-store concurrency.

use dashmap::DashMap;
use dig_blob_store::BlobStore;
use dig_errors::{ConflictKind, DigError, DigResult};
use dig_manifest::{FileEntry, Generation, ManifestStore};
use dig_merkle::{from_hex, leaf_digest, to_hex, Digest, MerkleTree};
use dig_transport::Transport;
use flate2::read::GzDecoder;
use sha2::{Digest as _, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::fs as tokio_fs;
use tokio::io::AsyncWriteExt;

pub mod signer;
pub use signer::{ownership_message, KeySigner};

const DEFAULT_UPLOAD_CONCURRENCY: usize = 10;

/// Response to a push preflight HEAD (§4.9 step 1, §6).
#[derive(Debug, Clone)]
pub struct PreflightInfo {
    pub store_exists: bool,
    pub root_hash_exists: bool,
    pub nonce: Option<String>,
    pub last_uploaded_hash: Option<String>,
    pub generation_index: u64,
}

pub struct ReplicationController {
    transport: Arc<Transport>,
    signer: Arc<dyn KeySigner>,
    upload_concurrency: usize,
    in_flight: DashMap<String, ()>,
}

/// Released on drop, enforcing the single-sync-task-per-store rule.
struct SingleFlightGuard<'a> {
    map: &'a DashMap<String, ()>,
    store_id: String,
}

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.store_id);
    }
}

impl ReplicationController {
    pub fn new(transport: Arc<Transport>, signer: Arc<dyn KeySigner>) -> Self {
        ReplicationController {
            transport,
            signer,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            in_flight: DashMap::new(),
        }
    }

    fn acquire_single_flight(&self, store_id: &str) -> DigResult<SingleFlightGuard<'_>> {
        if self.in_flight.insert(store_id.to_string(), ()).is_some() {
            return Err(DigError::resource(format!(
                "a replication task is already running for store {store_id}"
            )));
        }
        Ok(SingleFlightGuard { map: &self.in_flight, store_id: store_id.to_string() })
    }

    async fn preflight(&self, base_url: &str, store_id: &str, root_hex: &str) -> DigResult<PreflightInfo> {
        let url = format!("{base_url}/{store_id}?hasRootHash={root_hex}");
        let resp = self.transport.head(&url).await?;
        Ok(PreflightInfo {
            store_exists: resp.header("x-store-exists") == Some("true"),
            root_hash_exists: resp.header("x-has-root-hash") == Some("true"),
            nonce: resp.header("x-nonce").map(str::to_string),
            last_uploaded_hash: resp.header("x-last-uploaded-hash").map(str::to_string),
            generation_index: resp
                .header("x-generation-index")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
        })
    }

    fn classify_conflict(
        preflight: &PreflightInfo,
        generation: &Generation,
        local_generation_index: u64,
    ) -> DigResult<()> {
        if preflight.generation_index > local_generation_index {
            return Err(DigError::conflict(ConflictKind::RemoteAhead));
        }
        if preflight.generation_index == local_generation_index {
            match &preflight.last_uploaded_hash {
                Some(remote_root) if remote_root == &generation.root => {
                    return Err(DigError::conflict(ConflictKind::NoChange));
                }
                Some(remote_root) if remote_root != &generation.root => {
                    return Err(DigError::conflict(ConflictKind::Diverged));
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn open_session(&self, base_url: &str, store_id: &str, root_hex: &str, generation: &Generation) -> DigResult<String> {
        let url = format!("{base_url}/upload/{store_id}?roothash={root_hex}");
        let bytes = serde_json::to_vec(generation).map_err(|e| DigError::validation(e.to_string()))?;
        let resp = self
            .transport
            .post_multipart_file(&url, "generation", &format!("{root_hex}.dat"), bytes)
            .await?;
        resp.get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DigError::validation("upload session response missing sessionId"))
    }

    async fn upload_one_file(
        &self,
        base_url: &str,
        store_id: &str,
        session_id: &str,
        key: &str,
        entry: &FileEntry,
        blobs: &BlobStore,
    ) -> DigResult<()> {
        let head_url = format!("{base_url}/upload/{store_id}/{session_id}/{key}");
        let resp = self.transport.head(&head_url).await?;
        if resp.header("x-file-exists") == Some("true") {
            return Ok(());
        }
        let nonce = resp
            .header("x-nonce")
            .ok_or_else(|| DigError::validation("upload HEAD missing x-nonce"))?
            .to_string();

        let message = ownership_message(&nonce);
        let signature = self.signer.sign_hex(&message);
        let public_key = self.signer.public_key_hex();

        let mut headers = HashMap::new();
        headers.insert("x-nonce".to_string(), nonce);
        headers.insert("x-public-key".to_string(), public_key);
        headers.insert("x-key-ownership-sig".to_string(), signature);

        let put_url = format!("{base_url}/upload/{store_id}/{session_id}/{key}");
        let blob_path = blobs.path_for(&entry.sha256)?;
        let size = tokio_fs::metadata(&blob_path).await.map(|m| m.len()).unwrap_or(0);
        self.transport.put_stream(&put_url, &blob_path, headers).await?;
        dig_metrics::record_bytes_uploaded(size);
        Ok(())
    }

    async fn commit_session(&self, base_url: &str, store_id: &str, session_id: &str) -> DigResult<()> {
        let url = format!("{base_url}/commit/{store_id}/{session_id}");
        self.transport.post_json(&url, &serde_json::json!({})).await?;
        Ok(())
    }

    /// Push `generation` (already committed locally at `local_generation_index`)
    /// to the peer at `base_url` (§4.9).
    #[tracing::instrument(level = "info", skip(self, generation, blobs), fields(root = %generation.root))]
    pub async fn push(
        &self,
        base_url: &str,
        store_id: &str,
        generation: &Generation,
        local_generation_index: u64,
        blobs: &BlobStore,
    ) -> DigResult<()> {
        let _guard = self.acquire_single_flight(store_id)?;
        let preflight = self.preflight(base_url, store_id, &generation.root).await?;
        if preflight.root_hash_exists {
            return Ok(());
        }
        Self::classify_conflict(&preflight, generation, local_generation_index)?;

        let session_id = self.open_session(base_url, store_id, &generation.root, generation).await?;
        self.upload_files(base_url, store_id, &session_id, generation, blobs).await?;
        self.commit_session(base_url, store_id, &session_id).await
    }

    /// Upload just the newest generation's file set (§4.9 "head-only push").
    pub async fn push_head_only(
        &self,
        base_url: &str,
        store_id: &str,
        generation: &Generation,
        local_generation_index: u64,
        blobs: &BlobStore,
    ) -> DigResult<()> {
        self.push(base_url, store_id, generation, local_generation_index, blobs).await
    }

    async fn upload_files(
        &self,
        base_url: &str,
        store_id: &str,
        session_id: &str,
        generation: &Generation,
        blobs: &BlobStore,
    ) -> DigResult<()> {
        use futures::stream::{self, StreamExt};

        let files: Vec<(String, FileEntry)> =
            generation.files.iter().map(|(k, v)| (k.clone(), v.clone())).collect();

        let results: Vec<DigResult<()>> = stream::iter(files)
            .map(|(key, entry)| async move {
                self.upload_one_file(base_url, store_id, session_id, &key, &entry, blobs).await
            })
            .buffer_unordered(self.upload_concurrency)
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(())
    }

    /// Find whether a peer claims to hold `root_hex` for `store_id`.
    pub async fn peer_claims_root(&self, base_url: &str, store_id: &str, root_hex: &str) -> DigResult<bool> {
        let url = format!("{base_url}/{store_id}?hasRootHash={root_hex}");
        let resp = self.transport.head(&url).await?;
        Ok(resp.header("x-has-root-hash") == Some("true"))
    }

    /// Pull generation `root_hex` from the peer at `base_url` into
    /// `store_root` (§4.9). `blacklist` accumulates peer addresses that
    /// served corrupt data for this run; callers restart the file from
    /// a different peer and clear the blacklist once all queued roots
    /// have completed.
    #[tracing::instrument(level = "info", skip(self, blacklist))]
    pub async fn pull(
        &self,
        base_url: &str,
        store_id: &str,
        root_hex: &str,
        store_root: &Path,
        force_download: bool,
        blacklist: &DashMap<String, ()>,
    ) -> DigResult<()> {
        let _guard = self.acquire_single_flight(store_id)?;

        if blacklist.contains_key(base_url) {
            return Err(DigError::auth(format!("peer {base_url} is blacklisted for this run")));
        }

        let generation_url = format!("{base_url}/{store_id}/{root_hex}.dat");
        let generation_bytes = self.transport.get_with_retries(&generation_url).await?;
        let generation: Generation = serde_json::from_slice(&generation_bytes)
            .map_err(|e| DigError::validation(format!("malformed generation file: {e}")))?;

        let rebuilt_root = rebuild_root(&generation)?;
        if rebuilt_root != root_hex {
            return Err(DigError::integrity(format!(
                "tree_root_mismatch: rebuilt {rebuilt_root} != requested {root_hex}"
            )));
        }

        let blobs = BlobStore::new(store_root)?;
        for (key, entry) in &generation.files {
            if !force_download && blobs.has(&entry.sha256)? {
                continue;
            }
            self.pull_one_file(base_url, store_id, key, entry, &generation, root_hex, &blobs, blacklist)
                .await?;
        }

        let manifest = ManifestStore::new(store_root)?;
        manifest.commit(&generation)?;
        Ok(())
    }

    async fn pull_one_file(
        &self,
        base_url: &str,
        store_id: &str,
        key: &str,
        entry: &FileEntry,
        generation: &Generation,
        root_hex: &str,
        blobs: &BlobStore,
        blacklist: &DashMap<String, ()>,
    ) -> DigResult<()> {
        let file_url = format!("{base_url}/{store_id}/{key}");
        let bytes = self.transport.get_with_retries(&file_url).await?;

        // `bytes` is the gzip-compressed blob as stored on disk (§3/§6);
        // the manifest's sha256 is always over the decompressed content.
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut decompressed = Vec::new();
        let gunzip_ok = decoder.read_to_end(&mut decompressed).is_ok();
        let actual_sha256 = if gunzip_ok {
            hex::encode(Sha256::digest(&decompressed))
        } else {
            String::new()
        };
        let leaf = leaf_digest(key, &actual_sha256);
        let leaves: Vec<Digest> = generation
            .leaves
            .iter()
            .map(|h| from_hex(h))
            .collect::<DigResult<_>>()?;
        let tree = MerkleTree::build(&leaves);
        let integrity_ok = actual_sha256 == entry.sha256
            && tree.contains_leaf(&leaf)
            && to_hex(&tree.root()) == root_hex;

        if !integrity_ok {
            blacklist.insert(base_url.to_string(), ());
            dig_metrics::record_blacklist_event();
            return Err(DigError::integrity(format!(
                "peer {base_url} served corrupt content for key {key}"
            )));
        }
        dig_metrics::record_bytes_downloaded(bytes.len() as u64);

        let dest = blobs.path_for(&actual_sha256)?;
        if let Some(parent) = dest.parent() {
            tokio_fs::create_dir_all(parent).await.map_err(DigError::from)?;
        }
        let tmp_path = dest.with_extension("tmp-download");
        let mut tmp_file = tokio_fs::File::create(&tmp_path).await.map_err(DigError::from)?;
        tmp_file.write_all(&bytes).await.map_err(DigError::from)?;
        tmp_file.flush().await.map_err(DigError::from)?;
        tokio_fs::rename(&tmp_path, &dest).await.map_err(DigError::from)?;
        Ok(())
    }
}

fn rebuild_root(generation: &Generation) -> DigResult<String> {
    let leaves: Vec<Digest> = generation
        .leaves
        .iter()
        .map(|h| from_hex(h))
        .collect::<DigResult<_>>()?;
    Ok(to_hex(&MerkleTree::build(&leaves).root()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_message_matches_wire_format() {
        let msg = ownership_message("deadbeef");
        assert_eq!(msg, "Signing this message to prove ownership of key.\n\nNonce: deadbeef");
    }

    #[test]
    fn classify_conflict_flags_remote_ahead() {
        let generation = Generation::empty();
        let preflight = PreflightInfo {
            store_exists: true,
            root_hash_exists: false,
            nonce: None,
            last_uploaded_hash: None,
            generation_index: 5,
        };
        let err = ReplicationController::classify_conflict(&preflight, &generation, 2).unwrap_err();
        assert!(matches!(err, DigError::Conflict(ConflictKind::RemoteAhead)));
    }

    #[test]
    fn classify_conflict_flags_no_change() {
        let generation = Generation::empty();
        let preflight = PreflightInfo {
            store_exists: true,
            root_hash_exists: false,
            nonce: None,
            last_uploaded_hash: Some(generation.root.clone()),
            generation_index: 2,
        };
        let err = ReplicationController::classify_conflict(&preflight, &generation, 2).unwrap_err();
        assert!(matches!(err, DigError::Conflict(ConflictKind::NoChange)));
    }

    #[test]
    fn classify_conflict_allows_diverged_at_equal_index() {
        let generation = Generation::empty();
        let preflight = PreflightInfo {
            store_exists: true,
            root_hash_exists: false,
            nonce: None,
            last_uploaded_hash: Some("ff".repeat(32)),
            generation_index: 2,
        };
        let err = ReplicationController::classify_conflict(&preflight, &generation, 2).unwrap_err();
        assert!(matches!(err, DigError::Conflict(ConflictKind::Diverged)));
    }

    #[test]
    fn pulled_bytes_are_gunzipped_before_hashing() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let plaintext = b"dig file content served by a peer".to_vec();
        let expected_sha256 = hex::encode(Sha256::digest(&plaintext));

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plaintext).unwrap();
        let compressed = encoder.finish().unwrap();

        // hashing the compressed stream directly must NOT match — this is
        // the exact bug `pull_one_file` has to avoid.
        assert_ne!(hex::encode(Sha256::digest(&compressed)), expected_sha256);

        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(hex::encode(Sha256::digest(&decompressed)), expected_sha256);
    }
}
