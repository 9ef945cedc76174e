//! Data Integrity Engine (§4.4): orchestrates ingestion, commit, lookup,
//! cross-root validation and diff on top of the blob store, Merkle tree
//! and generation manifest.

use dig_blob_store::BlobStore;
use dig_errors::{DigError, DigResult};
use dig_manifest::{FileEntry, Generation, ManifestStore};
use dig_merkle::{from_hex, leaf_digest, to_hex, Digest, MerkleTree, ProofEnvelope};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// `height.json`: the store's on-chain creation anchor (§3 supplement).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeightRecord {
    pub height: u64,
    pub hash: String,
}

/// Result of [`Engine::diff`]: the symmetric difference of two
/// generations' `(key -> sha256)` maps (§4.4, §8).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationDiff {
    pub added: BTreeMap<String, String>,
    pub removed: BTreeMap<String, String>,
}

pub struct Engine {
    store_root: PathBuf,
    blobs: BlobStore,
    manifest: ManifestStore,
    /// The working (not-yet-committed) generation, seeded from the
    /// latest committed one at open time.
    working: Generation,
}

impl Engine {
    pub fn open(store_root: impl AsRef<Path>) -> DigResult<Self> {
        let store_root = store_root.as_ref().to_path_buf();
        fs::create_dir_all(&store_root)?;
        let blobs = BlobStore::new(&store_root)?;
        let manifest = ManifestStore::new(&store_root)?;
        let working = manifest.load_latest()?;
        Ok(Engine {
            store_root,
            blobs,
            manifest,
            working,
        })
    }

    pub fn height_path(&self) -> PathBuf {
        self.store_root.join("height.json")
    }

    pub fn load_height(&self) -> DigResult<Option<HeightRecord>> {
        let path = self.height_path();
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        Ok(Some(
            serde_json::from_str(&raw).map_err(|e| DigError::validation(e.to_string()))?,
        ))
    }

    pub fn save_height(&self, record: &HeightRecord) -> DigResult<()> {
        let raw = serde_json::to_string(record).map_err(|e| DigError::validation(e.to_string()))?;
        fs::write(self.height_path(), raw)?;
        Ok(())
    }

    /// Insert or replace `key`'s content from `reader`. A no-op if the
    /// key already maps to identical content.
    #[tracing::instrument(level = "debug", skip(self, reader))]
    pub fn upsert<R: Read>(&mut self, key_hex: &str, reader: R) -> DigResult<String> {
        validate_hex(key_hex)?;
        let sha256_hex = self.blobs.put(reader)?;

        if let Some(existing) = self.working.files.get(key_hex) {
            if existing.sha256 == sha256_hex {
                return Ok(sha256_hex);
            }
        }

        let leaf = leaf_digest(key_hex, &sha256_hex);
        self.working.files.insert(
            key_hex.to_string(),
            FileEntry {
                hash: to_hex(&leaf),
                sha256: sha256_hex.clone(),
            },
        );
        self.rebuild_working_root();
        tracing::debug!(key_hex, sha256 = %sha256_hex, "ingested blob");
        Ok(sha256_hex)
    }

    pub fn delete(&mut self, key_hex: &str) -> DigResult<()> {
        if self.working.files.remove(key_hex).is_none() {
            return Err(DigError::not_found(format!("key not found: {key_hex}")));
        }
        self.rebuild_working_root();
        Ok(())
    }

    fn rebuild_working_root(&mut self) {
        let leaves = self.current_leaf_digests(&self.working);
        let root = MerkleTree::build(&leaves).root();
        self.working.root = to_hex(&root);
        self.working.leaves = leaves.iter().map(to_hex).collect();
    }

    fn current_leaf_digests(&self, generation: &Generation) -> Vec<Digest> {
        generation
            .files
            .iter()
            .map(|(k, v)| leaf_digest(k, &v.sha256))
            .collect()
    }

    fn resolve_generation(&self, root_hex: Option<&str>) -> DigResult<Generation> {
        match root_hex {
            None => Ok(self.working.clone()),
            Some(root) => {
                if root == self.working.root {
                    Ok(self.working.clone())
                } else {
                    self.manifest.load_generation(root)
                }
            }
        }
    }

    pub fn list_keys(&self, root_hex: Option<&str>) -> DigResult<Vec<String>> {
        let generation = self.resolve_generation(root_hex)?;
        Ok(generation.files.keys().cloned().collect())
    }

    pub fn has_key(&self, key_hex: &str, root_hex: Option<&str>) -> DigResult<bool> {
        let generation = self.resolve_generation(root_hex)?;
        match generation.files.get(key_hex) {
            Some(entry) => self.blobs.has(&entry.sha256),
            None => Ok(false),
        }
    }

    /// The content sha256 a key currently resolves to, without reading
    /// the blob itself.
    pub fn content_sha256(&self, key_hex: &str, root_hex: Option<&str>) -> DigResult<String> {
        let generation = self.resolve_generation(root_hex)?;
        generation
            .files
            .get(key_hex)
            .map(|entry| entry.sha256.clone())
            .ok_or_else(|| DigError::not_found(format!("key not found: {key_hex}")))
    }

    /// Stream a key's content from its current or historical generation.
    pub fn read(
        &self,
        key_hex: &str,
        root_hex: Option<&str>,
        offset: Option<u64>,
        length: Option<u64>,
    ) -> DigResult<dig_blob_store::GzReader> {
        let generation = self.resolve_generation(root_hex)?;
        let entry = generation
            .files
            .get(key_hex)
            .ok_or_else(|| DigError::not_found(format!("key not found: {key_hex}")))?;
        self.blobs.get(&entry.sha256, offset, length)
    }

    pub fn prove(
        &self,
        key_hex: &str,
        content_sha256_hex: &str,
        root_hex: Option<&str>,
    ) -> DigResult<ProofEnvelope> {
        let generation = self.resolve_generation(root_hex)?;
        let leaves = self.current_leaf_digests(&generation);
        let tree = MerkleTree::build(&leaves);
        let leaf = leaf_digest(key_hex, content_sha256_hex);
        let siblings = tree
            .proof(&leaf)
            .ok_or_else(|| DigError::not_found(format!("leaf not present for key {key_hex}")))?;
        let root = from_hex(&generation.root)?;
        Ok(ProofEnvelope::new(key_hex, &root, &siblings))
    }

    pub fn verify_proof(proof_json: &str, content_sha256_hex: &str) -> DigResult<bool> {
        let envelope = ProofEnvelope::from_json(proof_json)?;
        let leaf = leaf_digest(&envelope.key, content_sha256_hex);
        let root = envelope.root()?;
        let siblings = envelope.siblings()?;
        Ok(dig_merkle::verify(&siblings, &leaf, &root))
    }

    /// Gunzip+hash the blob and confirm its content hash is registered
    /// against some key in the named generation (§4.4).
    pub fn verify_blob(&self, content_sha256_hex: &str, root_hex: &str) -> DigResult<bool> {
        if !self.blobs.verify(content_sha256_hex)? {
            return Ok(false);
        }
        let generation = self.resolve_generation(Some(root_hex))?;
        Ok(generation
            .files
            .values()
            .any(|entry| entry.sha256 == content_sha256_hex))
    }

    /// Validate a `(key, content_sha256)` pair against a generation
    /// downloaded from a peer, rebuilding its root from its own leaves
    /// and comparing to `expected_root` before trusting leaf presence
    /// (§4.4; used to validate pulled objects before they are trusted).
    pub fn validate_key_in_foreign_tree(
        key_hex: &str,
        content_sha256_hex: &str,
        foreign_generation: &Generation,
        expected_root_hex: &str,
    ) -> DigResult<bool> {
        let leaves: Vec<Digest> = foreign_generation
            .leaves
            .iter()
            .map(|h| from_hex(h))
            .collect::<DigResult<_>>()?;
        let rebuilt_root = to_hex(&MerkleTree::build(&leaves).root());
        if rebuilt_root != expected_root_hex {
            return Ok(false);
        }
        let leaf = leaf_digest(key_hex, content_sha256_hex);
        let tree = MerkleTree::build(&leaves);
        Ok(tree.contains_leaf(&leaf))
    }

    pub fn diff(&self, root_a_hex: &str, root_b_hex: &str) -> DigResult<GenerationDiff> {
        let a = self.resolve_generation(Some(root_a_hex))?;
        let b = self.resolve_generation(Some(root_b_hex))?;
        let a_map: HashMap<&str, &str> = a
            .files
            .iter()
            .map(|(k, v)| (k.as_str(), v.sha256.as_str()))
            .collect();
        let b_map: HashMap<&str, &str> = b
            .files
            .iter()
            .map(|(k, v)| (k.as_str(), v.sha256.as_str()))
            .collect();

        let mut diff = GenerationDiff::default();
        for (k, v) in &b_map {
            match a_map.get(k) {
                Some(av) if av == v => {}
                _ => {
                    diff.added.insert(k.to_string(), v.to_string());
                }
            }
        }
        for (k, v) in &a_map {
            match b_map.get(k) {
                Some(bv) if bv == v => {}
                _ => {
                    diff.removed.insert(k.to_string(), v.to_string());
                }
            }
        }
        Ok(diff)
    }

    /// Commit the working generation. No-op (per §4.3) if the working
    /// root equals the last committed non-empty root.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn commit(&mut self) -> DigResult<String> {
        let committed = self.manifest.commit(&self.working)?;
        if !committed {
            return Err(DigError::validation("no_change_to_commit"));
        }
        tracing::info!(root = %self.working.root, "committed generation");
        Ok(self.working.root.clone())
    }

    pub fn current_root(&self) -> &str {
        &self.working.root
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.manifest
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }
}

fn validate_hex(s: &str) -> DigResult<()> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DigError::validation(format!("invalid_hex: {s}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(dir.path()).unwrap();
        engine.upsert("66", std::io::Cursor::new(b"hello")).unwrap();
        engine.commit().unwrap();
        let mut out = Vec::new();
        engine.read("66", None, None, None).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn upsert_same_content_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(dir.path()).unwrap();
        engine.upsert("66", std::io::Cursor::new(b"hello")).unwrap();
        let root1 = engine.current_root().to_string();
        engine.upsert("66", std::io::Cursor::new(b"hello")).unwrap();
        assert_eq!(engine.current_root(), root1);
    }

    #[test]
    fn diff_reports_symmetric_difference() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(dir.path()).unwrap();
        engine.upsert("66", std::io::Cursor::new(b"hello")).unwrap();
        engine.upsert("67", std::io::Cursor::new(b"world")).unwrap();
        engine.commit().unwrap();
        let root1 = engine.current_root().to_string();

        engine.upsert("67", std::io::Cursor::new(b"!")).unwrap();
        engine.commit().unwrap();
        let root2 = engine.current_root().to_string();

        let diff = engine.diff(&root1, &root2).unwrap();
        let world_sha = hex::encode(sha2::Sha256::digest(b"world"));
        let bang_sha = hex::encode(sha2::Sha256::digest(b"!"));
        assert_eq!(diff.added.get("67"), Some(&bang_sha));
        assert_eq!(diff.removed.get("67"), Some(&world_sha));
        assert!(!diff.added.contains_key("66"));
    }

    #[test]
    fn prove_and_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(dir.path()).unwrap();
        let sha = engine.upsert("66", std::io::Cursor::new(b"hello")).unwrap();
        engine.commit().unwrap();
        let proof = engine.prove("66", &sha, None).unwrap();
        let json = proof.to_json().unwrap();
        assert!(Engine::verify_proof(&json, &sha).unwrap());
        assert!(!Engine::verify_proof(&json, &hex::encode(sha2::Sha256::digest(b"other"))).unwrap());
    }

    #[test]
    fn delete_missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = Engine::open(dir.path()).unwrap();
        assert!(matches!(engine.delete("aa").unwrap_err(), DigError::NotFound(_)));
    }

    use sha2::Digest as _;
}
