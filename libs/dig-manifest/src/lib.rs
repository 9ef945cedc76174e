//! Generation manifest and per-generation snapshot files (§4.3).
//!
//! `manifest.dat` is a newline-separated, append-only list of committed
//! root hashes. Each committed root also gets a `<root>.dat` snapshot
//! holding the full `{root, leaves, files}` tree for that generation.
//! Rollback is not supported: the manifest only grows.

use dig_errors::{DigError, DigResult};
use dig_merkle::{from_hex, to_hex, Digest, EMPTY_ROOT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// One key's entry in a generation: its leaf digest and content hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Hex leaf digest, `SHA-256(key_hex || "/" || sha256_hex)`.
    pub hash: String,
    /// Hex SHA-256 of the file's uncompressed content.
    pub sha256: String,
}

/// A committed generation snapshot: `<rootHash>.dat` (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generation {
    pub root: String,
    pub leaves: Vec<String>,
    pub files: HashMap<String, FileEntry>,
}

impl Generation {
    pub fn empty() -> Self {
        Generation {
            root: to_hex(&EMPTY_ROOT),
            leaves: Vec::new(),
            files: HashMap::new(),
        }
    }

    pub fn is_empty_sentinel(&self) -> bool {
        self.root == to_hex(&EMPTY_ROOT)
    }

    fn leaf_digests(&self) -> DigResult<Vec<Digest>> {
        self.leaves.iter().map(|h| from_hex(h)).collect()
    }
}

/// Manages `manifest.dat` and the `<root>.dat` generation files beneath
/// a single store's directory.
pub struct ManifestStore {
    store_root: PathBuf,
}

impl ManifestStore {
    pub fn new(store_root: impl AsRef<Path>) -> DigResult<Self> {
        let store_root = store_root.as_ref().to_path_buf();
        fs::create_dir_all(&store_root)?;
        Ok(ManifestStore { store_root })
    }

    fn manifest_path(&self) -> PathBuf {
        self.store_root.join("manifest.dat")
    }

    fn generation_path(&self, root_hex: &str) -> PathBuf {
        self.store_root.join(format!("{root_hex}.dat"))
    }

    /// Ordered list of committed root hashes, oldest first. Empty if no
    /// commit has ever happened.
    pub fn roots(&self) -> DigResult<Vec<String>> {
        let path = self.manifest_path();
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        Ok(raw.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }

    /// The most recently committed root, if any.
    pub fn latest_root(&self) -> DigResult<Option<String>> {
        Ok(self.roots()?.into_iter().last())
    }

    /// Load the generation file for `root_hex`. `NotFound` if the
    /// `<root>.dat` file is missing, which the engine treats as a
    /// partially-synced generation (§4.3).
    pub fn load_generation(&self, root_hex: &str) -> DigResult<Generation> {
        let path = self.generation_path(root_hex);
        if !path.is_file() {
            return Err(DigError::not_found(format!(
                "generation file missing for root {root_hex}"
            )));
        }
        let raw = fs::read_to_string(&path)?;
        serde_json::from_str(&raw).map_err(|e| {
            DigError::validation(format!("malformed generation file {root_hex}: {e}"))
        })
    }

    /// Load the latest committed generation, or the empty generation if
    /// nothing has been committed yet.
    pub fn load_latest(&self) -> DigResult<Generation> {
        match self.latest_root()? {
            Some(root) => self.load_generation(&root),
            None => Ok(Generation::empty()),
        }
    }

    /// A generation is fully synced locally iff its snapshot file exists
    /// and every blob it names is present (the blob-presence half of
    /// this check belongs to the engine, which owns the blob store).
    pub fn generation_file_exists(&self, root_hex: &str) -> bool {
        self.generation_path(root_hex).is_file()
    }

    /// Append `generation` as the new latest commit, unless its root
    /// equals the current latest non-empty root (no-op commit, §4.3).
    /// Returns `true` if a new generation was actually committed.
    pub fn commit(&self, generation: &Generation) -> DigResult<bool> {
        let tree = dig_merkle::MerkleTree::build(&generation.leaf_digests()?);
        let computed_root = to_hex(&tree.root());
        if computed_root != generation.root {
            return Err(DigError::validation(format!(
                "tree_root_mismatch: computed {computed_root}, generation claims {}",
                generation.root
            )));
        }

        let latest = self.latest_root()?;
        if let Some(latest_root) = &latest {
            if latest_root == &generation.root && !generation.is_empty_sentinel() {
                return Ok(false);
            }
        }

        let _lock = ManifestLock::acquire(&self.store_root)?;

        let gen_path = self.generation_path(&generation.root);
        let raw = serde_json::to_string(generation)
            .map_err(|e| DigError::validation(e.to_string()))?;
        fs::write(&gen_path, raw)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.manifest_path())?;
        writeln!(file, "{}", generation.root)?;
        file.sync_data()?;

        Ok(true)
    }

    /// Verify §3's cross-process invariant: the local manifest must be
    /// a prefix of the authoritative on-chain root-history.
    pub fn is_prefix_of(&self, on_chain_history: &[String]) -> DigResult<bool> {
        let local = self.roots()?;
        if local.len() > on_chain_history.len() {
            return Ok(false);
        }
        Ok(local.iter().zip(on_chain_history.iter()).all(|(a, b)| a == b))
    }
}

/// Advisory, cross-process exclusive lock over the manifest append
/// window (§5). Held for the duration of a single `commit()`; renewed
/// roughly every `renewal` if a caller holds it across a longer
/// operation, with a stale-lock horizon past which a watchdog may
/// reclaim it.
pub struct ManifestLock {
    file: File,
    acquired_at: Instant,
    last_renewed: Instant,
}

impl ManifestLock {
    pub const DEFAULT_RENEWAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_STALE_HORIZON: Duration = Duration::from_secs(180);

    pub fn acquire(store_root: &Path) -> DigResult<Self> {
        use fs2::FileExt;
        let lock_path = store_root.join(".manifest.lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()
            .map_err(|e| DigError::resource(format!("could not acquire manifest lock: {e}")))?;
        let now = Instant::now();
        Ok(ManifestLock {
            file,
            acquired_at: now,
            last_renewed: now,
        })
    }

    pub fn renew(&mut self) {
        self.last_renewed = Instant::now();
    }

    pub fn is_stale(&self, horizon: Duration) -> bool {
        self.last_renewed.elapsed() > horizon
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        use fs2::FileExt;
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dig_merkle::leaf_digest;

    fn gen_with_keys(keys_and_content: &[(&str, &str)]) -> Generation {
        let mut files = HashMap::new();
        let mut leaves = Vec::new();
        for (key, content) in keys_and_content {
            let sha256 = hex::encode(sha2::Sha256::digest(content.as_bytes()));
            let leaf = leaf_digest(key, &sha256);
            files.insert(
                key.to_string(),
                FileEntry {
                    hash: to_hex(&leaf),
                    sha256,
                },
            );
            leaves.push(to_hex(&leaf));
        }
        let digests: Vec<Digest> = leaves.iter().map(|h| from_hex(h).unwrap()).collect();
        let root = to_hex(&dig_merkle::MerkleTree::build(&digests).root());
        Generation { root, leaves, files }
    }

    use sha2::Digest as _;

    #[test]
    fn empty_store_commit_persists_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        let committed = manifest.commit(&Generation::empty()).unwrap();
        assert!(committed);
        let roots = manifest.roots().unwrap();
        assert_eq!(roots, vec![to_hex(&EMPTY_ROOT)]);
    }

    #[test]
    fn no_op_commit_when_root_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        let gen = gen_with_keys(&[("66", "hello")]);
        assert!(manifest.commit(&gen).unwrap());
        assert!(!manifest.commit(&gen).unwrap());
        assert_eq!(manifest.roots().unwrap().len(), 1);
    }

    #[test]
    fn sequential_commits_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        let gen1 = gen_with_keys(&[("66", "hello")]);
        let gen2 = gen_with_keys(&[("66", "hello"), ("67", "world")]);
        manifest.commit(&gen1).unwrap();
        manifest.commit(&gen2).unwrap();
        let roots = manifest.roots().unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0], gen1.root);
        assert_eq!(roots[1], gen2.root);
        assert_eq!(manifest.latest_root().unwrap().unwrap(), gen2.root);
    }

    #[test]
    fn manifest_is_prefix_of_on_chain_history() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        let gen1 = gen_with_keys(&[("66", "hello")]);
        manifest.commit(&gen1).unwrap();
        let history = vec![gen1.root.clone(), "deadbeef".repeat(8)];
        assert!(manifest.is_prefix_of(&history).unwrap());
        assert!(!manifest.is_prefix_of(&[]).unwrap());
    }

    #[test]
    fn missing_generation_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        let err = manifest.load_generation(&"ab".repeat(32)).unwrap_err();
        assert!(matches!(err, DigError::NotFound(_)));
    }
}
