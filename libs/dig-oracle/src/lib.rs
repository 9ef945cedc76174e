//! Coin/Root Oracle adapter (§2 component 6, §4 supplement).
//!
//! The blockchain driver that actually mints, spends and queries coins
//! is an external collaborator; this crate only caches and refreshes
//! whatever history it reports through the [`RootHistorySource`] trait
//! boundary, and checks the local manifest against it.

use dig_errors::{ConflictKind, DigError, DigResult};
use dig_manifest::ManifestStore;
use std::sync::RwLock;

/// One entry of the on-chain root-history for a store (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootHistoryEntry {
    pub root_hash: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub height: u64,
    pub header_hash: String,
}

/// Implemented by the external blockchain driver. This crate never
/// talks to a chain directly; it only consumes what this trait reports.
pub trait RootHistorySource: Send + Sync {
    /// Full ordered root-history for `store_id`, oldest first.
    fn fetch_history(&self, store_id: &str) -> DigResult<Vec<RootHistoryEntry>>;
}

/// Refresh-on-demand cache over a store's on-chain root-history.
pub struct OracleCache<S: RootHistorySource> {
    store_id: String,
    source: S,
    cached: RwLock<Vec<RootHistoryEntry>>,
}

impl<S: RootHistorySource> OracleCache<S> {
    pub fn new(store_id: impl Into<String>, source: S) -> Self {
        OracleCache {
            store_id: store_id.into(),
            source,
            cached: RwLock::new(Vec::new()),
        }
    }

    /// Pull the current history through the trait boundary. Rejects a
    /// refresh that is not a prefix-consistent extension of what was
    /// previously cached (an on-chain reorg) with `ConflictKind::Reorg`.
    pub fn refresh(&self) -> DigResult<()> {
        let fresh = self.source.fetch_history(&self.store_id)?;
        let mut cached = self.cached.write().expect("oracle cache lock poisoned");
        if !cached.is_empty() {
            let still_prefix = cached
                .iter()
                .zip(fresh.iter())
                .all(|(old, new)| old.root_hash == new.root_hash);
            if !still_prefix || fresh.len() < cached.len() {
                return Err(DigError::conflict(ConflictKind::Reorg));
            }
        }
        *cached = fresh;
        Ok(())
    }

    /// The cached history as of the last [`Self::refresh`], without
    /// fetching again.
    pub fn history(&self) -> Vec<RootHistoryEntry> {
        self.cached.read().expect("oracle cache lock poisoned").clone()
    }

    /// The earliest entry in the cached history, if any: the store's
    /// creation anchor, persisted once by the engine as `height.json`.
    pub fn creation_anchor(&self) -> Option<RootHistoryEntry> {
        self.cached.read().expect("oracle cache lock poisoned").first().cloned()
    }

    /// §3's cross-process invariant: the local manifest must be a
    /// prefix of the cached on-chain history.
    pub fn is_local_prefix(&self, manifest: &ManifestStore) -> DigResult<bool> {
        let roots: Vec<String> = self
            .history()
            .into_iter()
            .map(|entry| entry.root_hash)
            .collect();
        manifest.is_prefix_of(&roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeSource {
        history: Mutex<Vec<RootHistoryEntry>>,
    }

    impl RootHistorySource for FakeSource {
        fn fetch_history(&self, _store_id: &str) -> DigResult<Vec<RootHistoryEntry>> {
            Ok(self.history.lock().unwrap().clone())
        }
    }

    fn entry(root: &str, height: u64) -> RootHistoryEntry {
        RootHistoryEntry {
            root_hash: root.to_string(),
            timestamp: chrono::Utc::now(),
            height,
            header_hash: "deadbeef".to_string(),
        }
    }

    #[test]
    fn refresh_populates_cache_and_creation_anchor() {
        let source = FakeSource {
            history: Mutex::new(vec![entry("aa", 1), entry("bb", 2)]),
        };
        let cache = OracleCache::new("store1", source);
        cache.refresh().unwrap();
        assert_eq!(cache.history().len(), 2);
        assert_eq!(cache.creation_anchor().unwrap().root_hash, "aa");
    }

    #[test]
    fn empty_history_is_valid() {
        let source = FakeSource { history: Mutex::new(Vec::new()) };
        let cache = OracleCache::new("store1", source);
        cache.refresh().unwrap();
        assert!(cache.history().is_empty());
        assert!(cache.creation_anchor().is_none());
    }

    #[test]
    fn non_extending_refresh_is_a_reorg_conflict() {
        let source = FakeSource {
            history: Mutex::new(vec![entry("aa", 1), entry("bb", 2)]),
        };
        let cache = OracleCache::new("store1", source);
        cache.refresh().unwrap();

        *cache.source.history.lock().unwrap() = vec![entry("aa", 1), entry("cc", 2)];
        let err = cache.refresh().unwrap_err();
        assert!(matches!(err, DigError::Conflict(ConflictKind::Reorg)));
    }

    #[test]
    fn manifest_prefix_check_delegates_to_manifest_store() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ManifestStore::new(dir.path()).unwrap();
        manifest.commit(&dig_manifest::Generation::empty()).unwrap();

        let source = FakeSource {
            history: Mutex::new(vec![entry(&dig_merkle::to_hex(&dig_merkle::EMPTY_ROOT), 0)]),
        };
        let cache = OracleCache::new("store1", source);
        cache.refresh().unwrap();
        assert!(cache.is_local_prefix(&manifest).unwrap());
    }
}
