//! Canonical sorted-pair SHA-256 Merkle tree.
//!
//! Leaves are hashed and sorted before the tree is built, so
//! `build(permutation) == build(sorted)` for any permutation of the same
//! leaf multiset (§8). Internal nodes combine children with
//! `SHA-256(sort(left, right))`, which makes verification independent of
//! left/right position: a proof is just an ordered list of sibling
//! digests, combined one at a time with the running hash.

use dig_errors::{DigError, DigResult};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::HashMap;

/// A 32-byte tree node (leaf or internal hash).
pub type Digest = [u8; 32];

/// Sentinel root for an empty tree (§3, §4.2): not a real hash, an
/// explicit all-zero marker.
pub const EMPTY_ROOT: Digest = [0u8; 32];

fn sha256(bytes: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut d = [0u8; 32];
    d.copy_from_slice(&out);
    d
}

/// Combine two nodes order-independently: `SHA-256(sort(left, right))`.
pub fn hash_pair(a: &Digest, b: &Digest) -> Digest {
    if a <= b {
        sha256(&[a.as_slice(), b.as_slice()].concat())
    } else {
        sha256(&[b.as_slice(), a.as_slice()].concat())
    }
}

/// `SHA-256(key_hex || "/" || content_sha256_hex)`, the unit inserted
/// into the tree (§3).
pub fn leaf_digest(key_hex: &str, content_sha256_hex: &str) -> Digest {
    let mut s = String::with_capacity(key_hex.len() + 1 + content_sha256_hex.len());
    s.push_str(key_hex);
    s.push('/');
    s.push_str(content_sha256_hex);
    sha256(s.as_bytes())
}

pub fn to_hex(d: &Digest) -> String {
    hex::encode(d)
}

pub fn from_hex(s: &str) -> DigResult<Digest> {
    let bytes = hex::decode(s).map_err(|e| DigError::validation(format!("invalid hex: {e}")))?;
    if bytes.len() != 32 {
        return Err(DigError::validation(format!(
            "expected 32-byte digest, got {} bytes",
            bytes.len()
        )));
    }
    let mut d = [0u8; 32];
    d.copy_from_slice(&bytes);
    Ok(d)
}

/// A built Merkle tree: `levels[0]` is the sorted leaf set, each
/// subsequent level is the sorted-pair reduction of the one below, and
/// the last level holds exactly one node: the root.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
    leaf_index: HashMap<Digest, usize>,
}

impl MerkleTree {
    /// Build a tree from an unordered set of leaves. Rebuilds from
    /// scratch every time; there is no incremental update (§4.2).
    pub fn build(leaves: &[Digest]) -> Self {
        if leaves.is_empty() {
            return MerkleTree {
                levels: vec![vec![EMPTY_ROOT]],
                leaf_index: HashMap::new(),
            };
        }

        let mut sorted = leaves.to_vec();
        sorted.sort();

        let mut leaf_index = HashMap::with_capacity(sorted.len());
        for (i, l) in sorted.iter().enumerate() {
            leaf_index.insert(*l, i);
        }

        let mut levels = vec![sorted.clone()];
        let mut level = sorted;
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut i = 0;
            while i < level.len() {
                if i + 1 < level.len() {
                    next.push(hash_pair(&level[i], &level[i + 1]));
                } else {
                    next.push(level[i]);
                }
                i += 2;
            }
            levels.push(next.clone());
            level = next;
        }

        MerkleTree { levels, leaf_index }
    }

    /// The Merkle root, or [`EMPTY_ROOT`] for an empty tree.
    pub fn root(&self) -> Digest {
        *self.levels.last().expect("levels is never empty")
            .first()
            .expect("top level always has exactly one node")
    }

    /// Sibling digests from `leaf` to the root, in order. `None` if the
    /// leaf is not present in this tree.
    pub fn proof(&self, leaf: &Digest) -> Option<Vec<Digest>> {
        let mut idx = *self.leaf_index.get(leaf)?;
        let mut proof = Vec::new();
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = if idx % 2 == 0 { idx + 1 } else { idx - 1 };
            if sibling_idx < level.len() {
                proof.push(level[sibling_idx]);
            }
            idx /= 2;
        }
        Some(proof)
    }

    pub fn leaves(&self) -> &[Digest] {
        &self.levels[0]
    }

    pub fn contains_leaf(&self, leaf: &Digest) -> bool {
        self.leaf_index.contains_key(leaf)
    }
}

/// Reconstruct a root from a leaf and its proof, and compare to `root`.
/// Succeeds only when the recomputed root matches exactly (§4.2, §8).
pub fn verify(proof: &[Digest], leaf: &Digest, root: &Digest) -> bool {
    let mut current = *leaf;
    for sibling in proof {
        current = hash_pair(&current, sibling);
    }
    current == *root
}

/// A serialized Merkle proof: `{ key, rootHash, proof }`, with `proof`
/// the concatenation of fixed-width 32-byte sibling digests in hex
/// (§4.2).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProofEnvelope {
    pub key: String,
    #[serde(rename = "rootHash")]
    pub root_hash: String,
    pub proof: String,
}

impl ProofEnvelope {
    pub fn new(key: &str, root: &Digest, siblings: &[Digest]) -> Self {
        let mut proof_hex = String::with_capacity(siblings.len() * 64);
        for s in siblings {
            proof_hex.push_str(&to_hex(s));
        }
        ProofEnvelope {
            key: key.to_string(),
            root_hash: to_hex(root),
            proof: proof_hex,
        }
    }

    pub fn siblings(&self) -> DigResult<Vec<Digest>> {
        if self.proof.len() % 64 != 0 {
            return Err(DigError::validation(
                "proof hex length is not a multiple of 64",
            ));
        }
        let mut out = Vec::with_capacity(self.proof.len() / 64);
        for chunk in self.proof.as_bytes().chunks(64) {
            let chunk_str = std::str::from_utf8(chunk)
                .map_err(|_| DigError::validation("proof is not valid UTF-8"))?;
            out.push(from_hex(chunk_str)?);
        }
        Ok(out)
    }

    pub fn root(&self) -> DigResult<Digest> {
        from_hex(&self.root_hash)
    }

    pub fn to_json(&self) -> DigResult<String> {
        serde_json::to_string(self).map_err(|e| DigError::validation(e.to_string()))
    }

    pub fn from_json(s: &str) -> DigResult<Self> {
        serde_json::from_str(s).map_err(|e| DigError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(byte: u8) -> Digest {
        let mut x = [0u8; 32];
        x[31] = byte;
        x
    }

    #[test]
    fn empty_tree_root_is_sentinel() {
        let t = MerkleTree::build(&[]);
        assert_eq!(t.root(), EMPTY_ROOT);
    }

    #[test]
    fn single_leaf_root_equals_leaf() {
        let leaf = leaf_digest("66", "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824");
        let t = MerkleTree::build(&[leaf]);
        assert_eq!(t.root(), leaf);
        let proof = t.proof(&leaf).unwrap();
        assert!(proof.is_empty());
        assert!(verify(&proof, &leaf, &t.root()));
    }

    #[test]
    fn build_is_permutation_invariant() {
        let leaves: Vec<Digest> = (0..7).map(d).collect();
        let mut shuffled = leaves.clone();
        shuffled.reverse();
        let shuffled2 = vec![
            leaves[3], leaves[0], leaves[6], leaves[1], leaves[5], leaves[2], leaves[4],
        ];

        let r1 = MerkleTree::build(&leaves).root();
        let r2 = MerkleTree::build(&shuffled).root();
        let r3 = MerkleTree::build(&shuffled2).root();
        assert_eq!(r1, r2);
        assert_eq!(r1, r3);
    }

    #[test]
    fn proof_soundness_for_every_leaf_odd_count() {
        let leaves: Vec<Digest> = (0..5).map(d).collect();
        let tree = MerkleTree::build(&leaves);
        let root = tree.root();
        for leaf in &leaves {
            let proof = tree.proof(leaf).expect("leaf present");
            assert!(verify(&proof, leaf, &root));
        }
    }

    #[test]
    fn proof_fails_for_wrong_leaf() {
        let leaves: Vec<Digest> = (0..4).map(d).collect();
        let tree = MerkleTree::build(&leaves);
        let root = tree.root();
        let proof = tree.proof(&leaves[0]).unwrap();
        let wrong_leaf = d(99);
        assert!(!verify(&proof, &wrong_leaf, &root));
    }

    #[test]
    fn proof_envelope_roundtrips_through_hex_json() {
        let leaves: Vec<Digest> = (0..3).map(d).collect();
        let tree = MerkleTree::build(&leaves);
        let root = tree.root();
        let siblings = tree.proof(&leaves[1]).unwrap();
        let env = ProofEnvelope::new("61", &root, &siblings);
        let json = env.to_json().unwrap();
        let parsed = ProofEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed.siblings().unwrap(), siblings);
        assert_eq!(parsed.root().unwrap(), root);
        assert!(verify(&parsed.siblings().unwrap(), &leaves[1], &parsed.root().unwrap()));
    }
}
