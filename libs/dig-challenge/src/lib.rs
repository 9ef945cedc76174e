//! Challenge-response possession proofs (§4.5).
//!
//! A challenger picks a random seed and derives a deterministic set of
//! byte-range segments from it; the holder must read exactly those
//! segments of the plaintext and hash them. Because segment selection
//! is a pure function of the seed and the file's own length, a
//! responder who does not hold the full decompressed content cannot
//! reconstruct the right segments without downloading it first.

use dig_blob_store::BlobStore;
use dig_engine::Engine;
use dig_errors::{DigError, DigResult};
use num_bigint::BigUint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Fixed challenge shape for a given `(storeId, key, root)` triple.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeParams {
    pub store_id: String,
    pub key: String,
    pub root: String,
    pub segment_size: u64,
    pub segment_count: u32,
}

impl ChallengeParams {
    pub const DEFAULT_SEGMENT_SIZE: u64 = 1024;
    pub const DEFAULT_SEGMENT_COUNT: u32 = 10;

    pub fn new(store_id: impl Into<String>, key: impl Into<String>, root: impl Into<String>) -> Self {
        ChallengeParams {
            store_id: store_id.into(),
            key: key.into(),
            root: root.into(),
            segment_size: Self::DEFAULT_SEGMENT_SIZE,
            segment_count: Self::DEFAULT_SEGMENT_COUNT,
        }
    }
}

/// A generated challenge: the params plus the derived segment offsets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Challenge {
    #[serde(flatten)]
    pub params: ChallengeParams,
    pub seed: String,
    pub segments: Vec<u64>,
}

impl Challenge {
    pub fn to_json(&self) -> DigResult<String> {
        serde_json::to_string(self).map_err(|e| DigError::validation(e.to_string()))
    }

    pub fn from_json(raw: &str) -> DigResult<Self> {
        serde_json::from_str(raw).map_err(|e| DigError::validation(format!("malformed challenge: {e}")))
    }
}

/// 32 cryptographically random bytes, hex-encoded.
pub fn random_seed_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Derive `segments[i] = (SHA-256(seed) + i) mod (fileSize - segment_size)`
/// for `i in [0, segment_count)`.
pub fn generate(params: &ChallengeParams, seed_hex: &str, file_size: u64) -> DigResult<Challenge> {
    if file_size < params.segment_size {
        return Err(DigError::validation("file_too_small"));
    }
    let seed_bytes = hex::decode(seed_hex)
        .map_err(|_| DigError::validation(format!("invalid seed hex: {seed_hex}")))?;
    let r = BigUint::from_bytes_be(&Sha256::digest(&seed_bytes));
    let modulus = BigUint::from(file_size - params.segment_size);

    let mut segments = Vec::with_capacity(params.segment_count as usize);
    for i in 0..params.segment_count as u64 {
        let offset = (&r + i) % &modulus;
        // modulus fits in a u64 by construction, so the remainder does too.
        let digits = offset.to_u64_digits();
        segments.push(digits.first().copied().unwrap_or(0));
    }

    Ok(Challenge {
        params: params.clone(),
        seed: seed_hex.to_string(),
        segments,
    })
}

/// Read each challenged segment from the decompressed blob and hash
/// them in order into a single streaming digest (§4.5).
#[tracing::instrument(level = "debug", skip(blobs, challenge), fields(segments = challenge.segments.len()))]
pub fn respond(blobs: &BlobStore, content_sha256_hex: &str, challenge: &Challenge) -> DigResult<String> {
    let mut hasher = Sha256::new();
    for &offset in &challenge.segments {
        let bytes = blobs.read_decompressed_range(content_sha256_hex, offset, challenge.params.segment_size)?;
        hasher.update(&bytes);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Resolve `key` in `engine`'s current generation, then [`generate`] a
/// fresh challenge for it against a random seed. Returns the challenge
/// alongside the content sha256 the caller will need to pass to
/// [`respond`].
#[tracing::instrument(level = "debug", skip(engine))]
pub fn generate_for_key(engine: &Engine, store_id: &str, key_hex: &str) -> DigResult<(Challenge, String)> {
    let root = engine.current_root().to_string();
    let sha256_hex = engine.content_sha256(key_hex, None)?;
    let file_size = engine.blobs().uncompressed_len(&sha256_hex)?;
    let params = ChallengeParams::new(store_id, key_hex, root);
    let seed = random_seed_hex();
    let challenge = generate(&params, &seed, file_size)?;
    Ok((challenge, sha256_hex))
}

/// Constant-time comparison of two hex digest strings (§4.5).
pub fn verify(client_resp_hex: &str, server_resp_hex: &str) -> bool {
    let a = client_resp_hex.as_bytes();
    let b = server_resp_hex.as_bytes();
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_match_spec_scenario() {
        let params = ChallengeParams {
            store_id: "s".into(),
            key: "66".into(),
            root: "r".into(),
            segment_size: 1024,
            segment_count: 10,
        };
        let seed = "00".repeat(32);
        let challenge = generate(&params, &seed, 4096).unwrap();

        let r = BigUint::from_bytes_be(&Sha256::digest(hex::decode(&seed).unwrap()));
        let modulus = BigUint::from(3072u64);
        let expected: Vec<u64> = (0..10u64)
            .map(|i| (&r + i) % &modulus)
            .map(|v| v.to_u64_digits().first().copied().unwrap_or(0))
            .collect();
        assert_eq!(challenge.segments, expected);
    }

    #[test]
    fn file_too_small_is_rejected() {
        let params = ChallengeParams::new("s", "66", "r");
        let err = generate(&params, &"00".repeat(32), 100).unwrap_err();
        assert!(matches!(err, DigError::Validation(_)));
    }

    #[test]
    fn respond_then_verify_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = BlobStore::new(dir.path()).unwrap();
        let content = vec![7u8; 4096];
        let sha = blobs.put_bytes(&content).unwrap();

        let params = ChallengeParams::new("s", "66", "r");
        let seed = random_seed_hex();
        let challenge = generate(&params, &seed, 4096).unwrap();

        let server_resp = respond(&blobs, &sha, &challenge).unwrap();
        let client_resp = respond(&blobs, &sha, &challenge).unwrap();
        assert!(verify(&client_resp, &server_resp));
        assert!(!verify(&client_resp, &"00".repeat(32)));
    }

    #[test]
    fn challenge_json_round_trips() {
        let params = ChallengeParams::new("s", "66", "r");
        let challenge = generate(&params, &"11".repeat(32), 4096).unwrap();
        let json = challenge.to_json().unwrap();
        let back = Challenge::from_json(&json).unwrap();
        assert_eq!(challenge, back);
    }
}
