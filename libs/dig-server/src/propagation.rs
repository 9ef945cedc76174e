//! Propagation server (§6): write-side endpoints a pushing peer drives
//! through preflight, upload, and commit.

use crate::{bytes_response, random_nonce_hex, reject, with_state, ServerState, UploadSession};
use bytes::Buf;
use dig_blob_store::BlobStore;
use dig_engine::Engine;
use dig_errors::DigError;
use dig_manifest::{Generation, ManifestStore};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures::TryStreamExt;
use serde::Deserialize;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// 1 GiB: generous enough for a generation snapshot or a single blob
/// upload without letting an unbounded body exhaust memory.
const MAX_BODY_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct HasRootHashQuery {
    #[serde(rename = "hasRootHash")]
    has_root_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RootHashQuery {
    roothash: Option<String>,
}

pub fn routes(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let head_store = warp::path::param::<String>()
        .and(warp::path::end())
        .and(warp::head())
        .and(warp::query::<HasRootHashQuery>())
        .and(with_state(state.clone()))
        .and_then(head_store);

    let post_upload = warp::path("upload")
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::query::<RootHashQuery>())
        .and(warp::multipart::form())
        .and(with_state(state.clone()))
        .and_then(post_upload);

    let head_upload_file = warp::path("upload")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::head())
        .and(with_state(state.clone()))
        .and_then(head_upload_file);

    let put_upload_file = warp::path("upload")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::put())
        .and(warp::header::<String>("x-nonce"))
        .and(warp::header::<String>("x-public-key"))
        .and(warp::header::<String>("x-key-ownership-sig"))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_state(state.clone()))
        .and_then(put_upload_file);

    let post_commit = warp::path("commit")
        .and(warp::path::param::<String>())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::post())
        .and(with_state(state.clone()))
        .and_then(post_commit);

    let get_file = warp::path::param::<String>()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state))
        .and_then(get_file);

    head_store
        .or(post_upload)
        .or(head_upload_file)
        .or(put_upload_file)
        .or(post_commit)
        .or(get_file)
}

async fn head_store(
    store_id: String,
    query: HasRootHashQuery,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let store_root = state.config.store_dir(&store_id);
    let store_exists = store_root.is_dir();
    let manifest = ManifestStore::new(&store_root).map_err(reject)?;
    let roots = manifest.roots().map_err(reject)?;
    let has_root_hash = query
        .has_root_hash
        .as_deref()
        .map(|r| roots.iter().any(|existing| existing == r))
        .unwrap_or(false);
    let last_uploaded_hash = roots.last().cloned().unwrap_or_default();
    let generation_index = roots.len() as u64;

    let reply = warp::reply::with_header(warp::reply(), "x-store-exists", store_exists.to_string());
    let reply = warp::reply::with_header(reply, "x-has-root-hash", has_root_hash.to_string());
    let reply = warp::reply::with_header(reply, "x-nonce", random_nonce_hex());
    let reply = warp::reply::with_header(reply, "x-last-uploaded-hash", last_uploaded_hash);
    let reply = warp::reply::with_header(reply, "x-generation-index", generation_index.to_string());
    Ok(reply)
}

/// `POST /upload/{store}?roothash=<hex>` multipart with `<root>.dat`:
/// opens an upload session for the generation the peer is about to
/// push (§4.9, §6).
#[tracing::instrument(level = "info", skip(form, state))]
async fn post_upload(
    store_id: String,
    query: RootHashQuery,
    mut form: warp::multipart::FormData,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let _root_hex = query
        .roothash
        .ok_or_else(|| reject(DigError::validation("missing roothash query parameter")))?;

    let mut generation_bytes = Vec::new();
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| reject(DigError::validation(e.to_string())))?
    {
        if part.name() != "generation" {
            continue;
        }
        let mut stream = part.stream();
        while let Some(mut buf) = stream
            .try_next()
            .await
            .map_err(|e| reject(DigError::validation(e.to_string())))?
        {
            let remaining = buf.remaining();
            generation_bytes.extend_from_slice(&buf.copy_to_bytes(remaining));
        }
    }

    let generation: Generation = serde_json::from_slice(&generation_bytes)
        .map_err(|e| reject(DigError::validation(format!("malformed generation upload: {e}"))))?;

    let session_id = uuid::Uuid::new_v4().to_string();
    state.sessions.insert(
        session_id.clone(),
        UploadSession { store_id, generation, nonces: dashmap::DashMap::new() },
    );
    Ok(warp::reply::json(&serde_json::json!({ "sessionId": session_id })))
}

async fn head_upload_file(
    store_id: String,
    session_id: String,
    key: String,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| reject(DigError::not_found("unknown upload session")))?;
    if session.store_id != store_id {
        return Err(reject(DigError::validation("session does not belong to this store")));
    }
    let entry = session
        .generation
        .files
        .get(&key)
        .ok_or_else(|| reject(DigError::validation(format!("{key} is not part of this generation"))))?;

    let blobs = BlobStore::new(state.config.store_dir(&store_id)).map_err(reject)?;
    let file_exists = blobs.has(&entry.sha256).map_err(reject)?;
    let nonce = random_nonce_hex();
    if !file_exists {
        session.nonces.insert(key.clone(), nonce.clone());
    }
    let reply = warp::reply::with_header(warp::reply(), "x-file-exists", file_exists.to_string());
    let reply = warp::reply::with_header(reply, "x-nonce", nonce);
    Ok(reply)
}

#[tracing::instrument(level = "debug", skip(body, state))]
async fn put_upload_file(
    store_id: String,
    session_id: String,
    key: String,
    nonce: String,
    public_key_hex: String,
    signature_hex: String,
    body: bytes::Bytes,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| reject(DigError::not_found("unknown upload session")))?;
    if session.store_id != store_id {
        return Err(reject(DigError::validation("session does not belong to this store")));
    }
    let expected_nonce = session
        .nonces
        .get(&key)
        .map(|n| n.clone())
        .ok_or_else(|| reject(DigError::auth("no nonce outstanding for this key")))?;
    if expected_nonce != nonce {
        return Err(reject(DigError::auth("nonce mismatch")));
    }
    verify_ownership_signature(&public_key_hex, &nonce, &signature_hex).map_err(reject)?;

    let entry = session
        .generation
        .files
        .get(&key)
        .ok_or_else(|| reject(DigError::validation(format!("{key} is not part of this generation"))))?;

    // `body` is gzip-compressed on the wire (§3/§6); the manifest's
    // sha256 is always over the decompressed content, so gunzip before
    // hashing and let `put_bytes` recompress into the canonical blob.
    let mut decoder = flate2::read::GzDecoder::new(body.as_ref());
    let mut plaintext = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut plaintext)
        .map_err(|e| reject(DigError::validation(format!("malformed gzip upload for {key}: {e}"))))?;

    let blobs = BlobStore::new(state.config.store_dir(&store_id)).map_err(reject)?;
    let sha256 = blobs.put_bytes(&plaintext).map_err(reject)?;
    if sha256 != entry.sha256 {
        return Err(reject(DigError::integrity(format!(
            "uploaded content for {key} hashes to {sha256}, generation declares {}",
            entry.sha256
        ))));
    }
    session.nonces.remove(&key);
    dig_metrics::record_bytes_uploaded(body.len() as u64);
    Ok(warp::reply::with_status(warp::reply(), StatusCode::OK))
}

#[tracing::instrument(level = "info", skip(state))]
async fn post_commit(
    store_id: String,
    session_id: String,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let (_, session) = state
        .sessions
        .remove(&session_id)
        .ok_or_else(|| reject(DigError::not_found("unknown upload session")))?;
    if session.store_id != store_id {
        return Err(reject(DigError::validation("session does not belong to this store")));
    }

    let blobs = BlobStore::new(state.config.store_dir(&store_id)).map_err(reject)?;
    for (key, entry) in &session.generation.files {
        if !blobs.has(&entry.sha256).map_err(reject)? {
            return Err(reject(DigError::validation(format!("commit refused: {key} was never uploaded"))));
        }
    }

    let manifest = ManifestStore::new(state.config.store_dir(&store_id)).map_err(reject)?;
    manifest.commit(&session.generation).map_err(reject)?;
    Ok(warp::reply::with_status(warp::reply(), StatusCode::OK))
}

/// `GET /{store}/{path}`: streamed bytes of `path`'s content in the
/// store's latest committed generation (§6).
#[tracing::instrument(level = "debug", skip(state))]
async fn get_file(store_id: String, key: String, state: Arc<ServerState>) -> Result<warp::reply::Response, Rejection> {
    let engine = Engine::open(state.config.store_dir(&store_id)).map_err(reject)?;
    let content_sha256 = engine.content_sha256(&key, None).map_err(reject)?;
    let bytes = engine.blobs().get_bytes(&content_sha256).map_err(reject)?;
    dig_metrics::record_bytes_downloaded(bytes.len() as u64);
    Ok(bytes_response(StatusCode::OK, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dig_config::Config;
    use dig_manifest::Generation;
    use ed25519_dalek::{Signer, SigningKey};
    use sha2::{Digest as _, Sha256};

    fn fixture() -> (tempfile::TempDir, Arc<ServerState>, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.store.folder_path = dir.path().to_path_buf();
        let store_id = "abcd".to_string();
        ManifestStore::new(config.store_dir(&store_id)).unwrap();
        let state = Arc::new(ServerState::new(config));
        (dir, state, store_id)
    }

    #[tokio::test]
    async fn head_store_reports_empty_store_as_not_existing() {
        let (_dir, state, store_id) = fixture();
        let resp = warp::test::request()
            .method("HEAD")
            .path(&format!("/{store_id}"))
            .reply(&routes(state))
            .await;
        assert_eq!(resp.headers().get("x-has-root-hash").unwrap(), "false");
        assert!(resp.headers().contains_key("x-nonce"));
    }

    #[tokio::test]
    async fn upload_lifecycle_verifies_signature_and_commits() {
        let (_dir, state, store_id) = fixture();
        let plaintext = b"pushed by a peer".to_vec();
        let sha256 = hex::encode(Sha256::digest(&plaintext));
        let leaf = dig_merkle::leaf_digest("6b6579", &sha256);
        let tree = dig_merkle::MerkleTree::build(&[leaf]);
        let root = dig_merkle::to_hex(&tree.root());

        let mut generation = Generation::empty();
        generation.root = root.clone();
        generation.leaves = vec![dig_merkle::to_hex(&leaf)];
        generation
            .files
            .insert("6b6579".to_string(), dig_manifest::FileEntry { hash: dig_merkle::to_hex(&leaf), sha256: sha256.clone() });

        let generation_bytes = serde_json::to_vec(&generation).unwrap();
        let form_body = format!(
            "--B\r\nContent-Disposition: form-data; name=\"generation\"; filename=\"{root}.dat\"\r\n\r\n"
        )
        .into_bytes();
        let mut multipart = form_body;
        multipart.extend_from_slice(&generation_bytes);
        multipart.extend_from_slice(b"\r\n--B--\r\n");

        let resp = warp::test::request()
            .method("POST")
            .path(&format!("/upload/{store_id}?roothash={root}"))
            .header("content-type", "multipart/form-data; boundary=B")
            .body(multipart)
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let session: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        let session_id = session["sessionId"].as_str().unwrap();

        let head_resp = warp::test::request()
            .method("HEAD")
            .path(&format!("/upload/{store_id}/{session_id}/6b6579"))
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(head_resp.headers().get("x-file-exists").unwrap(), "false");
        let nonce = head_resp.headers().get("x-nonce").unwrap().to_str().unwrap().to_string();

        let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
        let message = dig_replicate::ownership_message(&nonce);
        let signature = signing_key.sign(message.as_bytes());

        let mut compressed = Vec::new();
        {
            use std::io::Write;
            let mut encoder = flate2::write::GzEncoder::new(&mut compressed, flate2::Compression::default());
            encoder.write_all(&plaintext).unwrap();
            encoder.finish().unwrap();
        }

        let put_resp = warp::test::request()
            .method("PUT")
            .path(&format!("/upload/{store_id}/{session_id}/6b6579"))
            .header("x-nonce", &nonce)
            .header("x-public-key", hex::encode(signing_key.verifying_key().to_bytes()))
            .header("x-key-ownership-sig", hex::encode(signature.to_bytes()))
            .body(compressed)
            .reply(&routes(state.clone()))
            .await;
        assert_eq!(put_resp.status(), StatusCode::OK);

        let commit_resp = warp::test::request()
            .method("POST")
            .path(&format!("/commit/{store_id}/{session_id}"))
            .reply(&routes(state))
            .await;
        assert_eq!(commit_resp.status(), StatusCode::OK);
    }
}

fn verify_ownership_signature(public_key_hex: &str, nonce: &str, signature_hex: &str) -> Result<(), DigError> {
    let message = dig_replicate::ownership_message(nonce);
    let pk_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|_| DigError::validation("malformed public key hex"))?
        .try_into()
        .map_err(|_| DigError::validation("public key must be 32 bytes"))?;
    let verifying_key =
        VerifyingKey::from_bytes(&pk_bytes).map_err(|e| DigError::validation(e.to_string()))?;
    let sig_bytes: [u8; 64] = hex::decode(signature_hex)
        .map_err(|_| DigError::validation("malformed signature hex"))?
        .try_into()
        .map_err(|_| DigError::validation("signature must be 64 bytes"))?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(message.as_bytes(), &signature)
        .map_err(|_| DigError::auth("key ownership signature invalid"))
}
