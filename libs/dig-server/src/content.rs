//! Content server (§6): read-only endpoints peers use to fetch blobs,
//! answer challenges, and discover what a store currently holds.

use crate::{bytes_response, reject, split_store_root, with_state, ServerState};
use dig_challenge::Challenge;
use dig_engine::Engine;
use dig_errors::DigError;
use dig_manifest::ManifestStore;
use serde::Deserialize;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

#[derive(Debug, Deserialize)]
struct HasRootHashQuery {
    #[serde(rename = "hasRootHash")]
    has_root_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChallengeQuery {
    challenge: Option<String>,
}

pub fn routes(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let well_known = warp::path(".well-known")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_well_known);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(get_metrics);

    let index = warp::path::end()
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_index);

    let head_key = warp::path::param::<String>()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::head())
        .and(with_state(state.clone()))
        .and_then(head_key_exists);

    let get_key_route = warp::path::param::<String>()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<ChallengeQuery>())
        .and(with_state(state.clone()))
        .and_then(get_key);

    let head_store = warp::path::param::<String>()
        .and(warp::path::end())
        .and(warp::head())
        .and(warp::query::<HasRootHashQuery>())
        .and(with_state(state))
        .and_then(head_store);

    well_known
        .or(metrics)
        .or(index)
        .or(head_key)
        .or(get_key_route)
        .or(head_store)
}

/// `GET /metrics`: process-wide peer pool and replication counters in
/// Prometheus text exposition format.
async fn get_metrics() -> Result<impl Reply, Rejection> {
    let body = dig_metrics::export().map_err(|e| reject(DigError::resource(e.to_string())))?;
    Ok(warp::reply::with_header(body, "content-type", "text/plain; version=0.0.4"))
}

async fn get_well_known(state: Arc<ServerState>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&serde_json::json!({
        "publicIp": state.config.network.public_ip,
        "contentPort": state.config.network.content_port,
        "propagationPort": state.config.network.propagation_port,
        "remoteNode": state.config.network.remote_node,
    })))
}

async fn get_index(state: Arc<ServerState>) -> Result<impl Reply, Rejection> {
    let root = &state.config.store.folder_path;
    let mut stores = Vec::new();
    if root.is_dir() {
        let entries = std::fs::read_dir(root).map_err(|e| reject(DigError::from(e)))?;
        for entry in entries {
            let entry = entry.map_err(|e| reject(DigError::from(e)))?;
            if !entry.path().is_dir() {
                continue;
            }
            let store_id = entry.file_name().to_string_lossy().to_string();
            if let Ok(manifest) = ManifestStore::new(entry.path()) {
                if let Ok(Some(root_hex)) = manifest.latest_root() {
                    stores.push(serde_json::json!({ "storeId": store_id, "root": root_hex }));
                }
            }
        }
    }
    Ok(warp::reply::json(&serde_json::json!({ "stores": stores })))
}

#[tracing::instrument(level = "debug", skip(state))]
async fn head_store(
    store_id: String,
    query: HasRootHashQuery,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let store_root = state.config.store_dir(&store_id);
    let store_exists = store_root.is_dir();
    let has_root_hash = match &query.has_root_hash {
        Some(root_hex) if store_exists => {
            let manifest = ManifestStore::new(&store_root).map_err(reject)?;
            manifest.generation_file_exists(root_hex)
        }
        _ => false,
    };
    let reply = warp::reply::with_header(warp::reply(), "x-store-exists", store_exists.to_string());
    let reply = warp::reply::with_header(reply, "x-has-root-hash", has_root_hash.to_string());
    Ok(reply)
}

async fn head_key_exists(
    store_dot_root: String,
    key: String,
    state: Arc<ServerState>,
) -> Result<impl Reply, Rejection> {
    let (store_id, root_hex) = split_store_root(&store_dot_root).map_err(reject)?;
    let engine = Engine::open(state.config.store_dir(&store_id)).map_err(reject)?;
    let exists = engine.has_key(&key, Some(&root_hex)).unwrap_or(false);
    Ok(warp::reply::with_header(warp::reply(), "x-key-exists", exists.to_string()))
}

/// `GET /{store}.{root}/{key}[?challenge=<hex>]`: decompressed blob
/// bytes, or — when `challenge` carries a hex-encoded [`Challenge`]
/// JSON — the challenge response body instead (§4.5, §6).
#[tracing::instrument(level = "debug", skip(state))]
async fn get_key(
    store_dot_root: String,
    key: String,
    query: ChallengeQuery,
    state: Arc<ServerState>,
) -> Result<warp::reply::Response, Rejection> {
    let (store_id, root_hex) = split_store_root(&store_dot_root).map_err(reject)?;
    let engine = Engine::open(state.config.store_dir(&store_id)).map_err(reject)?;
    let content_sha256 = engine.content_sha256(&key, Some(&root_hex)).map_err(reject)?;

    if let Some(challenge_hex) = &query.challenge {
        let challenge_json = hex::decode(challenge_hex)
            .ok()
            .and_then(|raw| String::from_utf8(raw).ok())
            .ok_or_else(|| reject(DigError::validation("malformed challenge hex")))?;
        let challenge = Challenge::from_json(&challenge_json).map_err(reject)?;
        let response = dig_challenge::respond(engine.blobs(), &content_sha256, &challenge).map_err(reject)?;
        return Ok(bytes_response(StatusCode::OK, response.into_bytes()));
    }

    let bytes = engine.blobs().get_bytes(&content_sha256).map_err(reject)?;
    Ok(bytes_response(StatusCode::OK, bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dig_config::Config;

    fn fixture() -> (tempfile::TempDir, Arc<ServerState>, String, String) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_env();
        config.store.folder_path = dir.path().to_path_buf();
        let store_id = "abcd".to_string();

        let mut engine = Engine::open(config.store_dir(&store_id)).unwrap();
        engine.upsert("6b6579", "hello world".as_bytes()).unwrap();
        let root = engine.commit().unwrap();

        let state = Arc::new(ServerState::new(config));
        (dir, state, store_id, root)
    }

    #[tokio::test]
    async fn well_known_reports_configured_ports() {
        let (_dir, state, _store_id, _root) = fixture();
        let resp = warp::test::request()
            .path("/.well-known")
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["contentPort"], 4161);
    }

    #[tokio::test]
    async fn metrics_route_serves_prometheus_text() {
        let (_dir, state, _store_id, _root) = fixture();
        let resp = warp::test::request()
            .path("/metrics")
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_key_serves_decompressed_content() {
        let (_dir, state, store_id, root) = fixture();
        let resp = warp::test::request()
            .path(&format!("/{store_id}.{root}/6b6579"))
            .reply(&routes(state))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "hello world".as_bytes());
    }

    #[tokio::test]
    async fn head_store_reports_root_hash_presence() {
        let (_dir, state, store_id, root) = fixture();
        let resp = warp::test::request()
            .method("HEAD")
            .path(&format!("/{store_id}?hasRootHash={root}"))
            .reply(&routes(state))
            .await;
        assert_eq!(resp.headers().get("x-store-exists").unwrap(), "true");
        assert_eq!(resp.headers().get("x-has-root-hash").unwrap(), "true");
    }
}
