//! Content and Propagation servers (§6): the half of the peer contract
//! that `dig-transport` talks *to*. Every node that isn't running in
//! `mercenary_mode` serves both, so its own peers can read its stores
//! and push generations into it the same way it reads and pushes to
//! them.

pub mod content;
pub mod propagation;

use dashmap::DashMap;
use dig_config::Config;
use dig_errors::DigError;
use dig_manifest::Generation;
use dig_transport::IdentityMaterial;
use std::net::SocketAddr;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// State an upload session accumulates between `POST /upload/{store}`
/// and `POST /commit/{store}/{session}` (§6).
pub struct UploadSession {
    pub store_id: String,
    pub generation: Generation,
    /// Per-key nonce issued by the last `HEAD /upload/.../{key}`, consumed
    /// by the matching `PUT`.
    pub nonces: DashMap<String, String>,
}

/// Shared state behind both servers: configuration plus in-flight
/// upload sessions. One instance is shared across every request via an
/// `Arc`.
pub struct ServerState {
    pub config: Config,
    pub sessions: DashMap<String, UploadSession>,
}

impl ServerState {
    pub fn new(config: Config) -> Self {
        ServerState { config, sessions: DashMap::new() }
    }
}

fn with_state(
    state: Arc<ServerState>,
) -> impl Filter<Extract = (Arc<ServerState>,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Wrap a `DigError` surfaced mid-filter-chain as a warp rejection.
fn reject(e: DigError) -> Rejection {
    warp::reject::custom(ServerError(e))
}

#[derive(Debug)]
struct ServerError(DigError);
impl warp::reject::Reject for ServerError {}

/// Build a fixed-body response with an arbitrary status, bypassing the
/// `Reply` blanket impls so every handler can return the same concrete
/// type regardless of whether the body is JSON, plain text, or bytes.
pub(crate) fn bytes_response(status: StatusCode, body: Vec<u8>) -> warp::reply::Response {
    let mut response = warp::reply::Response::new(body.into());
    *response.status_mut() = status;
    response
}

pub(crate) fn random_nonce_hex() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not_found".to_string())
    } else if let Some(ServerError(e)) = err.find::<ServerError>() {
        (status_for(e), e.to_string())
    } else if err.find::<warp::reject::MissingHeader>().is_some()
        || err.find::<warp::reject::InvalidHeader>().is_some()
        || err.find::<warp::filters::body::BodyDeserializeError>().is_some()
    {
        (StatusCode::BAD_REQUEST, format!("{err:?}"))
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, format!("unhandled rejection: {err:?}"))
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "error": message })),
        status,
    ))
}

fn status_for(e: &DigError) -> StatusCode {
    match e {
        DigError::Validation(_) => StatusCode::BAD_REQUEST,
        DigError::NotFound(_) => StatusCode::NOT_FOUND,
        DigError::Integrity(_) => StatusCode::CONFLICT,
        DigError::TransientNetwork(_) => StatusCode::SERVICE_UNAVAILABLE,
        DigError::Auth(_) => StatusCode::UNAUTHORIZED,
        DigError::Conflict(_) => StatusCode::CONFLICT,
        DigError::Resource(_) => StatusCode::INSUFFICIENT_STORAGE,
    }
}

/// Split a single path segment of the form `{store}.{root}` (§6) at its
/// first dot.
pub(crate) fn split_store_root(segment: &str) -> Result<(String, String), DigError> {
    segment
        .split_once('.')
        .map(|(store, root)| (store.to_string(), root.to_string()))
        .ok_or_else(|| DigError::validation(format!("expected {{store}}.{{root}}, got {segment}")))
}

/// Run the content server on `content_addr` and the propagation server
/// on `propagation_addr` until either returns, terminating mTLS with
/// `identity`'s self-signed leaf (the same one `dig-transport` presents
/// client-side). A no-op if `state.config.store.mercenary_mode` is set
/// (§6 supplement: mercenary nodes never serve other peers).
pub async fn run(
    state: Arc<ServerState>,
    identity: &IdentityMaterial,
    content_addr: SocketAddr,
    propagation_addr: SocketAddr,
) {
    if state.config.store.mercenary_mode {
        tracing::info!("mercenary_mode enabled, not starting content/propagation servers");
        return;
    }

    let content_routes = content::routes(state.clone()).recover(handle_rejection);
    let propagation_routes = propagation::routes(state.clone()).recover(handle_rejection);

    let content = warp::serve(content_routes)
        .tls()
        .cert(identity.cert_pem_bytes())
        .key(identity.key_pem_bytes())
        .run(content_addr);
    let propagation = warp::serve(propagation_routes)
        .tls()
        .cert(identity.cert_pem_bytes())
        .key(identity.key_pem_bytes())
        .run(propagation_addr);

    tracing::info!(%content_addr, %propagation_addr, "serving content and propagation endpoints");
    tokio::join!(content, propagation);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_store_root_requires_a_dot() {
        assert!(split_store_root("nodothere").is_err());
        let (store, root) = split_store_root("abcd.ef01").unwrap();
        assert_eq!(store, "abcd");
        assert_eq!(root, "ef01");
    }
}
