//! Peer transport (§4.6): a single mTLS HTTPS client shared across all
//! peer RPCs, with per-peer rate limiting, exponential backoff retries,
//! redirect following and an inactivity timeout on streamed bodies.

use dig_errors::{DigError, DigResult};
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use governor::state::{InMemoryState, NotKeyed};
use governor::clock::DefaultClock;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

mod identity;
pub use identity::IdentityMaterial;

/// Tunables for a [`Transport`] instance (§5, §6).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_redirects: usize,
    pub inactivity_timeout: Duration,
    pub retry_base: Duration,
    pub retry_multiplier: f64,
    pub retry_cap: Duration,
    pub max_retries: u32,
    pub rate_per_minute: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_redirects: 5,
            inactivity_timeout: Duration::from_secs(5),
            retry_base: Duration::from_secs(2),
            retry_multiplier: 1.5,
            retry_cap: Duration::from_secs(10),
            max_retries: 5,
            rate_per_minute: 60,
        }
    }
}

/// Response to a [`Transport::head`] call: status plus the headers the
/// peer contract cares about (§6's `x-*` header families).
#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl HeadResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Per-peer rate limiter: `rate_per_minute` requests/min, at most 1
/// concurrent in-flight (§4.6, §5).
struct PeerLimiter {
    rate: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    inflight: Semaphore,
}

/// Holds a permit for the duration of one peer RPC; releases on drop.
struct PeerPermit<'a> {
    _inflight: tokio::sync::SemaphorePermit<'a>,
}

struct RateLimiters {
    per_peer: DashMap<String, Arc<PeerLimiter>>,
    rate_per_minute: u32,
}

impl RateLimiters {
    fn new(rate_per_minute: u32) -> Self {
        RateLimiters { per_peer: DashMap::new(), rate_per_minute }
    }

    fn limiter_for(&self, host: &str) -> Arc<PeerLimiter> {
        self.per_peer
            .entry(host.to_string())
            .or_insert_with(|| {
                let quota = Quota::per_minute(
                    NonZeroU32::new(self.rate_per_minute.max(1)).unwrap(),
                );
                Arc::new(PeerLimiter {
                    rate: RateLimiter::direct(quota),
                    inflight: Semaphore::new(1),
                })
            })
            .clone()
    }

    async fn acquire(&self, host: &str) -> Arc<PeerLimiter> {
        let limiter = self.limiter_for(host);
        limiter.rate.until_ready().await;
        limiter
    }
}

pub struct Transport {
    client: reqwest::Client,
    config: TransportConfig,
    limiters: RateLimiters,
}

fn host_of(url: &str) -> DigResult<String> {
    let parsed = Url::parse(url).map_err(|e| DigError::validation(format!("bad url {url}: {e}")))?;
    parsed
        .host_str()
        .map(str::to_string)
        .ok_or_else(|| DigError::validation(format!("url has no host: {url}")))
}

impl Transport {
    /// Builds a client carrying `identity` as its mTLS client
    /// certificate, accepting self-signed peer certs (§4.6: peer
    /// identity is carried by the on-chain coin, not the cert chain).
    pub fn new(config: TransportConfig, identity: &IdentityMaterial) -> DigResult<Self> {
        let reqwest_identity = identity.to_reqwest_identity()?;
        let client = reqwest::Client::builder()
            .identity(reqwest_identity)
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| DigError::resource(format!("failed to build transport client: {e}")))?;
        Ok(Transport {
            client,
            limiters: RateLimiters::new(config.rate_per_minute),
            config,
        })
    }

    async fn permit(&self, url: &str) -> DigResult<(String, Arc<PeerLimiter>)> {
        let host = host_of(url)?;
        let limiter = self.limiters.acquire(&host).await;
        Ok((host, limiter))
    }

    pub async fn head(&self, url: &str) -> DigResult<HeadResponse> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        Ok(to_head_response(&resp))
    }

    /// Stream and buffer a response body, aborting with a transient
    /// error if no bytes arrive for `inactivity_timeout` (§4.6).
    pub async fn get(&self, url: &str) -> DigResult<bytes::Bytes> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let resp = self.client.get(url).send().await.map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(DigError::transient(format!("GET {url} failed: {}", resp.status())));
        }
        read_body_with_inactivity_timeout(resp, self.config.inactivity_timeout).await
    }

    /// A single-byte range GET, used as the 405 fallback for latency
    /// probing against peers that reject HEAD (§4.7).
    pub async fn range_get_first_byte(&self, url: &str) -> DigResult<()> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let resp = self
            .client
            .get(url)
            .header("Range", "bytes=0-0")
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if resp.status().is_success() || resp.status().as_u16() == 206 {
            Ok(())
        } else {
            Err(DigError::transient(format!("range GET {url} failed: {}", resp.status())))
        }
    }

    /// [`Self::get`] with exponential backoff retries on transient
    /// failures (§4.6): 2s base, ×1.5 multiplier, capped at 10s.
    pub async fn get_with_retries(&self, url: &str) -> DigResult<bytes::Bytes> {
        let mut delay = self.config.retry_base;
        let mut attempt = 0;
        loop {
            match self.get(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    tracing::warn!(url, attempt, "transient get failure, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    delay = delay
                        .mul_f64(self.config.retry_multiplier)
                        .min(self.config.retry_cap);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Stream `path`'s contents to `url` with `Content-Length` set from
    /// the file's own size.
    pub async fn put_stream(
        &self,
        url: &str,
        path: &Path,
        headers: HashMap<String, String>,
    ) -> DigResult<()> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;

        let file = tokio::fs::File::open(path).await.map_err(DigError::from)?;
        let len = file.metadata().await.map_err(DigError::from)?.len();
        let stream = tokio_util::io::ReaderStream::new(file);
        let body = reqwest::Body::wrap_stream(stream);

        let mut req = self.client.put(url).header("Content-Length", len).body(body);
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req.send().await.map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(DigError::transient(format!("PUT {url} failed: {}", resp.status())));
        }
        Ok(())
    }

    /// POST a raw byte buffer, used by the bandwidth probe (§4.7).
    pub async fn post_bytes(&self, url: &str, body: Vec<u8>) -> DigResult<()> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(DigError::transient(format!("POST {url} failed: {}", resp.status())));
        }
        Ok(())
    }

    /// Multipart POST of a single named file, used to open an upload
    /// session against `<root>.dat` (§4.9).
    pub async fn post_multipart_file(
        &self,
        url: &str,
        field_name: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> DigResult<serde_json::Value> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new().part(field_name.to_string(), part);
        let resp = self
            .client
            .post(url)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(DigError::transient(format!("POST {url} failed: {}", resp.status())));
        }
        resp.json().await.map_err(map_reqwest_err)
    }

    pub async fn post_json<T: serde::Serialize>(&self, url: &str, body: &T) -> DigResult<serde_json::Value> {
        let (_, limiter) = self.permit(url).await?;
        let _inflight = limiter
            .inflight
            .acquire()
            .await
            .map_err(|e| DigError::resource(e.to_string()))?;
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_reqwest_err)?;
        if !resp.status().is_success() {
            return Err(DigError::transient(format!("POST {url} failed: {}", resp.status())));
        }
        resp.json().await.map_err(map_reqwest_err)
    }
}

async fn read_body_with_inactivity_timeout(
    resp: reqwest::Response,
    inactivity_timeout: Duration,
) -> DigResult<bytes::Bytes> {
    use futures::StreamExt;
    let mut stream = resp.bytes_stream();
    let mut buf = bytes::BytesMut::new();
    loop {
        match tokio::time::timeout(inactivity_timeout, stream.next()).await {
            Ok(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
            Ok(Some(Err(e))) => return Err(map_reqwest_err(e)),
            Ok(None) => return Ok(buf.freeze()),
            Err(_) => return Err(DigError::transient("timeout: inactivity timeout exceeded")),
        }
    }
}

fn to_head_response(resp: &reqwest::Response) -> HeadResponse {
    let headers = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.as_str().to_ascii_lowercase(), v.to_str().unwrap_or_default().to_string()))
        .collect();
    HeadResponse { status: resp.status().as_u16(), headers }
}

fn map_reqwest_err(e: reqwest::Error) -> DigError {
    if e.is_timeout() || e.is_connect() {
        DigError::transient(e.to_string())
    } else if let Some(status) = e.status() {
        if status.as_u16() == 401 || status.as_u16() == 403 {
            DigError::auth(e.to_string())
        } else if status.is_server_error() {
            DigError::transient(e.to_string())
        } else {
            DigError::validation(e.to_string())
        }
    } else {
        DigError::transient(e.to_string())
    }
}

/// Directory used to cache the ephemeral identity, exposed for tests.
pub fn default_identity_dir() -> DigResult<PathBuf> {
    identity::identity_dir()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn head_response_classifies_status_ranges() {
        let ok = HeadResponse { status: 200, headers: HashMap::new() };
        assert!(ok.is_success());
        assert!(!ok.is_redirect());
        let redirect = HeadResponse { status: 302, headers: HashMap::new() };
        assert!(redirect.is_redirect());
    }

    #[test]
    fn host_of_extracts_host_from_url() {
        assert_eq!(host_of("https://example.com:4161/foo").unwrap(), "example.com");
        assert!(host_of("not a url").is_err());
    }
}
