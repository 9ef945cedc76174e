//! Peer Ranker and Peer Pool (§4.7, §4.8).

pub mod pool;
pub mod ranker;

pub use pool::{PeerPool, PoolConfig};
pub use ranker::{rank, NextBest, RankedPeer};

/// Shared by ranker and pool: an address this process can talk to.
pub type Address = String;

/// Resolve DNS-named introducer hosts through an async resolver rather
/// than the OS stub resolver (§4.8 supplement), so lookups share the
/// same timeout/retry treatment as other peer RPCs.
pub async fn resolve_introducer_hosts(hostnames: &[String]) -> Vec<Address> {
    use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
    use trust_dns_resolver::TokioAsyncResolver;

    let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    let mut out = Vec::new();
    for host in hostnames {
        match resolver.lookup_ip(host.as_str()).await {
            Ok(lookup) => out.extend(lookup.iter().map(|ip| ip.to_string())),
            Err(e) => tracing::warn!(host, "introducer DNS lookup failed: {e}"),
        }
    }
    out
}
