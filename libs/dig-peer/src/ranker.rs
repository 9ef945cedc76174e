//! Peer Ranker (§4.7): latency/bandwidth probing and ranked ordering.

use crate::Address;
use dig_transport::Transport;
use std::time::Instant;

const BANDWIDTH_PAYLOAD_SIZE: usize = 1024 * 1024;

/// One address' measured latency and bandwidth.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedPeer {
    pub address: Address,
    /// `f64::INFINITY` if the peer was unreachable.
    pub latency_secs: f64,
    /// `0.0` on failure.
    pub bandwidth_bytes_per_sec: f64,
}

async fn measure_latency(transport: &Transport, address: &str) -> f64 {
    let url = format!("{address}/");
    let start = Instant::now();
    match transport.head(&url).await {
        Ok(resp) if resp.is_success() || resp.is_redirect() => start.elapsed().as_secs_f64(),
        Ok(resp) if resp.status == 405 => {
            let retry_start = Instant::now();
            match transport.range_get_first_byte(&url).await {
                Ok(()) => retry_start.elapsed().as_secs_f64(),
                Err(_) => f64::INFINITY,
            }
        }
        _ => f64::INFINITY,
    }
}

async fn measure_bandwidth(transport: &Transport, address: &str) -> f64 {
    let url = format!("{address}/upload");
    let payload = vec![0x5au8; BANDWIDTH_PAYLOAD_SIZE];
    let start = Instant::now();
    match transport.post_bytes(&url, payload).await {
        Ok(()) => {
            let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
            BANDWIDTH_PAYLOAD_SIZE as f64 / elapsed
        }
        Err(_) => 0.0,
    }
}

/// Probe every address and return them ordered by ascending latency,
/// ties broken by descending bandwidth (§4.7).
pub async fn rank(addresses: &[Address], transport: &Transport) -> Vec<RankedPeer> {
    let mut peers = Vec::with_capacity(addresses.len());
    for address in addresses {
        let latency_secs = measure_latency(transport, address).await;
        let bandwidth_bytes_per_sec = measure_bandwidth(transport, address).await;
        peers.push(RankedPeer {
            address: address.clone(),
            latency_secs,
            bandwidth_bytes_per_sec,
        });
    }
    peers.sort_by(|a, b| {
        a.latency_secs
            .partial_cmp(&b.latency_secs)
            .unwrap()
            .then_with(|| b.bandwidth_bytes_per_sec.partial_cmp(&a.bandwidth_bytes_per_sec).unwrap())
    });
    peers
}

/// A cyclic "next best" iterator over a ranked peer set.
pub struct NextBest {
    ranked: Vec<RankedPeer>,
    cursor: usize,
}

impl NextBest {
    pub fn new(ranked: Vec<RankedPeer>) -> Self {
        NextBest { ranked, cursor: 0 }
    }

    pub fn next(&mut self) -> Option<&RankedPeer> {
        if self.ranked.is_empty() {
            return None;
        }
        let peer = &self.ranked[self.cursor % self.ranked.len()];
        self.cursor = (self.cursor + 1) % self.ranked.len();
        Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(address: &str, latency: f64, bandwidth: f64) -> RankedPeer {
        RankedPeer {
            address: address.to_string(),
            latency_secs: latency,
            bandwidth_bytes_per_sec: bandwidth,
        }
    }

    #[test]
    fn next_best_cycles_modulo_ranked_set() {
        let mut iter = NextBest::new(vec![peer("a", 0.1, 10.0), peer("b", 0.2, 5.0)]);
        assert_eq!(iter.next().unwrap().address, "a");
        assert_eq!(iter.next().unwrap().address, "b");
        assert_eq!(iter.next().unwrap().address, "a");
    }

    #[test]
    fn empty_ranked_set_yields_none() {
        let mut iter = NextBest::new(Vec::new());
        assert!(iter.next().is_none());
    }
}
