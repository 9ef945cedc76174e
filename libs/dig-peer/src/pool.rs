//! Peer Pool (§4.8): discovery priority, cooldown/weight state, and
//! round-robin selection with retry-on-failure.

use crate::Address;
use dig_errors::{DigError, DigResult};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub cooldown: Duration,
    pub max_retries: u32,
    /// Starting weight for an address entering the pool normally (§3).
    pub default_weight: i32,
    /// Starting weight for a trusted/introducer address (§3).
    pub prioritized_weight: i32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            cooldown: Duration::from_secs(5 * 60),
            max_retries: 3,
            default_weight: 1,
            prioritized_weight: 5,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerState {
    weight: i32,
    connected: bool,
}

/// Round-robin peer selection with cooldown-on-failure (§4.8).
///
/// Discovery sources feed `addresses` in priority order (configured
/// trusted node, localhost, a fixed alias, DNS-resolved introducers,
/// on-chain epoch hints); this type owns only the selection state, not
/// the discovery itself.
pub struct PeerPool {
    config: PoolConfig,
    peers: HashMap<Address, PeerState>,
    available: Vec<Address>,
    cursor: usize,
    cooldown: HashMap<Address, Instant>,
}

impl PeerPool {
    /// `addresses` must already be in discovery priority order.
    /// `prioritized` names the subset (trusted node, introducers) that
    /// enters with `config.prioritized_weight` instead of the default (§3).
    pub fn new(addresses: Vec<Address>, prioritized: &[Address], config: PoolConfig) -> Self {
        let mut peers = HashMap::new();
        for addr in &addresses {
            let weight = if prioritized.contains(addr) {
                config.prioritized_weight
            } else {
                config.default_weight
            };
            peers.insert(addr.clone(), PeerState { weight, connected: false });
        }
        PeerPool {
            config,
            peers,
            available: addresses,
            cursor: 0,
            cooldown: HashMap::new(),
        }
    }

    /// Lazily expire cooldown entries and fold any newly-eligible peers
    /// back into `available`.
    fn reap_cooldowns(&mut self) {
        let now = Instant::now();
        let expired: Vec<Address> = self
            .cooldown
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in expired {
            self.cooldown.remove(&addr);
            if !self.available.contains(&addr) {
                if let Some(state) = self.peers.get_mut(&addr) {
                    state.connected = false;
                }
                self.available.push(addr);
            }
        }
    }

    /// Select the next peer round-robin over `available`.
    pub fn select(&mut self) -> DigResult<Address> {
        self.reap_cooldowns();
        if self.available.is_empty() {
            return Err(DigError::transient("no peers available"));
        }
        let idx = self.cursor % self.available.len();
        self.cursor = (self.cursor + 1) % self.available.len().max(1);
        let addr = self.available[idx].clone();
        if let Some(state) = self.peers.get_mut(&addr) {
            state.connected = true;
        }
        Ok(addr)
    }

    /// Mark `address` as having just failed a connection-level or
    /// timeout error: decrement its weight and drop it from `available`
    /// (§4.8). An address whose weight reaches zero is evicted outright
    /// rather than cooled down (§3 peer lifecycle); otherwise it cools
    /// down and rejoins `available` once the cooldown expires.
    pub fn record_failure(&mut self, address: &str) {
        self.available.retain(|a| a != address);
        self.cooldown.remove(address);

        let evicted = match self.peers.get_mut(address) {
            Some(state) => {
                state.weight -= 1;
                state.connected = false;
                state.weight <= 0
            }
            None => return,
        };

        if evicted {
            tracing::warn!(address, "peer evicted after weight reached zero");
            dig_metrics::record_peer_eviction();
            self.peers.remove(address);
        } else {
            tracing::debug!(address, cooldown_secs = self.config.cooldown.as_secs(), "peer cooling down");
            dig_metrics::record_peer_cooldown();
            self.cooldown.insert(address.to_string(), Instant::now() + self.config.cooldown);
        }

        if self.cursor > 0 && self.cursor > self.available.len() {
            self.cursor = 0;
        }
    }

    /// Mark `address` as having just completed a successful operation:
    /// nudge its weight up slightly (§3).
    pub fn record_success(&mut self, address: &str) {
        if let Some(state) = self.peers.get_mut(address) {
            state.weight = state.weight.saturating_add(1);
        }
    }

    /// Run `op` against the next peer, retrying against a fresh peer on
    /// transient failure up to `max_retries` (§4.8).
    pub async fn with_retry<F, Fut, T>(&mut self, mut op: F) -> DigResult<T>
    where
        F: FnMut(Address) -> Fut,
        Fut: std::future::Future<Output = DigResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let addr = self.select()?;
            match op(addr.clone()).await {
                Ok(value) => {
                    self.record_success(&addr);
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    self.record_failure(&addr);
                    attempt += 1;
                    dig_metrics::record_peer_retry();
                    tracing::debug!(address = %addr, attempt, "retrying against a fresh peer");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn weight(&self, address: &str) -> Option<i32> {
        self.peers.get(address).map(|s| s.weight)
    }

    pub fn is_available(&self, address: &str) -> bool {
        self.available.contains(&address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_available_peers() {
        let mut pool = PeerPool::new(
            vec!["a".into(), "b".into(), "c".into()],
            &[],
            PoolConfig::default(),
        );
        assert_eq!(pool.select().unwrap(), "a");
        assert_eq!(pool.select().unwrap(), "b");
        assert_eq!(pool.select().unwrap(), "c");
        assert_eq!(pool.select().unwrap(), "a");
    }

    #[test]
    fn new_peers_seed_default_or_prioritized_weight() {
        let pool = PeerPool::new(
            vec!["a".into(), "b".into()],
            &["b".to_string()],
            PoolConfig::default(),
        );
        assert_eq!(pool.weight("a"), Some(1));
        assert_eq!(pool.weight("b"), Some(5));
    }

    #[test]
    fn failure_on_default_weight_peer_evicts_immediately() {
        let mut pool = PeerPool::new(vec!["a".into(), "b".into()], &[], PoolConfig::default());
        pool.record_failure("a");
        assert!(!pool.is_available("a"));
        assert_eq!(pool.weight("a"), None);
        assert_eq!(pool.select().unwrap(), "b");
    }

    #[test]
    fn prioritized_peer_survives_failures_until_weight_exhausted() {
        let mut pool = PeerPool::new(vec!["a".into()], &["a".to_string()], PoolConfig::default());
        for _ in 0..4 {
            pool.record_failure("a");
            assert_eq!(pool.is_available("a"), false);
            // cools down rather than evicted while weight remains positive.
            assert!(pool.weight("a").unwrap() > 0);
        }
        pool.record_failure("a");
        assert_eq!(pool.weight("a"), None);
    }

    #[test]
    fn record_success_nudges_weight_up() {
        let mut pool = PeerPool::new(vec!["a".into()], &["a".to_string()], PoolConfig::default());
        pool.record_failure("a");
        assert_eq!(pool.weight("a"), Some(4));
        pool.record_success("a");
        assert_eq!(pool.weight("a"), Some(5));
    }

    #[test]
    fn empty_pool_selection_is_transient_error() {
        let mut pool = PeerPool::new(Vec::new(), &[], PoolConfig::default());
        assert!(matches!(pool.select().unwrap_err(), DigError::TransientNetwork(_)));
    }
}
