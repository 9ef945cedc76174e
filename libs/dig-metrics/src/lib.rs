//! In-process counters for peer pool and replication activity (§3, §4.8).
//!
//! Mirrors the counter/registry shape used elsewhere in the stack: a
//! lazily-initialized `Registry` with named counters, gathered on demand
//! into the Prometheus text exposition format rather than pushed anywhere.

use lazy_static::lazy_static;
use prometheus::{register_counter_vec, register_counter, Counter, CounterVec, Encoder, TextEncoder};

lazy_static! {
    static ref PEERS_COOLED_DOWN: Counter = register_counter!(
        "dig_peers_cooled_down_total",
        "Total number of times a peer was put into cooldown after a failure"
    )
    .expect("failed to register dig_peers_cooled_down_total");

    static ref PEERS_EVICTED: Counter = register_counter!(
        "dig_peers_evicted_total",
        "Total number of times a peer's weight reached zero and it was evicted"
    )
    .expect("failed to register dig_peers_evicted_total");

    static ref PEER_RETRIES: Counter = register_counter!(
        "dig_peer_retries_total",
        "Total number of retry attempts against a fresh peer after a transient failure"
    )
    .expect("failed to register dig_peer_retries_total");

    static ref BYTES_TRANSFERRED: CounterVec = register_counter_vec!(
        "dig_bytes_transferred_total",
        "Total bytes transferred during replication, by direction",
        &["direction"]
    )
    .expect("failed to register dig_bytes_transferred_total");

    static ref BLACKLIST_EVENTS: Counter = register_counter!(
        "dig_blacklist_events_total",
        "Total number of files blacklisted after the manifest disagreed with the server"
    )
    .expect("failed to register dig_blacklist_events_total");
}

fn touch_all() {
    // Force registration of every counter even if nothing has recorded
    // through it yet, so a fresh export always lists every metric name.
    lazy_static::initialize(&PEERS_COOLED_DOWN);
    lazy_static::initialize(&PEERS_EVICTED);
    lazy_static::initialize(&PEER_RETRIES);
    lazy_static::initialize(&BYTES_TRANSFERRED);
    lazy_static::initialize(&BLACKLIST_EVENTS);
}

pub fn record_peer_cooldown() {
    PEERS_COOLED_DOWN.inc();
}

pub fn record_peer_eviction() {
    PEERS_EVICTED.inc();
}

pub fn record_peer_retry() {
    PEER_RETRIES.inc();
}

pub fn record_bytes_uploaded(n: u64) {
    BYTES_TRANSFERRED.with_label_values(&["upload"]).inc_by(n as f64);
}

pub fn record_bytes_downloaded(n: u64) {
    BYTES_TRANSFERRED.with_label_values(&["download"]).inc_by(n as f64);
}

pub fn record_blacklist_event() {
    BLACKLIST_EVENTS.inc();
}

/// Render the current counter values in Prometheus text exposition format.
pub fn export() -> Result<String, prometheus::Error> {
    touch_all();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_the_export() {
        record_peer_cooldown();
        record_bytes_uploaded(1024);
        let text = export().unwrap();
        assert!(text.contains("dig_peers_cooled_down_total"));
        assert!(text.contains("dig_bytes_transferred_total"));
    }
}
