//! Process-wide configuration, loaded once at startup.
//!
//! Resolution order mirrors the teacher pattern: an optional TOML file,
//! then environment variables (§6 of the specification), then hard-coded
//! defaults documented next to each field.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    pub network: NetworkConfig,
    pub transport: TransportConfig,
    pub peers: PeerConfig,
    pub replication: ReplicationConfig,
    pub challenge: ChallengeConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    /// Root directory holding `<storeId>/` trees. `DIG_FOLDER_PATH`.
    pub folder_path: PathBuf,
    /// Disk budget before ingest refuses new blobs. `DISK_SPACE_LIMIT_BYTES`.
    pub disk_space_limit_bytes: u64,
    /// Run without acting as a content/propagation server for others.
    /// `MERCENARY_MODE`.
    pub mercenary_mode: bool,
    pub debug: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkConfig {
    /// `PUBLIC_IP`: IPv4/IPv6/hostname this node advertises to peers.
    pub public_ip: Option<String>,
    pub trusted_fullnode: Option<String>,
    pub trusted_fullnode_port: u16,
    pub content_port: u16,
    pub propagation_port: u16,
    pub incentive_port: u16,
    /// `REMOTE_NODE`: this node is reachable only via a remote peer,
    /// not directly.
    pub remote_node: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TransportConfig {
    pub max_redirects: u8,
    pub inactivity_timeout_secs: u64,
    pub backoff_initial_secs: f64,
    pub backoff_multiplier: f64,
    pub backoff_cap_secs: f64,
    pub max_retries: u32,
    pub rate_limit_per_minute: u32,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PeerConfig {
    pub default_weight: u32,
    pub prioritized_weight: u32,
    pub cooldown_secs: u64,
    pub max_pool_retries: u32,
    /// Intra-cluster DNS alias checked ahead of introducer hosts (§4.8).
    pub fixed_alias: Option<String>,
    /// DNS-named introducer hosts, resolved via the async resolver (§4.8).
    pub introducer_hosts: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReplicationConfig {
    pub upload_concurrency: usize,
    pub manifest_lock_renewal_secs: u64,
    pub manifest_lock_stale_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChallengeConfig {
    pub segment_size: u64,
    pub segment_count: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub rust_log: String,
    pub log_simple: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store: StoreConfig {
                folder_path: default_folder_path(),
                disk_space_limit_bytes: 0,
                mercenary_mode: false,
                debug: false,
            },
            network: NetworkConfig {
                public_ip: None,
                trusted_fullnode: None,
                trusted_fullnode_port: 8444,
                content_port: 4161,
                propagation_port: 4159,
                incentive_port: 4160,
                remote_node: false,
            },
            transport: TransportConfig {
                max_redirects: 5,
                inactivity_timeout_secs: 5,
                backoff_initial_secs: 2.0,
                backoff_multiplier: 1.5,
                backoff_cap_secs: 10.0,
                max_retries: 5,
                rate_limit_per_minute: 100,
                username: None,
                password: None,
            },
            peers: PeerConfig {
                default_weight: 1,
                prioritized_weight: 5,
                cooldown_secs: 300,
                max_pool_retries: 3,
                fixed_alias: None,
                introducer_hosts: Vec::new(),
            },
            replication: ReplicationConfig {
                upload_concurrency: 10,
                manifest_lock_renewal_secs: 60,
                manifest_lock_stale_secs: 180,
            },
            challenge: ChallengeConfig {
                segment_size: 1024,
                segment_count: 10,
            },
            logging: LoggingConfig {
                rust_log: "info".to_string(),
                log_simple: true,
            },
        }
    }
}

fn default_folder_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dig")
        .join("stores")
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_num<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load from `DIG_CONFIG_PATH` (TOML) if present, then apply
    /// environment overrides; otherwise build straight from the
    /// environment over the defaults.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path =
            env::var("DIG_CONFIG_PATH").unwrap_or_else(|_| "dig.toml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            let raw = fs::read_to_string(&config_path)?;
            toml::from_str(&raw)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Build configuration purely from the environment and defaults,
    /// ignoring any config file. Useful for tests and for CLI overrides.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("DIG_FOLDER_PATH") {
            self.store.folder_path = PathBuf::from(v);
        }
        self.store.disk_space_limit_bytes =
            env_num("DISK_SPACE_LIMIT_BYTES", self.store.disk_space_limit_bytes);
        self.store.mercenary_mode = env_bool("MERCENARY_MODE", self.store.mercenary_mode);
        self.store.debug = env_bool("DIG_DEBUG", self.store.debug);

        if let Ok(v) = env::var("PUBLIC_IP") {
            self.network.public_ip = Some(v);
        }
        if let Ok(v) = env::var("TRUSTED_FULLNODE") {
            self.network.trusted_fullnode = Some(v);
        }
        self.network.trusted_fullnode_port = env_num(
            "TRUSTED_FULLNODE_PORT",
            self.network.trusted_fullnode_port,
        );
        self.network.remote_node = env_bool("REMOTE_NODE", self.network.remote_node);

        if let Ok(v) = env::var("DIG_USERNAME") {
            self.transport.username = Some(v);
        }
        if let Ok(v) = env::var("DIG_PASSWORD") {
            self.transport.password = Some(v);
        }

        if self.store.debug {
            self.logging.rust_log = "debug".to_string();
        }
    }

    /// Root directory for a specific store id (already hex-encoded).
    pub fn store_dir(&self, store_id_hex: &str) -> PathBuf {
        self.store.folder_path.join(store_id_hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let c = Config::default();
        assert_eq!(c.network.content_port, 4161);
        assert_eq!(c.network.propagation_port, 4159);
        assert_eq!(c.network.incentive_port, 4160);
        assert_eq!(c.challenge.segment_size, 1024);
        assert_eq!(c.challenge.segment_count, 10);
        assert_eq!(c.replication.upload_concurrency, 10);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("DIG_FOLDER_PATH", "/tmp/dig-test-store");
        std::env::set_var("MERCENARY_MODE", "true");
        let c = Config::from_env();
        assert_eq!(c.store.folder_path, PathBuf::from("/tmp/dig-test-store"));
        assert!(c.store.mercenary_mode);
        std::env::remove_var("DIG_FOLDER_PATH");
        std::env::remove_var("MERCENARY_MODE");
    }

    #[test]
    fn store_dir_joins_folder_and_id() {
        let mut c = Config::default();
        c.store.folder_path = PathBuf::from("/tmp/dig-root");
        let dir = c.store_dir("aabbcc");
        assert_eq!(dir, PathBuf::from("/tmp/dig-root/aabbcc"));
    }
}
