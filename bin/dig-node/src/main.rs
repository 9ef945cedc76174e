mod cli;
mod signer;

use clap::Parser;
use cli::{ChallengeCommands, Cli, Commands, PeerCommands};
use dig_blob_store::BlobStore;
use dig_config::Config;
use dig_engine::Engine;
use dig_errors::{DigError, DigResult};
use dig_peer::{ranker, PeerPool, PoolConfig};
use dig_replicate::ReplicationController;
use dig_transport::{IdentityMaterial, Transport, TransportConfig as TransportSettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use walkdir::WalkDir;

#[tokio::main]
async fn main() {
    // rustls 0.23 needs a default crypto provider installed once per
    // process when more than one provider feature is reachable in the
    // dependency graph.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    let config_load_error;
    let config = match Config::load() {
        Ok(c) => {
            config_load_error = None;
            c
        }
        Err(e) => {
            config_load_error = Some(e.to_string());
            Config::from_env()
        }
    };

    let default_level = if cli.verbose { "debug" } else { config.logging.rust_log.as_str() };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .init();

    if let Some(e) = config_load_error {
        tracing::warn!("failed to load config, using environment/defaults: {e}");
    }

    match run(cli, config).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn run(cli: Cli, config: Config) -> DigResult<()> {
    let store_id = cli.store.clone().unwrap_or_else(|| "default".to_string());
    let store_root = config.store_dir(&store_id);

    match cli.command {
        Commands::Init => cmd_init(&store_root),
        Commands::Ingest { path } => cmd_ingest(&store_root, &path),
        Commands::Commit => cmd_commit(&store_root),
        Commands::Verify { root, content_sha256 } => cmd_verify(&store_root, &root, &content_sha256),
        Commands::Challenge { command } => cmd_challenge(&store_root, &store_id, command),
        Commands::Push { root, peers } => cmd_push(&store_root, &store_id, &peers, &root, &config).await,
        Commands::Pull { root, force, peers } => {
            cmd_pull(&store_root, &store_id, &peers, &root, force, &config).await
        }
        Commands::Peers { command } => cmd_peers(&config, command).await,
        Commands::Serve => cmd_serve(config).await,
        Commands::Metrics => cmd_metrics(),
    }
}

fn cmd_metrics() -> DigResult<()> {
    let text = dig_metrics::export().map_err(|e| DigError::resource(e.to_string()))?;
    print!("{text}");
    Ok(())
}

fn pool_config_from(config: &Config) -> PoolConfig {
    PoolConfig {
        cooldown: Duration::from_secs(config.peers.cooldown_secs),
        max_retries: config.peers.max_pool_retries,
        default_weight: config.peers.default_weight as i32,
        prioritized_weight: config.peers.prioritized_weight as i32,
    }
}

#[tracing::instrument(skip(config))]
async fn cmd_serve(config: Config) -> DigResult<()> {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    // `dig_server::run` is the single authority on `mercenary_mode`; it
    // no-ops instead of binding when the config says not to serve peers.
    let identity = IdentityMaterial::load_or_generate()?;
    let bind_ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
    let content_addr = SocketAddr::new(bind_ip, config.network.content_port);
    let propagation_addr = SocketAddr::new(bind_ip, config.network.propagation_port);

    println!(
        "serving content on {content_addr} and propagation on {propagation_addr}"
    );
    let state = Arc::new(dig_server::ServerState::new(config));
    dig_server::run(state, &identity, content_addr, propagation_addr).await;
    Ok(())
}

fn cmd_init(store_root: &Path) -> DigResult<()> {
    Engine::open(store_root)?;
    println!("initialized store at {}", store_root.display());
    Ok(())
}

#[tracing::instrument]
fn cmd_ingest(store_root: &Path, path: &Path) -> DigResult<()> {
    let mut engine = Engine::open(store_root)?;
    for entry in WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let key_hex = hex::encode(relative.as_bytes());
        let file = std::fs::File::open(entry.path())?;
        let sha256 = engine.upsert(&key_hex, file)?;
        println!("{key_hex}  {relative}  {sha256}");
    }
    println!("root: {}", engine.current_root());
    Ok(())
}

#[tracing::instrument]
fn cmd_commit(store_root: &Path) -> DigResult<()> {
    let mut engine = Engine::open(store_root)?;
    let root = engine.commit()?;
    println!("committed generation with root {root}");
    Ok(())
}

fn cmd_verify(store_root: &Path, root: &str, content_sha256: &str) -> DigResult<()> {
    let engine = Engine::open(store_root)?;
    let ok = engine.verify_blob(content_sha256, root)?;
    println!("{ok}");
    if ok {
        Ok(())
    } else {
        Err(DigError::integrity(format!("blob {content_sha256} not valid under root {root}")))
    }
}

#[tracing::instrument]
fn cmd_challenge(store_root: &Path, store_id: &str, command: ChallengeCommands) -> DigResult<()> {
    let engine = Engine::open(store_root)?;
    let blobs = BlobStore::new(store_root)?;
    match command {
        ChallengeCommands::Respond { key } => {
            let (challenge, sha256) = dig_challenge::generate_for_key(&engine, store_id, &key)?;
            let response = dig_challenge::respond(&blobs, &sha256, &challenge)?;
            println!("{}", challenge.to_json()?);
            println!("response: {response}");
        }
        ChallengeCommands::Verify { client_response, server_response } => {
            let ok = dig_challenge::verify(&client_response, &server_response);
            println!("{ok}");
            if !ok {
                return Err(DigError::integrity("challenge response mismatch"));
            }
        }
    }
    Ok(())
}

#[tracing::instrument(skip(store_root, config))]
async fn cmd_push(store_root: &Path, store_id: &str, peers: &[String], root: &str, config: &Config) -> DigResult<()> {
    let engine = Engine::open(store_root)?;
    let manifest = engine.manifest();
    let generation = manifest.load_generation(root)?;
    let local_index = manifest.roots()?.iter().position(|r| r == root).unwrap_or(0) as u64;

    let identity = IdentityMaterial::load_or_generate()?;
    let transport = Arc::new(Transport::new(TransportSettings::default(), &identity)?);
    let signer = Arc::new(signer::LocalSigner::load_or_generate()?);
    let controller = ReplicationController::new(transport, signer);
    let blobs = BlobStore::new(store_root)?;

    let mut pool = PeerPool::new(peers.to_vec(), &[], pool_config_from(config));
    let served_by = pool
        .with_retry(|peer| {
            let controller = &controller;
            let generation = &generation;
            let blobs = &blobs;
            async move {
                controller.push(&peer, store_id, generation, local_index, blobs).await?;
                Ok(peer)
            }
        })
        .await?;
    println!("pushed generation {root} to {served_by}");
    Ok(())
}

#[tracing::instrument(skip(store_root, config))]
async fn cmd_pull(
    store_root: &Path,
    store_id: &str,
    peers: &[String],
    root: &str,
    force: bool,
    config: &Config,
) -> DigResult<()> {
    let identity = IdentityMaterial::load_or_generate()?;
    let transport = Arc::new(Transport::new(TransportSettings::default(), &identity)?);
    let signer = Arc::new(signer::LocalSigner::load_or_generate()?);
    let controller = ReplicationController::new(transport, signer);
    let blacklist = dashmap::DashMap::new();

    let mut pool = PeerPool::new(peers.to_vec(), &[], pool_config_from(config));
    let served_by = pool
        .with_retry(|peer| {
            let controller = &controller;
            let blacklist = &blacklist;
            async move {
                controller.pull(&peer, store_id, root, store_root, force, blacklist).await?;
                Ok(peer)
            }
        })
        .await?;
    println!("pulled generation {root} from {served_by}");
    Ok(())
}

#[tracing::instrument(skip(config))]
async fn cmd_peers(config: &Config, command: PeerCommands) -> DigResult<()> {
    match command {
        PeerCommands::List => {
            // Discovery priority order (§4.8): trusted node, localhost, a
            // fixed alias, DNS-resolved introducers. On-chain epoch-hinted
            // coin sets need the blockchain driver collaborator and are
            // not produced here.
            let mut addresses = Vec::new();
            if let Some(trusted) = &config.network.trusted_fullnode {
                addresses.push(format!("{trusted}:{}", config.network.trusted_fullnode_port));
            }
            addresses.push(format!("127.0.0.1:{}", config.network.content_port));
            if let Some(alias) = &config.peers.fixed_alias {
                addresses.push(alias.clone());
            }
            if !config.peers.introducer_hosts.is_empty() {
                addresses.extend(dig_peer::resolve_introducer_hosts(&config.peers.introducer_hosts).await);
            }
            for addr in &addresses {
                println!("{addr}");
            }
        }
        PeerCommands::Rank { addresses } => {
            let identity = IdentityMaterial::load_or_generate()?;
            let transport = Transport::new(TransportSettings::default(), &identity)?;
            let ranked = ranker::rank(&addresses, &transport).await;
            for peer in ranked {
                println!(
                    "{}  latency={:.3}s  bandwidth={:.0} B/s",
                    peer.address, peer.latency_secs, peer.bandwidth_bytes_per_sec
                );
            }
        }
    }
    Ok(())
}
