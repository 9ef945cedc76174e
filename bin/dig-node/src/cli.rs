use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "dig-node",
    version = env!("CARGO_PKG_VERSION"),
    author = "DIG Network Contributors",
    about = "DIG content-addressed storage node"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,

    /// Store id (hex) to operate on.
    #[clap(short, long, global = true)]
    pub store: Option<String>,

    /// Enable verbose logging.
    #[clap(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a store directory skeleton.
    Init,

    /// Walk a working directory into the engine, keyed by relative path.
    Ingest {
        path: PathBuf,
    },

    /// Commit the working generation.
    Commit,

    /// Verify a blob's content sha256 against a committed generation.
    Verify {
        root: String,
        content_sha256: String,
    },

    /// Challenge-response possession proofs.
    Challenge {
        #[clap(subcommand)]
        command: ChallengeCommands,
    },

    /// Push a generation to a peer, trying candidates round-robin on failure.
    Push {
        root: String,
        #[clap(required = true)]
        peers: Vec<String>,
    },

    /// Pull a generation from a peer, trying candidates round-robin on failure.
    Pull {
        root: String,
        #[clap(long)]
        force: bool,
        #[clap(required = true)]
        peers: Vec<String>,
    },

    /// Peer discovery and ranking.
    Peers {
        #[clap(subcommand)]
        command: PeerCommands,
    },

    /// Run the content and propagation servers (no-op under `mercenary_mode`).
    Serve,

    /// Print process-wide peer pool and replication counters.
    Metrics,
}

#[derive(Subcommand, Debug)]
pub enum ChallengeCommands {
    /// Generate a challenge and compute the expected response for `key`.
    Respond { key: String },
    /// Verify a client response against a server response.
    Verify {
        client_response: String,
        server_response: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum PeerCommands {
    /// List configured/discovered peer addresses.
    List,
    /// Rank peers by latency and bandwidth.
    Rank { addresses: Vec<String> },
}
