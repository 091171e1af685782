//! Engine-wide configuration, built from CLI flags (§6).
use clap::Parser;
use std::path::PathBuf;

/// BitTorrent download engine.
#[derive(Debug, Parser)]
#[command(name = "bitengine", version, about)]
pub struct Args {
    /// Path to a `.torrent` file, or a `magnet:?` URI.
    pub source: String,

    /// Directory to write downloaded files into.
    #[arg(short, long, default_value = "./downloads")]
    pub output: PathBuf,

    /// TCP port this engine listens on (unused for outbound-only sessions
    /// but announced to trackers).
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections to keep open at once per torrent.
    #[arg(long, default_value_t = 5)]
    pub peer_fanout: usize,
}

/// Runtime configuration derived from `Args`, held by the `Engine`.
#[derive(Debug, Clone)]
pub struct Config {
    pub save_dir: PathBuf,
    pub listen_port: u16,
    pub peer_fanout: usize,
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            save_dir: args.output.clone(),
            listen_port: args.port,
            peer_fanout: args.peer_fanout,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("./downloads"),
            listen_port: 6881,
            peer_fanout: 5,
        }
    }
}
