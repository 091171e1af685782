//! The download engine: a non-singleton owner of every active torrent (§4.7).
//!
//! Unlike a process-wide manager, `Engine` is an ordinary value — an
//! application can hold several, each with its own `Config`, peer-id, and
//! task registry. Cloning an `Engine` is cheap (it's `Arc`-backed internally)
//! and every clone shares the same in-flight torrents.
pub mod orchestrator;
pub mod registry;

pub use registry::{InMemoryRegistry, TaskRegistry, TaskRow, TaskState};

use crate::config::Config;
use crate::peer::PeerError;
use crate::piece::PieceError;
use crate::torrent::{self, MagnetLink, TorrentError, TorrentFile};
use crate::tracker::{self, TrackerError};
use crate::{bencode, peer_id};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Piece(#[from] PieceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("tracker returned no peers for this torrent")]
    NoPeersAvailable,

    #[error("no torrent registered for that info-hash")]
    UnknownTorrent,

    #[error("magnet metadata exchange (ut_metadata) is not implemented; supply a .torrent file")]
    MagnetMetadataUnsupported,
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

struct ActiveTorrent {
    handle: JoinHandle<Result<(), EngineError>>,
}

/// Owns configuration, a local peer-id, and the set of torrents currently
/// running. Not a singleton: construct as many as the embedding application
/// needs.
pub struct Engine {
    config: Config,
    peer_id: [u8; 20],
    registry: Arc<dyn TaskRegistry>,
    active: Mutex<HashMap<[u8; 20], ActiveTorrent>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, Arc::new(InMemoryRegistry::new()))
    }

    pub fn with_registry(config: Config, registry: Arc<dyn TaskRegistry>) -> Self {
        Self {
            config,
            peer_id: peer_id::generate(),
            registry,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> Arc<dyn TaskRegistry> {
        self.registry.clone()
    }

    /// Parses and starts downloading a `.torrent` file from disk.
    #[instrument(level = "info", skip(self))]
    pub async fn add_torrent_file(&self, path: &Path) -> EngineResult<[u8; 20]> {
        let bytes = tokio::fs::read(path).await?;
        let value = bencode::decode(&bytes).map_err(TorrentError::from)?;
        let torrent = TorrentFile::parse(value).map_err(|e| match e.downcast::<TorrentError>() {
            Ok(te) => te,
            Err(other) => TorrentError::InvalidFormat(other.to_string()),
        })?;
        self.spawn_torrent(torrent).await
    }

    /// Parses a magnet URI. Since metadata exchange (BEP-9/BEP-10) isn't
    /// implemented, a magnet link alone can never start a download — this
    /// only validates the URI and surfaces that limitation explicitly rather
    /// than silently falling back to anything.
    #[instrument(level = "info", skip(self))]
    pub async fn add_magnet(&self, uri: &str) -> EngineResult<MagnetLink> {
        let link = torrent::magnet::parse(uri)?;
        tracing::warn!(
            info_hash = %hex::encode(link.info_hash),
            "magnet metadata exchange is not implemented, cannot start download from a magnet alone"
        );
        Err(EngineError::MagnetMetadataUnsupported)
    }

    async fn spawn_torrent(&self, torrent: TorrentFile) -> EngineResult<[u8; 20]> {
        let info_hash = torrent.info_hash;
        let tracker_client = Arc::new(tracker::Client::new(self.config.listen_port, self.peer_id)?);
        let registry = self.registry.clone();
        let save_dir = self.config.save_dir.clone();
        let peer_fanout = self.config.peer_fanout;

        let handle = tokio::spawn(orchestrator::run(
            torrent,
            save_dir,
            peer_fanout,
            tracker_client,
            registry,
        ));

        self.active.lock().await.insert(info_hash, ActiveTorrent { handle });
        Ok(info_hash)
    }

    /// Suspends the request loop for a running torrent without closing its
    /// peer sockets: the orchestrator task keeps draining peer events, it
    /// just stops dispatching new block requests until resumed (§4.6, §9 S6).
    pub async fn pause(&self, info_hash: &[u8; 20]) -> EngineResult<()> {
        if !self.active.lock().await.contains_key(info_hash) {
            return Err(EngineError::UnknownTorrent);
        }
        let mut row = self.registry.get(info_hash).ok_or(EngineError::UnknownTorrent)?;
        row.state = TaskState::Paused;
        self.registry.save(row);
        Ok(())
    }

    /// Resumes a paused torrent's request loop.
    pub async fn resume(&self, info_hash: &[u8; 20]) -> EngineResult<()> {
        if !self.active.lock().await.contains_key(info_hash) {
            return Err(EngineError::UnknownTorrent);
        }
        let mut row = self.registry.get(info_hash).ok_or(EngineError::UnknownTorrent)?;
        row.state = TaskState::Downloading;
        self.registry.save(row);
        Ok(())
    }

    /// Stops the torrent and removes its progress row entirely.
    pub async fn remove(&self, info_hash: &[u8; 20]) -> EngineResult<()> {
        let mut active = self.active.lock().await;
        if let Some(torrent) = active.remove(info_hash) {
            torrent.handle.abort();
        }
        self.registry.delete(info_hash);
        Ok(())
    }

    pub async fn status(&self, info_hash: &[u8; 20]) -> Option<TaskRow> {
        self.registry.get(info_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_on_unknown_torrent_errors() {
        let engine = Engine::new(Config::default());
        let result = engine.pause(&[9u8; 20]).await;
        assert!(matches!(result, Err(EngineError::UnknownTorrent)));
    }

    #[tokio::test]
    async fn add_magnet_parses_but_refuses_to_start() {
        let engine = Engine::new(Config::default());
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&dn=test";
        let result = engine.add_magnet(uri).await;
        assert!(matches!(result, Err(EngineError::MagnetMetadataUnsupported)));
    }

    #[tokio::test]
    async fn remove_clears_registry_row() {
        let engine = Engine::new(Config::default());
        engine.registry().create(TaskRow::new([1u8; 20], "x".to_string(), 10));
        engine.remove(&[1u8; 20]).await.unwrap();
        assert!(engine.status(&[1u8; 20]).await.is_none());
    }
}
