//! Piece/block bookkeeping and on-disk storage (§4.5).
//!
//! The manager holds a single critical section guarded by a `std::sync::Mutex`
//! (never a `tokio::sync::Mutex` — the section never holds across an
//! `.await`): bookkeeping for which blocks have landed, and the atomic
//! verify+write+flip-downloaded step once a piece's last block arrives. File
//! I/O for a completed piece happens while the lock is held, intentionally —
//! it is bounded by `piece_length` and keeps the downloaded bitmap from ever
//! observing a piece as done before its bytes are actually on disk.
pub mod file_span;

use crate::torrent::TorrentFile;
use file_span::{resolve, spans_for_range};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Fixed block size requested from peers (§4.4, §4.5).
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Error)]
pub enum PieceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece index {0} out of range")]
    InvalidPieceIndex(usize),

    #[error("block begin {begin} + length {length} exceeds piece size {piece_size}")]
    BlockOutOfBounds { begin: u32, length: u32, piece_size: i64 },
}

pub type PieceResult<T> = std::result::Result<T, PieceError>;

#[derive(Debug, Default)]
struct Piece {
    downloaded: bool,
    blocks: HashMap<u32, Vec<u8>>,
}

/// Tracks per-piece download state and performs verified writes to disk.
pub struct PieceManager {
    torrent: TorrentFile,
    save_dir: PathBuf,
    pieces: Mutex<Vec<Piece>>,
}

impl PieceManager {
    /// Builds a manager for `torrent`, preallocating its on-disk file(s)
    /// under `save_dir` (§4.5: sparse preallocation via seek-and-write-one-byte).
    #[instrument(level = "debug", skip(torrent))]
    pub fn new(torrent: TorrentFile, save_dir: PathBuf) -> PieceResult<Self> {
        let num_pieces = torrent.num_pieces();
        preallocate(&torrent, &save_dir)?;
        Ok(Self {
            torrent,
            save_dir,
            pieces: Mutex::new((0..num_pieces).map(|_| Piece::default()).collect()),
        })
    }

    pub fn torrent(&self) -> &TorrentFile {
        &self.torrent
    }

    /// Returns the next unfetched block for `piece_index`, or `None` if the
    /// piece is already complete or every remaining block is already pending
    /// (the caller is expected to track in-flight requests separately).
    pub fn next_missing_block(&self, piece_index: usize) -> Option<(u32, u32)> {
        let pieces = self.pieces.lock().unwrap();
        let piece = pieces.get(piece_index)?;
        if piece.downloaded {
            return None;
        }
        let piece_size = self.torrent.piece_size(piece_index) as u32;
        let mut begin = 0u32;
        while begin < piece_size {
            let length = BLOCK_SIZE.min(piece_size - begin);
            if !piece.blocks.contains_key(&begin) {
                return Some((begin, length));
            }
            begin += BLOCK_SIZE;
        }
        None
    }

    /// Returns the index of the first piece that isn't downloaded yet and
    /// for which `has_piece` reports the peer holds it.
    pub fn next_piece_for_peer(&self, has_piece: impl Fn(u32) -> bool) -> Option<usize> {
        let pieces = self.pieces.lock().unwrap();
        pieces
            .iter()
            .enumerate()
            .find(|(i, p)| !p.downloaded && has_piece(*i as u32))
            .map(|(i, _)| i)
    }

    /// Records a received block. If it completes the piece, verifies the
    /// hash, writes the piece to disk, and flips `downloaded`. Delivering a
    /// block for an already-downloaded piece is a no-op (idempotent, §8).
    #[instrument(level = "debug", skip(self, block))]
    pub fn add_block(&self, index: usize, begin: u32, block: Vec<u8>) -> PieceResult<bool> {
        if index >= self.torrent.num_pieces() {
            return Err(PieceError::InvalidPieceIndex(index));
        }
        let piece_size = self.torrent.piece_size(index);
        if begin as i64 + block.len() as i64 > piece_size {
            return Err(PieceError::BlockOutOfBounds {
                begin,
                length: block.len() as u32,
                piece_size,
            });
        }

        let mut pieces = self.pieces.lock().unwrap();
        let piece = &mut pieces[index];
        if piece.downloaded {
            return Ok(false);
        }
        piece.blocks.insert(begin, block);

        if !piece_is_complete(piece, piece_size) {
            return Ok(false);
        }

        let assembled = assemble(piece, piece_size);
        if !hash_matches(&assembled, self.torrent.pieces_hash[index]) {
            warn!(index, "piece failed hash verification, discarding blocks");
            piece.blocks.clear();
            return Ok(false);
        }

        let piece_start = index as i64 * self.torrent.info.piece_length;
        self.write_spans(piece_start, &assembled)?;
        piece.downloaded = true;
        piece.blocks.clear();
        debug!(index, "piece verified and written");
        Ok(true)
    }

    fn write_spans(&self, start: i64, data: &[u8]) -> PieceResult<()> {
        let mut consumed: usize = 0;
        for span in spans_for_range(&self.torrent, start, data.len() as i64) {
            let path = resolve(&self.save_dir, &span);
            let chunk = &data[consumed..consumed + span.length as usize];
            consumed += span.length as usize;

            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(span.file_offset))?;
            file.write_all(chunk)?;
        }
        Ok(())
    }

    /// Percentage of pieces downloaded, in `[0.0, 100.0]` (spec.md §4.5:
    /// `100 · downloaded_pieces / num_pieces`).
    pub fn progress(&self) -> f64 {
        let pieces = self.pieces.lock().unwrap();
        if pieces.is_empty() {
            return 100.0;
        }
        let done = pieces.iter().filter(|p| p.downloaded).count();
        100.0 * done as f64 / pieces.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.lock().unwrap().iter().all(|p| p.downloaded)
    }

    pub fn downloaded_bitfield(&self) -> Vec<bool> {
        self.pieces.lock().unwrap().iter().map(|p| p.downloaded).collect()
    }
}

fn piece_is_complete(piece: &Piece, piece_size: i64) -> bool {
    let total: i64 = piece.blocks.values().map(|b| b.len() as i64).sum();
    total == piece_size
}

fn assemble(piece: &Piece, piece_size: i64) -> Vec<u8> {
    let mut out = vec![0u8; piece_size as usize];
    for (&begin, block) in &piece.blocks {
        let begin = begin as usize;
        out[begin..begin + block.len()].copy_from_slice(block);
    }
    out
}

fn hash_matches(data: &[u8], expected: [u8; 20]) -> bool {
    let actual: [u8; 20] = Sha1::digest(data).into();
    actual == expected
}

/// Preallocates every file the torrent will write to by seeking to its final
/// byte and writing a single zero, so later writes never need to grow the
/// file mid-download. Creates parent directories for multi-file torrents.
fn preallocate(torrent: &TorrentFile, save_dir: &std::path::Path) -> PieceResult<()> {
    std::fs::create_dir_all(save_dir)?;

    if !torrent.info.is_directory {
        let path = save_dir.join(&torrent.info.name);
        preallocate_one(&path, torrent.total_size())?;
        return Ok(());
    }

    let mut cursor: i64 = 0;
    for file in &torrent.info.files {
        let mut path = save_dir.join(&torrent.info.name);
        for component in &file.path {
            path = path.join(component);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        preallocate_one(&path, file.length)?;
        cursor += file.length;
    }
    let _ = cursor;
    Ok(())
}

fn preallocate_one(path: &std::path::Path, length: i64) -> PieceResult<()> {
    let mut file = OpenOptions::new().write(true).create(true).open(path)?;
    if length > 0 {
        file.seek(SeekFrom::Start((length - 1) as u64))?;
        file.write_all(&[0u8])?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::InfoDict;
    use tempfile::tempdir;

    fn single_piece_torrent(data: &[u8]) -> TorrentFile {
        let hash: [u8; 20] = Sha1::digest(data).into();
        TorrentFile {
            announce: "http://t".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: InfoDict {
                piece_length: data.len() as i64,
                pieces: hash.to_vec(),
                private: false,
                name: "file.bin".to_string(),
                length: Some(data.len() as i64),
                files: Vec::new(),
                is_directory: false,
            },
            info_hash: [0u8; 20],
            pieces_hash: vec![hash],
        }
    }

    #[test]
    fn completes_piece_once_every_block_lands() {
        let dir = tempdir().unwrap();
        let data = vec![42u8; BLOCK_SIZE as usize * 2];
        let torrent = single_piece_torrent(&data);
        let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

        let first = &data[..BLOCK_SIZE as usize];
        let second = &data[BLOCK_SIZE as usize..];

        assert!(!manager.add_block(0, 0, first.to_vec()).unwrap());
        assert!(manager.add_block(0, BLOCK_SIZE, second.to_vec()).unwrap());
        assert!(manager.is_complete());

        let written = std::fs::read(dir.path().join("file.bin")).unwrap();
        assert_eq!(written, data);
    }

    #[test]
    fn delivering_a_block_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let data = vec![7u8; BLOCK_SIZE as usize];
        let torrent = single_piece_torrent(&data);
        let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

        assert!(manager.add_block(0, 0, data.clone()).unwrap());
        assert!(!manager.add_block(0, 0, data.clone()).unwrap());
        assert!(manager.is_complete());
    }

    #[test]
    fn hash_mismatch_discards_blocks_and_allows_retry() {
        let dir = tempdir().unwrap();
        let data = vec![1u8; BLOCK_SIZE as usize];
        let torrent = single_piece_torrent(&data);
        let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

        let bad = vec![2u8; BLOCK_SIZE as usize];
        assert!(!manager.add_block(0, 0, bad).unwrap());
        assert!(!manager.is_complete());

        assert!(manager.add_block(0, 0, data).unwrap());
        assert!(manager.is_complete());
    }

    #[test]
    fn next_missing_block_walks_forward() {
        let dir = tempdir().unwrap();
        let data = vec![0u8; BLOCK_SIZE as usize * 2];
        let torrent = single_piece_torrent(&data);
        let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

        assert_eq!(manager.next_missing_block(0), Some((0, BLOCK_SIZE)));
        manager.add_block(0, 0, vec![0u8; BLOCK_SIZE as usize]).unwrap();
        assert_eq!(manager.next_missing_block(0), Some((BLOCK_SIZE, BLOCK_SIZE)));
    }

    #[test]
    fn rejects_out_of_bounds_block() {
        let dir = tempdir().unwrap();
        let data = vec![0u8; BLOCK_SIZE as usize];
        let torrent = single_piece_torrent(&data);
        let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

        let err = manager
            .add_block(0, BLOCK_SIZE, vec![1, 2, 3])
            .unwrap_err();
        assert!(matches!(err, PieceError::BlockOutOfBounds { .. }));
    }
}
