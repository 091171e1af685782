//! Drives a single torrent from tracker announce to completion (§4.6).
use super::registry::{TaskRegistry, TaskRow, TaskState};
use super::EngineError;
use crate::peer::{PeerCommand, PeerConnection, PeerEvent};
use crate::piece::PieceManager;
use crate::torrent::TorrentFile;
use crate::tracker::{self, AnnounceEvent};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

/// Passes with no newly-downloaded piece before a torrent is marked stalled.
const STALL_THRESHOLD_PASSES: u32 = 20;
/// Sleep between orchestration passes once peers are connected.
const PASS_INTERVAL: Duration = Duration::from_millis(500);
/// Outstanding block requests dispatched to a single peer per pass.
const REQUESTS_PER_PEER_PER_PASS: usize = 10;

/// Runs one torrent to completion (or to a fatal error). Spawns up to
/// `peer_fanout` peer connection tasks and drains the piece manager's
/// missing-block queue against whichever peers report having each piece.
#[instrument(level = "info", skip(tracker_client, registry), fields(name = %torrent.info.name))]
pub async fn run(
    torrent: TorrentFile,
    save_dir: std::path::PathBuf,
    peer_fanout: usize,
    tracker_client: Arc<tracker::Client>,
    registry: Arc<dyn TaskRegistry>,
) -> Result<(), EngineError> {
    let info_hash = torrent.info_hash;
    let total_bytes = torrent.total_size().max(0) as u64;
    registry.create(TaskRow::new(info_hash, torrent.info.name.clone(), total_bytes));

    let manager = Arc::new(PieceManager::new(torrent.clone(), save_dir)?);

    // A tracker returning zero peers is a non-fatal condition here: the task
    // row is surfaced as failed so a caller can decide what to do next (retry
    // later, fall back to some other peer source), but it isn't propagated
    // as an orchestrator error.
    let peers = tracker_client
        .announce_tiered(&torrent, AnnounceEvent::Started)
        .await?;
    if peers.is_empty() {
        warn!("tracker returned no peers for this torrent");
        let mut row = registry.get(&info_hash).unwrap();
        row.state = TaskState::Failed;
        row.error_message = Some("No peers available".to_string());
        registry.save(row);
        return Ok(());
    }
    info!(count = peers.len(), "tracker returned peers");

    let (tagged_tx, mut tagged_rx) = mpsc::channel::<(usize, PeerEvent)>(256);
    let mut command_senders = Vec::new();

    for peer in peers.into_iter().take(peer_fanout) {
        let addr = std::net::SocketAddr::new(peer.ip, peer.port);
        let peer_id = tracker_client.local_peer_id();
        let (events_tx, mut events_rx) = mpsc::channel::<PeerEvent>(32);
        match PeerConnection::connect(addr, info_hash, peer_id, events_tx).await {
            Ok((conn, commands)) => {
                let peer_idx = command_senders.len();
                command_senders.push(commands);
                tokio::spawn(conn.run());

                let tagged_tx = tagged_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = events_rx.recv().await {
                        if tagged_tx.send((peer_idx, event)).await.is_err() {
                            break;
                        }
                    }
                });
            }
            Err(e) => warn!(%addr, error = %e, "failed to connect to peer"),
        }
    }
    drop(tagged_tx);

    if command_senders.is_empty() {
        let mut row = registry.get(&info_hash).unwrap();
        row.state = TaskState::Failed;
        row.error_message = Some("No peers available".to_string());
        registry.save(row);
        return Err(EngineError::NoPeersAvailable);
    }

    // Bitfields as reported by each connected peer, indexed the same way as
    // `command_senders`. Populated as `PeerEvent::BitfieldReceived`/`HaveReceived`
    // arrive; until then every peer is assumed to have nothing.
    let mut peer_bitfields: Vec<Vec<bool>> = vec![Vec::new(); command_senders.len()];
    let mut stalled_passes = 0u32;
    let mut last_progress = manager.progress();
    let session_start = Instant::now();

    {
        let mut row = registry.get(&info_hash).unwrap();
        row.state = TaskState::Downloading;
        row.connected_peers = command_senders.len();
        registry.save(row);
    }

    loop {
        if manager.is_complete() {
            break;
        }

        drain_events(&mut tagged_rx, &mut peer_bitfields, &manager);

        // Honor an externally-set pause (§4.6, §9 S6): sockets stay open and
        // events still drain above, only new `request`s are suppressed.
        let paused = registry
            .get(&info_hash)
            .map(|row| row.state == TaskState::Paused)
            .unwrap_or(false);

        if !paused {
            for (peer_idx, commands) in command_senders.iter().enumerate() {
                let has_piece = |i: u32| {
                    peer_bitfields[peer_idx]
                        .get(i as usize)
                        .copied()
                        .unwrap_or(false)
                };
                let mut dispatched = 0;
                while dispatched < REQUESTS_PER_PEER_PER_PASS {
                    let Some(piece_index) = manager.next_piece_for_peer(has_piece) else {
                        break;
                    };
                    let Some((begin, length)) = manager.next_missing_block(piece_index) else {
                        break;
                    };
                    let cmd = PeerCommand::Request { index: piece_index as u32, begin, length };
                    if commands.send(cmd).await.is_err() {
                        break;
                    }
                    dispatched += 1;
                }
            }
        }

        tokio::time::sleep(PASS_INTERVAL).await;

        // Re-check pause state after the sleep rather than trusting the
        // pre-sleep snapshot: an external resume (or pause) delivered during
        // the sleep window must not be clobbered by a stale write below.
        let still_paused = registry
            .get(&info_hash)
            .map(|row| row.state == TaskState::Paused)
            .unwrap_or(false);

        let progress = manager.progress();
        if still_paused {
            stalled_passes = 0;
        } else if progress <= last_progress {
            stalled_passes += 1;
        } else {
            stalled_passes = 0;
        }
        last_progress = progress;

        let downloaded_bytes = (progress / 100.0 * total_bytes as f64) as u64;
        let elapsed = session_start.elapsed().as_secs_f64();
        let download_speed = if elapsed > 0.0 { downloaded_bytes as f64 / elapsed } else { 0.0 };
        let eta = if download_speed > 0.0 {
            let remaining = total_bytes.saturating_sub(downloaded_bytes);
            Some(Duration::from_secs_f64(remaining as f64 / download_speed))
        } else {
            None
        };

        let mut row = registry.get(&info_hash).unwrap();
        row.progress = progress;
        row.downloaded_bytes = downloaded_bytes;
        row.download_speed = download_speed;
        row.eta = eta;
        row.state = if still_paused {
            TaskState::Paused
        } else if stalled_passes >= STALL_THRESHOLD_PASSES {
            TaskState::Stalled
        } else {
            TaskState::Downloading
        };
        registry.save(row);

        if !still_paused && stalled_passes >= STALL_THRESHOLD_PASSES {
            warn!(passes = stalled_passes, "torrent stalled, no progress");
            break;
        }
    }

    for commands in &command_senders {
        let _ = commands.send(PeerCommand::Shutdown).await;
    }

    // The loop above only ever breaks for one of two reasons: the piece
    // manager reports completion, or the stall threshold was reached. A
    // stalled torrent is not an error (spec.md S4): it might still resume if
    // a peer starts sending again, so it is reported as `Stalled`, not
    // `Failed` — `Failed` is reserved for the genuinely fatal paths above
    // (no peers at all, tracker exhaustion) that return early via `?`.
    let mut row = registry.get(&info_hash).unwrap();
    row.progress = manager.progress();

    if manager.is_complete() {
        row.state = TaskState::Completed;
        row.completed_at = Some(SystemTime::now());
        registry.save(row);
        let _ = tracker_client
            .announce_tiered(&torrent, AnnounceEvent::Completed)
            .await;
    } else {
        row.state = TaskState::Stalled;
        registry.save(row);
    }
    Ok(())
}

/// Applies every currently-queued event to the per-peer bitfield table and
/// feeds any delivered blocks to the piece manager, without blocking if the
/// channel is empty.
fn drain_events(
    tagged_rx: &mut mpsc::Receiver<(usize, PeerEvent)>,
    bitfields: &mut [Vec<bool>],
    manager: &PieceManager,
) {
    while let Ok((peer_idx, event)) = tagged_rx.try_recv() {
        match event {
            PeerEvent::HaveReceived { index } => {
                if let Some(bitfield) = bitfields.get_mut(peer_idx) {
                    set_bit(bitfield, index as usize);
                }
            }
            PeerEvent::BitfieldReceived { bitfield: bytes } => {
                if let Some(bitfield) = bitfields.get_mut(peer_idx) {
                    *bitfield = bytes_to_bits(&bytes);
                }
            }
            PeerEvent::BlockReceived { index, begin, block } => {
                match manager.add_block(index as usize, begin, block) {
                    Ok(completed) if completed => debug!(index, "piece completed"),
                    Ok(_) => {}
                    Err(e) => warn!(index, error = %e, "failed to store received block"),
                }
            }
            PeerEvent::Disconnected { reason } => {
                debug!(peer_idx, %reason, "peer disconnected");
                if let Some(bitfield) = bitfields.get_mut(peer_idx) {
                    bitfield.clear();
                }
            }
            other => debug!(peer_idx, ?other, "peer event"),
        }
    }
}

fn set_bit(bitfield: &mut Vec<bool>, index: usize) {
    if bitfield.len() <= index {
        bitfield.resize(index + 1, false);
    }
    bitfield[index] = true;
}

fn bytes_to_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = Vec::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for i in 0..8 {
            bits.push(byte & (1 << (7 - i)) != 0);
        }
    }
    bits
}
