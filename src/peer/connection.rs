//! Per-peer connection state machine (§4.4, §5).
//!
//! Each peer runs as its own tokio task: connect, handshake, send
//! `interested`, then alternate between reading incoming messages and
//! draining a bounded command queue from the orchestrator. The task never
//! touches another peer's state or the piece manager directly — it reports
//! what it sees via `PeerEvent` and accepts block requests via `PeerCommand`,
//! keeping the failure of one peer from ever reaching another (§7).
use super::{Handshake, PeerError, PeerMessage, PeerResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Connect + handshake must complete within this long or the peer is given up on.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
/// A peer that sends nothing at all (not even a keep-alive) for this long is dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Outbound command queue depth; the orchestrator backs off once this fills.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Mutable session state for one peer, updated as messages arrive.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub peer_id: [u8; 20],
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub bitfield: Vec<u8>,
    pub downloaded_bytes: u64,
}

impl PeerSession {
    fn new(peer_id: [u8; 20]) -> Self {
        Self {
            peer_id,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Vec::new(),
            downloaded_bytes: 0,
        }
    }

    /// True if bit `index` is set in the peer's bitfield (peer has that piece).
    pub fn has_piece(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        self.bitfield
            .get(byte)
            .map(|b| b & (1 << bit) != 0)
            .unwrap_or(false)
    }

    fn set_piece(&mut self, index: u32) {
        let byte = (index / 8) as usize;
        let bit = 7 - (index % 8);
        if self.bitfield.len() <= byte {
            self.bitfield.resize(byte + 1, 0);
        }
        self.bitfield[byte] |= 1 << bit;
    }
}

/// Events reported up to the orchestrator as a connection progresses.
#[derive(Debug)]
pub enum PeerEvent {
    Connected { peer_id: [u8; 20] },
    BitfieldReceived { bitfield: Vec<u8> },
    HaveReceived { index: u32 },
    Unchoked,
    Choked,
    BlockReceived { index: u32, begin: u32, block: Vec<u8> },
    Disconnected { reason: String },
}

/// Instructions sent down from the orchestrator to a running peer task.
#[derive(Debug)]
pub enum PeerCommand {
    Request { index: u32, begin: u32, length: u32 },
    Shutdown,
}

/// A running peer connection: owns the socket and session state, and bridges
/// the orchestrator's command queue to wire messages.
pub struct PeerConnection {
    stream: TcpStream,
    session: PeerSession,
    events: mpsc::Sender<PeerEvent>,
    commands: mpsc::Receiver<PeerCommand>,
}

impl PeerConnection {
    /// Connects to `addr`, performs the handshake, announces `interested`,
    /// and returns the connection plus the command sender the orchestrator
    /// uses to request blocks.
    #[instrument(level = "debug", skip(peer_id, events_tx))]
    pub async fn connect(
        addr: SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        events_tx: mpsc::Sender<PeerEvent>,
    ) -> PeerResult<(Self, mpsc::Sender<PeerCommand>)> {
        let (mut stream, their_handshake) =
            timeout(HANDSHAKE_TIMEOUT, Handshake::do_handshake(addr, info_hash, peer_id))
                .await
                .map_err(|_| PeerError::HandshakeTimeout)??;

        PeerMessage::Interested.write(&mut stream).await?;
        let mut session = PeerSession::new(their_handshake.peer_id);
        session.am_interested = true;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        Ok((
            Self { stream, session, events: events_tx, commands: commands_rx },
            commands_tx,
        ))
    }

    /// Runs the read/command loop until the peer disconnects or is shut down.
    /// Consumes `self`; all exit paths report a `PeerEvent::Disconnected`.
    #[instrument(level = "debug", skip(self), fields(peer_id = ?self.session.peer_id))]
    pub async fn run(mut self) {
        let _ = self
            .events
            .send(PeerEvent::Connected { peer_id: self.session.peer_id })
            .await;

        let reason = loop {
            tokio::select! {
                biased;

                cmd = self.commands.recv() => {
                    match cmd {
                        Some(PeerCommand::Shutdown) | None => break "shutdown".to_string(),
                        Some(PeerCommand::Request { index, begin, length }) => {
                            if self.session.peer_choking {
                                debug!("skipping request, peer is choking us");
                                continue;
                            }
                            let msg = PeerMessage::Request { index, begin, length };
                            if let Err(e) = msg.write(&mut self.stream).await {
                                break format!("write failed: {e}");
                            }
                        }
                    }
                }

                frame = timeout(IDLE_TIMEOUT, PeerMessage::read(&mut self.stream)) => {
                    match frame {
                        Err(_) => break "idle timeout".to_string(),
                        Ok(Err(e)) => break format!("read failed: {e}"),
                        Ok(Ok(msg)) => {
                            if let Err(reason) = self.handle_message(msg).await {
                                break reason;
                            }
                        }
                    }
                }
            }
        };

        warn!(%reason, "peer connection closed");
        let _ = self.events.send(PeerEvent::Disconnected { reason }).await;
    }

    async fn handle_message(&mut self, msg: PeerMessage) -> Result<(), String> {
        match msg {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.session.peer_choking = true;
                let _ = self.events.send(PeerEvent::Choked).await;
            }
            PeerMessage::Unchoke => {
                self.session.peer_choking = false;
                let _ = self.events.send(PeerEvent::Unchoked).await;
            }
            PeerMessage::Interested => self.session.peer_interested = true,
            PeerMessage::NotInterested => self.session.peer_interested = false,
            PeerMessage::Have(index) => {
                self.session.set_piece(index);
                let _ = self.events.send(PeerEvent::HaveReceived { index }).await;
            }
            PeerMessage::Bitfield(bits) => {
                self.session.bitfield = bits.clone();
                let _ = self.events.send(PeerEvent::BitfieldReceived { bitfield: bits }).await;
            }
            PeerMessage::Request { .. } | PeerMessage::Cancel { .. } => {
                // We never seed in this engine; upload requests are ignored (§1 Non-goals).
            }
            PeerMessage::Piece { index, begin, block } => {
                self.session.downloaded_bytes += block.len() as u64;
                let _ = self
                    .events
                    .send(PeerEvent::BlockReceived { index, begin, block })
                    .await;
            }
        }
        Ok(())
    }
}
