//! This module implements the BitTorrent peer handshake protocol.
//!
//! The handshake is the first message exchanged between two peers. It verifies
//! that both peers are participating in the same torrent (via info_hash) and
//! establishes basic protocol compatibility.
use super::{PeerError, PeerResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::instrument;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";

/** Represents a BitTorrent handshake message as defined in the BitTorrent protocol.

A handshake is the first message exchanged between peers and contains:
- Protocol identifier ("BitTorrent protocol")
- Reserved bytes for protocol extensions
- Info hash identifying the torrent
- Peer ID identifying the client */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    /** Creates a new handshake with the specified info hash and peer ID. */
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /** Serializes the handshake into a 68-byte array as per the BitTorrent protocol.

    - 1 byte: protocol string length (19)
    - 19 bytes: protocol string ("BitTorrent protocol")
    - 8 bytes: reserved bytes
    - 20 bytes: info hash
    - 20 bytes: peer ID */
    #[instrument(level = "trace")]
    pub fn serialize(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /**
    Reads exactly 68 handshake bytes from `stream`. The reserved bytes are
    ignored on receipt (we don't negotiate any extensions); the remote
    peer-id is recorded but not validated (§4.4). The info-hash must match
    `expected_info_hash` or the session is a fatal protocol error.
    */
    #[instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream, expected_info_hash: [u8; 20]) -> PeerResult<Self> {
        let mut buf = [0u8; 68];
        stream.read_exact(&mut buf).await?;

        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL.as_slice() {
            return Err(PeerError::InvalidProtocol);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        if info_hash != expected_info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Performs a complete outbound handshake: connect, send our handshake,
    /// read and validate the peer's handshake. Returns the open socket and
    /// the peer's handshake (for its peer-id).
    #[instrument(level = "debug", skip(peer_id))]
    pub async fn do_handshake(
        peer_addr: std::net::SocketAddr,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> PeerResult<(TcpStream, Handshake)> {
        let mut stream = TcpStream::connect(peer_addr).await?;

        let ours = Handshake::new(info_hash, peer_id);
        stream.write_all(&ours.serialize()).await?;

        let theirs = Handshake::read(&mut stream, info_hash).await?;
        Ok((stream, theirs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn serialize_has_correct_shape() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.serialize();
        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], b"BitTorrent protocol");
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &[1u8; 20]);
        assert_eq!(&bytes[48..68], &[2u8; 20]);
    }

    #[tokio::test]
    async fn handshake_round_trips_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let info_hash = [7u8; 20];
        let our_id = [9u8; 20];
        let their_id = [11u8; 20];

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let theirs = Handshake::read(&mut sock, info_hash).await.unwrap();
            assert_eq!(theirs.peer_id, our_id);
            sock.write_all(&Handshake::new(info_hash, their_id).serialize())
                .await
                .unwrap();
        });

        let (_, theirs) = Handshake::do_handshake(addr, info_hash, our_id)
            .await
            .unwrap();
        assert_eq!(theirs.peer_id, their_id);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn rejects_mismatched_info_hash() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut incoming = [0u8; 68];
            sock.read_exact(&mut incoming).await.unwrap();
            sock.write_all(&Handshake::new([0xFFu8; 20], [3u8; 20]).serialize())
                .await
                .unwrap();
        });

        let result = Handshake::do_handshake(addr, [1u8; 20], [2u8; 20]).await;
        assert!(matches!(result, Err(PeerError::InfoHashMismatch)));
        server.await.unwrap();
    }
}
