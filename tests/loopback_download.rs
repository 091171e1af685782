//! End-to-end loopback scenarios driving the peer connection and piece
//! manager together, without a live network or tracker.
use bitengine::peer::{PeerCommand, PeerConnection, PeerEvent, PeerMessage};
use bitengine::piece::{PieceManager, BLOCK_SIZE};
use bitengine::torrent::{InfoDict, TorrentFile};
use sha1::{Digest, Sha1};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

fn single_piece_torrent(name: &str, payload: &[u8]) -> TorrentFile {
    let hash: [u8; 20] = Sha1::digest(payload).into();
    TorrentFile {
        announce: "http://tracker.example/announce".to_string(),
        announce_list: Vec::new(),
        creation_date: None,
        comment: String::new(),
        created_by: String::new(),
        encoding: String::new(),
        info: InfoDict {
            piece_length: payload.len() as i64,
            pieces: hash.to_vec(),
            private: false,
            name: name.to_string(),
            length: Some(payload.len() as i64),
            files: Vec::new(),
            is_directory: false,
        },
        info_hash: [0u8; 20],
        pieces_hash: vec![hash],
    }
}

/// S1: a 1-piece torrent served by one loopback peer across two blocks.
#[tokio::test]
async fn single_piece_download_completes_from_one_loopback_peer() {
    let total_size = 20000usize;
    let payload = vec![0x41u8; total_size];
    let torrent = single_piece_torrent("payload.bin", &payload);
    let info_hash = [1u8; 20];
    let our_id = [2u8; 20];
    let their_id = [3u8; 20];

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_payload = payload.clone();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        perform_inbound_handshake(&mut sock, info_hash, their_id).await;

        // First message we send: a full bitfield claiming the single piece,
        // then unchoke so the client is actually willing to send requests.
        PeerMessage::Bitfield(vec![0b1000_0000]).write(&mut sock).await.unwrap();
        PeerMessage::Unchoke.write(&mut sock).await.unwrap();

        loop {
            match PeerMessage::read(&mut sock).await {
                Ok(PeerMessage::Request { index, begin, length }) => {
                    assert_eq!(index, 0);
                    let block = server_payload[begin as usize..(begin + length) as usize].to_vec();
                    PeerMessage::Piece { index, begin, block }.write(&mut sock).await.unwrap();
                }
                Ok(PeerMessage::Interested) => {}
                _ => break,
            }
        }
    });

    let dir = tempdir().unwrap();
    let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

    let (events_tx, mut events_rx) = mpsc::channel::<PeerEvent>(32);
    let (conn, commands) = PeerConnection::connect(addr, info_hash, our_id, events_tx)
        .await
        .unwrap();
    tokio::spawn(conn.run());

    // Wait for both the bitfield and the unchoke before issuing requests:
    // a request sent while the connection still believes it's choked is
    // silently dropped (§4.4), so both events must land first.
    let mut saw_bitfield = false;
    let mut saw_unchoke = false;
    while !(saw_bitfield && saw_unchoke) {
        match events_rx.recv().await.unwrap() {
            PeerEvent::BitfieldReceived { .. } => saw_bitfield = true,
            PeerEvent::Unchoked => saw_unchoke = true,
            _ => {}
        }
    }

    let (begin1, len1) = manager.next_missing_block(0).unwrap();
    commands
        .send(PeerCommand::Request { index: 0, begin: begin1, length: len1 })
        .await
        .unwrap();
    let block1 = expect_block(&mut events_rx).await;
    manager.add_block(0, block1.1, block1.2).unwrap();

    let (begin2, len2) = manager.next_missing_block(0).unwrap();
    assert_eq!(begin2, BLOCK_SIZE);
    commands
        .send(PeerCommand::Request { index: 0, begin: begin2, length: len2 })
        .await
        .unwrap();
    let block2 = expect_block(&mut events_rx).await;
    assert!(manager.add_block(0, block2.1, block2.2).unwrap());

    assert!(manager.is_complete());
    assert_eq!(manager.progress(), 100.0);

    let written = std::fs::read(dir.path().join("payload.bin")).unwrap();
    assert_eq!(written, payload);

    let _ = commands.send(PeerCommand::Shutdown).await;
    let _ = server.await;
}

/// S3: a corrupted block fails verification and a correct re-serve completes.
#[tokio::test]
async fn corrupted_block_fails_verification_then_recovers_on_retry() {
    let payload = vec![0x7Bu8; BLOCK_SIZE as usize];
    let torrent = single_piece_torrent("clip.bin", &payload);
    let dir = tempdir().unwrap();
    let manager = PieceManager::new(torrent, dir.path().to_path_buf()).unwrap();

    let mut corrupted = payload.clone();
    corrupted[0] ^= 0xFF;
    assert!(!manager.add_block(0, 0, corrupted).unwrap());
    assert!(!manager.is_complete());

    assert!(manager.add_block(0, 0, payload.clone()).unwrap());
    assert!(manager.is_complete());

    let written = std::fs::read(dir.path().join("clip.bin")).unwrap();
    assert_eq!(written, payload);
}

async fn expect_block(events_rx: &mut mpsc::Receiver<PeerEvent>) -> (u32, u32, Vec<u8>) {
    loop {
        match events_rx.recv().await.unwrap() {
            PeerEvent::BlockReceived { index, begin, block } => return (index, begin, block),
            _ => continue,
        }
    }
}

async fn perform_inbound_handshake(sock: &mut TcpStream, info_hash: [u8; 20], their_id: [u8; 20]) {
    let mut buf = [0u8; 68];
    sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf[28..48], &info_hash[..]);

    let mut response = [0u8; 68];
    response[0] = 19;
    response[1..20].copy_from_slice(b"BitTorrent protocol");
    response[28..48].copy_from_slice(&info_hash);
    response[48..68].copy_from_slice(&their_id);
    sock.write_all(&response).await.unwrap();
}
