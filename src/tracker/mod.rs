//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers, including:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Tiered failover across `announce`/`announce-list`
//!
//! Used by the client to discover peers for a torrent.
use crate::torrent::TorrentFile;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Per-tracker timeout (§4.3): a slow tracker must not stall the whole tier.
const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),

    #[error("tracker returned failure reason: {0}")]
    FailureReason(String),

    #[error("UDP trackers are not supported")]
    UdpUnsupported,

    #[error("all trackers in all tiers failed or returned no peers")]
    AllTiersExhausted,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The event reported to the tracker on an announce, per BEP-3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    Empty,
}

impl AnnounceEvent {
    fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Empty => "",
        }
    }
}

/// Represents a client communicating with a bittorent tracker
#[derive(Debug)]
pub struct Client {
    peer_id: [u8; 20],
    port: u16,
    http: reqwest::Client,
}

/// Contains the parameters for a tracker announce request
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub compact: bool,
    pub left: i64,
    pub event: AnnounceEvent,
}

/// Represents a peer received from the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Contains the parsed response from a tracker.
#[derive(Debug)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: i64,
    #[serde(default)]
    peers: Peers,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Peers {
    Compact(Vec<u8>),
    NonCompact(Vec<PeerDict>),
}

impl Default for Peers {
    fn default() -> Self {
        Peers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct PeerDict {
    ip: String,
    port: u16,
}

impl Client {
    pub fn new(port: u16, peer_id: [u8; 20]) -> TrackerResult<Self> {
        Ok(Self {
            peer_id,
            port,
            http: reqwest::Client::builder().timeout(TRACKER_TIMEOUT).build()?,
        })
    }

    /// The local peer-id this client announces to trackers, reused for the
    /// peer-wire handshake so both identify the same client.
    pub fn local_peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Announces to every tracker in `torrent`'s tiers in order, returning the
    /// peer list from the first tracker that answers with at least one peer.
    ///
    /// A tier is exhausted (every URL in it tried and failed) before moving to
    /// the next tier, per §4.3. A single tracker's network/decode failure is
    /// non-fatal and just advances to the next URL.
    #[tracing::instrument(skip(self, torrent), level = "info")]
    pub async fn announce_tiered(
        &self,
        torrent: &TorrentFile,
        event: AnnounceEvent,
    ) -> TrackerResult<Vec<Peer>> {
        for tier in self.tiers(torrent) {
            for url in tier {
                match self.announce_one(&url, torrent, event).await {
                    Ok(response) if !response.peers.is_empty() => return Ok(response.peers),
                    Ok(_) => {
                        tracing::debug!(%url, "tracker returned zero peers, trying next");
                    }
                    Err(e) => {
                        tracing::warn!(%url, error = %e, "tracker announce failed, trying next");
                    }
                }
            }
        }
        Err(TrackerError::AllTiersExhausted)
    }

    /// Builds the tier list: `announce-list` if present, else a single tier
    /// containing just `announce` (§4.1).
    fn tiers(&self, torrent: &TorrentFile) -> Vec<Vec<String>> {
        if !torrent.announce_list.is_empty() {
            torrent.announce_list.clone()
        } else {
            vec![vec![torrent.announce.clone()]]
        }
    }

    /// Sends an announce request to a single tracker URL.
    async fn announce_one(
        &self,
        url: &str,
        torrent: &TorrentFile,
        event: AnnounceEvent,
    ) -> TrackerResult<AnnounceResponse> {
        if url.starts_with("udp://") {
            return Err(TrackerError::UdpUnsupported);
        }

        let request = AnnounceRequest {
            info_hash: torrent.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded: 0,
            downloaded: 0,
            compact: true,
            left: torrent.total_size(),
            event,
        };

        let mut parsed = url::Url::parse(url)?;
        let params = [
            ("info_hash", url_encode(&request.info_hash)),
            ("peer_id", url_encode(&request.peer_id)),
            ("port", request.port.to_string()),
            ("uploaded", request.uploaded.to_string()),
            ("downloaded", request.downloaded.to_string()),
            ("left", request.left.to_string()),
            ("compact", (request.compact as i32).to_string()),
            ("event", event.as_str().to_string()),
        ];
        parsed.query_pairs_mut().extend_pairs(&params).finish();

        tracing::debug!(url = %parsed, "making announce request to tracker");
        let response = self.http.get(parsed).send().await?;
        let response_bytes = response.bytes().await?;
        Self::parse_announce_response(&response_bytes)
    }

    /// Parses the response from a BitTorrent tracker announce request.
    ///
    /// Handles both the compact and non-compact peer list formats as specified
    /// by the BitTorrent protocol:
    /// - **Compact format**: the "peers" field is a byte string where each peer
    ///   is represented by 6 bytes (4 for the IPv4 address, 2 for the port, big
    ///   endian).
    /// - **Non-compact format**: the "peers" field is a list of dictionaries,
    ///   each containing "ip" and "port".
    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let tracker_response: TrackerResponse = serde_bencode::from_bytes(bytes)?;

        if let Some(reason) = tracker_response.failure_reason {
            return Err(TrackerError::FailureReason(reason));
        }

        let peers = match tracker_response.peers {
            Peers::Compact(bytes) => bytes
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    Peer {
                        ip: IpAddr::V4(ip),
                        port,
                    }
                })
                .collect(),
            Peers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                        ip,
                        port: dict.port,
                    })
                })
                .collect(),
        };

        Ok(AnnounceResponse {
            interval: tracker_response.interval,
            peers,
        })
    }
}

/// URL-encodes a byte slice according to RFC 3986.
///
/// Unreserved characters (a-z, A-Z, 0-9, -, ., _, ~) are left as-is, all
/// other bytes become `%XX`. Used for `info_hash`/`peer_id`, which are raw
/// bytes and not valid UTF-8 in general, so `url`'s own percent-encoding
/// (which expects a `&str`) doesn't apply here.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encode_leaves_unreserved_chars_alone() {
        assert_eq!(url_encode(b"abcXYZ019-._~"), "abcXYZ019-._~");
    }

    #[test]
    fn url_encode_percent_encodes_everything_else() {
        assert_eq!(url_encode(&[0x00, 0xff, b' ']), "%00%FF%20");
    }

    #[test]
    fn parses_compact_peer_list() {
        let mut body = b"d8:intervali1800e5:peers12:".to_vec();
        body.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
        body.extend_from_slice(&[10, 0, 0, 2, 0x1A, 0xE2]);
        body.extend_from_slice(b"e");

        let response = Client::parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(response.peers[0].port, 0x1AE1);
    }

    #[test]
    fn parses_dictionary_peer_list() {
        let body = b"d8:intervali1800e5:peersld2:ip9:127.0.0.14:porti6881eeeee".to_vec();
        let response = Client::parse_announce_response(&body).unwrap();
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason20:no such torrent!!e".to_vec();
        let err = Client::parse_announce_response(&body).unwrap_err();
        assert!(matches!(err, TrackerError::FailureReason(_)));
    }

    #[tokio::test]
    async fn udp_trackers_are_rejected_without_a_network_call() {
        let client = Client::new(6881, [0u8; 20]).unwrap();
        let result = client
            .announce_one(
                "udp://tracker.example:80/announce",
                &dummy_torrent(),
                AnnounceEvent::Started,
            )
            .await;
        assert!(matches!(result, Err(TrackerError::UdpUnsupported)));
    }

    fn dummy_torrent() -> TorrentFile {
        TorrentFile {
            announce: "http://tracker.example/announce".to_string(),
            announce_list: Vec::new(),
            creation_date: None,
            comment: String::new(),
            created_by: String::new(),
            encoding: String::new(),
            info: crate::torrent::InfoDict {
                piece_length: 16384,
                pieces: vec![0u8; 20],
                private: false,
                name: "x".to_string(),
                length: Some(16384),
                files: Vec::new(),
                is_directory: false,
            },
            info_hash: [0u8; 20],
            pieces_hash: vec![[0u8; 20]],
        }
    }
}
