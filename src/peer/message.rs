//! Peer-wire message framing (BEP-3 §"peer messages").
//!
//! Every message after the handshake is `<u32 length prefix><id><payload>`,
//! big-endian, sent over the same TCP stream. A zero length prefix with no
//! id is a keep-alive. We reject any declared length larger than a piece's
//! worth of payload plus a small header slop — a legitimate peer never
//! sends more than that in one message (§4.4).
use super::{PeerError, PeerResult};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Upper bound on a frame's declared length: one block's worth of `piece`
/// payload (index + begin + data) plus slop for anything larger a peer might
/// legitimately send. Guards against a malicious/buggy peer claiming a
/// multi-gigabyte frame and exhausting memory on read.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

const ID_CHOKE: u8 = 0;
const ID_UNCHOKE: u8 = 1;
const ID_INTERESTED: u8 = 2;
const ID_NOT_INTERESTED: u8 = 3;
const ID_HAVE: u8 = 4;
const ID_BITFIELD: u8 = 5;
const ID_REQUEST: u8 = 6;
const ID_PIECE: u8 = 7;
const ID_CANCEL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl PeerMessage {
    /// Serializes this message into wire bytes, length-prefixed.
    pub fn encode(&self) -> Vec<u8> {
        if matches!(self, PeerMessage::KeepAlive) {
            return vec![0, 0, 0, 0];
        }

        let mut body = BytesMut::new();
        match self {
            PeerMessage::KeepAlive => unreachable!(),
            PeerMessage::Choke => body.put_u8(ID_CHOKE),
            PeerMessage::Unchoke => body.put_u8(ID_UNCHOKE),
            PeerMessage::Interested => body.put_u8(ID_INTERESTED),
            PeerMessage::NotInterested => body.put_u8(ID_NOT_INTERESTED),
            PeerMessage::Have(index) => {
                body.put_u8(ID_HAVE);
                body.put_u32(*index);
            }
            PeerMessage::Bitfield(bits) => {
                body.put_u8(ID_BITFIELD);
                body.put_slice(bits);
            }
            PeerMessage::Request { index, begin, length } => {
                body.put_u8(ID_REQUEST);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_u32(*length);
            }
            PeerMessage::Piece { index, begin, block } => {
                body.put_u8(ID_PIECE);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_slice(block);
            }
            PeerMessage::Cancel { index, begin, length } => {
                body.put_u8(ID_CANCEL);
                body.put_u32(*index);
                body.put_u32(*begin);
                body.put_u32(*length);
            }
        }

        let mut out = BytesMut::with_capacity(4 + body.len());
        out.put_u32(body.len() as u32);
        out.put_slice(&body);
        out.to_vec()
    }

    /// Parses a message body (post length-prefix, post-id-already-included)
    /// given its id byte and remaining payload.
    fn parse_body(id: u8, payload: &[u8]) -> PeerResult<Self> {
        match id {
            ID_CHOKE => Ok(PeerMessage::Choke),
            ID_UNCHOKE => Ok(PeerMessage::Unchoke),
            ID_INTERESTED => Ok(PeerMessage::Interested),
            ID_NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(PeerMessage::Have(BigEndian::read_u32(payload)))
            }
            ID_BITFIELD => Ok(PeerMessage::Bitfield(payload.to_vec())),
            ID_REQUEST => {
                if payload.len() != 12 {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(PeerMessage::Request {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(PeerMessage::Piece {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    block: payload[8..].to_vec(),
                })
            }
            ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(PeerError::MalformedPayload(id));
                }
                Ok(PeerMessage::Cancel {
                    index: BigEndian::read_u32(&payload[0..4]),
                    begin: BigEndian::read_u32(&payload[4..8]),
                    length: BigEndian::read_u32(&payload[8..12]),
                })
            }
            other => Err(PeerError::UnknownMessageId(other)),
        }
    }

    /// Reads one frame from `stream`, blocking until a full frame arrives.
    #[tracing::instrument(level = "trace", skip(stream))]
    pub async fn read(stream: &mut TcpStream) -> PeerResult<Self> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u32(&len_buf);

        if len == 0 {
            return Ok(PeerMessage::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(PeerError::OversizeFrame(len));
        }

        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body).await?;

        Self::parse_body(body[0], &body[1..])
    }

    /// Writes this message to `stream` as a complete frame.
    #[tracing::instrument(level = "trace", skip(self, stream))]
    pub async fn write(&self, stream: &mut TcpStream) -> PeerResult<()> {
        stream.write_all(&self.encode()).await?;
        Ok(())
    }
}
