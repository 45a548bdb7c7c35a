//! BitTorrent peer wire protocol (BEP 3) with the extension bit of BEP 10.

use crate::errors::DomainError;
use rand::Rng;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
pub const BLOCK_SIZE: u32 = 16 * 1024;
/// Largest frame accepted from a peer: a full block plus headroom for bitfields.
pub const MAX_FRAME_LEN: u32 = 2 * 1024 * 1024;

const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;

/// 20-byte peer identifier, `-TE0100-` followed by random bytes for this client.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-TE0100-");
        rand::thread_rng().fill(&mut id[8..]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENSION_BYTE] |= EXTENSION_BIT;
        Self {
            reserved,
            info_hash,
            peer_id: peer_id.0,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        // Format: <pstrlen><pstr><reserved><info_hash><peer_id>
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    pub fn decode(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, String> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err("Invalid handshake protocol identifier".to_string());
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);
        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }

    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, DomainError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| DomainError::NetworkError(format!("Failed to read handshake: {}", e)))?;
        Handshake::decode(&buf).map_err(|reason| DomainError::protocol("handshake", reason))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        fn frame(id: u8, body: &[u8]) -> Vec<u8> {
            let mut buf = Vec::with_capacity(5 + body.len());
            buf.extend_from_slice(&(1 + body.len() as u32).to_be_bytes());
            buf.push(id);
            buf.extend_from_slice(body);
            buf
        }
        fn triple(a: u32, b: u32, c: u32) -> [u8; 12] {
            let mut body = [0u8; 12];
            body[..4].copy_from_slice(&a.to_be_bytes());
            body[4..8].copy_from_slice(&b.to_be_bytes());
            body[8..].copy_from_slice(&c.to_be_bytes());
            body
        }

        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => frame(0, &[]),
            Message::Unchoke => frame(1, &[]),
            Message::Interested => frame(2, &[]),
            Message::NotInterested => frame(3, &[]),
            Message::Have(index) => frame(4, &index.to_be_bytes()),
            Message::Bitfield(bits) => frame(5, bits),
            Message::Request { index, begin, length } => frame(6, &triple(*index, *begin, *length)),
            Message::Piece { index, begin, data } => {
                let mut body = Vec::with_capacity(8 + data.len());
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(data);
                frame(7, &body)
            }
            Message::Cancel { index, begin, length } => frame(8, &triple(*index, *begin, *length)),
            Message::Port(port) => frame(9, &port.to_be_bytes()),
            Message::Extended { id, payload } => {
                let mut body = Vec::with_capacity(1 + payload.len());
                body.push(*id);
                body.extend_from_slice(payload);
                frame(20, &body)
            }
        }
    }

    /// Decodes a frame body (message id followed by payload, no length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, String> {
        let Some((&id, payload)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };

        fn u32_at(payload: &[u8], at: usize) -> u32 {
            u32::from_be_bytes([payload[at], payload[at + 1], payload[at + 2], payload[at + 3]])
        }
        let expect_len = |len: usize| {
            if payload.len() == len {
                Ok(())
            } else {
                Err(format!(
                    "Message {} has payload of {} bytes, expected {}",
                    id,
                    payload.len(),
                    len
                ))
            }
        };

        match id {
            0 => expect_len(0).map(|_| Message::Choke),
            1 => expect_len(0).map(|_| Message::Unchoke),
            2 => expect_len(0).map(|_| Message::Interested),
            3 => expect_len(0).map(|_| Message::NotInterested),
            4 => expect_len(4).map(|_| Message::Have(u32_at(payload, 0))),
            5 => Ok(Message::Bitfield(payload.to_vec())),
            6 => expect_len(12).map(|_| Message::Request {
                index: u32_at(payload, 0),
                begin: u32_at(payload, 4),
                length: u32_at(payload, 8),
            }),
            7 => {
                if payload.len() < 8 {
                    return Err("Piece message too short".to_string());
                }
                Ok(Message::Piece {
                    index: u32_at(payload, 0),
                    begin: u32_at(payload, 4),
                    data: payload[8..].to_vec(),
                })
            }
            8 => expect_len(12).map(|_| Message::Cancel {
                index: u32_at(payload, 0),
                begin: u32_at(payload, 4),
                length: u32_at(payload, 8),
            }),
            9 => expect_len(2).map(|_| Message::Port(u16::from_be_bytes([payload[0], payload[1]]))),
            20 => match payload.split_first() {
                Some((&ext_id, rest)) => Ok(Message::Extended {
                    id: ext_id,
                    payload: rest.to_vec(),
                }),
                None => Err("Extended message without id".to_string()),
            },
            other => Err(format!("Unknown message id {}", other)),
        }
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(&self.encode()).await
    }

    /// Reads one length-prefixed frame. I/O failures are `NetworkError`,
    /// oversized or undecodable frames are `PeerProtocolViolation`.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        peer: &str,
    ) -> Result<Self, DomainError> {
        let len = reader
            .read_u32()
            .await
            .map_err(|e| DomainError::NetworkError(format!("{}: {}", peer, e)))?;
        if len == 0 {
            return Ok(Message::KeepAlive);
        }
        if len > MAX_FRAME_LEN {
            return Err(DomainError::protocol(peer, format!("frame of {} bytes", len)));
        }
        let mut body = vec![0u8; len as usize];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| DomainError::NetworkError(format!("{}: {}", peer, e)))?;
        Message::decode(&body).map_err(|reason| DomainError::protocol(peer, reason))
    }
}

/// Piece availability bitmap, most significant bit first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; (len + 7) / 8],
            len,
        }
    }

    /// Validates a peer-supplied bitfield: exact byte length, spare bits clear.
    pub fn from_bytes(bytes: Vec<u8>, len: usize) -> Result<Self, String> {
        if bytes.len() != (len + 7) / 8 {
            return Err(format!(
                "Bitfield of {} bytes for {} pieces",
                bytes.len(),
                len
            ));
        }
        let field = Self { bits: bytes, len };
        if (len..field.bits.len() * 8).any(|i| field.bit(i)) {
            return Err("Bitfield has spare bits set".to_string());
        }
        Ok(field)
    }

    fn bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn has(&self, index: u32) -> bool {
        (index as usize) < self.len && self.bit(index as usize)
    }

    pub fn set(&mut self, index: u32) {
        if (index as usize) < self.len {
            self.bits[index as usize / 8] |= 0x80 >> (index % 8);
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self) -> usize {
        (0..self.len).filter(|&i| self.bit(i)).count()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(|&i| self.bit(i)).map(|i| i as u32)
    }
}
