//! Extension protocol (BEP 10) and metadata exchange (BEP 9) payloads.

use crate::protocol::bencode::{self, BencodedValue};

/// Extended message id 0 is always the extension handshake.
pub const HANDSHAKE_ID: u8 = 0;
/// Id we ask peers to use when sending us `ut_metadata` messages.
pub const LOCAL_METADATA_ID: u8 = 1;
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;
/// Upper bound on an advertised `metadata_size`.
pub const MAX_METADATA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionHandshake {
    /// Peer-chosen id for `ut_metadata`, if supported.
    pub metadata_id: Option<u8>,
    pub metadata_size: Option<usize>,
}

impl ExtensionHandshake {
    pub fn encode(metadata_size: Option<usize>) -> Vec<u8> {
        let mut entries = vec![(
            "m",
            bencode::dict([("ut_metadata", BencodedValue::Int(LOCAL_METADATA_ID as i64))]),
        )];
        if let Some(size) = metadata_size {
            entries.push(("metadata_size", BencodedValue::Int(size as i64)));
        }
        bencode::dict(entries).encode()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, String> {
        let value = bencode::decode(payload)?;
        let metadata_id = value
            .get("m")
            .and_then(|m| m.get("ut_metadata"))
            .and_then(|v| v.as_int())
            .filter(|id| (1..=255).contains(id))
            .map(|id| id as u8);
        let metadata_size = value
            .get("metadata_size")
            .and_then(|v| v.as_int())
            .filter(|size| *size > 0 && *size as usize <= MAX_METADATA_SIZE)
            .map(|size| size as usize);
        Ok(Self {
            metadata_id,
            metadata_size,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: usize, data: Vec<u8> },
    Reject { piece: u32 },
}

impl MetadataMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            MetadataMessage::Request { piece } => bencode::dict([
                ("msg_type", BencodedValue::Int(0)),
                ("piece", BencodedValue::Int(*piece as i64)),
            ])
            .encode(),
            MetadataMessage::Data { piece, total_size, data } => {
                let mut out = bencode::dict([
                    ("msg_type", BencodedValue::Int(1)),
                    ("piece", BencodedValue::Int(*piece as i64)),
                    ("total_size", BencodedValue::Int(*total_size as i64)),
                ])
                .encode();
                out.extend_from_slice(data);
                out
            }
            MetadataMessage::Reject { piece } => bencode::dict([
                ("msg_type", BencodedValue::Int(2)),
                ("piece", BencodedValue::Int(*piece as i64)),
            ])
            .encode(),
        }
    }

    pub fn decode(payload: &[u8]) -> Result<Self, String> {
        // Data messages carry raw bytes after the dictionary
        let (header, used) = bencode::decode_prefix(payload)?;
        let piece = header
            .get("piece")
            .and_then(|v| v.as_int())
            .filter(|p| *p >= 0)
            .ok_or("metadata message without piece")? as u32;
        match header.get("msg_type").and_then(|v| v.as_int()) {
            Some(0) => Ok(MetadataMessage::Request { piece }),
            Some(1) => {
                let total_size = header
                    .get("total_size")
                    .and_then(|v| v.as_int())
                    .filter(|s| *s > 0)
                    .ok_or("metadata data without total_size")? as usize;
                Ok(MetadataMessage::Data {
                    piece,
                    total_size,
                    data: payload[used..].to_vec(),
                })
            }
            Some(2) => Ok(MetadataMessage::Reject { piece }),
            other => Err(format!("unknown metadata msg_type {:?}", other)),
        }
    }
}

/// Number of 16 KiB metadata pieces for `size` bytes.
pub fn metadata_piece_count(size: usize) -> u32 {
    ((size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE) as u32
}

/// Collects `ut_metadata` pieces until the whole info dictionary is present.
#[derive(Debug)]
pub struct MetadataAssembler {
    total_size: usize,
    pieces: Vec<Option<Vec<u8>>>,
}

impl MetadataAssembler {
    pub fn new(total_size: usize) -> Self {
        Self {
            total_size,
            pieces: vec![None; metadata_piece_count(total_size) as usize],
        }
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn next_missing(&self) -> Option<u32> {
        self.pieces.iter().position(Option::is_none).map(|i| i as u32)
    }

    /// Stores one piece; a piece of the wrong length is refused.
    pub fn insert(&mut self, piece: u32, data: Vec<u8>) -> bool {
        let index = piece as usize;
        if index >= self.pieces.len() {
            return false;
        }
        let expected = if index + 1 == self.pieces.len() {
            self.total_size - index * METADATA_PIECE_SIZE
        } else {
            METADATA_PIECE_SIZE
        };
        if data.len() != expected {
            return false;
        }
        self.pieces[index] = Some(data);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.pieces.iter().all(Option::is_some)
    }

    pub fn assemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        Some(self.pieces.iter().flatten().flatten().copied().collect())
    }
}
