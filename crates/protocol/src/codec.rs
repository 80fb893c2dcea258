//! Binary codec for network messages.
//!
//! Every datagram is a [`Frame`]: protocol version, payload kind and a list
//! of length-prefixed records. A record is a fixed header followed by the
//! optional fields its header announces, in bit order. Bytes after the last
//! known optional field belong to newer peers and are skipped.

use bincode::config::{self, Config};
use bincode::error::DecodeError;
use bincode::{Decode, Encode};
use thiserror::Error;

use crate::wire::{
    ControlBits, Correction, MoveBatch, OptionalFields, ServerPacket, WireMove, PROTOCOL_VERSION,
};

/// Largest datagram we will encode or decode.
pub const MAX_PACKET_BYTES: usize = 1200;

const KIND_MOVE_BATCH: u8 = 1;
const KIND_SERVER_REPLIES: u8 = 2;

const TAG_ACK: u8 = 0;
const TAG_CORRECTION: u8 = 1;

/// Errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("truncated payload")]
    Truncated,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown payload kind {0}")]
    UnknownKind(u8),

    #[error("non-finite value in message")]
    NonFinite,
}

#[derive(Debug, Encode, Decode)]
struct Frame {
    version: u8,
    kind: u8,
    /// Number of leading records that are redundant resends.
    redundant: u8,
    records: Vec<Vec<u8>>,
}

#[derive(Debug, Encode, Decode)]
struct MoveHeader {
    timestamp: f64,
    delta_time: f32,
    acceleration: [i8; 3],
    flags: u8,
    control: ControlBits,
    rotation: [u16; 3],
    client_position: [f32; 3],
    client_mode: u8,
    optional: OptionalFields,
}

#[derive(Debug, Encode, Decode)]
struct CorrectionHeader {
    timestamp: f64,
    position: [f32; 3],
    rotation: [u16; 3],
    velocity: [f32; 3],
    mode: u8,
    optional: OptionalFields,
}

fn wire_config() -> impl Config {
    config::standard().with_limit::<MAX_PACKET_BYTES>()
}

// ============================================================================
// Client -> server
// ============================================================================

/// Encode a client move batch.
pub fn encode_batch(batch: &MoveBatch) -> Result<Vec<u8>, CodecError> {
    let mut records = Vec::with_capacity(batch.moves.len() + 1);
    for wire in batch.iter() {
        records.push(encode_move(wire)?);
    }

    encode_frame(&Frame {
        version: PROTOCOL_VERSION,
        kind: KIND_MOVE_BATCH,
        redundant: u8::from(batch.redundant.is_some()),
        records,
    })
}

/// Decode a client move batch.
pub fn decode_batch(data: &[u8]) -> Result<MoveBatch, CodecError> {
    let frame = decode_frame(data, KIND_MOVE_BATCH)?;

    let mut batch = MoveBatch::default();
    for (index, record) in frame.records.iter().enumerate() {
        let wire = decode_move(record)?;
        if index < frame.redundant as usize && batch.redundant.is_none() {
            batch.redundant = Some(wire);
        } else {
            batch.moves.push(wire);
        }
    }
    Ok(batch)
}

fn encode_move(wire: &WireMove) -> Result<Vec<u8>, CodecError> {
    if !wire.is_finite() {
        return Err(CodecError::NonFinite);
    }

    let header = MoveHeader {
        timestamp: wire.timestamp,
        delta_time: wire.delta_time,
        acceleration: wire.acceleration,
        flags: wire.flags,
        control: wire.control,
        rotation: wire.rotation,
        client_position: wire.client_position,
        client_mode: wire.client_mode,
        optional: wire.optional_fields(),
    };

    let mut bytes = bincode::encode_to_vec(&header, wire_config())?;
    if let Some(impulse) = wire.impulse {
        bytes.extend(bincode::encode_to_vec(impulse, wire_config())?);
    }
    if let Some(acked) = wire.acked_correction {
        bytes.extend(bincode::encode_to_vec(acked, wire_config())?);
    }
    Ok(bytes)
}

fn decode_move(bytes: &[u8]) -> Result<WireMove, CodecError> {
    let mut reader = RecordReader::new(bytes);
    let header: MoveHeader = reader.read()?;

    let impulse = if header.optional.has(OptionalFields::IMPULSE) {
        Some(reader.read::<[f32; 3]>()?)
    } else {
        None
    };
    let acked_correction = if header.optional.has(OptionalFields::ACKED_CORRECTION) {
        Some(reader.read::<f64>()?)
    } else {
        None
    };
    reader.skip_unknown(header.optional);

    let wire = WireMove {
        timestamp: header.timestamp,
        delta_time: header.delta_time,
        acceleration: header.acceleration,
        flags: header.flags,
        control: header.control,
        rotation: header.rotation,
        client_position: header.client_position,
        client_mode: header.client_mode,
        impulse,
        acked_correction,
    };

    if !wire.is_finite() {
        return Err(CodecError::NonFinite);
    }
    Ok(wire)
}

// ============================================================================
// Server -> client
// ============================================================================

/// Encode the replies for one client.
pub fn encode_replies(replies: &[ServerPacket]) -> Result<Vec<u8>, CodecError> {
    let mut records = Vec::with_capacity(replies.len());
    for reply in replies {
        let mut bytes = Vec::new();
        match reply {
            ServerPacket::Ack { timestamp } => {
                if !timestamp.is_finite() {
                    return Err(CodecError::NonFinite);
                }
                bytes.push(TAG_ACK);
                bytes.extend(bincode::encode_to_vec(timestamp, wire_config())?);
            }
            ServerPacket::Correction(correction) => {
                bytes.push(TAG_CORRECTION);
                bytes.extend(encode_correction(correction)?);
            }
        }
        records.push(bytes);
    }

    encode_frame(&Frame {
        version: PROTOCOL_VERSION,
        kind: KIND_SERVER_REPLIES,
        redundant: 0,
        records,
    })
}

/// Decode the replies sent to a client.
pub fn decode_replies(data: &[u8]) -> Result<Vec<ServerPacket>, CodecError> {
    let frame = decode_frame(data, KIND_SERVER_REPLIES)?;

    frame
        .records
        .iter()
        .map(|record| {
            let (&tag, body) = record.split_first().ok_or(CodecError::Truncated)?;
            match tag {
                TAG_ACK => {
                    let timestamp: f64 = RecordReader::new(body).read()?;
                    if !timestamp.is_finite() {
                        return Err(CodecError::NonFinite);
                    }
                    Ok(ServerPacket::Ack { timestamp })
                }
                TAG_CORRECTION => Ok(ServerPacket::Correction(decode_correction(body)?)),
                other => Err(CodecError::UnknownKind(other)),
            }
        })
        .collect()
}

fn encode_correction(correction: &Correction) -> Result<Vec<u8>, CodecError> {
    if !correction.is_finite() {
        return Err(CodecError::NonFinite);
    }

    let header = CorrectionHeader {
        timestamp: correction.timestamp,
        position: correction.position,
        rotation: correction.rotation,
        velocity: correction.velocity,
        mode: correction.mode,
        optional: correction.optional_fields(),
    };

    let mut bytes = bincode::encode_to_vec(&header, wire_config())?;
    if let Some(base) = correction.base {
        bytes.extend(bincode::encode_to_vec(base, wire_config())?);
    }
    if let Some(impulse) = correction.impulse {
        bytes.extend(bincode::encode_to_vec(impulse, wire_config())?);
    }
    Ok(bytes)
}

fn decode_correction(bytes: &[u8]) -> Result<Correction, CodecError> {
    let mut reader = RecordReader::new(bytes);
    let header: CorrectionHeader = reader.read()?;

    let base = if header.optional.has(OptionalFields::BASE) {
        Some(reader.read::<u32>()?)
    } else {
        None
    };
    let impulse = if header.optional.has(OptionalFields::IMPULSE_OVERRIDE) {
        Some(reader.read::<[f32; 3]>()?)
    } else {
        None
    };
    reader.skip_unknown(header.optional);

    let correction = Correction {
        timestamp: header.timestamp,
        position: header.position,
        rotation: header.rotation,
        velocity: header.velocity,
        mode: header.mode,
        base,
        impulse,
    };

    if !correction.is_finite() {
        return Err(CodecError::NonFinite);
    }
    Ok(correction)
}

// ============================================================================
// Framing
// ============================================================================

fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::encode_to_vec(frame, wire_config())?)
}

fn decode_frame(data: &[u8], expected_kind: u8) -> Result<Frame, CodecError> {
    let frame: Frame = RecordReader::new(data).read()?;

    if frame.version != PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(frame.version));
    }
    if frame.kind != expected_kind {
        return Err(CodecError::UnknownKind(frame.kind));
    }
    Ok(frame)
}

/// Sequential reader over one record.
struct RecordReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> RecordReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn read<T: Decode<()>>(&mut self) -> Result<T, CodecError> {
        let rest = self.bytes.get(self.offset..).ok_or(CodecError::Truncated)?;
        let (value, used) = bincode::decode_from_slice(rest, wire_config()).map_err(|err| match err {
            DecodeError::UnexpectedEnd { .. } => CodecError::Truncated,
            other => CodecError::Decode(other),
        })?;
        self.offset += used;
        Ok(value)
    }

    /// Ignore whatever follows the known optional fields.
    fn skip_unknown(&mut self, fields: OptionalFields) {
        let unknown = fields.0 & !OptionalFields::KNOWN;
        let trailing = self.bytes.len().saturating_sub(self.offset);
        if unknown != 0 || trailing > 0 {
            log::trace!("skipping {} trailing bytes (unknown fields {:#04x})", trailing, unknown);
        }
        self.offset = self.bytes.len();
    }
}
