//! Wire encoding for object transfer.
//!
//! Objects travel as a flat binary frame: per object
//! `[32-byte id][4-byte big-endian length][data]`, with `0xFFFF_FFFF` as the
//! length sentinel for an absent object. Whole frames are wrapped in a
//! zstd envelope: `[magic(4)][flags(1)][raw_len(4)][payload_len(4)][payload]`.

use bytes::Bytes;

use crate::object::ObjectId;

/// Magic bytes for the pit transfer envelope.
pub const WIRE_MAGIC: &[u8; 4] = b"PIT1";

/// Maximum single frame size (256 MB).
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0x01;
const ABSENT: u32 = 0xFFFF_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated frame")]
    Truncated,

    #[error("invalid envelope magic")]
    BadMagic,

    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),

    #[error("frame length mismatch: header declares {declared} bytes, payload yields {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("compression error: {0}")]
    Compression(String),
}

/// Encode a batch of objects into a raw frame.
pub fn encode_objects(objects: &[(ObjectId, Option<Bytes>)]) -> Vec<u8> {
    let mut buf = Vec::new();
    for (id, data) in objects {
        buf.extend_from_slice(id.as_bytes());
        match data {
            Some(data) => {
                buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
                buf.extend_from_slice(data);
            }
            None => buf.extend_from_slice(&ABSENT.to_be_bytes()),
        }
    }
    buf
}

/// Decode a raw frame into `(id, bytes-or-absent)` pairs.
pub fn decode_objects(data: &[u8]) -> Result<Vec<(ObjectId, Option<Bytes>)>, WireError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + 36 > data.len() {
            return Err(WireError::Truncated);
        }
        let mut id_bytes = [0u8; 32];
        id_bytes.copy_from_slice(&data[pos..pos + 32]);
        let id = ObjectId::new(id_bytes);
        pos += 32;

        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().unwrap());
        pos += 4;

        if len == ABSENT {
            out.push((id, None));
        } else {
            let end = pos + len as usize;
            if end > data.len() {
                return Err(WireError::Truncated);
            }
            out.push((id, Some(Bytes::copy_from_slice(&data[pos..end]))));
            pos = end;
        }
    }
    Ok(out)
}

/// Wrap a raw frame in the compressed envelope.
pub fn seal_frame(raw: &[u8]) -> Result<Vec<u8>, WireError> {
    if raw.len() > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(raw.len()));
    }
    let compressed =
        zstd::encode_all(raw, 3).map_err(|e| WireError::Compression(e.to_string()))?;
    let mut buf = Vec::with_capacity(13 + compressed.len());
    buf.extend_from_slice(WIRE_MAGIC);
    buf.push(FLAG_COMPRESSED);
    buf.extend_from_slice(&(raw.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    buf.extend_from_slice(&compressed);
    Ok(buf)
}

/// Unwrap an envelope, returning the raw frame.
pub fn open_frame(data: &[u8]) -> Result<Vec<u8>, WireError> {
    if data.len() < 13 {
        return Err(WireError::Truncated);
    }
    if &data[0..4] != WIRE_MAGIC {
        return Err(WireError::BadMagic);
    }
    let flags = data[4];
    let raw_len = u32::from_le_bytes(data[5..9].try_into().unwrap()) as usize;
    let payload_len = u32::from_le_bytes(data[9..13].try_into().unwrap()) as usize;
    if raw_len > MAX_FRAME_SIZE {
        return Err(WireError::TooLarge(raw_len));
    }
    if data.len() < 13 + payload_len {
        return Err(WireError::Truncated);
    }
    let payload = &data[13..13 + payload_len];

    // The header is untrusted; the actual payload must decode to exactly
    // the declared length.
    if flags & FLAG_COMPRESSED != 0 {
        let raw = zstd::decode_all(payload).map_err(|e| WireError::Compression(e.to_string()))?;
        if raw.len() != raw_len {
            return Err(WireError::LengthMismatch { declared: raw_len, actual: raw.len() });
        }
        Ok(raw)
    } else {
        if payload_len != raw_len {
            return Err(WireError::LengthMismatch { declared: raw_len, actual: payload_len });
        }
        Ok(payload.to_vec())
    }
}

/// Encode and seal in one step.
pub fn seal_objects(objects: &[(ObjectId, Option<Bytes>)]) -> Result<Vec<u8>, WireError> {
    seal_frame(&encode_objects(objects))
}

/// Open and decode in one step.
pub fn open_objects(data: &[u8]) -> Result<Vec<(ObjectId, Option<Bytes>)>, WireError> {
    decode_objects(&open_frame(data)?)
}
