//! Frame format for messages crossing the transport.
//!
//! Frame format: `[length:4][checksum:4][source:4][destination:4][tag:2][reserved:2][count:4][units:8*count]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of everything after the checksum field
//! - **source / destination**: ranks (little-endian u32)
//! - **tag**: message tag (little-endian u16)
//! - **count**: number of payload units
//! - **units**: payload, each unit a little-endian u64

use crate::types::{MessageTag, MessageUnit, Rank, UNIT_BYTES};

/// Header size: 4 + 4 + 4 + 4 + 2 + 2 + 4 = 24 bytes.
pub const HEADER_SIZE: usize = 24;

/// Maximum number of units in one frame.
pub const MAX_FRAME_UNITS: usize = 128 * 1024;

/// Wire format error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Not enough data to parse the frame.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the header.
        expected: u32,
        /// Checksum computed over the frame.
        actual: u32,
    },

    /// Payload exceeds [`MAX_FRAME_UNITS`].
    #[error("frame too large: {count} units (max {MAX_FRAME_UNITS})")]
    FrameTooLarge {
        /// Units in the rejected payload.
        count: usize,
    },

    /// Length field disagrees with the unit count.
    #[error("invalid frame length {length} for {count} units")]
    InvalidLength {
        /// Length from the header.
        length: u32,
        /// Unit count from the header.
        count: u32,
    },
}

/// Routing fields of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Sending rank.
    pub source: Rank,
    /// Receiving rank.
    pub destination: Rank,
    /// Message tag.
    pub tag: MessageTag,
    /// Payload units.
    pub count: usize,
}

/// Encode a frame.
pub fn encode_frame(header: &FrameHeader, units: &[MessageUnit]) -> Result<Vec<u8>, WireError> {
    if units.len() > MAX_FRAME_UNITS {
        return Err(WireError::FrameTooLarge { count: units.len() });
    }

    let total = HEADER_SIZE + units.len() * UNIT_BYTES;
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&(total as u32).to_le_bytes());
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(&(header.source as u32).to_le_bytes());
    data.extend_from_slice(&(header.destination as u32).to_le_bytes());
    data.extend_from_slice(&header.tag.to_le_bytes());
    data.extend_from_slice(&0u16.to_le_bytes());
    data.extend_from_slice(&(units.len() as u32).to_le_bytes());
    for unit in units {
        data.extend_from_slice(&unit.to_le_bytes());
    }

    let checksum = crc32c::crc32c(&data[8..]);
    data[4..8].copy_from_slice(&checksum.to_le_bytes());
    Ok(data)
}

/// Decode only the header, validating length and checksum.
pub fn decode_header(data: &[u8]) -> Result<FrameHeader, WireError> {
    if data.len() < HEADER_SIZE {
        return Err(WireError::InsufficientData {
            needed: HEADER_SIZE,
            have: data.len(),
        });
    }

    let length = read_u32(data, 0);
    let expected = read_u32(data, 4);
    let count = read_u32(data, 20);

    if length as usize != HEADER_SIZE + count as usize * UNIT_BYTES {
        return Err(WireError::InvalidLength { length, count });
    }
    if data.len() < length as usize {
        return Err(WireError::InsufficientData {
            needed: length as usize,
            have: data.len(),
        });
    }

    let actual = crc32c::crc32c(&data[8..length as usize]);
    if actual != expected {
        return Err(WireError::ChecksumMismatch { expected, actual });
    }

    Ok(FrameHeader {
        source: read_u32(data, 8) as Rank,
        destination: read_u32(data, 12) as Rank,
        tag: u16::from_le_bytes([data[16], data[17]]),
        count: count as usize,
    })
}

/// Decode a frame, writing its units into `out`.
///
/// `out` must hold at least `count` units; returns the header.
pub fn decode_frame_into(data: &[u8], out: &mut [MessageUnit]) -> Result<FrameHeader, WireError> {
    let header = decode_header(data)?;
    if out.len() < header.count {
        return Err(WireError::InsufficientData {
            needed: header.count,
            have: out.len(),
        });
    }
    for (index, chunk) in data[HEADER_SIZE..HEADER_SIZE + header.count * UNIT_BYTES]
        .chunks_exact(UNIT_BYTES)
        .enumerate()
    {
        let mut bytes = [0u8; UNIT_BYTES];
        bytes.copy_from_slice(chunk);
        out[index] = MessageUnit::from_le_bytes(bytes);
    }
    Ok(header)
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}
