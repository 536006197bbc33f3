//! WebSocket frame decoding for the intercepted client-to-upstream stream.
//!
//! The gateway never originates or terminates WebSocket traffic; it only
//! needs to recognize frames flowing through a spliced connection and pull
//! the stdin payload out of binary frames. The decoder therefore tolerates a
//! payload that is shorter than the declared length (the source stream is
//! chunked) but refuses to read past the end of the buffer.

use std::fmt;

/// Opcode carried by stdin data frames.
pub const OPCODE_BINARY: u8 = 0x2;

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Decode failures. All of them mean the buffer ends before the frame
/// header does; a short payload is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than the two fixed header bytes.
    TruncatedHeader,
    /// The 16- or 64-bit extended length field is cut off.
    TruncatedExtendedLength,
    /// The mask bit is set but the four mask bytes are cut off.
    TruncatedMaskKey,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TruncatedHeader => write!(f, "buffer too short for a websocket frame"),
            FrameError::TruncatedExtendedLength => {
                write!(f, "buffer too short for extended payload length")
            }
            FrameError::TruncatedMaskKey => write!(f, "buffer too short for mask key"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Decode a single frame assumed to start at the beginning of `data`.
///
/// The payload is unmasked when the mask bit is set. If the declared payload
/// length exceeds what the buffer holds, the bytes that are present are
/// returned.
pub fn parse_frame(data: &[u8]) -> Result<Frame, FrameError> {
    if data.len() < 2 {
        return Err(FrameError::TruncatedHeader);
    }

    let fin = data[0] & 0x80 != 0;
    let opcode = data[0] & 0x0f;
    let masked = data[1] & 0x80 != 0;

    let (payload_len, mut offset) = match data[1] & 0x7f {
        126 => {
            if data.len() < 4 {
                return Err(FrameError::TruncatedExtendedLength);
            }
            (u16::from_be_bytes([data[2], data[3]]) as usize, 4)
        }
        127 => {
            if data.len() < 10 {
                return Err(FrameError::TruncatedExtendedLength);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[2..10]);
            (u64::from_be_bytes(raw) as usize, 10)
        }
        n => (n as usize, 2),
    };

    let mask_key = if masked {
        if data.len() < offset + 4 {
            return Err(FrameError::TruncatedMaskKey);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&data[offset..offset + 4]);
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = data.len().min(offset.saturating_add(payload_len));
    let mut payload = data[offset..end].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        payload,
    })
}

/// Full encoded length (header + declared payload) of the frame starting at
/// offset 0, or `None` while the header itself is still incomplete.
///
/// Used to reassemble frames that arrive split across writes.
pub fn frame_len(data: &[u8]) -> Option<usize> {
    if data.len() < 2 {
        return None;
    }
    let masked = data[1] & 0x80 != 0;
    let (payload_len, header) = match data[1] & 0x7f {
        126 => {
            if data.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([data[2], data[3]]) as usize, 4usize)
        }
        127 => {
            if data.len() < 10 {
                return None;
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[2..10]);
            (u64::from_be_bytes(raw) as usize, 10usize)
        }
        n => (n as usize, 2usize),
    };
    let header = header + if masked { 4 } else { 0 };
    header.checked_add(payload_len)
}
