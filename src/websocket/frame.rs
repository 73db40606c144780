//! RFC 6455 frame codec.
//!
//! # Responsibilities
//! - Decode complete frames from an inbound byte queue, consuming exactly
//!   the bytes of each frame and nothing while a frame is incomplete
//! - Encode server frames (never masked) with the shortest length form
//! - Reject frames that violate the framing rules before buffering them
//!
//! # Frame layout
//! ```text
//!  0               1               2               3
//! |F|R|R|R| opcode|M| len (7)     | extended len (0, 2 or 8 bytes)
//! | masking key (0 or 4 bytes)    | payload ...
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Protocol violation.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
/// Payload inconsistent with the message type (e.g. invalid UTF-8 text).
pub const CLOSE_INVALID_DATA: u16 = 1007;
/// Message too big to process.
pub const CLOSE_TOO_BIG: u16 = 1009;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// Error type for frame decoding.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    #[error("unknown opcode {0:#x}")]
    InvalidOpcode(u8),
    #[error("client frame is not masked")]
    Unmasked,
    #[error("control frame is fragmented or longer than 125 bytes")]
    InvalidControlFrame,
    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: u64, max: usize },
}

impl FrameError {
    /// Status code sent in the CLOSE frame answering this error.
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::PayloadTooLarge { .. } => CLOSE_TOO_BIG,
            _ => CLOSE_PROTOCOL_ERROR,
        }
    }
}

/// Which end of the connection is decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Peer frames must be masked.
    Server,
    /// Peer frames must not be masked.
    Client,
}

/// A decoded frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::new(true, OpCode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    pub fn pong(payload: Bytes) -> Self {
        Self::new(true, OpCode::Pong, payload)
    }

    /// A CLOSE frame, with `code` as its status when given.
    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
            None => Bytes::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Status code of a CLOSE frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        match self.payload.get(..2) {
            Some(&[hi, lo]) => Some(u16::from_be_bytes([hi, lo])),
            _ => None,
        }
    }

    /// Append the unmasked encoding of this frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        self.encode_header(dst, false);
        dst.put_slice(&self.payload);
    }

    /// Append the masked encoding of this frame to `dst`, as a client sends it.
    pub fn encode_masked(&self, mask: [u8; 4], dst: &mut BytesMut) {
        self.encode_header(dst, true);
        dst.put_slice(&mask);
        let start = dst.len();
        dst.put_slice(&self.payload);
        apply_mask(&mut dst[start..], mask);
    }

    /// Size of the unmasked encoding.
    pub fn encoded_len(&self) -> usize {
        let len = self.payload.len();
        let header = match len {
            0..=125 => 2,
            126..=0xFFFF => 4,
            _ => 10,
        };
        header + len
    }

    fn encode_header(&self, dst: &mut BytesMut, masked: bool) {
        let fin = if self.fin { 0x80 } else { 0 };
        dst.put_u8(fin | self.opcode as u8);

        let mask_bit = if masked { 0x80 } else { 0 };
        let len = self.payload.len();
        if len <= 125 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= 0xFFFF {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }
    }
}

/// XOR `data` with the repeating 4-byte `mask`.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Frame decoder for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    role: Role,
    max_payload: usize,
}

impl Codec {
    pub fn new(role: Role, max_payload: usize) -> Self {
        Self { role, max_payload }
    }

    /// Decode one frame from the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame is
    /// incomplete. Header violations are reported as soon as the header is
    /// readable.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];

        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(FrameError::InvalidOpcode(b0 & 0x0F))?;

        let masked = b1 & 0x80 != 0;
        if self.role == Role::Server && !masked {
            return Err(FrameError::Unmasked);
        }

        let (len, mut offset) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                let Some(bytes) = src.get(2..10) else {
                    return Ok(None);
                };
                let mut be = [0u8; 8];
                be.copy_from_slice(bytes);
                (u64::from_be_bytes(be), 10)
            }
            code => (u64::from(code), 2),
        };

        if opcode.is_control() && (!fin || len > MAX_CONTROL_PAYLOAD as u64) {
            return Err(FrameError::InvalidControlFrame);
        }
        let len = match usize::try_from(len) {
            Ok(len) if len <= self.max_payload => len,
            _ => {
                return Err(FrameError::PayloadTooLarge {
                    len,
                    max: self.max_payload,
                })
            }
        };

        let mask = if masked {
            let Some(bytes) = src.get(offset..offset + 4) else {
                return Ok(None);
            };
            let mut key = [0u8; 4];
            key.copy_from_slice(bytes);
            offset += 4;
            Some(key)
        } else {
            None
        };

        if src.len() < offset + len {
            return Ok(None);
        }

        src.advance(offset);
        let mut payload = src.split_to(len);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}
