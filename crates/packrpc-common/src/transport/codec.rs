//! The bit-packed frame codec.
//!
//! Every frame starts with a fixed 8-byte header packed big-endian:
//!
//! ```text
//! bit:  0..6       7      8..23       24..29     30..35        36..63
//!       version(7) dir(1) datalen(16) methlen(6) argnamelen(6) serial(28)
//! ```
//!
//! followed by the method name bytes, the argument type name bytes, and the
//! payload bytes, in that order. Name lengths are byte counts of the UTF-8
//! encoding.
//!
//! The decoder never over-consumes: a partial frame leaves the buffer
//! untouched and reports "need more" (`Ok(None)`), so a session loop can
//! drive it repeatedly on a single receive buffer.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{Direction, Frame, PackrpcError, MAX_NAME_LEN, MAX_PAYLOAD_LEN, SERIAL_MAX};

/// Size of the packed frame header in bytes.
pub const HEADER_LEN: usize = 8;

const VERSION_SHIFT: u64 = 57;
const VERSION_MASK: u64 = 0x7F;
const DIRECTION_SHIFT: u64 = 56;
const DIRECTION_MASK: u64 = 0x1;
const DATA_LEN_SHIFT: u64 = 40;
const DATA_LEN_MASK: u64 = 0xFFFF;
const METHOD_LEN_SHIFT: u64 = 34;
const METHOD_LEN_MASK: u64 = 0x3F;
const ARG_NAME_LEN_SHIFT: u64 = 28;
const ARG_NAME_LEN_MASK: u64 = 0x3F;
const SERIAL_MASK: u64 = SERIAL_MAX as u64;

fn version_of(header: u64) -> u8 {
    ((header >> VERSION_SHIFT) & VERSION_MASK) as u8
}

fn direction_of(header: u64) -> Direction {
    Direction::from_bit((header >> DIRECTION_SHIFT) & DIRECTION_MASK)
}

fn data_len_of(header: u64) -> usize {
    ((header >> DATA_LEN_SHIFT) & DATA_LEN_MASK) as usize
}

fn method_len_of(header: u64) -> usize {
    ((header >> METHOD_LEN_SHIFT) & METHOD_LEN_MASK) as usize
}

fn arg_name_len_of(header: u64) -> usize {
    ((header >> ARG_NAME_LEN_SHIFT) & ARG_NAME_LEN_MASK) as usize
}

fn serial_of(header: u64) -> u32 {
    (header & SERIAL_MASK) as u32
}

fn pack_header(frame: &Frame) -> u64 {
    ((frame.version as u64 & VERSION_MASK) << VERSION_SHIFT)
        | (frame.direction.as_bit() << DIRECTION_SHIFT)
        | ((frame.payload.len() as u64 & DATA_LEN_MASK) << DATA_LEN_SHIFT)
        | ((frame.method.len() as u64 & METHOD_LEN_MASK) << METHOD_LEN_SHIFT)
        | ((frame.arg_type.len() as u64 & ARG_NAME_LEN_MASK) << ARG_NAME_LEN_SHIFT)
        | (frame.serial as u64 & SERIAL_MASK)
}

/// Check that a frame's variable-length sections fit their header fields.
///
/// Sessions run this before queueing a frame so the caller sees `BadName`
/// or `Overflow` instead of the writer task tearing the session down.
pub fn validate_frame(frame: &Frame) -> Result<(), PackrpcError> {
    if frame.method.len() > MAX_NAME_LEN || frame.arg_type.len() > MAX_NAME_LEN {
        return Err(PackrpcError::BadName);
    }
    if frame.payload.len() > MAX_PAYLOAD_LEN {
        return Err(PackrpcError::Overflow);
    }
    Ok(())
}

/// Framing codec for packrpc frames.
///
/// `buffer_cap` is the configured per-session receive buffer size; a frame
/// whose declared total length exceeds twice that capacity is rejected with
/// `Overflow` before any tail bytes are consumed.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    buffer_cap: usize,
}

impl FrameCodec {
    pub fn new(buffer_cap: usize) -> FrameCodec {
        FrameCodec { buffer_cap }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = PackrpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, PackrpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header_bytes = [0u8; HEADER_LEN];
        header_bytes.copy_from_slice(&src[..HEADER_LEN]);
        let header = u64::from_be_bytes(header_bytes);

        let method_len = method_len_of(header);
        let arg_name_len = arg_name_len_of(header);
        let data_len = data_len_of(header);

        if method_len > MAX_NAME_LEN || arg_name_len > MAX_NAME_LEN {
            return Err(PackrpcError::BadName);
        }

        let total = HEADER_LEN + method_len + arg_name_len + data_len;
        if total > self.buffer_cap << 1 {
            return Err(PackrpcError::Overflow);
        }

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let method = String::from_utf8(src.split_to(method_len).to_vec())
            .map_err(|_| PackrpcError::BadName)?;
        let arg_type = String::from_utf8(src.split_to(arg_name_len).to_vec())
            .map_err(|_| PackrpcError::BadName)?;
        let payload = src.split_to(data_len).to_vec();

        Ok(Some(Frame {
            version: version_of(header),
            direction: direction_of(header),
            method,
            arg_type,
            serial: serial_of(header),
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = PackrpcError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), PackrpcError> {
        validate_frame(&frame)?;

        dst.reserve(HEADER_LEN + frame.method.len() + frame.arg_type.len() + frame.payload.len());
        dst.put_u64(pack_header(&frame));
        dst.put_slice(frame.method.as_bytes());
        dst.put_slice(frame.arg_type.as_bytes());
        dst.put_slice(&frame.payload);

        Ok(())
    }
}
