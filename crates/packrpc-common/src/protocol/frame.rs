//! The in-memory frame record and protocol constants.

/// Protocol version stamped into every outgoing frame header.
///
/// The version is decoded and surfaced on [`Frame::version`] but never
/// validated on receive; semantic versioning is left to higher layers.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake byte written by the server immediately after accept.
///
/// A client whose first received byte differs closes the session with
/// `Unauthorized`. The byte precedes framing and is not itself a frame.
pub const HANDSHAKE_BYTE: u8 = 0xBF;

/// Maximum byte length of a method or argument type name.
///
/// Bound by the 6-bit length fields in the frame header.
pub const MAX_NAME_LEN: usize = 63;

/// Maximum payload length in bytes, bound by the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;

/// Largest value the 28-bit serial field can carry.
pub const SERIAL_MAX: u32 = 0x0FFF_FFFF;

/// Direction of a frame: a request toward a handler or a response toward a
/// waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Response = 0,
    Request = 1,
}

impl Direction {
    /// Decode the single header bit.
    pub fn from_bit(bit: u64) -> Direction {
        if bit == 0 {
            Direction::Response
        } else {
            Direction::Request
        }
    }

    pub fn as_bit(self) -> u64 {
        self as u64
    }
}

/// One wire message: the decoded header fields plus the three tail
/// sections.
///
/// `method` is required for requests and may be empty on responses.
/// An empty `arg_type` means the frame carries no payload. `serial` zero
/// marks a fire-and-forget request: no reply is expected and none may be
/// awaited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub direction: Direction,
    pub method: String,
    pub arg_type: String,
    pub serial: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a request frame. `payload` pairs the argument type name with
    /// its serialized bytes; `None` sends an argument-less request.
    pub fn request(method: impl Into<String>, serial: u32, payload: Option<(String, Vec<u8>)>) -> Frame {
        let (arg_type, payload) = payload.unwrap_or_default();
        Frame {
            version: PROTOCOL_VERSION,
            direction: Direction::Request,
            method: method.into(),
            arg_type,
            serial,
            payload,
        }
    }

    /// Build a response frame echoing the originating request's method name
    /// and serial.
    pub fn response(method: impl Into<String>, serial: u32, payload: Option<(String, Vec<u8>)>) -> Frame {
        let (arg_type, payload) = payload.unwrap_or_default();
        Frame {
            version: PROTOCOL_VERSION,
            direction: Direction::Response,
            method: method.into(),
            arg_type,
            serial,
            payload,
        }
    }

    /// Whether the frame carries a payload section.
    pub fn has_payload(&self) -> bool {
        !self.arg_type.is_empty()
    }

    /// Whether this is a fire-and-forget request.
    pub fn is_fire_and_forget(&self) -> bool {
        self.direction == Direction::Request && self.serial == 0
    }
}
