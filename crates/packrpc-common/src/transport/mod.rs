//! packrpc transport layer
//!
//! This module provides the framing codec and the client-side TCP connect
//! helper.
//!
//! # Wire format
//!
//! A fresh connection begins with a single handshake byte (`0xBF`) written
//! by the server. Every subsequent byte belongs to the frame stream
//! described in [`codec`]: an 8-byte bit-packed big-endian header followed
//! by the method name, the argument type name, and the payload.

pub mod codec;
pub mod tcp;

pub use codec::{validate_frame, FrameCodec, HEADER_LEN};
pub use tcp::connect;
