//! packrpc common types, frame codec, and method registry
//!
//! This crate provides the protocol definitions and the framing layer shared
//! by the packrpc client pool and server.
//!
//! # Protocol overview
//!
//! packrpc is a compact RPC protocol intended for use with TCP. A server
//! listens on a well-known port; clients open one or more long-lived
//! connections and exchange discrete *frames* with the server. Immediately
//! after accepting a connection the server writes a single handshake byte
//! (`0xBF`); everything after that byte is a stream of frames.
//!
//! Frames carry a fixed 8-byte bit-packed header followed by a variable
//! tail:
//!
//! ```text
//! bit:  0..6       7      8..23       24..29     30..35        36..63
//!       version(7) dir(1) datalen(16) methlen(6) argnamelen(6) serial(28)
//! tail: method_name_bytes | arg_type_name_bytes | payload_bytes
//! ```
//!
//! The header is packed big-endian. `dir` distinguishes a request (`1`)
//! from a response (`0`). `serial` correlates a request with its response;
//! serial `0` marks a fire-and-forget request that expects no reply.
//!
//! Payloads are opaque `(type-name, bytes)` tuples. The default
//! serialization is JSON through the [`registry::Message`] trait; the
//! framing layer never inspects payload bytes.
//!
//! # Components
//!
//! - [`protocol`] - the [`protocol::Frame`] record, protocol constants,
//!   and the [`protocol::PackrpcError`] error type
//! - [`transport`] - the [`transport::FrameCodec`] framing codec and the
//!   client-side connect/handshake helper
//! - [`registry`] - the method [`registry::Registry`] and the typed
//!   service builder
//! - [`dispatch`] - the shared request invocation path used by client and
//!   server sessions

pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use protocol::{Direction, Frame, PackrpcError, Result};
pub use registry::{CallContext, Message, Registry, ServiceBuilder};
pub use transport::FrameCodec;
