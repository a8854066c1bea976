//! packrpc client
//!
//! This crate provides the client side of packrpc: per-connection
//! [`session::ClientSession`]s and the [`pool::Pool`] that owns them.
//!
//! The pool keeps a bounded set of long-lived TCP connections to one
//! server, leases them out per call, reaps idle ones in the background, and
//! replaces connections the server closes. Each session carries at most one
//! awaited reply at a time, so request/response calls have FIFO semantics
//! per session while the pool multiplexes calls freely across sessions.
//!
//! # Example
//!
//! ```no_run
//! use packrpc_client::{Pool, PoolOptions};
//! use packrpc_common::registry::Message;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct HelloRequest { name: String }
//!
//! impl Message for HelloRequest {
//!     const TYPE_NAME: &'static str = "hello.HelloRequest";
//! }
//!
//! #[derive(Serialize, Deserialize)]
//! struct HelloReply { name: String }
//!
//! impl Message for HelloReply {
//!     const TYPE_NAME: &'static str = "hello.HelloReply";
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> packrpc_common::Result<()> {
//! let pool = Pool::new(PoolOptions::default().with_addr("127.0.0.1:8888")).await?;
//! let reply: HelloReply = pool
//!     .call_with("Greeter.Hello", Some(&HelloRequest { name: "x".to_string() }))
//!     .await?;
//! # drop(reply);
//! pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod pool;
pub mod session;

pub use pool::{Pool, PoolOptions};
pub use session::ClientSession;
