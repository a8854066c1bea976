//! packrpc server
//!
//! This crate provides the server side of packrpc: a TCP acceptor that
//! hands each inbound connection to a session task, a session group that maps
//! snowflake handles and socket ids to live sessions, and the dispatch of
//! decoded request frames against the registered services.
//!
//! # Example
//!
//! ```no_run
//! use packrpc_common::registry::{Message, ServiceBuilder};
//! use packrpc_server::{Server, ServerOptions};
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
//! let server = Server::new(ServerOptions::default().with_name("hello/server"));
//! server.register(
//!     ServiceBuilder::new("Greeter")
//!         .method("Hello", |_ctx, req: HelloRequest| HelloReply { name: req.name })
//!         .build(),
//! )?;
//! server.listen("0.0.0.0:8888").await?;
//! # Ok(())
//! # }
//! ```

pub mod group;
pub mod server;
pub mod session;

pub use group::Group;
pub use server::{Server, ServerOptions};
pub use session::ServerSession;
