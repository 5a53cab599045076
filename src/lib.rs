//! # pipeproxy
//!
//! Drive an out-of-process "server under test" as if it were local:
//! method calls are forwarded across a pair of anonymous pipes to a
//! child process and results (or failures) come back to the caller,
//! with any number of calls in flight at once.
//!
//! ## Architecture
//!
//! - **Protocol**: self-delimiting envelopes (length-prefixed
//!   MessagePack maps), one stream per direction, correlated by
//!   randomly generated call ids
//! - **Server side** (child): sends a one-time handshake, then
//!   dispatches each inbound call to a registered method handler on a
//!   bounded pool of spawned tasks; drains cleanly when the call pipe
//!   closes
//! - **Client side** (harness): a background receive loop resolves
//!   replies to waiting callers through per-call oneshot channels
//!
//! ## Example
//!
//! ```ignore
//! use pipeproxy::{transport, ProxyServer};
//!
//! #[tokio::main]
//! async fn main() -> pipeproxy::Result<()> {
//!     let (reader, writer) = transport::child_endpoints()?;
//!     ProxyServer::builder(target)
//!         .method("echo", |_t, args| async move { args.arg::<String>(0) })
//!         .build()
//!         .run(reader, writer)
//!         .await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

mod client;

pub use client::ProxyClient;
pub use config::{ClientConfig, Cookie, ServerConfig, ServerOptions};
pub use error::{ProxyError, Result};
pub use protocol::{CallId, Envelope, RemoteError};
pub use server::{CallArgs, Mode, PassthroughMode, ProxyServer, ProxyServerBuilder, Target};
