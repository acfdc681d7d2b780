//! wirecall - a minimal RPC runtime with pluggable codecs
//!
//! A process registers services on a [`Server`]; remote processes call their
//! methods through a [`Client`]. Each connection starts with a one-line JSON
//! negotiation that picks a codec, then carries `(header, body)` pairs in
//! checksummed frames. One client connection multiplexes any number of
//! concurrent calls, matched to their responses by sequence number.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use tokio::net::TcpListener;
//! use wirecall::{Client, Server, Service};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     a: i32,
//!     b: i32,
//! }
//!
//! struct Arith;
//!
//! # async fn demo() -> wirecall::Result<()> {
//! let server = Server::new();
//! server.register(
//!     Service::new(Arith).method("Sum", |_: &Arith, args: Args| Ok::<_, String>(args.a + args.b)),
//! )?;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let addr = listener.local_addr()?;
//! tokio::spawn(async move { server.accept(listener).await });
//!
//! let client = Client::dial(addr, None).await?;
//! let sum: i32 = client.call("Arith.Sum", &Args { a: 3, b: 4 }).await?;
//! assert_eq!(sum, 7);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Pluggable codecs** - bincode (default) and JSON built in, more via [`CodecRegistry`]
//! - **Multiplexed calls** - concurrent calls share one connection
//! - **Concurrent dispatch** - one task per request, whole-frame writes
//! - **Built-in checksums** - `XXHash3` on every frame
//!
//! Timeouts are layered by the caller: send with [`Client::go`] and race the
//! completion channel against `tokio::time::timeout`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod client;
pub mod global;
pub mod protocol;
pub mod server;
pub mod service;
pub mod transport;

pub use client::{Call, Client};
pub use protocol::{
    Codec, CodecRegistry, CodecType, Error, Header, Invalid, MAGIC_NUMBER, MetricsSnapshot,
    Options, Result, metrics_snapshot,
};
pub use server::Server;
pub use service::{MethodType, Service, ServiceBuilder};
pub use transport::Config;

/// wirecall version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
