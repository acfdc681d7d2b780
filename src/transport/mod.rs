//! Connection plumbing shared by the client and the server
//!
//! A connection starts with option negotiation ([`initiate`] / [`respond`])
//! and then carries codec frames through a [`ConnReader`] and a
//! [`ConnWriter`].

mod config;
mod conn;
mod handshake;

pub use config::{Config, DEFAULT_DONE_CAPACITY};
pub use conn::{BoxedReader, BoxedWriter, ConnReader, ConnWriter, split};
pub use handshake::{initiate, respond};
