//! A small, reusable networking library for mutually-authenticated TLS
//! message exchange between a server and many long-lived clients over
//! TCP.
//!
//! Each connection carries a stream of length-prefixed, typed, binary
//! messages (see [`message`]). Applications are built by implementing
//! [`client::ClientHandler`] or [`server::ServerHandler`] against a
//! user-supplied message-identifier kind ([`message::MessageId`]) and
//! handing it to a [`client::ClientEndpoint`] or
//! [`server::ServerEndpoint`].
//!
//! Certificate provisioning, the concrete identifier enumeration, and
//! application-level semantics are all external collaborators — this
//! crate only consumes file paths and a generic tag.

pub mod async_runtime;
pub mod client;
pub mod connection;
mod dispatch;
pub mod error;
pub mod message;
pub mod queue;
pub mod server;
pub mod tls;

pub use client::{ClientEndpoint, ClientHandler};
pub use connection::{Connection, ConnectionHandle, Role};
pub use error::{Error, ErrorKind, Result};
pub use message::{Header, Message, MessageId, OwnedMessage};
pub use queue::Fifo;
pub use server::{ServerEndpoint, ServerHandler};
pub use tls::TlsPaths;
