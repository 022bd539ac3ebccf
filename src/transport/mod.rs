//! Message transports between peers
//!
//! A transport moves wire text (functions, Acks, hellos) between named
//! peers. [`local::LocalHub`] connects nodes inside one process,
//! [`tcp::TcpTransport`] connects processes over newline-delimited JSON.
//! [`node::WorkerNode`] sits on top and turns messages into controller calls.

pub mod local;
pub mod node;
pub mod tcp;

use anyhow::Result;
use thiserror::Error;

pub use local::LocalHub;
pub use node::WorkerNode;
pub use tcp::TcpTransport;

pub trait Transport: Send + Sync {
    /// Queue `message` for `peer`; never waits for delivery
    fn send(&self, peer: &str, message: &str) -> Result<()>;
}

pub trait MessageHandler: Send + Sync {
    fn on_received(&self, peer: &str, message: &str);
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Peer name already in use: {0}")]
    NameTaken(String),

    #[error("Connection to {0} is closed")]
    Closed(String),

    #[error("Line longer than {0} bytes")]
    LineTooLong(usize),
}
