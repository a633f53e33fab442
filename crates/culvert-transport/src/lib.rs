//! Agent transport boundary for the culvert control plane.
//!
//! The secure-channel layer (handshake, encryption, multiplexing) lives
//! outside this workspace. What the control plane needs from it is small:
//! open a logical byte stream to an address behind the agent, know the
//! peer's network address, and learn when the transport is gone. This crate
//! defines that contract and ships an in-memory implementation for tests
//! and same-process agents.

pub mod memory;

use std::net::SocketAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use memory::{MemoryTransport, StreamRequest};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport to the agent is gone. Terminal for every stream.
    #[error("agent transport closed")]
    Closed,

    /// The agent refused to open a stream to the requested target.
    #[error("stream to {target} refused: {reason}")]
    Refused { target: String, reason: String },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A logical byte stream multiplexed over an agent transport.
pub trait TransportStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> TransportStream for T {}

/// Boxed stream handed to forwarding code.
pub type BoxedStream = Box<dyn TransportStream>;

/// An authenticated, multiplexed, bidirectional connection to one agent.
///
/// The session owns the transport; tunnels hold a weak reference and must
/// never close it.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Network address the agent connected from.
    fn remote_addr(&self) -> SocketAddr;

    /// Open a logical stream to `target` (`host:port` reachable from the
    /// agent side).
    async fn open_stream(&self, target: &str) -> Result<BoxedStream, TransportError>;

    /// Close the transport. Idempotent; fires the done token.
    async fn close(&self);

    /// Token cancelled when the transport tears down, whether by [`close`]
    /// or by the peer going away.
    ///
    /// [`close`]: AgentTransport::close
    fn done(&self) -> CancellationToken;
}
