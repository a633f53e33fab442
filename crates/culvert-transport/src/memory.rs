//! In-memory agent transport.
//!
//! Streams are `tokio::io::duplex` pipes: the control-plane side gets one
//! end, the agent side receives the other through a channel of
//! [`StreamRequest`]s. Tests drive the agent side directly; a same-process
//! agent can do the same in production.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{AgentTransport, BoxedStream, TransportError};

/// Per-stream buffer for in-memory pipes.
const STREAM_CAPACITY: usize = 64 * 1024;

/// A stream opened by the control plane, delivered to the agent side.
pub struct StreamRequest {
    /// `host:port` the control plane wants reached from the agent side.
    pub target: String,
    /// The agent's end of the pipe.
    pub stream: DuplexStream,
}

/// In-memory [`AgentTransport`] backed by duplex pipes.
pub struct MemoryTransport {
    remote_addr: SocketAddr,
    requests: mpsc::UnboundedSender<StreamRequest>,
    done: CancellationToken,
}

impl MemoryTransport {
    /// Create a transport and the receiver the agent side consumes stream
    /// requests from.
    pub fn new(remote_addr: SocketAddr) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamRequest>) {
        let (requests, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            remote_addr,
            requests,
            done: CancellationToken::new(),
        });
        (transport, rx)
    }
}

#[async_trait]
impl AgentTransport for MemoryTransport {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn open_stream(&self, target: &str) -> Result<BoxedStream, TransportError> {
        if self.done.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (near, far) = tokio::io::duplex(STREAM_CAPACITY);
        self.requests
            .send(StreamRequest {
                target: target.to_string(),
                stream: far,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Box::new(near))
    }

    async fn close(&self) {
        self.done.cancel();
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }
}

/// Agent side that echoes every byte back on each stream it is handed.
///
/// Test helper: pairs with [`MemoryTransport::new`]'s receiver.
pub fn spawn_echo_agent(mut requests: mpsc::UnboundedReceiver<StreamRequest>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = tokio::io::split(request.stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    })
}
