//! Server-side realization of one requested forwarding.
//!
//! A tunnel owns a TCP listener; every accepted connection is checked
//! against the tunnel's ACL, then bridged to a logical stream opened on the
//! owning session's agent transport. The tunnel holds only a weak reference
//! to that transport: the session owns it, and a tunnel must never close it.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use culvert_proto::{Remote, TunnelAcl};
use culvert_transport::{AgentTransport, BoxedStream};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffer size for each copy direction.
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Tunnel errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind tunnel listener on {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("tunnel accept loop failed: {0}")]
    AcceptTask(#[from] tokio::task::JoinError),
}

/// One live forwarding: a bound listener plus the accept loop shuttling its
/// connections over the agent transport.
pub struct Tunnel {
    id: String,
    remote: Remote,
    acl: TunnelAcl,
    transport: Weak<dyn AgentTransport>,
    transport_done: CancellationToken,
    cancel: CancellationToken,
    done: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Tunnel {
    pub(crate) fn new(
        id: String,
        remote: Remote,
        acl: TunnelAcl,
        transport: &Arc<dyn AgentTransport>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote,
            acl,
            transport: Arc::downgrade(transport),
            transport_done: transport.done(),
            cancel: parent.child_token(),
            done: CancellationToken::new(),
            local_addr: OnceLock::new(),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            accept_task: Mutex::new(None),
        })
    }

    /// Stable per-session tunnel ID (decimal, starting at 1).
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The forwarding this tunnel realizes.
    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// The parsed ACL gating the listener.
    pub fn acl(&self) -> &TunnelAcl {
        &self.acl
    }

    /// The address the listener actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Bytes copied from accepted peers towards the agent.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes copied from the agent towards accepted peers.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Whether the tunnel has reached its terminal state.
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Token cancelled once the tunnel reaches its terminal state.
    pub fn done_token(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Whether this tunnel realizes the given forwarding.
    pub fn matches(&self, remote: &Remote) -> bool {
        self.remote.eq_forwarding(remote)
    }

    /// Bind the listener and spawn the accept loop.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), TunnelError> {
        let addr = self.remote.local_addr_string();
        let listener = TcpListener::bind(addr.as_str())
            .await
            .map_err(|source| TunnelError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| TunnelError::Bind {
            addr,
            source,
        })?;
        let _ = self.local_addr.set(local);

        info!(
            tunnel_id = %self.id,
            listen = %local,
            remote = %self.remote,
            "Tunnel listener bound"
        );

        let tunnel = Arc::clone(self);
        let handle = tokio::spawn(async move { tunnel.accept_loop(listener).await });
        *self.accept_task.lock().await = Some(handle);
        Ok(())
    }

    /// Stop the tunnel: close the listener, cancel the accept loop, and
    /// abort in-flight forwardings. Idempotent.
    ///
    /// An accept loop that panicked instead of exiting surfaces as
    /// [`TunnelError::AcceptTask`]; the tunnel still reaches its terminal
    /// state.
    pub async fn terminate(&self) -> Result<(), TunnelError> {
        self.cancel.cancel();
        let joined = match self.accept_task.lock().await.take() {
            Some(handle) => handle.await.map_err(TunnelError::AcceptTask),
            None => Ok(()),
        };
        // Covers a tunnel that never got past start().
        self.done.cancel();
        joined
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(tunnel_id = %self.id, "Tunnel stopped");
                    break;
                }
                _ = self.transport_done.cancelled() => {
                    info!(tunnel_id = %self.id, "Agent transport closed, stopping tunnel");
                    break;
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => match accepted {
                    Ok((conn, peer)) => {
                        if !self.acl.is_allowed(&peer.ip()) {
                            debug!(tunnel_id = %self.id, peer = %peer, "Connection rejected by ACL");
                            continue;
                        }
                        let tunnel = Arc::clone(&self);
                        connections.spawn(async move { tunnel.forward_connection(conn, peer).await });
                    }
                    Err(err) if is_transient_accept_error(&err) => {
                        warn!(tunnel_id = %self.id, error = %err, "Transient accept failure");
                    }
                    Err(err) => {
                        warn!(tunnel_id = %self.id, error = %err, "Listener failed, tunnel is done");
                        break;
                    }
                }
            }
        }

        drop(listener);
        connections.abort_all();
        while connections.join_next().await.is_some() {}
        self.done.cancel();
    }

    async fn forward_connection(&self, conn: TcpStream, peer: SocketAddr) {
        let target = self.remote.remote_addr_string();
        let Some(transport) = self.transport.upgrade() else {
            debug!(tunnel_id = %self.id, peer = %peer, "Transport gone, dropping connection");
            return;
        };

        // A failed open closes the accepted connection but leaves the
        // listener up; the target being down is not the tunnel's problem.
        let channel = match transport.open_stream(&target).await {
            Ok(channel) => channel,
            Err(err) => {
                warn!(
                    tunnel_id = %self.id,
                    peer = %peer,
                    target = %target,
                    error = %err,
                    "Failed to open stream to agent"
                );
                return;
            }
        };
        drop(transport);

        debug!(tunnel_id = %self.id, peer = %peer, target = %target, "Forwarding connection");
        let (sent, received) = self.copy_bidirectional(conn, channel).await;
        debug!(
            tunnel_id = %self.id,
            peer = %peer,
            bytes_in = sent,
            bytes_out = received,
            "Forwarding finished"
        );
    }

    /// Copy bytes both ways until each direction hits EOF or an error.
    ///
    /// A direction that finishes shuts down the opposite write half and
    /// waits for the other direction to drain. Returns the per-connection
    /// (peer-to-agent, agent-to-peer) byte totals.
    async fn copy_bidirectional(&self, conn: TcpStream, channel: BoxedStream) -> (u64, u64) {
        let (mut conn_read, mut conn_write) = conn.into_split();
        let (mut chan_read, mut chan_write) = tokio::io::split(channel);

        let inbound = async {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                match conn_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if chan_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        total += n as u64;
                        self.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(_) => break,
                }
            }
            let _ = chan_write.shutdown().await;
            total
        };

        let outbound = async {
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut total = 0u64;
            loop {
                match chan_read.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if conn_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        total += n as u64;
                        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(_) => break,
                }
            }
            let _ = conn_write.shutdown().await;
            total
        };

        tokio::join!(inbound, outbound)
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
