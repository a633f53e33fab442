//! Orchestration of session creation, teardown, and the management surface.

use std::sync::Arc;

use chrono::Utc;
use culvert_proto::{AclParseError, ConnectionRequest, Remote, RemoteError, TunnelAcl};
use culvert_transport::AgentTransport;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::ports::{PortDistributor, PortError};
use crate::repository::{Retention, SessionRepository};
use crate::session::Session;
use crate::tunnel::{Tunnel, TunnelError};

/// Session service errors
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Acl(#[from] AclParseError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("tunnel not found: {0}")]
    TunnelNotFound(String),
}

/// Builds sessions out of connection requests and runs their lifecycle
/// against the repository and the port distributor.
pub struct SessionService {
    repo: Arc<SessionRepository>,
    port_distributor: Arc<PortDistributor>,
}

impl SessionService {
    pub fn new(port_distributor: Arc<PortDistributor>, repo: Arc<SessionRepository>) -> Self {
        Self {
            repo,
            port_distributor,
        }
    }

    /// Number of known sessions, disconnected ones included.
    pub fn count(&self) -> usize {
        self.repo.count()
    }

    /// Look up any session by ID.
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.repo.get_by_id(id)
    }

    /// Look up a connected session by ID.
    pub fn get_active_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.repo.get_active_by_id(id)
    }

    /// Snapshot of all sessions.
    pub fn get_all(&self) -> Vec<Arc<Session>> {
        self.repo.get_all()
    }

    /// Create a session for a freshly authenticated agent.
    ///
    /// `cancel` is the controlling context for the whole session; it parents
    /// every tunnel accept loop. When any requested tunnel fails, tunnels
    /// already started in this attempt are terminated, nothing is saved, and
    /// the error is returned.
    pub async fn start_client_session(
        &self,
        cancel: CancellationToken,
        id: impl Into<String>,
        transport: Arc<dyn AgentTransport>,
        mut request: ConnectionRequest,
        client_auth_id: impl Into<String>,
    ) -> Result<Arc<Session>, ServiceError> {
        let remotes = std::mem::take(&mut request.remotes);
        let session = Session::new(id, request, transport, client_auth_id, cancel);

        if let Err(err) = self.start_session_tunnels(&session, remotes).await {
            warn!(
                session_id = %session.id,
                error = %err,
                "Session start failed, unwinding already started tunnels"
            );
            session.terminate_all_tunnels().await;
            return Err(err);
        }

        self.repo.save(Arc::clone(&session));
        info!(session_id = %session.id, client = %session.banner(), "Client session started");
        Ok(session)
    }

    /// Start one tunnel per remote, in order.
    ///
    /// Re-reads the busy-port snapshot once up front, then allocates a
    /// random listener port for every remote that did not specify one. The
    /// first failure aborts the sequence; the caller owns cleanup of tunnels
    /// already started.
    pub async fn start_session_tunnels(
        &self,
        session: &Arc<Session>,
        remotes: Vec<Remote>,
    ) -> Result<Vec<Arc<Tunnel>>, ServiceError> {
        self.port_distributor.refresh().await?;

        let mut tunnels = Vec::with_capacity(remotes.len());
        for mut remote in remotes {
            remote.validate()?;
            if !remote.is_local_specified() {
                let port = self.port_distributor.get_random_port()?;
                remote.local_host = Some("0.0.0.0".to_string());
                remote.local_port = Some(port);
                remote.local_port_random = true;
            }

            let acl = match remote.acl.as_deref() {
                Some(raw) => TunnelAcl::parse(raw)?,
                None => TunnelAcl::default(),
            };

            let tunnel = session.start_tunnel(remote, acl).await?;
            tunnels.push(tunnel);
        }
        Ok(tunnels)
    }

    /// Handle the end of a session's transport.
    ///
    /// Without a retention policy the entry is deleted outright; otherwise
    /// it is stamped disconnected and kept for the repository's window. The
    /// transport is already closing, which stops the live tunnels.
    pub async fn terminate(&self, session: &Arc<Session>) {
        match self.repo.retention() {
            Retention::None => {
                info!(session_id = %session.id, "Session terminated, deleting entry");
                self.repo.delete(session);
            }
            _ => {
                info!(session_id = %session.id, "Session disconnected, retaining entry");
                session.set_disconnected(Utc::now());
                self.repo.save(Arc::clone(session));
            }
        }
    }

    /// Terminate one tunnel on a session, by IDs. Management-API surface.
    ///
    /// A terminate failure propagates; the tunnel has left the session's
    /// list regardless.
    pub async fn terminate_tunnel(
        &self,
        session_id: &str,
        tunnel_id: &str,
    ) -> Result<(), ServiceError> {
        let session = self
            .repo
            .get_by_id(session_id)
            .ok_or_else(|| ServiceError::SessionNotFound(session_id.to_string()))?;
        let tunnel = session
            .find_tunnel(tunnel_id)
            .await
            .ok_or_else(|| ServiceError::TunnelNotFound(tunnel_id.to_string()))?;
        session.terminate_tunnel(&tunnel).await?;
        Ok(())
    }
}
