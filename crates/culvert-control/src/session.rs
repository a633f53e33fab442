//! One live (or recently live) association between an agent and the server.
//!
//! A session exclusively owns the agent transport and its tunnels; the
//! repository holds shared handles to sessions. Tunnel-list mutations are
//! serialized by the session's async mutex, tunnel IDs come from an atomic
//! counter and are never reused, and long I/O never runs under the lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use culvert_proto::{ConnectionRequest, Remote, TunnelAcl};
use culvert_transport::AgentTransport;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::groups::ClientGroup;
use crate::tunnel::{Tunnel, TunnelError};

/// Connection state derived from the disconnect timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A connected (or retained disconnected) agent.
pub struct Session {
    /// Opaque session ID. An agent reconnecting with the same ID replaces
    /// the prior repository entry.
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    pub os: String,
    pub os_arch: String,
    pub os_family: String,
    pub os_kernel: String,
    pub hostname: String,
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    pub version: String,
    /// Network address the agent transport connected from.
    pub address: SocketAddr,
    /// Identity the agent authenticated with.
    pub client_auth_id: String,

    transport: Arc<dyn AgentTransport>,
    cancel: CancellationToken,
    tunnels: Mutex<Vec<Arc<Tunnel>>>,
    next_tunnel_id: AtomicI64,
    disconnected_at: RwLock<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("client_auth_id", &self.client_auth_id)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Build a session from a connection request.
    ///
    /// `cancel` is the controlling context: its cancellation tears down
    /// every tunnel the session starts.
    pub fn new(
        id: impl Into<String>,
        request: ConnectionRequest,
        transport: Arc<dyn AgentTransport>,
        client_auth_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let address = transport.remote_addr();
        Arc::new(Self {
            id: id.into(),
            name: request.name,
            tags: request.tags,
            os: request.os,
            os_arch: request.os_arch,
            os_family: request.os_family,
            os_kernel: request.os_kernel,
            hostname: request.hostname,
            ipv4: request.ipv4,
            ipv6: request.ipv6,
            version: request.version,
            address,
            client_auth_id: client_auth_id.into(),
            transport,
            cancel,
            tunnels: Mutex::new(Vec::new()),
            next_tunnel_id: AtomicI64::new(0),
            disconnected_at: RwLock::new(None),
        })
    }

    /// Generate a fresh random session ID.
    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Start a tunnel for `remote`, or return the existing one realizing the
    /// same forwarding.
    ///
    /// The tunnel ID is consumed even when the listener fails to bind; IDs
    /// are never reused within a session.
    pub async fn start_tunnel(
        self: &Arc<Self>,
        remote: Remote,
        acl: TunnelAcl,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(existing) = tunnels.iter().find(|t| t.matches(&remote)) {
            debug!(
                session_id = %self.id,
                tunnel_id = %existing.id(),
                "Reusing existing tunnel for repeated remote"
            );
            return Ok(Arc::clone(existing));
        }

        let id = self.next_tunnel_id.fetch_add(1, Ordering::SeqCst) + 1;
        let tunnel = Tunnel::new(id.to_string(), remote, acl, &self.transport, &self.cancel);
        tunnel.start().await?;
        tunnels.push(Arc::clone(&tunnel));
        drop(tunnels);

        self.watch_tunnel(&tunnel);
        Ok(tunnel)
    }

    /// Terminate a tunnel and drop it from the session's list.
    ///
    /// A terminate failure propagates, but the tunnel is removed from the
    /// list either way.
    pub async fn terminate_tunnel(&self, tunnel: &Arc<Tunnel>) -> Result<(), TunnelError> {
        info!(session_id = %self.id, tunnel_id = %tunnel.id(), "Terminating tunnel");
        let terminated = tunnel.terminate().await;
        self.remove_tunnel(tunnel.id()).await;
        terminated
    }

    /// Terminate every live tunnel. Used when a session start unwinds, so
    /// this is best-effort: a tunnel that fails to terminate cleanly is
    /// logged and the rest are still torn down.
    pub async fn terminate_all_tunnels(&self) {
        for tunnel in self.tunnels().await {
            if let Err(err) = self.terminate_tunnel(&tunnel).await {
                warn!(
                    session_id = %self.id,
                    tunnel_id = %tunnel.id(),
                    error = %err,
                    "Tunnel did not terminate cleanly"
                );
            }
        }
    }

    /// Find a tunnel by its ID.
    pub async fn find_tunnel(&self, id: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().await.iter().find(|t| t.id() == id).cloned()
    }

    /// Find the tunnel realizing a forwarding, if any.
    pub async fn find_tunnel_by_remote(&self, remote: &Remote) -> Option<Arc<Tunnel>> {
        self.tunnels
            .lock()
            .await
            .iter()
            .find(|t| t.matches(remote))
            .cloned()
    }

    /// Snapshot of the live tunnels. Safe to iterate without any lock.
    pub async fn tunnels(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.lock().await.clone()
    }

    /// The transport the agent is connected over.
    pub fn transport(&self) -> &Arc<dyn AgentTransport> {
        &self.transport
    }

    /// The controlling context stored at session start.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Close the session: cancel its context and close the owned transport.
    ///
    /// The tunnels observe the transport teardown and stop on their own.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.transport.close().await;
    }

    /// `connected` while the disconnect timestamp is unset.
    pub fn connection_state(&self) -> ConnectionState {
        if self.disconnected_at.read().unwrap().is_some() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Connected
        }
    }

    /// When the agent disconnected, if it has.
    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        *self.disconnected_at.read().unwrap()
    }

    /// Stamp the session disconnected.
    pub fn set_disconnected(&self, at: DateTime<Utc>) {
        *self.disconnected_at.write().unwrap() = Some(at);
    }

    /// Whether the session has been disconnected for at least `window`.
    pub fn obsolete(&self, window: Duration) -> bool {
        match *self.disconnected_at.read().unwrap() {
            Some(at) => (Utc::now() - at)
                .to_std()
                .map(|elapsed| elapsed >= window)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Whether this session matches a client group.
    ///
    /// Every parameter the group specifies must match the corresponding
    /// session field (any element, for the repeated fields). A group with no
    /// parameters matches nothing.
    pub fn belongs_to(&self, group: &ClientGroup) -> bool {
        let p = &group.params;
        if p.has_no_params() {
            return false;
        }

        let single = |param: &Option<crate::groups::ParamValues>, value: &str| {
            param.as_ref().map_or(true, |pv| pv.matches_one_of(&[value]))
        };
        let multi = |param: &Option<crate::groups::ParamValues>, values: &[String]| {
            param.as_ref().map_or(true, |pv| {
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                pv.matches_one_of(&refs)
            })
        };

        let address = self.address.to_string();
        single(&p.client_id, &self.id)
            && single(&p.name, &self.name)
            && single(&p.os, &self.os)
            && single(&p.os_arch, &self.os_arch)
            && single(&p.os_family, &self.os_family)
            && single(&p.os_kernel, &self.os_kernel)
            && single(&p.hostname, &self.hostname)
            && multi(&p.ipv4, &self.ipv4)
            && multi(&p.ipv6, &self.ipv6)
            && multi(&p.tag, &self.tags)
            && single(&p.version, &self.version)
            && single(&p.address, &address)
            && single(&p.client_auth_id, &self.client_auth_id)
    }

    /// Whether this session matches any of the given groups.
    pub fn belongs_to_one_of(&self, groups: &[ClientGroup]) -> bool {
        groups.iter().any(|g| self.belongs_to(g))
    }

    /// Human-readable identity line: ID, name, and tags.
    pub fn banner(&self) -> String {
        let mut banner = self.id.clone();
        if !self.name.is_empty() {
            banner.push_str(&format!(" ({})", self.name));
        }
        for tag in &self.tags {
            banner.push_str(&format!(" #{}", tag));
        }
        banner
    }

    /// Drop a tunnel from the list once it reaches its terminal state, no
    /// matter how it got there.
    fn watch_tunnel(self: &Arc<Self>, tunnel: &Arc<Tunnel>) {
        let session = Arc::downgrade(self);
        let done = tunnel.done_token();
        let tunnel_id = tunnel.id().to_string();
        tokio::spawn(async move {
            done.cancelled().await;
            if let Some(session) = session.upgrade() {
                session.remove_tunnel(&tunnel_id).await;
            }
        });
    }

    async fn remove_tunnel(&self, id: &str) {
        self.tunnels.lock().await.retain(|t| t.id() != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use culvert_transport::memory::{spawn_echo_agent, MemoryTransport};

    fn test_session() -> (Arc<Session>, Arc<MemoryTransport>) {
        let (memory, rx) = MemoryTransport::new("192.0.2.3:41000".parse().unwrap());
        let _agent = spawn_echo_agent(rx);
        let request = ConnectionRequest {
            name: "edge-1".to_string(),
            tags: vec!["prod".to_string()],
            ..Default::default()
        };
        let session = Session::new(
            "sess-1",
            request,
            memory.clone() as Arc<dyn AgentTransport>,
            "deploy-key",
            CancellationToken::new(),
        );
        (session, memory)
    }

    fn loopback_remote(remote_port: u16) -> Remote {
        Remote {
            local_host: Some("127.0.0.1".to_string()),
            // Ephemeral bind keeps parallel tests off each other's ports.
            local_port: Some(0),
            remote_host: "svc".to_string(),
            remote_port,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn tunnel_ids_are_monotonic_from_one() {
        let (session, _memory) = test_session();

        let t1 = session
            .start_tunnel(loopback_remote(8001), TunnelAcl::default())
            .await
            .unwrap();
        let t2 = session
            .start_tunnel(loopback_remote(8002), TunnelAcl::default())
            .await
            .unwrap();

        let id1: i64 = t1.id().parse().unwrap();
        let id2: i64 = t2.id().parse().unwrap();
        assert_eq!(id1, 1);
        assert!(id1 < id2);
        assert_eq!(session.tunnels().await.len(), 2);

        session.terminate_all_tunnels().await;
        assert!(session.tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn repeated_remote_reuses_tunnel_and_id() {
        let (session, _memory) = test_session();
        let remote = loopback_remote(8005);

        let first = session
            .start_tunnel(remote.clone(), TunnelAcl::default())
            .await
            .unwrap();
        let second = session
            .start_tunnel(remote, TunnelAcl::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(session.tunnels().await.len(), 1);

        // The next distinct tunnel still gets ID 2: no ID was burned on the
        // repeated request.
        let third = session
            .start_tunnel(loopback_remote(8006), TunnelAcl::default())
            .await
            .unwrap();
        assert_eq!(third.id(), "2");

        session.terminate_all_tunnels().await;
    }

    #[tokio::test]
    async fn failed_bind_consumes_the_id() {
        let (session, _memory) = test_session();

        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap().port();

        let mut conflicting = loopback_remote(9);
        conflicting.local_port = Some(taken);
        let err = session
            .start_tunnel(conflicting, TunnelAcl::default())
            .await;
        assert!(err.is_err());
        assert!(session.tunnels().await.is_empty());

        let next = session
            .start_tunnel(loopback_remote(8010), TunnelAcl::default())
            .await
            .unwrap();
        assert_eq!(next.id(), "2");

        session.terminate_all_tunnels().await;
    }

    #[tokio::test]
    async fn terminate_tunnel_reports_ok_and_removes() {
        let (session, _memory) = test_session();
        let tunnel = session
            .start_tunnel(loopback_remote(8015), TunnelAcl::default())
            .await
            .unwrap();

        session.terminate_tunnel(&tunnel).await.unwrap();
        assert!(tunnel.is_done());
        assert!(session.find_tunnel(tunnel.id()).await.is_none());
        assert!(session.tunnels().await.is_empty());
    }

    #[tokio::test]
    async fn find_by_id_and_remote() {
        let (session, _memory) = test_session();
        let remote = loopback_remote(8020);
        let tunnel = session
            .start_tunnel(remote.clone(), TunnelAcl::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(
            &session.find_tunnel(tunnel.id()).await.unwrap(),
            &tunnel
        ));
        assert!(Arc::ptr_eq(
            &session.find_tunnel_by_remote(&remote).await.unwrap(),
            &tunnel
        ));
        assert!(session.find_tunnel("99").await.is_none());
        assert!(session
            .find_tunnel_by_remote(&loopback_remote(9))
            .await
            .is_none());

        session.terminate_all_tunnels().await;
    }

    #[tokio::test]
    async fn transport_close_empties_tunnel_list() {
        let (session, memory) = test_session();
        session
            .start_tunnel(loopback_remote(8030), TunnelAcl::default())
            .await
            .unwrap();
        assert_eq!(session.tunnels().await.len(), 1);

        memory.close().await;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while !session.tunnels().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "tunnel list never drained");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn close_tears_down_transport_and_tunnels() {
        let (session, memory) = test_session();
        session
            .start_tunnel(loopback_remote(8040), TunnelAcl::default())
            .await
            .unwrap();

        session.close().await;
        assert!(memory.done().is_cancelled());

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(1);
        while !session.tunnels().await.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "tunnels survived close");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn connection_state_and_obsolete() {
        let (session, _memory) = test_session();
        assert_eq!(session.connection_state(), ConnectionState::Connected);
        assert!(!session.obsolete(Duration::from_secs(0)));

        session.set_disconnected(Utc::now() - chrono::Duration::seconds(10));
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert!(session.obsolete(Duration::from_secs(5)));
        assert!(!session.obsolete(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn banner_includes_name_and_tags() {
        let (session, _memory) = test_session();
        assert_eq!(session.banner(), "sess-1 (edge-1) #prod");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(Session::generate_id(), Session::generate_id());
    }

    #[tokio::test]
    async fn group_matching() {
        use crate::groups::{ClientGroup, GroupParams, ParamValues};

        let (session, _memory) = test_session();

        // A group with no parameters never matches anything.
        assert!(!session.belongs_to(&ClientGroup::default()));

        let by_tag = ClientGroup {
            id: "prod".to_string(),
            params: GroupParams {
                tag: Some(ParamValues::new(["prod", "staging"])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(session.belongs_to(&by_tag));

        let by_name_wildcard = ClientGroup {
            id: "edges".to_string(),
            params: GroupParams {
                name: Some(ParamValues::new(["edge-*"])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(session.belongs_to(&by_name_wildcard));

        // Every specified parameter must match.
        let conjunction = ClientGroup {
            id: "edge-db".to_string(),
            params: GroupParams {
                name: Some(ParamValues::new(["edge-*"])),
                tag: Some(ParamValues::new(["db"])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!session.belongs_to(&conjunction));

        let by_auth = ClientGroup {
            id: "deploys".to_string(),
            params: GroupParams {
                client_auth_id: Some(ParamValues::new(["deploy-*"])),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(session.belongs_to(&by_auth));

        assert!(session.belongs_to_one_of(&[conjunction.clone(), by_tag.clone()]));
        assert!(!session.belongs_to_one_of(&[conjunction]));
        assert!(!session.belongs_to_one_of(&[]));
    }
}
