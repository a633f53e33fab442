//! Requested forwarding descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a remote fails validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote host must not be empty")]
    EmptyRemoteHost,

    #[error("remote port must be in 1-65535")]
    InvalidRemotePort,

    #[error("local port must be in 1-65535")]
    InvalidLocalPort,
}

/// One forwarding requested by an agent: a server-side listener endpoint
/// mapped to an endpoint reachable from the agent.
///
/// The local side is optional. When no local port is given the server
/// allocates one from its pool and records that in `local_port_random`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Remote {
    /// Host the server-side listener binds to. Defaults to `0.0.0.0`.
    pub local_host: Option<String>,
    /// Port the server-side listener binds to. Allocated when absent.
    pub local_port: Option<u16>,
    /// Whether `local_port` was allocated by the server rather than
    /// requested by the agent.
    pub local_port_random: bool,
    /// Host of the endpoint reachable from the agent.
    pub remote_host: String,
    /// Port of the endpoint reachable from the agent.
    pub remote_port: u16,
    /// Optional scheme hint (`ssh`, `http`, ...). Informational only.
    pub scheme: Option<String>,
    /// Raw ACL string gating who may dial the listener. Parsed at tunnel
    /// start.
    pub acl: Option<String>,
}

impl Remote {
    /// Whether the agent specified the server-side listener port itself.
    pub fn is_local_specified(&self) -> bool {
        self.local_port.is_some()
    }

    /// The `host:port` the server-side listener binds to.
    ///
    /// Substitutes `0.0.0.0` when no host was given and port `0` when no
    /// port was allocated yet.
    pub fn local_addr_string(&self) -> String {
        format!(
            "{}:{}",
            self.local_host.as_deref().unwrap_or("0.0.0.0"),
            self.local_port.unwrap_or(0)
        )
    }

    /// The `host:port` of the agent-side endpoint.
    pub fn remote_addr_string(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Compare the forwarding identity of two remotes: the local and remote
    /// host/port pairs plus the scheme hint.
    ///
    /// ACL and the random-port marker are deliberately excluded; a repeated
    /// request for the same forwarding reuses the existing tunnel even if
    /// those differ.
    pub fn eq_forwarding(&self, other: &Remote) -> bool {
        self.local_host == other.local_host
            && self.local_port == other.local_port
            && self.remote_host == other.remote_host
            && self.remote_port == other.remote_port
            && self.scheme == other.scheme
    }

    /// Validate the invariants of a remote as received from an agent.
    pub fn validate(&self) -> Result<(), RemoteError> {
        if self.remote_host.is_empty() {
            return Err(RemoteError::EmptyRemoteHost);
        }
        if self.remote_port == 0 {
            return Err(RemoteError::InvalidRemotePort);
        }
        if self.local_port == Some(0) {
            return Err(RemoteError::InvalidLocalPort);
        }
        Ok(())
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.local_addr_string(),
            self.remote_addr_string()
        )?;
        if let Some(scheme) = &self.scheme {
            write!(f, " ({})", scheme)?;
        }
        Ok(())
    }
}
