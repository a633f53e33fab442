//! The structured message an agent sends after the transport handshake.

use serde::{Deserialize, Serialize};

use crate::Remote;

/// Connection request carried over a freshly authenticated transport.
///
/// Everything is defaulted so that minimal agents, which only fill in their
/// remotes, still connect; the metadata fields feed session listing and
/// group matching on the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionRequest {
    /// Display name chosen by the agent operator.
    pub name: String,
    /// Free-form labels for grouping and search.
    pub tags: Vec<String>,
    /// Operating system description.
    pub os: String,
    pub os_arch: String,
    pub os_family: String,
    pub os_kernel: String,
    pub hostname: String,
    /// Agent semantic version.
    pub version: String,
    /// Addresses the agent observed on its own interfaces.
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
    /// Forwardings to establish for this session.
    pub remotes: Vec<Remote>,
}
