//! CIDR allow-lists gating who may connect to a tunnel listener.
//!
//! An ACL arrives from the agent as a comma-separated string where each item
//! is either a bare IP address or a CIDR. An empty ACL allows everyone.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use ipnet::IpNet;
use thiserror::Error;

/// Error returned when an ACL string cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ACL rule {rule:?}: expected an IP address or CIDR")]
pub struct AclParseError {
    pub rule: String,
}

/// Ordered list of networks allowed to dial a tunnel listener.
///
/// Bare addresses are interpreted as host networks (`/32` for IPv4, `/128`
/// for IPv6). An empty list allows all peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelAcl {
    rules: Vec<IpNet>,
}

impl TunnelAcl {
    /// Parse a comma-separated list of IPs and CIDRs.
    ///
    /// Whitespace around items is ignored. An empty or whitespace-only
    /// string yields the empty allow-all ACL. Any malformed item fails the
    /// whole parse.
    pub fn parse(s: &str) -> Result<Self, AclParseError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut rules = Vec::new();
        for item in s.split(',') {
            let item = item.trim();
            let net = match item.parse::<IpAddr>() {
                Ok(ip) => IpNet::from(ip),
                Err(_) => item.parse::<IpNet>().map_err(|_| AclParseError {
                    rule: item.to_string(),
                })?,
            };
            rules.push(net);
        }
        Ok(Self { rules })
    }

    /// Check if an IP address is allowed by this ACL.
    ///
    /// Returns true if the rule list is empty or the IP is contained in any
    /// rule's network.
    pub fn is_allowed(&self, ip: &IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        self.rules.iter().any(|net| net.contains(ip))
    }

    /// Check the IP of a socket address.
    pub fn is_socket_allowed(&self, addr: &SocketAddr) -> bool {
        self.is_allowed(&addr.ip())
    }

    /// Whether this ACL allows all peers.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The parsed rules, in the order they were written.
    pub fn rules(&self) -> &[IpNet] {
        &self.rules
    }
}

impl FromStr for TunnelAcl {
    type Err = AclParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
