//! Wire-facing data model for the culvert control plane.
//!
//! This crate defines the types an agent sends when it connects: the
//! connection request, its requested forwardings, and the per-forwarding
//! access-control list, together with their validation rules. It carries no
//! networking; the control plane in `culvert-control` consumes these types.

pub mod acl;
pub mod remote;
pub mod request;

pub use acl::{AclParseError, TunnelAcl};
pub use remote::{Remote, RemoteError};
pub use request::ConnectionRequest;
