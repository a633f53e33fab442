//! Session and tunnel core of the culvert reverse-tunnel control plane.
//!
//! Agents connect out to the server over an authenticated multiplexed
//! transport (the [`culvert_transport::AgentTransport`] contract); this
//! crate turns each connection request into a [`Session`] with one
//! [`Tunnel`] per requested forwarding, re-exposing endpoints behind the
//! agent as TCP listeners on the server. The [`SessionRepository`] tracks
//! connected and recently disconnected sessions, the [`PortDistributor`]
//! hands out listener ports, and the [`SessionService`] ties the pipeline
//! together for the transport layer and the management API.

pub mod config;
pub mod groups;
pub mod ports;
pub mod repository;
pub mod service;
pub mod session;
pub mod tunnel;

pub use config::{CoreConfig, DEFAULT_PORT_RANGE};
pub use groups::{ClientGroup, GroupParams, ParamValues, Pattern};
pub use ports::{PortDistributor, PortError, PortRange, PortScanner, ProcNetScanner};
pub use repository::{Retention, RetentionParseError, SessionRepository};
pub use service::{ServiceError, SessionService};
pub use session::{ConnectionState, Session};
pub use tunnel::{Tunnel, TunnelError};
