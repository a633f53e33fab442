//! Configuration surface of the core.
//!
//! The embedding daemon owns file/flag parsing; this is the handful of
//! options the core itself recognizes, plus the wiring that turns them into
//! a ready-to-use service.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::ports::{PortDistributor, PortError};
use crate::repository::{Retention, SessionRepository};
use crate::service::SessionService;

/// Default pool for server-side listener ports.
pub const DEFAULT_PORT_RANGE: &str = "20000-30000";

/// Options recognized by the session/tunnel core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Port-range expression feeding the port distributor
    /// (`"20000-30000"`, `"20000-20100,22000"`).
    pub port_range: String,

    /// Retention policy for disconnected sessions: `none`, `forever`, or a
    /// duration literal like `1h`.
    pub keep_disconnected: Retention,

    /// Upper bound on how long one busy-port snapshot may take, in seconds.
    #[serde(with = "optional_secs")]
    pub check_port_timeout: Option<Duration>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            port_range: DEFAULT_PORT_RANGE.to_string(),
            keep_disconnected: Retention::None,
            check_port_timeout: None,
        }
    }
}

impl CoreConfig {
    /// Validate the configuration and build the session service.
    ///
    /// Must run inside a tokio runtime when `keep_disconnected` is a finite
    /// window (the repository spawns its reaper).
    pub fn build_service(&self) -> Result<SessionService, PortError> {
        let distributor = Arc::new(PortDistributor::with_os_scanner(
            &self.port_range,
            self.check_port_timeout,
        )?);
        let repo = SessionRepository::new(self.keep_disconnected);
        Ok(SessionService::new(distributor, repo))
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
