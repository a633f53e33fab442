//! Server-side listening-port allocation.
//!
//! The distributor owns a pool of allocatable ports derived from a
//! port-range expression (`"20000-20010,22000"`). A refresh snapshots the
//! ports the OS already has bound so a burst of allocations during session
//! start never needs an OS round-trip per port. Handed-out ports leave the
//! pool for the lifetime of the distributor; they go back to the OS, not to
//! the pool, when a tunnel closes, and the next refresh reconciles.

use std::collections::HashSet;
use std::io;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IteratorRandom;
use thiserror::Error;
use tracing::debug;

/// Port allocation errors
#[derive(Debug, Error)]
pub enum PortError {
    #[error("invalid port range {0:?}: expected N or M-N with 1 <= M <= N <= 65535")]
    InvalidRange(String),

    #[error("failed to query locally bound ports: {0}")]
    OsQuery(#[source] io::Error),

    #[error("no allocatable ports left in the pool")]
    Exhausted,
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

impl FromStr for PortRange {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PortError::InvalidRange(s.to_string());
        let range = if let Some((start, end)) = s.split_once('-') {
            let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
            let end = end.trim().parse::<u16>().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            PortRange::range(start, end)
        } else {
            PortRange::single(s.trim().parse::<u16>().map_err(|_| invalid())?)
        };
        if range.start == 0 {
            return Err(invalid());
        }
        Ok(range)
    }
}

/// Parse a comma-separated port-range expression into the set of allowed
/// ports.
pub fn parse_port_pool(s: &str) -> Result<HashSet<u16>, PortError> {
    let mut pool = HashSet::new();
    for item in s.split(',') {
        let range: PortRange = item.trim().parse()?;
        pool.extend(range.start..=range.end);
    }
    Ok(pool)
}

/// Source of the "which ports does the OS already have bound" snapshot.
///
/// Production uses [`ProcNetScanner`]; tests inject a fixed set.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn busy_ports(&self) -> io::Result<HashSet<u16>>;
}

/// Scanner reading the kernel socket tables.
///
/// On Linux this parses the local-address column of `/proc/net/tcp` and
/// `/proc/net/tcp6`. Other targets report an empty snapshot; a port that is
/// actually taken then surfaces as a bind error on the tunnel instead.
pub struct ProcNetScanner {
    timeout: Option<Duration>,
}

impl ProcNetScanner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PortScanner for ProcNetScanner {
    async fn busy_ports(&self) -> io::Result<HashSet<u16>> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, read_bound_ports())
                .await
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::TimedOut, "socket table query timed out")
                })?,
            None => read_bound_ports().await,
        }
    }
}

#[cfg(target_os = "linux")]
async fn read_bound_ports() -> io::Result<HashSet<u16>> {
    let mut ports = HashSet::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        match tokio::fs::read_to_string(path).await {
            Ok(table) => parse_socket_table(&table, &mut ports),
            Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(ports)
}

#[cfg(not(target_os = "linux"))]
async fn read_bound_ports() -> io::Result<HashSet<u16>> {
    Ok(HashSet::new())
}

/// Extract local ports from a `/proc/net/tcp`-format table.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_socket_table(table: &str, out: &mut HashSet<u16>) {
    for line in table.lines().skip(1) {
        // "  0: 00000000:4E20 00000000:0000 0A ..." - field 1 is local addr.
        let Some(local) = line.split_whitespace().nth(1) else {
            continue;
        };
        let Some((_, port_hex)) = local.rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            if port != 0 {
                out.insert(port);
            }
        }
    }
}

/// Hands out server-side listening ports from a configured pool, avoiding
/// ports the OS already has bound.
pub struct PortDistributor {
    allowed: Mutex<HashSet<u16>>,
    busy: Mutex<HashSet<u16>>,
    scanner: Arc<dyn PortScanner>,
}

impl PortDistributor {
    /// Build a distributor over a port-range expression with a custom
    /// scanner.
    pub fn new(port_range: &str, scanner: Arc<dyn PortScanner>) -> Result<Self, PortError> {
        Ok(Self {
            allowed: Mutex::new(parse_port_pool(port_range)?),
            busy: Mutex::new(HashSet::new()),
            scanner,
        })
    }

    /// Build a distributor backed by the OS socket tables.
    pub fn with_os_scanner(
        port_range: &str,
        check_port_timeout: Option<Duration>,
    ) -> Result<Self, PortError> {
        Self::new(port_range, Arc::new(ProcNetScanner::new(check_port_timeout)))
    }

    /// Re-read the busy-port snapshot from the scanner.
    pub async fn refresh(&self) -> Result<(), PortError> {
        let snapshot = self.scanner.busy_ports().await.map_err(PortError::OsQuery)?;
        debug!(busy = snapshot.len(), "Refreshed busy-port snapshot");
        *self.busy.lock().unwrap() = snapshot;
        Ok(())
    }

    /// Take a random port from allowed-minus-busy.
    ///
    /// The port leaves the allowed set for the lifetime of this instance, so
    /// repeated calls never hand out the same port even before the next
    /// refresh.
    pub fn get_random_port(&self) -> Result<u16, PortError> {
        let busy = self.busy.lock().unwrap();
        let mut allowed = self.allowed.lock().unwrap();
        let port = allowed
            .iter()
            .copied()
            .filter(|p| !busy.contains(p))
            .choose(&mut rand::thread_rng())
            .ok_or(PortError::Exhausted)?;
        allowed.remove(&port);
        debug!(port, remaining = allowed.len(), "Allocated listener port");
        Ok(port)
    }

    /// Ports still allocatable (ignoring the busy snapshot).
    pub fn pool_size(&self) -> usize {
        self.allowed.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedScanner(HashSet<u16>);

    #[async_trait]
    impl PortScanner for FixedScanner {
        async fn busy_ports(&self) -> io::Result<HashSet<u16>> {
            Ok(self.0.clone())
        }
    }

    struct FailingScanner;

    #[async_trait]
    impl PortScanner for FailingScanner {
        async fn busy_ports(&self) -> io::Result<HashSet<u16>> {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
        }
    }

    fn distributor(range: &str, busy: &[u16]) -> PortDistributor {
        PortDistributor::new(range, Arc::new(FixedScanner(busy.iter().copied().collect())))
            .unwrap()
    }

    #[test]
    fn port_range_parsing() {
        assert_eq!("22".parse::<PortRange>().unwrap(), PortRange::single(22));
        assert_eq!(
            "80-443".parse::<PortRange>().unwrap(),
            PortRange::range(80, 443)
        );
        assert_eq!(
            " 80 - 443 ".parse::<PortRange>().unwrap(),
            PortRange::range(80, 443)
        );

        assert!("".parse::<PortRange>().is_err());
        assert!("0".parse::<PortRange>().is_err());
        assert!("0-10".parse::<PortRange>().is_err());
        assert!("443-80".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
        assert!("abc".parse::<PortRange>().is_err());
    }

    #[test]
    fn pool_parsing_merges_items() {
        let pool = parse_port_pool("20000-20002,22000").unwrap();
        assert_eq!(pool.len(), 4);
        assert!(pool.contains(&20000));
        assert!(pool.contains(&20002));
        assert!(pool.contains(&22000));

        // Overlap is fine, it is a set.
        assert_eq!(parse_port_pool("10-12,11-13").unwrap().len(), 4);

        assert!(parse_port_pool("").is_err());
        assert!(parse_port_pool("10,").is_err());
    }

    #[tokio::test]
    async fn allocation_skips_busy_and_exhausts() {
        let d = distributor("20000-20002", &[20001]);
        d.refresh().await.unwrap();

        let first = d.get_random_port().unwrap();
        let second = d.get_random_port().unwrap();
        assert_ne!(first, second);
        for port in [first, second] {
            assert!(port == 20000 || port == 20002, "unexpected port {port}");
        }

        assert!(matches!(d.get_random_port(), Err(PortError::Exhausted)));
    }

    #[tokio::test]
    async fn ports_are_never_handed_out_twice() {
        let d = distributor("30000-30063", &[]);
        d.refresh().await.unwrap();

        let mut seen = HashSet::new();
        for _ in 0..64 {
            assert!(seen.insert(d.get_random_port().unwrap()));
        }
        assert!(matches!(d.get_random_port(), Err(PortError::Exhausted)));
    }

    #[tokio::test]
    async fn refresh_does_not_return_handed_out_ports() {
        let d = distributor("40000-40001", &[]);
        d.refresh().await.unwrap();
        let first = d.get_random_port().unwrap();

        // A refresh reconciles the busy snapshot but never restores ports
        // already handed out by this instance.
        d.refresh().await.unwrap();
        let second = d.get_random_port().unwrap();
        assert_ne!(first, second);
        assert!(matches!(d.get_random_port(), Err(PortError::Exhausted)));
    }

    #[tokio::test]
    async fn scanner_failure_surfaces_as_os_query() {
        let d = PortDistributor::new("20000-20010", Arc::new(FailingScanner)).unwrap();
        assert!(matches!(d.refresh().await, Err(PortError::OsQuery(_))));
    }

    #[test]
    fn allocation_without_refresh_uses_empty_snapshot() {
        let d = distributor("50000", &[50000]);
        // Busy set only applies once refreshed.
        assert_eq!(d.get_random_port().unwrap(), 50000);
    }

    #[test]
    fn socket_table_parsing() {
        let table = "  sl  local_address rem_address   st tx_queue rx_queue\n\
                     0: 00000000:4E20 00000000:0000 0A 00000000:00000000 00:00000000\n\
                     1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000\n\
                     garbage line\n";
        let mut ports = HashSet::new();
        parse_socket_table(table, &mut ports);
        assert!(ports.contains(&0x4E20));
        assert!(ports.contains(&0x1F90));
        assert_eq!(ports.len(), 2);
    }
}
