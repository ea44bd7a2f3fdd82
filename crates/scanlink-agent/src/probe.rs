//! # Reachability Probes
//!
//! One probe per connectivity layer. A probe answers "reachable or not" and,
//! when not, a coarse reason that only ever ends up in logs.
//!
//! | Layer | Default probe | Reachable when |
//! |-------|---------------|----------------|
//! | local segment | [`GatewayProbe`] | gateway accepts or refuses a TCP connect |
//! | internet | [`TcpProbe`] | any target accepts a TCP connect |
//! | hub | [`HubProbe`] | `GET /health` returns 2xx |

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;

use crate::hub::{HubClient, HubErrorKind};

/// Why a probe failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    Timeout,
    Refused,
    Dns,
    Unreachable,
    Other(String),
}

impl std::fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeFailure::Timeout => write!(f, "timeout"),
            ProbeFailure::Refused => write!(f, "refused"),
            ProbeFailure::Dns => write!(f, "dns"),
            ProbeFailure::Unreachable => write!(f, "unreachable"),
            ProbeFailure::Other(msg) => write!(f, "other: {}", msg),
        }
    }
}

impl From<&io::Error> for ProbeFailure {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
            io::ErrorKind::TimedOut => ProbeFailure::Timeout,
            // ENETUNREACH / EHOSTUNREACH
            _ if matches!(err.raw_os_error(), Some(101) | Some(113)) => ProbeFailure::Unreachable,
            _ => ProbeFailure::Other(err.to_string()),
        }
    }
}

pub type ProbeResult = Result<(), ProbeFailure>;

/// A reachability check for one layer.
///
/// Implementations must not enforce their own timeout; the monitor wraps
/// every call in the layer's timeout.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self) -> ProbeResult;

    /// Short description for logs.
    fn describe(&self) -> String;
}

// =============================================================================
// TCP
// =============================================================================

/// Connects to each `host:port` target in turn; the first success wins.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    targets: Vec<String>,
}

impl TcpProbe {
    pub fn new(targets: Vec<String>) -> Self {
        TcpProbe { targets }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self) -> ProbeResult {
        let mut last = ProbeFailure::Other("no targets configured".to_string());

        for target in &self.targets {
            let addrs: Vec<SocketAddr> = match tokio::net::lookup_host(target.as_str()).await {
                Ok(addrs) => addrs.collect(),
                Err(_) => {
                    last = ProbeFailure::Dns;
                    continue;
                }
            };

            for addr in addrs {
                match TcpStream::connect(addr).await {
                    Ok(_) => return Ok(()),
                    Err(e) => last = ProbeFailure::from(&e),
                }
            }
        }

        Err(last)
    }

    fn describe(&self) -> String {
        format!("tcp {}", self.targets.join(","))
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Local segment probe: a TCP connect to the default gateway.
///
/// A refused connection still proves the gateway answered on the local
/// segment, so `Refused` counts as reachable.
#[derive(Debug, Clone)]
pub struct GatewayProbe {
    target: Option<String>,
    route_table: PathBuf,
    port: u16,
}

impl GatewayProbe {
    /// Probes `target` if given, otherwise the default IPv4 gateway.
    pub fn new(target: Option<String>) -> Self {
        GatewayProbe {
            target,
            route_table: PathBuf::from("/proc/net/route"),
            port: 53,
        }
    }

    /// Reads the routing table from another path.
    pub fn with_route_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.route_table = path.into();
        self
    }

    async fn resolve_target(&self) -> Result<String, ProbeFailure> {
        if let Some(target) = &self.target {
            return Ok(target.clone());
        }

        let table = tokio::fs::read_to_string(&self.route_table)
            .await
            .map_err(|e| ProbeFailure::Other(format!("route table: {}", e)))?;

        default_gateway(&table)
            .map(|gw| SocketAddr::new(IpAddr::V4(gw), self.port).to_string())
            .ok_or(ProbeFailure::Unreachable)
    }
}

/// Parses the default IPv4 gateway out of `/proc/net/route`.
///
/// Columns are tab separated; destination and gateway are little-endian hex.
pub fn default_gateway(route_table: &str) -> Option<Ipv4Addr> {
    route_table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[1] != "00000000" {
            return None;
        }

        let raw = u32::from_str_radix(fields[2], 16).ok()?;
        if raw == 0 {
            return None;
        }
        Some(Ipv4Addr::from(raw.to_le_bytes()))
    })
}

#[async_trait]
impl Probe for GatewayProbe {
    async fn probe(&self) -> ProbeResult {
        let target = self.resolve_target().await?;

        match TcpStream::connect(target.as_str()).await {
            Ok(_) => Ok(()),
            Err(e) => match ProbeFailure::from(&e) {
                ProbeFailure::Refused => Ok(()),
                other => Err(other),
            },
        }
    }

    fn describe(&self) -> String {
        match &self.target {
            Some(target) => format!("gateway {}", target),
            None => "default gateway".to_string(),
        }
    }
}

// =============================================================================
// Hub
// =============================================================================

/// Hub layer probe through the hub client's health call.
pub struct HubProbe {
    hub: Arc<dyn HubClient>,
}

impl HubProbe {
    pub fn new(hub: Arc<dyn HubClient>) -> Self {
        HubProbe { hub }
    }
}

#[async_trait]
impl Probe for HubProbe {
    async fn probe(&self) -> ProbeResult {
        self.hub.health().await.map_err(|e| match e.kind {
            HubErrorKind::Timeout => ProbeFailure::Timeout,
            HubErrorKind::Network => ProbeFailure::Unreachable,
            _ => ProbeFailure::Other(e.message),
        })
    }

    fn describe(&self) -> String {
        "hub health".to_string()
    }
}

// =============================================================================
// Manual
// =============================================================================

/// Probe whose answer is set by hand. Used by tests and by deployments that
/// force a layer on or off.
#[derive(Debug, Clone)]
pub struct ManualProbe {
    reachable: Arc<AtomicBool>,
}

impl ManualProbe {
    pub fn new(reachable: bool) -> Self {
        ManualProbe {
            reachable: Arc::new(AtomicBool::new(reachable)),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Probe for ManualProbe {
    async fn probe(&self) -> ProbeResult {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProbeFailure::Unreachable)
        }
    }

    fn describe(&self) -> String {
        "manual".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubError, MockHubClient};
    use tokio::net::TcpListener;

    const ROUTE_TABLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t0000A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
";

    #[test]
    fn test_default_gateway_parse() {
        assert_eq!(
            default_gateway(ROUTE_TABLE),
            Some(Ipv4Addr::new(192, 168, 1, 1))
        );
        assert_eq!(default_gateway("Iface\tDestination\tGateway\n"), None);
    }

    #[tokio::test]
    async fn test_tcp_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new(vec![addr]);
        assert!(probe.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = TcpProbe::new(vec![addr]);
        assert_eq!(probe.probe().await, Err(ProbeFailure::Refused));
    }

    #[tokio::test]
    async fn test_gateway_refused_counts_as_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let probe = GatewayProbe::new(Some(addr));
        assert!(probe.probe().await.is_ok());
    }

    #[tokio::test]
    async fn test_gateway_from_route_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("route");
        std::fs::write(&path, ROUTE_TABLE).unwrap();

        let probe = GatewayProbe::new(None).with_route_table(&path);
        assert_eq!(probe.resolve_target().await.unwrap(), "192.168.1.1:53");
    }

    #[tokio::test]
    async fn test_hub_probe_maps_failure() {
        let mut hub = MockHubClient::new();
        hub.expect_health()
            .times(1)
            .returning(|| Err(HubError::timeout(std::time::Duration::from_secs(1))));

        let probe = HubProbe::new(Arc::new(hub));
        assert_eq!(probe.probe().await, Err(ProbeFailure::Timeout));
    }

    #[tokio::test]
    async fn test_manual_probe_toggles() {
        let probe = ManualProbe::new(false);
        assert!(probe.probe().await.is_err());
        probe.set(true);
        assert!(probe.probe().await.is_ok());
    }
}
