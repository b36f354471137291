//! Local endpoint discovery.
//!
//! Some providers expose quota data only through a private API served by a
//! sibling desktop process. The port and access token are never published,
//! so they are recovered from the running process:
//!
//! 1. Find the process by executable name and product marker.
//! 2. Read the access token from its command line.
//! 3. List the process's listening TCP ports.
//! 4. Probe each port in ascending order, HTTPS first then HTTP, and stop
//!    at the first port that answers with a JSON document.
//!
//! A missing process or a process without listening ports is reported as
//! [`Discovery::NotConnected`], not as an error.

mod platform;
mod probe;
mod status;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;

pub use platform::{executable_name, SystemPortLister, SystemProcessLister};
pub use probe::{HttpPortProber, PROBE_PATH, PROBE_TIMEOUT};
pub use status::{
    parse_user_status, LocalStatusClient, LocalUsage, STATUS_PATH, STATUS_TIMEOUT,
};

static EXTENSION_PORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--extension_server_port[=\s]+(\d+)").unwrap());
static CSRF_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"--csrf_token[=\s]+([a-zA-Z0-9-]+)").unwrap());
static APP_DATA_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)--app_data_dir\s+antigravity\b").unwrap());

/// A running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    /// Process id.
    pub pid: u32,
    /// Full command line.
    pub command_line: String,
}

impl ProcessEntry {
    /// Creates a process entry.
    pub fn new(pid: u32, command_line: impl Into<String>) -> Self {
        Self {
            pid,
            command_line: command_line.into(),
        }
    }
}

/// Transport used to reach a local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// TLS with certificate validation disabled.
    Https,
    /// Plaintext.
    Http,
}

impl Scheme {
    /// URL scheme string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Https => "https",
            Scheme::Http => "http",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A working local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Owning process id.
    pub pid: u32,
    /// Port that answered the probe.
    pub port: u16,
    /// Port advertised on the command line.
    pub extension_port: u16,
    /// Access token, if the command line carried one.
    pub token: Option<String>,
    /// Transport that worked.
    pub scheme: Scheme,
}

impl DiscoveredEndpoint {
    /// Base URL on the loopback interface.
    pub fn base_url(&self) -> String {
        format!("{}://127.0.0.1:{}", self.scheme, self.port)
    }

    /// Full URL for an API path.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }
}

/// Result of one discovery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A working endpoint was found.
    Connected(DiscoveredEndpoint),
    /// The sibling application is not reachable right now.
    NotConnected(String),
}

impl Discovery {
    /// Returns the endpoint if connected.
    pub fn endpoint(&self) -> Option<&DiscoveredEndpoint> {
        match self {
            Discovery::Connected(endpoint) => Some(endpoint),
            Discovery::NotConnected(_) => None,
        }
    }
}

/// Values parsed from a matching command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// `--extension_server_port` value.
    pub extension_port: u16,
    /// `--csrf_token` value.
    pub token: Option<String>,
}

/// Identifies the sibling process among everything running.
#[derive(Debug, Clone)]
pub struct TargetProcess {
    executable: String,
}

impl TargetProcess {
    /// Target for the current platform and architecture.
    pub fn current() -> Self {
        Self::with_executable(executable_name())
    }

    /// Target with an explicit executable name.
    pub fn with_executable(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    /// Executable name to search for.
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Returns true if the command line belongs to this product rather than
    /// a differently-branded process sharing the executable.
    pub fn is_product(&self, command_line: &str) -> bool {
        if !command_line.contains(&self.executable) {
            return false;
        }
        let lower = command_line.to_lowercase();
        APP_DATA_DIR.is_match(command_line)
            || lower.contains("/antigravity/")
            || lower.contains("\\antigravity\\")
    }

    /// Parses launch arguments. `None` if the port is missing.
    pub fn parse_launch_args(command_line: &str) -> Option<LaunchArgs> {
        let extension_port = EXTENSION_PORT
            .captures(command_line)?
            .get(1)?
            .as_str()
            .parse()
            .ok()?;
        let token = CSRF_TOKEN
            .captures(command_line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        Some(LaunchArgs {
            extension_port,
            token,
        })
    }
}

/// Enumerates running processes.
#[async_trait]
pub trait ProcessLister: Send + Sync {
    /// Returns processes whose command line mentions `executable`.
    async fn list(&self, executable: &str) -> Result<Vec<ProcessEntry>>;
}

/// Enumerates a process's listening TCP ports.
#[async_trait]
pub trait PortLister: Send + Sync {
    /// Returns listening ports in any order, possibly with duplicates.
    async fn listening_ports(&self, pid: u32) -> Result<Vec<u16>>;
}

/// Checks whether a port serves the expected API.
#[async_trait]
pub trait PortProber: Send + Sync {
    /// Returns true if the port answered with a JSON document.
    async fn probe(&self, port: u16, scheme: Scheme, token: Option<&str>) -> bool;
}

/// Runs the discovery protocol.
#[derive(Clone)]
pub struct EndpointDiscovery {
    target: TargetProcess,
    processes: Arc<dyn ProcessLister>,
    ports: Arc<dyn PortLister>,
    prober: Arc<dyn PortProber>,
}

impl fmt::Debug for EndpointDiscovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointDiscovery")
            .field("target", &self.target)
            .finish()
    }
}

impl EndpointDiscovery {
    /// Creates a discovery with explicit collaborators.
    pub fn new(
        target: TargetProcess,
        processes: Arc<dyn ProcessLister>,
        ports: Arc<dyn PortLister>,
        prober: Arc<dyn PortProber>,
    ) -> Self {
        Self {
            target,
            processes,
            ports,
            prober,
        }
    }

    /// Creates a discovery backed by the operating system.
    pub fn system() -> Result<Self> {
        Ok(Self::new(
            TargetProcess::current(),
            Arc::new(SystemProcessLister),
            Arc::new(SystemPortLister),
            Arc::new(HttpPortProber::new()?),
        ))
    }

    /// Runs steps 1 to 4 once.
    pub async fn discover(&self) -> Discovery {
        let processes = match self.processes.list(self.target.executable()).await {
            Ok(processes) => processes,
            Err(e) => {
                warn!("Process listing failed: {}", e);
                return Discovery::NotConnected(format!("process listing failed: {}", e));
            }
        };

        let candidates: Vec<(ProcessEntry, LaunchArgs)> = processes
            .into_iter()
            .filter(|p| self.target.is_product(&p.command_line))
            .filter_map(|p| {
                let args = TargetProcess::parse_launch_args(&p.command_line)?;
                Some((p, args))
            })
            .collect();

        if candidates.is_empty() {
            debug!("No {} process found", self.target.executable());
            return Discovery::NotConnected("process not running".to_string());
        }

        let mut saw_ports = false;
        for (process, args) in candidates {
            let ports = match self.ports.listening_ports(process.pid).await {
                Ok(ports) => ports,
                Err(e) => {
                    warn!("Port listing for pid {} failed: {}", process.pid, e);
                    continue;
                }
            };

            let ports: BTreeSet<u16> = ports.into_iter().collect();
            if ports.is_empty() {
                debug!("Process {} has no listening ports", process.pid);
                continue;
            }
            saw_ports = true;

            if let Some(endpoint) = self.probe_ports(&process, &args, &ports).await {
                info!(
                    "Discovered local endpoint {} (pid {})",
                    endpoint.base_url(),
                    endpoint.pid
                );
                return Discovery::Connected(endpoint);
            }
        }

        if saw_ports {
            Discovery::NotConnected("no listening port answered".to_string())
        } else {
            Discovery::NotConnected("no listening ports".to_string())
        }
    }

    async fn probe_ports(
        &self,
        process: &ProcessEntry,
        args: &LaunchArgs,
        ports: &BTreeSet<u16>,
    ) -> Option<DiscoveredEndpoint> {
        let token = args.token.as_deref();
        for &port in ports {
            for scheme in [Scheme::Https, Scheme::Http] {
                if self.prober.probe(port, scheme, token).await {
                    return Some(DiscoveredEndpoint {
                        pid: process.pid,
                        port,
                        extension_port: args.extension_port,
                        token: args.token.clone(),
                        scheme,
                    });
                }
                debug!("Probe {}://127.0.0.1:{} failed", scheme, port);
            }
        }
        None
    }
}
