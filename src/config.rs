use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{bail, eyre, Result, WrapErr};
use serde::Deserialize;

use crate::connection::MAX_CONCURRENT_SESSIONS;
use crate::pool::{BackendPool, BackendProxy, Credentials, SharedPool};
use crate::upstream::UpstreamTimeouts;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "SOCKS5 load balancer",
    long_about = "sbal accepts SOCKS5 clients and tunnels each CONNECT through the upstream SOCKS5 \
backend with the fewest active connections.\n\nThe backend pool is read from a JSON file: an array of \
{id, host, port, username?, password?, enabled?, priority?}.\n\nControl surface: GET /metrics, \
GET /metrics/prometheus, GET /health on --metrics-port.\n"
)]
pub struct Cli {
    /// SOCKS5 listen port
    #[arg(short, long, default_value_t = 7777)]
    pub port: u16,

    /// Control surface (metrics/health) port
    #[arg(long = "metrics-port", default_value_t = 9000)]
    pub metrics_port: u16,

    /// IP address to bind both listeners
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: Ipv4Addr,

    /// JSON file with the ordered backend list
    #[arg(short, long, value_name = "FILE")]
    pub backends: PathBuf,

    /// Seconds allowed for the client greeting and CONNECT request
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds allowed for the TCP connect to a backend
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds allowed for the SOCKS5 handshake with a backend
    #[arg(long, default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Idle timeout in seconds for established tunnels (0 disables)
    #[arg(long, default_value_t = 540)]
    pub idle_timeout: u64,

    /// Maximum concurrently handled client sessions
    #[arg(long = "max-sessions", default_value_t = MAX_CONCURRENT_SESSIONS)]
    pub max_sessions: usize,

    /// Backends tried per session before replying failure (1 = no retry)
    #[arg(long = "connect-attempts", default_value_t = 1)]
    pub connect_attempts: u32,

    /// Seconds to wait for in-flight sessions on shutdown
    #[arg(long = "drain-timeout", default_value_t = 30)]
    pub drain_timeout: u64,

    /// Interval seconds for backend status logging (0 disables)
    #[arg(long = "status-interval", default_value_t = 30)]
    pub status_interval: u64,
}

fn default_enabled() -> bool {
    true
}

/// Backend descriptor as supplied by the management layer
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BackendSpec {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
}

impl BackendSpec {
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("backend with empty id");
        }
        if self.host.is_empty() {
            bail!("backend {}: empty host", self.id);
        }
        if self.port == 0 {
            bail!("backend {}: port must be non-zero", self.id);
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => {
                if u.len() > 255 || p.len() > 255 {
                    bail!("backend {}: username and password must be at most 255 bytes", self.id);
                }
            }
            (None, None) => {}
            _ => bail!("backend {}: username and password must be given together", self.id),
        }
        Ok(())
    }

    pub fn into_backend(self) -> BackendProxy {
        let credentials = match (self.username, self.password) {
            (Some(u), Some(p)) => Some(Credentials::new(u, p)),
            _ => None,
        };
        BackendProxy::new(
            self.id,
            self.host,
            self.port,
            credentials,
            self.enabled,
            self.priority,
        )
    }
}

/// Parse and validate an ordered backend list
pub fn parse_backends(json: &str) -> Result<Vec<BackendSpec>> {
    let specs: Vec<BackendSpec> =
        serde_json::from_str(json).wrap_err("backend list is not a valid JSON array")?;
    if specs.is_empty() {
        bail!("backend list is empty");
    }
    let mut seen = HashSet::new();
    for spec in &specs {
        spec.validate()?;
        if !seen.insert(spec.id.as_str()) {
            bail!("duplicate backend id {}", spec.id);
        }
    }
    Ok(specs)
}

pub fn load_backends(path: &Path) -> Result<Vec<BackendSpec>> {
    let json = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read backend list {}", path.display()))?;
    parse_backends(&json).wrap_err_with(|| format!("invalid backend list {}", path.display()))
}

/// Re-read the backend file into `pool`. A file that fails to load or
/// validate leaves the current pool in place.
pub fn reload_pool(path: &Path, pool: &SharedPool) -> Result<Arc<BackendPool>> {
    let specs = load_backends(path)?;
    Ok(pool.reload(specs.into_iter().map(BackendSpec::into_backend).collect()))
}

/// Balancer configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct BalancerConfig {
    pub listen_addr: SocketAddr,
    pub metrics_addr: SocketAddr,
    pub backends_path: PathBuf,
    pub backends: Vec<BackendSpec>,
    pub handshake_timeout: Duration,
    pub upstream: UpstreamTimeouts,
    pub idle_timeout: Option<Duration>,
    pub max_sessions: usize,
    pub connect_attempts: u32,
    pub drain_timeout: Duration,
    pub status_interval: Option<Duration>,
}

impl BalancerConfig {
    /// Create BalancerConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Result<Self> {
        let backends = load_backends(&args.backends)?;
        Self::build(args, backends)
    }

    fn build(args: Cli, backends: Vec<BackendSpec>) -> Result<Self> {
        if args.connect_attempts == 0 {
            return Err(eyre!("--connect-attempts must be at least 1"));
        }
        if args.max_sessions == 0 {
            return Err(eyre!("--max-sessions must be at least 1"));
        }
        if args.port == args.metrics_port {
            return Err(eyre!("SOCKS5 and metrics listeners cannot share port {}", args.port));
        }

        let secs = Duration::from_secs;
        let non_zero = |s: u64| (s > 0).then(|| Duration::from_secs(s));

        Ok(Self {
            listen_addr: SocketAddr::from((args.listen_ip, args.port)),
            metrics_addr: SocketAddr::from((args.listen_ip, args.metrics_port)),
            backends_path: args.backends,
            backends,
            handshake_timeout: secs(args.handshake_timeout.max(1)),
            upstream: UpstreamTimeouts {
                connect: secs(args.connect_timeout.max(1)),
                handshake: secs(args.upstream_timeout.max(1)),
            },
            idle_timeout: non_zero(args.idle_timeout),
            max_sessions: args.max_sessions,
            connect_attempts: args.connect_attempts,
            drain_timeout: secs(args.drain_timeout),
            status_interval: non_zero(args.status_interval),
        })
    }
}
