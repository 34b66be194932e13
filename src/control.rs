//! Read-only HTTP view over the backend pool: `/metrics`, `/metrics/prometheus`
//! and `/health`. Routing is by path only; every other path is answered with 404.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::connection::SessionTracker;
use crate::pool::{BackendProxy, SharedPool};

type Body = BoxBody<Bytes, Infallible>;

/// What the handlers read from
#[derive(Debug)]
pub struct ControlState {
    pool: Arc<SharedPool>,
    tracker: Arc<SessionTracker>,
    proxy_port: u16,
}

impl ControlState {
    pub fn new(pool: Arc<SharedPool>, tracker: Arc<SessionTracker>, proxy_port: u16) -> Self {
        Self {
            pool,
            tracker,
            proxy_port,
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let pool = self.pool.current();
        MetricsSnapshot {
            timestamp: unix_millis(),
            balancer: BalancerInfo {
                port: self.proxy_port,
                uptime: pool.uptime().as_secs(),
                active_sessions: self.tracker.active(),
            },
            proxies: pool.backends().iter().map(|b| ProxyMetrics::read(b)).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub balancer: BalancerInfo,
    pub proxies: Vec<ProxyMetrics>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerInfo {
    pub port: u16,
    /// Seconds since the pool was built
    pub uptime: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyMetrics {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
    pub priority: i32,
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub success_rate: String,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ProxyMetrics {
    fn read(backend: &BackendProxy) -> Self {
        let stats = backend.stats();
        Self {
            id: backend.id().to_string(),
            host: backend.host().to_string(),
            port: backend.port(),
            enabled: backend.is_enabled(),
            priority: backend.priority(),
            active_connections: stats.active_connections,
            total_connections: stats.total_connections,
            failed_connections: stats.failed_connections,
            success_rate: stats
                .success_rate()
                .map(|rate| format!("{:.2}%", rate))
                .unwrap_or_else(|| "N/A".to_string()),
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
        }
    }
}

/// HTTP/1.1 server for the control surface
pub struct ControlServer {
    listener: TcpListener,
    state: Arc<ControlState>,
}

impl ControlServer {
    pub async fn bind(addr: SocketAddr, state: ControlState) -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            state: Arc::new(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) {
        if let Ok(addr) = self.local_addr() {
            info!("Control surface listening on http://{}", addr);
        }

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Control accept error: {} (continuing)", e);
                    continue;
                }
            };

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                let service = service_fn(move |req| route(req, Arc::clone(&state)));
                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!("Control connection from {} error: {:?}", peer, err);
                }
            });
        }
    }
}

async fn route(
    req: Request<Incoming>,
    state: Arc<ControlState>,
) -> Result<Response<Body>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match serde_json::to_vec(&state.snapshot()) {
            Ok(json) => with_type(full(json), "application/json"),
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                let mut resp = Response::new(full("metrics unavailable"));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp
            }
        },
        "/metrics/prometheus" => with_type(
            full(prometheus_text(&state)),
            "text/plain; version=0.0.4; charset=utf-8",
        ),
        "/health" => with_type(full(r#"{"status":"ok"}"#), "application/json"),
        _ => not_found(),
    };
    Ok(response)
}

/// Render the pool in Prometheus text exposition format
fn prometheus_text(state: &ControlState) -> String {
    let snapshot = state.snapshot();
    let mut out = String::new();

    let _ = writeln!(out, "# HELP proxy_balancer_info SOCKS5 listener of this balancer");
    let _ = writeln!(out, "# TYPE proxy_balancer_info gauge");
    let _ = writeln!(
        out,
        "proxy_balancer_info{{port=\"{}\"}} 1",
        snapshot.balancer.port
    );
    let _ = writeln!(out, "# TYPE proxy_balancer_uptime_seconds gauge");
    let _ = writeln!(out, "proxy_balancer_uptime_seconds {}", snapshot.balancer.uptime);
    let _ = writeln!(out, "# TYPE proxy_active_sessions gauge");
    let _ = writeln!(out, "proxy_active_sessions {}", snapshot.balancer.active_sessions);

    let families: [(&str, &str, &str, fn(&ProxyMetrics) -> u64); 5] = [
        ("proxy_active_connections", "gauge", "Open tunnels per backend", |p| {
            p.active_connections
        }),
        ("proxy_total_connections", "counter", "Successful upstream handshakes", |p| {
            p.total_connections
        }),
        ("proxy_failed_connections", "counter", "Failed upstream attempts", |p| {
            p.failed_connections
        }),
        ("proxy_bytes_sent", "counter", "Bytes relayed client to backend", |p| p.bytes_sent),
        ("proxy_bytes_received", "counter", "Bytes relayed backend to client", |p| {
            p.bytes_received
        }),
    ];

    for (name, kind, help, value) in families {
        let _ = writeln!(out, "# HELP {} {}", name, help);
        let _ = writeln!(out, "# TYPE {} {}", name, kind);
        for proxy in &snapshot.proxies {
            let _ = writeln!(
                out,
                "{}{{id=\"{}\"}} {}",
                name,
                escape_label(&proxy.id),
                value(proxy)
            );
        }
    }
    out
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn not_found() -> Response<Body> {
    let mut resp = Response::new(full("Not Found"));
    *resp.status_mut() = StatusCode::NOT_FOUND;
    resp
}

fn with_type(body: Body, content_type: &'static str) -> Response<Body> {
    let mut resp = Response::new(body);
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    resp
}

fn full<T: Into<Bytes>>(chunk: T) -> Body {
    Full::new(chunk.into()).boxed()
}
