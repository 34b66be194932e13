use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::inbound::{ClientHandshake, Phase};
use crate::pool::{BackendProxy, SharedPool};
use crate::protocol::{Destination, ProtocolError};
use crate::relay::{Tunnel, TunnelEnd};
use crate::selector::{select_backend, select_backend_excluding, SelectError};
use crate::upstream::{UpstreamConnection, UpstreamConnector, UpstreamError};

/// Global session counter for generating unique session IDs
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique session ID
///
/// Lower 48 bits of the current nanosecond timestamp followed by the lower
/// 32 bits of a monotonic counter, as lowercase hex.
pub fn new_session_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    let counter = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);

    format!(
        "{:x}{:x}",
        now.as_nanos() & 0xffffffffffff,
        counter & 0xffffffff
    )
}

/// Failure categories that end a session before the tunnel phase
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("client handshake timed out")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    NoBackend(#[from] SelectError),

    #[error("upstream failure: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("failed to send reply: {0}")]
    Reply(#[source] std::io::Error),
}

/// Per-session knobs shared by every connection
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub connect_attempts: u32,
    /// Pause before retry N is `retry_backoff * N`
    pub retry_backoff: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(540)),
            connect_attempts: 1,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Everything a session needs, shared across all sessions
#[derive(Debug)]
pub struct SessionContext {
    pub pool: Arc<SharedPool>,
    pub connector: UpstreamConnector,
    pub settings: SessionSettings,
}

/// State of one accepted client connection
#[derive(Debug)]
pub struct ClientSession {
    id: String,
    peer: SocketAddr,
    phase: Phase,
    destination: Option<Destination>,
    backend: Option<Arc<BackendProxy>>,
}

impl ClientSession {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: new_session_id(),
            peer,
            phase: Phase::Greeting,
            destination: None,
            backend: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    pub fn backend(&self) -> Option<&Arc<BackendProxy>> {
        self.backend.as_ref()
    }

    /// Drive the connection from greeting to tunnel teardown.
    pub async fn run<S>(&mut self, stream: S, ctx: &SessionContext) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.serve(stream, ctx).await;
        self.phase = Phase::Closed;
        result
    }

    async fn serve<S>(&mut self, stream: S, ctx: &SessionContext) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut handshake = ClientHandshake::new(stream);
        let destination = timeout(ctx.settings.handshake_timeout, async {
            handshake.greet().await?;
            handshake.read_request().await
        })
        .await
        .map_err(|_| SessionError::HandshakeTimeout)??;
        self.phase = handshake.phase();

        debug!(
            "Session #{} from {} requests host {} port {}",
            self.id,
            self.peer,
            destination.host_string(),
            destination.port
        );
        self.destination = Some(destination.clone());

        let upstream = match self.open_upstream(&destination, ctx).await {
            Ok(upstream) => upstream,
            Err(e) => {
                handshake.reject().await;
                return Err(e);
            }
        };
        self.backend = Some(Arc::clone(upstream.lease.backend()));

        // A failed reply drops the lease, which releases the backend slot
        let client = handshake.accept().await.map_err(SessionError::Reply)?;
        self.phase = Phase::Tunnel;

        let UpstreamConnection { stream, lease } = upstream;
        let report = Tunnel::new(lease, ctx.settings.idle_timeout)
            .run(client, stream)
            .await;

        match report.end {
            TunnelEnd::Failed(direction, e) => {
                debug!("Session #{} tunnel {:?} error: {}", self.id, direction, e)
            }
            TunnelEnd::IdleTimeout => info!(
                "Session #{} idle timeout after {:?}, closing",
                self.id, ctx.settings.idle_timeout
            ),
            TunnelEnd::Closed(_) => {}
        }
        debug!(
            "Session #{} closed: {}↑ {}↓ bytes via {}",
            self.id,
            report.bytes_sent,
            report.bytes_received,
            self.backend().map(|b| b.id()).unwrap_or("?")
        );
        Ok(())
    }

    /// Select a backend and open the nested connection, retrying on other
    /// backends up to `connect_attempts` times.
    async fn open_upstream(
        &self,
        destination: &Destination,
        ctx: &SessionContext,
    ) -> Result<UpstreamConnection, SessionError> {
        // One pool generation for the whole session, even across a reload
        let pool = ctx.pool.current();
        let attempts = ctx.settings.connect_attempts.max(1);
        let mut tried: Vec<String> = Vec::new();
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(ctx.settings.retry_backoff * attempt).await;
            }

            let selected = if tried.is_empty() {
                select_backend(&pool)
            } else {
                select_backend_excluding(&pool, &tried)
            };
            let backend = match selected {
                Ok(backend) => backend,
                Err(e) if last_error.is_none() => return Err(e.into()),
                Err(_) => break,
            };
            tried.push(backend.id().to_string());
            debug!(
                "Session #{} attempt {}/{} via {} (active: {})",
                self.id,
                attempt,
                attempts,
                backend.id(),
                backend.active_connections()
            );

            match ctx.connector.connect(&backend, destination).await {
                Ok(upstream) => return Ok(upstream),
                Err(e) => {
                    warn!(
                        "Session #{} backend {} failed for {}: {}",
                        self.id,
                        backend.id(),
                        destination,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .map(SessionError::Upstream)
            .unwrap_or(SessionError::NoBackend(SelectError::NoBackendAvailable)))
    }
}
