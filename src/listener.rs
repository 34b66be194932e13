use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::connection::SessionTracker;
use crate::session::{ClientSession, SessionContext, SessionError};

/// Back-off after the process runs out of file descriptors
const EXHAUSTION_BACKOFF: Duration = Duration::from_millis(100);

/// SOCKS5 accept loop: one spawned task per admitted connection.
pub struct Listener {
    inner: TcpListener,
    ctx: Arc<SessionContext>,
    tracker: Arc<SessionTracker>,
}

impl Listener {
    pub async fn bind(
        addr: SocketAddr,
        ctx: Arc<SessionContext>,
        tracker: Arc<SessionTracker>,
    ) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self {
            inner,
            ctx,
            tracker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept until the future is dropped. Accept errors never end the loop.
    pub async fn serve(self) {
        if let Ok(addr) = self.local_addr() {
            info!("SOCKS5 balancer listening on {}", addr);
        }

        loop {
            let (stream, peer) = match self.inner.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_resource_exhaustion(&e) => {
                    error!("Accept failed, out of file descriptors: {}", e);
                    tokio::time::sleep(EXHAUSTION_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    warn!("Accept error: {} (continuing)", e);
                    continue;
                }
            };

            let Some(guard) = self.tracker.try_acquire() else {
                warn!(
                    "Session limit {} reached, dropping connection from {}",
                    self.tracker.limit(),
                    peer
                );
                drop(stream);
                continue;
            };

            if let Err(e) = stream.set_nodelay(true) {
                debug!("set_nodelay failed for {}: {}", peer, e);
            }

            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                let _guard = guard;
                let mut session = ClientSession::new(peer);
                if let Err(e) = session.run(stream, &ctx).await {
                    log_session_error(&session, peer, &e);
                }
            });
        }
    }
}

fn log_session_error(session: &ClientSession, peer: SocketAddr, err: &SessionError) {
    let id = session.id();
    let target = session
        .destination()
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string());
    match err {
        SessionError::Protocol(_) | SessionError::HandshakeTimeout | SessionError::Reply(_) => {
            debug!(
                "Session #{} from {} dropped in {:?} phase: {}",
                id,
                peer,
                session.phase(),
                err
            )
        }
        SessionError::NoBackend(_) => warn!("Session #{} from {} to {}: {}", id, peer, target, err),
        // Each failed attempt was already logged against its backend
        SessionError::Upstream(_) => {
            debug!("Session #{} from {} to {} failed: {}", id, peer, target, err)
        }
    }
}

fn is_resource_exhaustion(err: &io::Error) -> bool {
    // EMFILE / ENFILE
    matches!(err.raw_os_error(), Some(23) | Some(24))
}
