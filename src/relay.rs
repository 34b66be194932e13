use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{sleep_until, Instant};

use crate::buffer_pool::lease_buffer;
use crate::pool::ActiveLease;

/// Copy direction within a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// client -> backend
    Upstream,
    /// backend -> client
    Downstream,
}

/// Why a tunnel ended
#[derive(Debug)]
pub enum TunnelEnd {
    /// The reading side of this direction reached end-of-stream
    Closed(Direction),
    Failed(Direction, std::io::Error),
    IdleTimeout,
}

#[derive(Debug)]
pub struct TunnelReport {
    pub end: TunnelEnd,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Last time any byte moved, as millis since the tunnel opened
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Resolves once no traffic has moved for `limit`.
    async fn idle_for(&self, limit: Duration) {
        loop {
            let last = self.origin + Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = last + limit;
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}

/// Bidirectional relay between an accepted client and its backend leg.
///
/// Holds the backend's active lease; the lease is released exactly once,
/// in [`Tunnel::run`]'s teardown or on drop if the tunnel is cancelled.
pub struct Tunnel {
    lease: ActiveLease,
    idle_timeout: Option<Duration>,
}

impl Tunnel {
    pub fn new(lease: ActiveLease, idle_timeout: Option<Duration>) -> Self {
        Self {
            lease,
            idle_timeout,
        }
    }

    /// Copy bytes both ways until either side finishes, errors, or idles out.
    pub async fn run<C, U>(mut self, client: C, upstream: U) -> TunnelReport
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        let backend = Arc::clone(self.lease.backend());
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);

        let activity = Activity::new();
        let sent = AtomicU64::new(0);
        let received = AtomicU64::new(0);

        let end = tokio::select! {
            res = pump(&mut client_rd, &mut upstream_wr, &activity, |n| {
                backend.add_sent(n);
                sent.fetch_add(n, Ordering::Relaxed);
            }) => match res {
                Ok(()) => TunnelEnd::Closed(Direction::Upstream),
                Err(e) => TunnelEnd::Failed(Direction::Upstream, e),
            },
            res = pump(&mut upstream_rd, &mut client_wr, &activity, |n| {
                backend.add_received(n);
                received.fetch_add(n, Ordering::Relaxed);
            }) => match res {
                Ok(()) => TunnelEnd::Closed(Direction::Downstream),
                Err(e) => TunnelEnd::Failed(Direction::Downstream, e),
            },
            _ = idle(&activity, self.idle_timeout) => TunnelEnd::IdleTimeout,
        };

        self.teardown(client_rd, client_wr, upstream_rd, upstream_wr).await;

        TunnelReport {
            end,
            bytes_sent: sent.into_inner(),
            bytes_received: received.into_inner(),
        }
    }

    /// Single exit path: close both legs, then release the backend lease.
    async fn teardown<C, U>(
        &mut self,
        client_rd: ReadHalf<C>,
        mut client_wr: WriteHalf<C>,
        upstream_rd: ReadHalf<U>,
        mut upstream_wr: WriteHalf<U>,
    ) where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        let _ = upstream_wr.shutdown().await;
        let _ = client_wr.shutdown().await;
        drop((client_rd, client_wr, upstream_rd, upstream_wr));
        self.lease.release();
    }
}

async fn idle(activity: &Activity, limit: Option<Duration>) {
    match limit {
        Some(limit) => activity.idle_for(limit).await,
        None => std::future::pending().await,
    }
}

async fn pump<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    activity: &Activity,
    on_bytes: F,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    let mut buf = lease_buffer();
    loop {
        let n = reader.read(buf.as_mut_slice()).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf.as_mut_slice()[..n]).await?;
        activity.touch();
        on_bytes(n as u64);
    }
}
