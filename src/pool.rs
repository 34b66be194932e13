use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Username/password pair for a password-authenticated backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

/// Live counters of one backend id.
///
/// Shared between successive records of the same id across pool reloads,
/// so leases taken before a reload still land on the counters selection reads.
#[derive(Debug, Default)]
struct Counters {
    active_connections: AtomicU64,
    total_connections: AtomicU64,
    failed_connections: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// One upstream SOCKS5 proxy plus its live counters.
///
/// Sessions hold an `Arc` to the record in the pool, so every counter
/// update lands on the shared instance.
#[derive(Debug)]
pub struct BackendProxy {
    id: String,
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    enabled: bool,
    /// Carried for the management layer; selection does not read it.
    priority: i32,
    counters: Arc<Counters>,
}

impl BackendProxy {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        credentials: Option<Credentials>,
        enabled: bool,
        priority: i32,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            credentials,
            enabled,
            priority,
            counters: Arc::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn active_connections(&self) -> u64 {
        self.counters.active_connections.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> u64 {
        self.counters.total_connections.load(Ordering::Relaxed)
    }

    pub fn failed_connections(&self) -> u64 {
        self.counters.failed_connections.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.counters.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.counters.bytes_received.load(Ordering::Relaxed)
    }

    /// Record a completed upstream handshake and take an active-connection lease.
    pub fn open_lease(self: &Arc<Self>) -> ActiveLease {
        self.counters.active_connections.fetch_add(1, Ordering::AcqRel);
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        ActiveLease {
            backend: Arc::clone(self),
            released: false,
        }
    }

    /// Record a failed upstream attempt
    pub fn record_failure(&self) {
        self.counters.failed_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_sent(&self, n: u64) {
        self.counters.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.counters.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            active_connections: self.active_connections(),
            total_connections: self.total_connections(),
            failed_connections: self.failed_connections(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
        }
    }
}

/// Counter values read from a backend at one moment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub active_connections: u64,
    pub total_connections: u64,
    pub failed_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl BackendStats {
    /// `(total - failed) / total` as a percentage, `None` before any connection.
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_connections == 0 {
            None
        } else {
            let total = self.total_connections as f64;
            Some((total - self.failed_connections as f64) / total * 100.0)
        }
    }
}

/// RAII lease on one active connection of a backend.
///
/// The active counter is decremented exactly once, either through
/// [`ActiveLease::release`] or on drop.
#[derive(Debug)]
pub struct ActiveLease {
    backend: Arc<BackendProxy>,
    released: bool,
}

impl ActiveLease {
    pub fn backend(&self) -> &Arc<BackendProxy> {
        &self.backend
    }

    pub fn release(&mut self) {
        if !self.released {
            let previous = self.backend.counters.active_connections.fetch_sub(1, Ordering::AcqRel);
            debug_assert!(previous > 0, "active connection counter underflow");
            self.released = true;
        }
    }
}

impl Drop for ActiveLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// Ordered, in-memory set of backends
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Arc<BackendProxy>>,
    started_at: Instant,
}

impl BackendPool {
    pub fn new(backends: Vec<BackendProxy>) -> Self {
        Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            started_at: Instant::now(),
        }
    }

    /// Backends in pool order
    pub fn backends(&self) -> &[Arc<BackendProxy>] {
        &self.backends
    }

    pub fn get(&self, id: &str) -> Option<&Arc<BackendProxy>> {
        self.backends.iter().find(|b| b.id() == id)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn enabled_count(&self) -> usize {
        self.backends.iter().filter(|b| b.is_enabled()).count()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Build the next generation of the pool from a new descriptor list.
    ///
    /// Backends whose id survives keep their counters; uptime keeps running.
    pub fn refresh(&self, backends: Vec<BackendProxy>) -> BackendPool {
        let backends = backends
            .into_iter()
            .map(|mut backend| {
                if let Some(previous) = self.get(backend.id()) {
                    backend.counters = Arc::clone(&previous.counters);
                }
                Arc::new(backend)
            })
            .collect();
        BackendPool {
            backends,
            started_at: self.started_at,
        }
    }
}

/// The current pool generation, replaceable while sessions are running.
///
/// Readers take a snapshot with [`SharedPool::current`]; a session keeps
/// using its snapshot even if the pool is replaced underneath it.
#[derive(Debug)]
pub struct SharedPool {
    current: RwLock<Arc<BackendPool>>,
}

impl SharedPool {
    pub fn new(pool: BackendPool) -> Self {
        Self {
            current: RwLock::new(Arc::new(pool)),
        }
    }

    pub fn current(&self) -> Arc<BackendPool> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Swap in a new generation built by [`BackendPool::refresh`].
    pub fn reload(&self, backends: Vec<BackendProxy>) -> Arc<BackendPool> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(guard.refresh(backends));
        *guard = Arc::clone(&next);
        next
    }
}
