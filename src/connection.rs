use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default cap on concurrently handled client sessions
pub const MAX_CONCURRENT_SESSIONS: usize = 40_000;

/// Share of the cap above which the status task starts warning
pub const HIGH_WATER_PERCENT: usize = 80;

/// Process-wide count of in-flight client sessions, with an admission cap
#[derive(Debug)]
pub struct SessionTracker {
    active: AtomicUsize,
    limit: usize,
}

impl SessionTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit,
        }
    }

    /// Admit a new session, or `None` if the cap is reached.
    pub fn try_acquire(self: &Arc<Self>) -> Option<SessionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);

        loop {
            if current >= self.limit {
                return None;
            }

            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(SessionGuard {
                        tracker: Arc::clone(self),
                        released: false,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_above_high_water(&self) -> bool {
        self.active() * 100 >= self.limit * HIGH_WATER_PERCENT
    }
}

/// RAII guard holding one admitted session slot
#[derive(Debug)]
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
    released: bool,
}

impl SessionGuard {
    pub fn release(&mut self) {
        if !self.released {
            self.tracker.active.fetch_sub(1, Ordering::AcqRel);
            self.released = true;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let tracker = Arc::new(SessionTracker::new(10));
        {
            let _guard = tracker.try_acquire().expect("slot available");
            assert_eq!(tracker.active(), 1);
        }
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn manual_release_is_idempotent() {
        let tracker = Arc::new(SessionTracker::new(10));
        let mut guard = tracker.try_acquire().unwrap();
        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn respects_limit() {
        let tracker = Arc::new(SessionTracker::new(2));
        let a = tracker.try_acquire();
        let b = tracker.try_acquire();
        assert!(a.is_some() && b.is_some());
        assert!(tracker.try_acquire().is_none());

        drop(a);
        assert!(tracker.try_acquire().is_some());
    }

    #[test]
    fn high_water_mark() {
        let tracker = Arc::new(SessionTracker::new(10));
        let guards: Vec<_> = (0..7).filter_map(|_| tracker.try_acquire()).collect();
        assert!(!tracker.is_above_high_water());

        let extra = tracker.try_acquire();
        assert!(tracker.is_above_high_water());
        drop((guards, extra));
        assert_eq!(tracker.active(), 0);
    }
}
