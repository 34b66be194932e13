use std::sync::Arc;

use crate::pool::{BackendPool, BackendProxy};

#[derive(Debug, thiserror::Error)]
pub enum SelectError {
    #[error("no enabled backend available")]
    NoBackendAvailable,
}

/// Pick the enabled backend with the fewest active connections.
///
/// Ties go to the earliest backend in pool order. `priority` is not consulted.
pub fn select_backend(pool: &BackendPool) -> Result<Arc<BackendProxy>, SelectError> {
    select_backend_excluding(pool, &[])
}

/// Same as [`select_backend`], skipping backends whose id is in `tried`.
pub fn select_backend_excluding(
    pool: &BackendPool,
    tried: &[String],
) -> Result<Arc<BackendProxy>, SelectError> {
    let mut best: Option<(&Arc<BackendProxy>, u64)> = None;

    for backend in pool.backends() {
        if !backend.is_enabled() || tried.iter().any(|id| id == backend.id()) {
            continue;
        }
        let load = backend.active_connections();
        match best {
            Some((_, min)) if load >= min => {}
            _ => best = Some((backend, load)),
        }
    }

    best.map(|(backend, _)| Arc::clone(backend))
        .ok_or(SelectError::NoBackendAvailable)
}
