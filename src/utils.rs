use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const DEFAULT_WORKERS: usize = 4;

/// Seconds since the Unix epoch; the resolution idle tracking works at.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(DEFAULT_WORKERS)
}
