use std::{
    sync::Arc,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use tracing::info;

pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| Arc::new(Metrics::new()));

#[derive(Debug)]
pub struct Metrics {
    start: Instant,
    ready: AtomicBool,
    active_voice_calls: AtomicUsize,
    total_queue_len: AtomicUsize,
    fallback_resolutions: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            ready: AtomicBool::new(false),
            active_voice_calls: AtomicUsize::new(0),
            total_queue_len: AtomicUsize::new(0),
            fallback_resolutions: AtomicU64::new(0),
        }
    }

    pub fn set_ready(&self, v: bool) {
        self.ready.store(v, Ordering::Relaxed);
    }
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn inc_connections(&self) {
        self.active_voice_calls.fetch_add(1, Ordering::Relaxed);
    }
    pub fn dec_connections(&self) {
        let _ = self
            .active_voice_calls
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }

    pub fn inc_queue(&self, n: usize) {
        self.total_queue_len.fetch_add(n, Ordering::Relaxed);
    }
    pub fn dec_queue(&self, n: usize) {
        let _ = self
            .total_queue_len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(n))
            });
    }

    /// A resolution succeeded only through a non-primary strategy.
    pub fn inc_fallbacks(&self) {
        self.fallback_resolutions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start.elapsed().as_secs(),
            ready: self.is_ready(),
            active_voice_calls: self.active_voice_calls.load(Ordering::Relaxed),
            total_queue_len: self.total_queue_len.load(Ordering::Relaxed),
            fallback_resolutions: self.fallback_resolutions.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub ready: bool,
    pub active_voice_calls: usize,
    pub total_queue_len: usize,
    pub fallback_resolutions: u64,
}

/// Logs a metrics line every `every` while the runtime lives.
pub fn spawn_reporter(every: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let s = METRICS.snapshot();
            info!(
                uptime_secs = s.uptime_secs,
                ready = s.ready,
                voice_calls = s.active_voice_calls,
                queued = s.total_queue_len,
                fallbacks = s.fallback_resolutions,
                "metrics"
            );
        }
    });
}
