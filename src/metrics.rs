use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use inference_protocol::GenerationMetrics;
use serde::Serialize;

#[derive(Default)]
struct MetricsState {
    total_generations: u64,
    total_failures: u64,
    total_tokens: u64,
    last: Option<GenerationMetrics>,
}

/// Process-wide counters reported by the `PERF` command.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_generations: u64,
    pub total_failures: u64,
    pub total_tokens: u64,
    pub last: Option<GenerationMetrics>,
}

fn metrics_state() -> &'static Mutex<MetricsState> {
    static METRICS: OnceLock<Mutex<MetricsState>> = OnceLock::new();
    METRICS.get_or_init(|| Mutex::new(MetricsState::default()))
}

fn metrics_start() -> &'static Instant {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now)
}

pub(crate) fn record_generation(success: bool) {
    let mut lock = metrics_state().lock().unwrap();
    lock.total_generations += 1;
    if !success {
        lock.total_failures += 1;
    }
}

pub(crate) fn record_metrics(metrics: &GenerationMetrics) {
    let mut lock = metrics_state().lock().unwrap();
    lock.total_tokens += metrics.generated_tokens as u64;
    lock.last = Some(metrics.clone());
}

pub fn snapshot() -> MetricsSnapshot {
    let lock = metrics_state().lock().unwrap();
    MetricsSnapshot {
        uptime_secs: metrics_start().elapsed().as_secs(),
        total_generations: lock.total_generations,
        total_failures: lock.total_failures,
        total_tokens: lock.total_tokens,
        last: lock.last.clone(),
    }
}
