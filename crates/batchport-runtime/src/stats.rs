use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// Process-wide counters, written from every serving path.
#[derive(Debug)]
pub struct RunningStats {
    total_requests: AtomicU64,
    total_items: AtomicU64,
    inference_us: AtomicU64,
    started_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StatsReport {
    pub total_requests: u64,
    pub total_items: u64,
    pub avg_inference_ms: f64,
    pub avg_batch_size: f64,
    pub uptime: Duration,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RunningStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
            inference_us: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Records one completed call that carried `items` rows.
    pub fn record(&self, items: usize, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_items.fetch_add(items as u64, Ordering::Relaxed);
        self.inference_us.fetch_add(micros, Ordering::Relaxed);
    }

    /// `None` until the first call completes.
    pub fn report(&self) -> Option<StatsReport> {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        if total_requests == 0 {
            return None;
        }
        let total_items = self.total_items.load(Ordering::Relaxed);
        let inference_us = self.inference_us.load(Ordering::Relaxed);

        Some(StatsReport {
            total_requests,
            total_items,
            avg_inference_ms: inference_us as f64 / 1000.0 / total_requests as f64,
            avg_batch_size: total_items as f64 / total_requests as f64,
            uptime: self.started_at.elapsed(),
        })
    }

    pub fn log_report(&self) {
        if let Some(report) = self.report() {
            info!(
                total_requests = report.total_requests,
                total_items = report.total_items,
                avg_batch_size = %format!("{:.2}", report.avg_batch_size),
                avg_inference_ms = %format!("{:.2}", report.avg_inference_ms),
                uptime_s = %format!("{:.2}", report.uptime.as_secs_f64()),
                "serving stats"
            );
        }
    }
}

/// Logs a report every `every` until the runtime shuts down.
pub fn spawn_reporter(stats: Arc<RunningStats>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            stats.log_report();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_report_before_first_call() {
        let stats = RunningStats::new();
        assert!(stats.report().is_none());
    }

    #[test]
    fn averages_are_per_request() {
        let stats = RunningStats::new();
        stats.record(4, Duration::from_millis(2));
        stats.record(2, Duration::from_millis(4));

        let report = stats.report().unwrap();
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.total_items, 6);
        assert!((report.avg_batch_size - 3.0).abs() < f64::EPSILON);
        assert!((report.avg_inference_ms - 3.0).abs() < 1e-9);
    }

    #[test]
    fn concurrent_records_are_not_lost() {
        let stats = Arc::new(RunningStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record(1, Duration::from_micros(1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let report = stats.report().unwrap();
        assert_eq!(report.total_requests, 8000);
        assert_eq!(report.total_items, 8000);
    }
}
