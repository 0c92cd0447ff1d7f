//! Memory-monitored execution of an in-flight scan.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

/// Samples the scan process's current heap footprint in bytes.
pub type MemSampler = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Sampling cadence of the monitor.
const SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a monitored run. `result` is `None` when the memory budget
/// tripped and the work was cancelled.
pub struct Monitored<T> {
    pub result: Option<T>,
    /// Highest sample observed, whichever way the race went.
    pub peak: u64,
}

/// Runs `work` while sampling memory usage. If `limit` is non-zero and a
/// sample exceeds it, `work` is cancelled by dropping it; cancellation is
/// cooperative, and subprocess-backed futures terminate their children on
/// drop. Exactly one of {completion, cancellation} wins; the peak sample is
/// observable either way.
pub async fn run_with_monitor<T>(
    limit: u64,
    sampler: MemSampler,
    work: impl Future<Output = T>,
) -> Monitored<T> {
    let peak = Arc::new(AtomicU64::new(0));
    let monitor = {
        let peak = Arc::clone(&peak);
        let sampler = Arc::clone(&sampler);
        async move {
            let mut ticks = tokio::time::interval(SAMPLE_INTERVAL);
            loop {
                ticks.tick().await;
                let current = sampler();
                peak.fetch_max(current, Ordering::Relaxed);
                if limit > 0 && current > limit {
                    warn!(current, limit, "scan exceeded its memory budget");
                    break;
                }
            }
        }
    };

    tokio::pin!(work);
    // Biased so the monitor samples before the work future can win the
    // first poll; the peak is then meaningful even for instant completions.
    let result = tokio::select! {
        biased;
        _ = monitor => None,
        result = &mut work => Some(result),
    };
    Monitored {
        result,
        peak: peak.load(Ordering::Relaxed),
    }
}

/// Peak-minus-baseline with a floor of zero.
pub fn mem_delta(current: u64, baseline: u64) -> u64 {
    current.saturating_sub(baseline)
}

/// Default sampler: resident set from `/proc/self/statm`, falling back to
/// the cgroup accounting files. Returns 0 when neither is readable.
pub fn process_sampler() -> MemSampler {
    Arc::new(|| {
        if let Some(rss) = read_statm_resident() {
            return rss;
        }
        for path in [
            "/sys/fs/cgroup/memory.current",
            "/sys/fs/cgroup/memory/memory.usage_in_bytes",
        ] {
            if let Some(value) = read_u64_file(path) {
                return value;
            }
        }
        0
    })
}

fn read_statm_resident() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

fn read_u64_file(path: &str) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Logs container memory pressure around expensive phases. Only meaningful
/// under the platform's cgroup accounting, so managed hosts only.
pub fn log_host_memory(prefix: &str) {
    if !ecoscan_config::on_managed_host() {
        return;
    }
    const PAIRS: [(&str, &str); 2] = [
        ("/sys/fs/cgroup/memory.current", "/sys/fs/cgroup/memory.max"),
        (
            "/sys/fs/cgroup/memory/memory.usage_in_bytes",
            "/sys/fs/cgroup/memory/memory.limit_in_bytes",
        ),
    ];
    const GIB: f64 = (1 << 30) as f64;
    for (current_file, limit_file) in PAIRS {
        let (Some(current), Some(limit)) =
            (read_u64_file(current_file), read_u64_file(limit_file))
        else {
            continue;
        };
        info!(
            "{prefix}: using {:.1}G out of {:.1}G",
            current as f64 / GIB,
            limit as f64 / GIB
        );
        return;
    }
    error!("reading cgroup memory accounting failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn constant_sampler(value: u64) -> MemSampler {
        Arc::new(move || value)
    }

    #[tokio::test]
    async fn completion_wins_under_limit() {
        let monitored = run_with_monitor(1 << 20, constant_sampler(1024), async { 42 }).await;
        assert_eq!(monitored.result, Some(42));
        assert!(monitored.peak >= 1024);
    }

    #[tokio::test]
    async fn zero_limit_never_trips() {
        let monitored = run_with_monitor(0, constant_sampler(u64::MAX), async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            "done"
        })
        .await;
        assert_eq!(monitored.result, Some("done"));
        assert_eq!(monitored.peak, u64::MAX);
    }

    #[tokio::test]
    async fn breach_cancels_and_reports_peak() {
        let limit = 1 << 20;
        let start = Instant::now();
        // Ramps past the limit shortly after the run begins.
        let sampler: MemSampler = Arc::new(move || {
            if start.elapsed() > Duration::from_millis(10) {
                2 << 20
            } else {
                0
            }
        });
        let monitored = run_with_monitor(limit, sampler, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await;
        assert!(monitored.result.is_none());
        assert!(monitored.peak >= limit);
        // The monitor must have tripped, not the sleep finished.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn mem_delta_floors_at_zero() {
        assert_eq!(mem_delta(10, 3), 7);
        assert_eq!(mem_delta(3, 10), 0);
    }
}
