use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Point-in-time view of scan progress.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub current: u64,
    pub total: u64,
    pub elapsed: Duration,
    pub eta: Duration,
}

impl ProgressSnapshot {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.current as f64 * 100.0 / self.total as f64
    }

    pub fn render(&self) -> String {
        format!(
            "progress: {:.1}% ({}/{}) elapsed: {} eta: {}",
            self.percent(),
            self.current,
            self.total,
            humantime::format_duration(round_secs(self.elapsed)),
            humantime::format_duration(round_secs(self.eta)),
        )
    }
}

fn round_secs(d: Duration) -> Duration {
    Duration::from_secs(d.as_secs_f64().round() as u64)
}

#[derive(Debug)]
struct Counters {
    current: u64,
    total: u64,
    started: Instant,
}

/// Shared completed/total counters with an ETA estimate.
#[derive(Clone, Debug)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Counters>>,
    render: bool,
}

impl ProgressTracker {
    /// `already_done` seeds the counter when resuming.
    pub fn new(total: u64, already_done: u64, render: bool) -> Self {
        let current = already_done.min(total);
        Self {
            inner: Arc::new(Mutex::new(Counters {
                current,
                total,
                started: Instant::now(),
            })),
            render,
        }
    }

    pub async fn increment(&self) -> ProgressSnapshot {
        let snap = {
            let mut c = self.inner.lock().await;
            c.current += 1;
            snapshot(&c)
        };
        if self.render {
            let mut err = std::io::stderr().lock();
            let _ = write!(err, "\r{}", snap.render());
            let _ = err.flush();
        }
        snap
    }

    pub async fn snapshot(&self) -> ProgressSnapshot {
        snapshot(&*self.inner.lock().await)
    }

    /// End the overwritten progress line.
    pub fn finish(&self) {
        if self.render {
            eprintln!();
        }
    }
}

fn snapshot(c: &Counters) -> ProgressSnapshot {
    let elapsed = c.started.elapsed();
    let remaining = c.total.saturating_sub(c.current);
    let eta = if c.current > 0 {
        elapsed.mul_f64(remaining as f64 / c.current as f64)
    } else {
        Duration::ZERO
    };
    ProgressSnapshot {
        current: c.current,
        total: c.total,
        elapsed,
        eta,
    }
}
