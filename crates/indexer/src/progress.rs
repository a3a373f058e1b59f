use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Periodic `done/total` logging for a long stage. Logging stops when the
/// value drops.
pub struct Progress {
    label: String,
    total: usize,
    done: Arc<AtomicUsize>,
    ticker: Option<JoinHandle<()>>,
}

impl Progress {
    /// Without a `scheduler` or `interval` the counter still works but
    /// nothing is logged periodically.
    pub fn start(
        label: impl Into<String>,
        total: usize,
        scheduler: Option<&Handle>,
        interval: Option<Duration>,
    ) -> Self {
        let label = label.into();
        let done = Arc::new(AtomicUsize::new(0));

        let ticker = match (scheduler, interval) {
            (Some(handle), Some(interval)) if total > 0 => {
                let label = label.clone();
                let done = Arc::clone(&done);
                Some(handle.spawn(async move {
                    let mut ticks = tokio::time::interval(interval);
                    // The first tick fires immediately.
                    ticks.tick().await;
                    loop {
                        ticks.tick().await;
                        let current = done.load(Ordering::Relaxed);
                        log::info!("Progress: {current}/{total} ({:.1}%) {label}", percent(current, total));
                        if current >= total {
                            break;
                        }
                    }
                }))
            }
            _ => None,
        };

        Self {
            label,
            total,
            done,
            ticker,
        }
    }

    pub fn increment(&self) {
        self.done.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        log::debug!("Finished {}: {}/{}", self.label, self.done(), self.total);
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    100.0 * done as f64 / total as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_without_scheduler() {
        let progress = Progress::start("files", 3, None, None);
        progress.increment();
        progress.increment();
        assert_eq!(progress.done(), 2);
        assert_eq!(progress.total(), 3);
    }

    #[test]
    fn ticker_stops_on_drop() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_time()
            .build()
            .unwrap();
        let progress = Progress::start(
            "files",
            10,
            Some(runtime.handle()),
            Some(Duration::from_millis(1)),
        );
        progress.increment();
        std::thread::sleep(Duration::from_millis(10));
        drop(progress);
        runtime.shutdown_timeout(Duration::from_secs(1));
    }

    #[test]
    fn percent_of_empty_stage_is_complete() {
        assert!((percent(0, 0) - 100.0).abs() < f64::EPSILON);
        assert!((percent(1, 4) - 25.0).abs() < f64::EPSILON);
    }
}
