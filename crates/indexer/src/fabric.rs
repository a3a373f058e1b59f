//! Thread pools shared by one synchronization run.
//!
//! ```text
//! fixed (P threads)            one reconciliation pass per project
//!   └─ work_stealing (P)       per-file analysis fan-out
//!        └─ ctags pool (P)     blocking checkout of helper processes
//! scheduled (1 tokio worker)   watchdogs and progress logging
//! ```
//!
//! All four are built together in [`ExecutionFabric::new`] and torn down
//! together in [`ExecutionFabric::shutdown`].

use crate::config::IndexerConfig;
use crate::ctags::{CtagsFactory, CtagsWorker};
use crate::pool::BoundedPool;
use crate::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};

const SCHEDULED_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

// Field order is drop order: helpers and timers go before compute pools.
pub struct ExecutionFabric {
    parallelism: usize,
    ctags: BoundedPool<CtagsWorker>,
    scheduled: Runtime,
    work_stealing: ThreadPool,
    fixed: ThreadPool,
}

impl ExecutionFabric {
    pub fn new(config: &IndexerConfig) -> Result<Self> {
        let parallelism = config.effective_parallelism();

        let fixed = ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("treegrok-project-{i}"))
            .build()?;
        let work_stealing = ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("treegrok-analysis-{i}"))
            .build()?;
        let scheduled = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("treegrok-scheduled")
            .enable_time()
            .build()?;

        let ctags = BoundedPool::new(
            parallelism,
            CtagsFactory::new(
                config.ctags.clone(),
                config.ctags_timeout(),
                Some(scheduled.handle().clone()),
            ),
        );

        log::debug!("Execution fabric ready with parallelism {parallelism}");
        Ok(Self {
            parallelism,
            ctags,
            scheduled,
            work_stealing,
            fixed,
        })
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    /// Runs one task per project.
    #[must_use]
    pub fn fixed(&self) -> &ThreadPool {
        &self.fixed
    }

    #[must_use]
    pub fn work_stealing(&self) -> &ThreadPool {
        &self.work_stealing
    }

    #[must_use]
    pub fn scheduled(&self) -> &Handle {
        self.scheduled.handle()
    }

    #[must_use]
    pub fn ctags(&self) -> &BoundedPool<CtagsWorker> {
        &self.ctags
    }

    /// Release everything: the ctags pool, then the scheduled runtime, then
    /// the compute pools.
    pub fn shutdown(self) {
        let Self {
            ctags,
            scheduled,
            work_stealing,
            fixed,
            ..
        } = self;

        ctags.shutdown();
        drop(ctags);
        scheduled.shutdown_timeout(SCHEDULED_SHUTDOWN_GRACE);
        drop(work_stealing);
        drop(fixed);
        log::debug!("Execution fabric shut down");
    }
}
