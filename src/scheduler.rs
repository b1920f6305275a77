//! Periodic execution of the watch cycle.
//!
//! ```text
//!          first_delay            interval (ok) / fallback (err)
//!  spawn ─────────────▶ Running ───────────────────────────────▶ Running ─▶ …
//!    │                    │  ▲                                      │
//!    └── Idle ◀───────────┘  └──────────── Idle ◀───────────────────┘
//! ```
//!
//! Cycles never overlap: the next delay starts only after the previous
//! cycle has finished. A failing cycle never stops the loop; it only
//! switches the next delay to the fallback. [`SchedulerHandle::close`]
//! cancels the pending delay and waits for a running cycle to finish.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerConfig, FALLBACK_INTERVAL_SECS};
use crate::error::CycleError;
use crate::pipeline::{NotifyStatus, Pipeline};

/// Work executed on every tick.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<(), CycleError>;
}

#[async_trait]
impl Job for Pipeline {
    async fn run(&self) -> Result<(), CycleError> {
        let report = self.run_cycle().await?;
        if let NotifyStatus::Sent(delivery) = &report.notification {
            info!(
                delivered = delivery.delivered,
                failed = delivery.failed,
                "subscribers notified"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Delays between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub first_delay: Duration,
    /// Delay after a successful cycle.
    pub interval: Duration,
    /// Delay after a failed cycle.
    pub fallback: Duration,
}

impl Timing {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            first_delay: config.first_delay(),
            interval: config.interval(),
            fallback: Duration::from_secs(FALLBACK_INTERVAL_SECS),
        }
    }
}

pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<SchedulerState>,
    abort_handle: AbortHandle,
}

impl SchedulerHandle {
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.abort_handle.is_finished()
    }

    /// Stops scheduling. A running cycle is allowed to finish.
    pub async fn close(&self) {
        debug!("closing scheduler");
        self.shutdown.send_replace(true);
        while !self.abort_handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        info!("scheduler stopped");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if self.abort_handle.is_finished() {
            return;
        }
        warn!("aborting scheduler");
        self.abort_handle.abort();
    }
}

/// Spawns the loop on the current runtime.
pub fn spawn(job: Arc<dyn Job>, timing: Timing) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let (state_tx, state) = watch::channel(SchedulerState::Idle);

    let abort_handle = tokio::spawn(async move {
        debug!(?timing, "scheduler started");
        let mut delay = timing.first_delay;
        let mut old_err = None;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }

            state_tx.send_replace(SchedulerState::Running);
            let res = job.run().await;
            state_tx.send_replace(SchedulerState::Idle);

            delay = if res.is_ok() {
                timing.interval
            } else {
                timing.fallback
            };
            log_err_if_new(res, &mut old_err);
        }
    })
    .abort_handle();

    SchedulerHandle {
        shutdown,
        state,
        abort_handle,
    }
}

/// Logs a repeated failure at `warn` after its first `error`.
fn log_err_if_new(res: Result<(), CycleError>, old_err: &mut Option<String>) {
    match res {
        Ok(()) => *old_err = None,
        Err(err) => {
            let text = err.to_string();
            if old_err.as_deref() == Some(text.as_str()) {
                warn!(error = %text, "cycle failed again");
            } else {
                error!(error = %text, "cycle failed");
                *old_err = Some(text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails on the runs listed in `fail_on` (0-based).
    struct CountingJob {
        runs: AtomicUsize,
        fail_on: Vec<usize>,
        duration: Duration,
    }

    impl CountingJob {
        fn new(fail_on: Vec<usize>) -> Self {
            Self {
                runs: AtomicUsize::new(0),
                fail_on,
                duration: Duration::ZERO,
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(&self) -> Result<(), CycleError> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst);
            if !self.duration.is_zero() {
                tokio::time::sleep(self.duration).await;
            }
            if self.fail_on.contains(&n) {
                return Err(FetchError::Status {
                    url: "http://test".to_string(),
                    status: 500,
                }
                .into());
            }
            Ok(())
        }
    }

    fn timing(first: u64, interval: u64, fallback: u64) -> Timing {
        Timing {
            first_delay: Duration::from_millis(first),
            interval: Duration::from_millis(interval),
            fallback: Duration::from_millis(fallback),
        }
    }

    #[tokio::test]
    async fn test_waits_first_delay() {
        let job = Arc::new(CountingJob::new(vec![]));
        let handle = spawn(job.clone(), timing(200, 1000, 1000));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(job.runs(), 0);
        assert_eq!(handle.state(), SchedulerState::Idle);
        handle.close().await;
        assert_eq!(job.runs(), 0);
    }

    #[tokio::test]
    async fn test_keeps_running_after_failure() {
        let job = Arc::new(CountingJob::new(vec![0, 1]));
        let handle = spawn(job.clone(), timing(0, 10, 10));
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.close().await;
        assert!(job.runs() >= 3, "ran {} times", job.runs());
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn test_fallback_used_after_failure() {
        // success interval is long, fallback short: a failing job keeps ticking
        let failing = Arc::new(CountingJob::new((0..1000).collect()));
        let handle = spawn(failing.clone(), timing(0, 10_000, 10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.close().await;
        assert!(failing.runs() >= 3);

        let ok = Arc::new(CountingJob::new(vec![]));
        let handle = spawn(ok.clone(), timing(0, 10_000, 10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.close().await;
        assert_eq!(ok.runs(), 1);
    }

    #[tokio::test]
    async fn test_no_cycles_after_close() {
        let job = Arc::new(CountingJob::new(vec![]));
        let handle = spawn(job.clone(), timing(0, 20, 20));
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.close().await;
        let after_close = job.runs();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(job.runs(), after_close);
    }

    #[tokio::test]
    async fn test_state_running_during_cycle() {
        let job = Arc::new(CountingJob {
            duration: Duration::from_millis(200),
            ..CountingJob::new(vec![])
        });
        let handle = spawn(job.clone(), timing(0, 10_000, 10_000));
        let mut rx = handle.subscribe();
        rx.wait_for(|s| *s == SchedulerState::Running).await.unwrap();
        assert_eq!(handle.state(), SchedulerState::Running);
        handle.close().await;
        assert_eq!(job.runs(), 1);
        assert_eq!(handle.state(), SchedulerState::Idle);
    }

    #[test]
    fn test_timing_clamps_interval() {
        let config = SchedulerConfig {
            interval_secs: 60,
            first_delay_secs: 10,
        };
        let t = Timing::from_config(&config);
        assert_eq!(t.interval, Duration::from_secs(300));
        assert_eq!(t.fallback, Duration::from_secs(300));
        assert_eq!(t.first_delay, Duration::from_secs(10));
    }
}
