//! Repeating scan schedule
//!
//! Runs are strictly sequential: a tick that arrives while a run is still
//! going is delayed rather than queued up.

use std::future::Future;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use super::orchestrator::RunOutcome;
use crate::error::ConnectorError;

/// Invoke `run` every `period` until `shutdown` resolves.
///
/// Shutdown is only observed between runs, so an in-flight run always
/// finishes and submits. Returns the number of runs started.
pub async fn run_every<F, Fut, S>(period: Duration, mut run: F, shutdown: S) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<RunOutcome, ConnectorError>>,
    S: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut runs = 0;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!(runs, "Shutdown requested, stopping scheduler");
                return runs;
            }
            _ = ticker.tick() => {}
        }

        runs += 1;
        match run().await {
            Ok(outcome) if outcome.is_success() => {
                info!(run_id = %outcome.run_id, "Scheduled run finished");
            }
            Ok(outcome) => {
                warn!(
                    run_id = %outcome.run_id,
                    status = ?outcome.status,
                    failed = outcome.report.summary().failed,
                    "Scheduled run finished with failures"
                );
            }
            Err(e) => error!(error = %e, "Scan cycle failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::orchestrator::RunStatus;
    use crate::inventory::SubmissionReport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn outcome() -> RunOutcome {
        RunOutcome {
            run_id: uuid::Uuid::new_v4(),
            status: RunStatus::Completed,
            report: SubmissionReport::default(),
            timed_out: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));
        let (a, o) = (active.clone(), overlapped.clone());

        let runs = run_every(
            Duration::from_secs(10),
            move || {
                let (a, o) = (a.clone(), o.clone());
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) > 0 {
                        o.fetch_add(1, Ordering::SeqCst);
                    }
                    // longer than the period
                    tokio::time::sleep(Duration::from_secs(25)).await;
                    a.fetch_sub(1, Ordering::SeqCst);
                    Ok(outcome())
                }
            },
            tokio::time::sleep(Duration::from_secs(100)),
        )
        .await;

        assert!(runs >= 3);
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        run_every(
            Duration::from_secs(5),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ConnectorError::configuration("providers file missing"))
                }
            },
            tokio::time::sleep(Duration::from_secs(12)),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
