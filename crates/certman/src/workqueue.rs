use crate::reconcile::{ReconcileOutcome, Reconciler};
use cm_common::CertificateRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

const REQUEUE_BASE: Duration = Duration::from_secs(1);
const REQUEUE_MAX: Duration = Duration::from_secs(30);

/// Pause before the next attempt after `failures` consecutive failures.
///
/// Doubles from one second and stays at thirty.
pub fn requeue_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    REQUEUE_BASE
        .saturating_mul(1u32 << exponent)
        .min(REQUEUE_MAX)
}

/// Tally of one pass over the requests
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub issued: usize,
    pub up_to_date: usize,
    pub failed: usize,
}

/// Reconcile every request with at most `max_concurrent` in flight.
///
/// A failed request is retried with [`requeue_backoff`] up to `max_requeues`
/// times before it counts as failed for this pass.
pub async fn reconcile_all(
    reconciler: Arc<Reconciler>,
    requests: Vec<CertificateRequest>,
    max_concurrent: usize,
    max_requeues: u32,
) -> PassSummary {
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut tasks = JoinSet::new();

    for request in requests {
        let reconciler = Arc::clone(&reconciler);
        let permits = Arc::clone(&permits);
        tasks.spawn(async move {
            reconcile_with_requeue(&reconciler, &request, &permits, max_requeues).await
        });
    }

    let mut summary = PassSummary::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(ReconcileOutcome::Issued)) => summary.issued += 1,
            Ok(Some(ReconcileOutcome::UpToDate)) => summary.up_to_date += 1,
            Ok(None) => summary.failed += 1,
            Err(join_error) => {
                error!("Reconcile task panicked: {join_error}");
                summary.failed += 1;
            }
        }
    }

    info!(
        issued = summary.issued,
        up_to_date = summary.up_to_date,
        failed = summary.failed,
        "Reconcile pass finished"
    );
    summary
}

async fn reconcile_with_requeue(
    reconciler: &Reconciler,
    request: &CertificateRequest,
    permits: &Semaphore,
    max_requeues: u32,
) -> Option<ReconcileOutcome> {
    let mut failures: u32 = 0;

    loop {
        // the permit covers one attempt, never the backoff
        let attempt = {
            let Ok(_permit) = permits.acquire().await else {
                return None;
            };
            reconciler.reconcile(request).await
        };

        match attempt {
            Ok(outcome) => {
                info!(request = %request.key(), outcome = ?outcome, "Reconciled");
                return Some(outcome);
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                if failures > max_requeues {
                    error!(
                        request = %request.key(),
                        failures,
                        "Giving up on request: {e:#}"
                    );
                    return None;
                }

                let backoff = requeue_backoff(failures);
                warn!(
                    request = %request.key(),
                    "Reconcile failed, requeue in {backoff:?} ({failures}/{max_requeues}): {e:#}"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
