//! The Cover-Swap-Cleanup rebuild: orchestrator, per-collection driver,
//! job entry points and the orphan reconciler.

pub mod collection;
pub mod job;
pub mod orchestrator;
pub mod reconcile;

pub use job::{run_cleanup, run_compact, run_rebuild, CleanupSummary, JobSummary};

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::config::JobConfig;
use crate::error::RebuildError;
use crate::mongo::MongoGateway;

/// Everything the rebuild machinery shares: the gateway, the run
/// configuration and the cancellation flag set by SIGINT.
pub struct RebuildContext<'a> {
    pub gateway: &'a dyn MongoGateway,
    pub config: &'a JobConfig,
    pub cancel: &'a AtomicBool,
}

impl<'a> RebuildContext<'a> {
    pub fn deadline(&self) -> Duration {
        self.config.call_deadline
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Run `op` within the bounded retry budget. Retryable failures sleep with
/// exponential backoff and try again; exhausting the budget escalates the
/// last error to fatal. Cancellation is honored between attempts.
pub async fn with_retry<T, F, Fut>(
    ctx: &RebuildContext<'_>,
    what: &str,
    mut op: F,
) -> Result<T, RebuildError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, RebuildError>>,
{
    let policy = ctx.config.rpc_retry;
    let mut attempt = 0;
    loop {
        if ctx.cancelled() {
            return Err(RebuildError::Aborted);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                log::warn!(
                    "{} failed ({}) - retry {}/{}",
                    what,
                    err,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(policy.delay(attempt)).await;
                attempt += 1;
            }
            Err(err) if err.is_retryable() => return Err(err.into_fatal()),
            Err(err) => return Err(err),
        }
    }
}
