//! The per-index Cover-Swap-Cleanup state machine.
//!
//! MongoDB has no atomic index rename and no multi-index transaction, so the
//! replacement runs as a sequence of individually idempotent phases that are
//! always reconcilable from the persisted record:
//!
//! ```text
//! planned -> covering -> covered -> swapping -> swapped -> cleaning -> done
//! ```
//!
//! The persist ordering is the contract the reconciler relies on: a phase is
//! recorded *before* a destructive server action (dropping the original,
//! dropping the covering index) and *after* a constructive one completes.
//! On failure nothing is rolled back - artifacts stay on the server and the
//! record keeps the phase they were left in.
//!
//! Between dropping the original and finishing its recreation, queries that
//! hint the original index by name fail; that window is bounded by the
//! second build's duration and is the only externally observable gap. An
//! interruption inside it leaves the collection without the original index
//! until the next run restores it from the recorded spec.

use log::info;

use crate::error::RebuildError;
use crate::index::IndexSpec;
use crate::rebuild::job::PerfLog;
use crate::rebuild::{with_retry, RebuildContext};
use crate::state::{Phase, StateStore};

#[derive(Debug)]
pub enum IndexOutcome {
    /// Full cycle completed (or resumed through to `done`).
    Rebuilt,
    /// A previous run already finished this index.
    AlreadyDone,
    /// Recorded as failed; the run continues with the next index.
    Failed(String),
}

pub struct Orchestrator<'a, 'c> {
    ctx: &'a RebuildContext<'c>,
    state: &'a mut StateStore,
    perf: &'a mut PerfLog,
}

impl<'a, 'c> Orchestrator<'a, 'c> {
    pub fn new(
        ctx: &'a RebuildContext<'c>,
        state: &'a mut StateStore,
        perf: &'a mut PerfLog,
    ) -> Self {
        Self { ctx, state, perf }
    }

    /// Rebuild one index, resuming from whatever phase a previous run
    /// recorded. Returns `Err` only for operator aborts and infrastructure
    /// failures (state persistence); per-index errors become
    /// [`IndexOutcome::Failed`].
    pub async fn rebuild_index(
        &mut self,
        collection: &str,
        original: &IndexSpec,
    ) -> Result<IndexOutcome, RebuildError> {
        let temp_name = original.temp_name();
        let recorded = self
            .state
            .ensure_index_record(collection, original, &temp_name)?;

        if recorded == Phase::Done {
            return Ok(IndexOutcome::AlreadyDone);
        }
        // a failed attempt restarts from the beginning; the adopt/recreate
        // tie-breaks converge on whatever artifacts were left behind
        let start = if recorded == Phase::Failed { Phase::Planned } else { recorded };

        let temp = match original.derive_temp(self.ctx.config.allow_unique) {
            Ok(temp) => temp,
            Err(err) => return self.give_up(collection, &original.name, err),
        };

        self.note(&format!(
            "{}.{}: rebuild starting from phase '{}'",
            collection, original.name, start
        ));

        match self.run_machine(collection, original, &temp, start).await {
            Ok(()) => {
                self.note(&format!("{}.{}: done", collection, original.name));
                Ok(IndexOutcome::Rebuilt)
            }
            Err(RebuildError::Aborted) => Err(RebuildError::Aborted),
            Err(err) => self.give_up(collection, &original.name, err),
        }
    }

    fn give_up(
        &mut self,
        collection: &str,
        original_name: &str,
        err: RebuildError,
    ) -> Result<IndexOutcome, RebuildError> {
        let message = err.to_string();
        self.state
            .set_phase(collection, original_name, Phase::Failed, Some(message.clone()))?;
        log::error!("{}.{}: rebuild failed: {}", collection, original_name, message);
        self.perf
            .line(&format!("{}.{}: failed: {}", collection, original_name, message));
        Ok(IndexOutcome::Failed(message))
    }

    async fn run_machine(
        &mut self,
        collection: &str,
        original: &IndexSpec,
        temp: &IndexSpec,
        mut phase: Phase,
    ) -> Result<(), RebuildError> {
        let name = original.name.as_str();

        if phase == Phase::Planned {
            self.transition(collection, name, Phase::Covering)?;
            phase = Phase::Covering;
        }

        if phase == Phase::Covering {
            self.ensure_covering(collection, temp).await?;
            self.verify(collection, "covering index build", |indexes| {
                indexes.iter().any(|i| i.name == temp.name && i.equivalent(temp))
            })
            .await?;
            self.transition(collection, name, Phase::Covered)?;
            phase = Phase::Covered;
        }

        if phase == Phase::Covered {
            // destructive next step - record it before dropping the original;
            // the covering index serves the same keys in the meantime
            self.transition(collection, name, Phase::Swapping)?;
            phase = Phase::Swapping;
            let gateway = self.ctx.gateway;
            let deadline = self.ctx.deadline();
            with_retry(self.ctx, "drop original index", || {
                gateway.drop_index(collection, name, deadline)
            })
            .await?;
        }

        if phase == Phase::Swapping {
            // recreate under the original name; on resume the drop may not
            // have happened yet, in which case this is a server-side no-op
            self.recreate_original(collection, original).await?;
            self.transition(collection, name, Phase::Swapped)?;
            phase = Phase::Swapped;
        }

        if phase == Phase::Swapped {
            self.transition(collection, name, Phase::Cleaning)?;
            phase = Phase::Cleaning;
        }

        if phase == Phase::Cleaning {
            let gateway = self.ctx.gateway;
            let deadline = self.ctx.deadline();
            let temp_name = temp.name.as_str();
            with_retry(self.ctx, "drop covering index", || {
                gateway.drop_index(collection, temp_name, deadline)
            })
            .await?;

            self.verify(collection, "final index layout", |indexes| {
                indexes.iter().all(|i| i.name != temp.name)
                    && indexes
                        .iter()
                        .any(|i| i.name == original.name && i.equivalent(original))
            })
            .await?;
            self.transition(collection, name, Phase::Done)?;
        }

        Ok(())
    }

    fn transition(
        &mut self,
        collection: &str,
        original_name: &str,
        phase: Phase,
    ) -> Result<(), RebuildError> {
        self.state.set_phase(collection, original_name, phase, None)?;
        self.perf
            .line(&format!("{}.{}: phase {}", collection, original_name, phase));
        Ok(())
    }

    /// Make sure the covering index exists with the expected spec: adopt a
    /// matching leftover, replace a mismatched one, create otherwise.
    async fn ensure_covering(
        &mut self,
        collection: &str,
        temp: &IndexSpec,
    ) -> Result<(), RebuildError> {
        let gateway = self.ctx.gateway;
        let deadline = self.ctx.deadline();

        let existing = with_retry(self.ctx, "list indexes", || {
            gateway.list_indexes(collection, deadline)
        })
        .await?;

        if let Some(found) = existing.iter().find(|i| i.name == temp.name) {
            if found.equivalent(temp) {
                info!("{}: adopting existing covering index '{}'", collection, temp.name);
                return Ok(());
            }
            info!(
                "{}: covering index '{}' exists with a different spec - replacing it",
                collection, temp.name
            );
            let temp_name = temp.name.as_str();
            with_retry(self.ctx, "drop stale covering index", || {
                gateway.drop_index(collection, temp_name, deadline)
            })
            .await?;
        }

        with_retry(self.ctx, "create covering index", || {
            gateway.create_index(collection, temp, deadline)
        })
        .await
    }

    /// Recreate the original from its recorded spec. A name conflict means
    /// an index appeared under the original name concurrently - adopt it
    /// only if it matches.
    async fn recreate_original(
        &mut self,
        collection: &str,
        original: &IndexSpec,
    ) -> Result<(), RebuildError> {
        let gateway = self.ctx.gateway;
        let deadline = self.ctx.deadline();

        let result = with_retry(self.ctx, "recreate original index", || {
            gateway.create_index(collection, original, deadline)
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_index_conflict() => {
                let existing = with_retry(self.ctx, "list indexes", || {
                    gateway.list_indexes(collection, deadline)
                })
                .await?;
                match existing.iter().find(|i| i.name == original.name) {
                    Some(found) if found.equivalent(original) => {
                        info!(
                            "{}: index '{}' already present with the expected spec",
                            collection, original.name
                        );
                        Ok(())
                    }
                    _ => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Poll `listIndexes` until `check` holds, within the verification
    /// budget. Transient listing errors consume an attempt like a failed
    /// check does; exhausting the budget is fatal for this index.
    async fn verify<C>(
        &self,
        collection: &str,
        what: &str,
        check: C,
    ) -> Result<(), RebuildError>
    where
        C: Fn(&[IndexSpec]) -> bool,
    {
        let policy = self.ctx.config.verify_retry;
        let deadline = self.ctx.deadline();
        let mut attempt = 0;
        loop {
            if self.ctx.cancelled() {
                return Err(RebuildError::Aborted);
            }
            match self.ctx.gateway.list_indexes(collection, deadline).await {
                Ok(indexes) => {
                    if check(&indexes) {
                        return Ok(());
                    }
                }
                Err(err) if err.is_retryable() => {
                    log::warn!("verification of {} on '{}': {}", what, collection, err);
                }
                Err(err) => return Err(err),
            }
            attempt += 1;
            if attempt > policy.max_retries {
                return Err(RebuildError::fatal(format!(
                    "verification of {} on '{}' did not succeed within {} attempts",
                    what, collection, policy.max_retries
                )));
            }
            tokio::time::sleep(policy.delay(attempt - 1)).await;
        }
    }

    fn note(&mut self, message: &str) {
        info!("{}", message);
        self.perf.line(message);
    }
}
