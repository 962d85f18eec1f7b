//! Per-collection driver: resolves the index worklist, runs the
//! orchestrator over it and propagates operator aborts.

use log::{info, warn};

use crate::error::RebuildError;
use crate::index::IndexSpec;
use crate::rebuild::job::PerfLog;
use crate::rebuild::orchestrator::{IndexOutcome, Orchestrator};
use crate::rebuild::{with_retry, RebuildContext};
use crate::state::{CollectionStatus, Phase, StateStore};
use crate::tools::matcher::NameMatcher;
use crate::tools::prompt::Prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionOutcome {
    Done,
    Failed,
    Aborted,
    /// Not touched: unresolved covering indexes need manual review first.
    Skipped,
}

#[derive(Debug)]
pub struct CollectionResult {
    pub outcome: CollectionOutcome,
    pub rebuilt: usize,
    pub failed: usize,
    pub skipped_indexes: usize,
}

impl CollectionResult {
    fn outcome(outcome: CollectionOutcome) -> Self {
        Self { outcome, rebuilt: 0, failed: 0, skipped_indexes: 0 }
    }
}

pub async fn process_collection(
    ctx: &RebuildContext<'_>,
    state: &mut StateStore,
    perf: &mut PerfLog,
    prompt: &dyn Prompt,
    index_matcher: &NameMatcher,
    collection: &str,
) -> Result<CollectionResult, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();

    let indexes = with_retry(ctx, "list indexes", || {
        gateway.list_indexes(collection, deadline)
    })
    .await?;

    let records = state.records_for(collection);

    // Reserved-name guard: a covering index the state knows nothing about is
    // either a user index violating the reserved suffix or an orphan the
    // operator declined to clean up. Either way this collection is not ours
    // to touch until that is resolved.
    for index in indexes.iter().filter(|i| i.is_temp()) {
        let known = IndexSpec::original_name_of_temp(&index.name)
            .map(|orig| records.iter().any(|r| r.original_name == orig))
            .unwrap_or(false);
        if !known {
            warn!(
                "collection '{}' carries an unresolved covering index '{}' - \
                 skipping the collection; resolve it with the cleanup command",
                collection, index.name
            );
            perf.line(&format!(
                "{}: skipped (unresolved covering index '{}')",
                collection, index.name
            ));
            return Ok(CollectionResult::outcome(CollectionOutcome::Skipped));
        }
    }

    // Worklist: what the server has, minus _id_ and covering indexes, with
    // the name filters applied ...
    let mut worklist: Vec<IndexSpec> = indexes
        .iter()
        .filter(|i| !i.is_id() && !i.is_temp())
        .filter(|i| index_matcher.matches(&i.name))
        .cloned()
        .collect();

    // ... plus unfinished recorded work whose original is gone from the
    // server (interrupted swap). Those are restored from the recorded spec
    // regardless of filters - leaving a collection without its index is
    // never acceptable.
    for record in &records {
        if record.phase == Phase::Done {
            continue;
        }
        if indexes.iter().any(|i| i.name == record.original_name) {
            continue;
        }
        if worklist.iter().any(|i| i.name == record.original_name) {
            continue;
        }
        info!(
            "{}: resuming interrupted rebuild of '{}' (recorded phase '{}')",
            collection, record.original_name, record.phase
        );
        worklist.push(record.original_index()?);
    }

    if worklist.is_empty() {
        info!("{}: nothing to rebuild", collection);
        return Ok(CollectionResult::outcome(CollectionOutcome::Done));
    }

    if ctx.config.safe_run
        && !prompt.confirm(&format!(
            "rebuild {} index(es) of collection '{}'?",
            worklist.len(),
            collection
        ))?
    {
        // nothing was touched; stop the whole job
        return Ok(CollectionResult::outcome(CollectionOutcome::Aborted));
    }

    state.set_collection_status(collection, CollectionStatus::Running)?;
    let mut result = CollectionResult::outcome(CollectionOutcome::Done);

    for index in &worklist {
        if ctx.cancelled() {
            state.set_collection_status(collection, CollectionStatus::Aborted)?;
            result.outcome = CollectionOutcome::Aborted;
            return Ok(result);
        }

        if ctx.config.safe_run
            && !prompt.confirm(&format!("rebuild index '{}' on '{}'?", index.name, collection))?
        {
            info!("{}: skipping index '{}'", collection, index.name);
            result.skipped_indexes += 1;
            continue;
        }

        let mut orchestrator = Orchestrator::new(ctx, state, perf);
        match orchestrator.rebuild_index(collection, index).await {
            Ok(IndexOutcome::Rebuilt) => result.rebuilt += 1,
            Ok(IndexOutcome::AlreadyDone) => (),
            Ok(IndexOutcome::Failed(_)) => result.failed += 1,
            Err(RebuildError::Aborted) => {
                state.set_collection_status(collection, CollectionStatus::Aborted)?;
                result.outcome = CollectionOutcome::Aborted;
                return Ok(result);
            }
            Err(err) => return Err(err),
        }
    }

    let status = if result.failed > 0 {
        result.outcome = CollectionOutcome::Failed;
        CollectionStatus::Failed
    } else {
        CollectionStatus::Done
    };
    state.set_collection_status(collection, status)?;
    Ok(result)
}
