//! Orphan reconciliation.
//!
//! Covering indexes left behind by an interrupted run are classified against
//! the recorded phase before anything is dropped. Only the tail artifact of
//! a *completed* rebuild is removed automatically - there the original is
//! known to be back under its own name. Everything else is surfaced and
//! dropped solely on explicit operator confirmation.

use log::{info, warn};

use crate::error::RebuildError;
use crate::index::IndexSpec;
use crate::rebuild::{with_retry, RebuildContext};
use crate::state::{Phase, StateStore};
use crate::tools::prompt::Prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanDisposition {
    /// Recorded as `done`: the rebuild finished, only the drop of the
    /// covering index is outstanding. Safe to remove without asking.
    CompletedRebuild,
    /// Recorded mid-flight (or failed): needs the operator.
    InFlight(Phase),
    /// No state at all - a crashed run lost its file, or a user index
    /// violates the reserved suffix. Never dropped unilaterally.
    NoState,
}

#[derive(Debug, Clone)]
pub struct OrphanCandidate {
    pub collection: String,
    pub temp_name: String,
    pub original_name: String,
    pub disposition: OrphanDisposition,
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub dropped: usize,
    pub kept: usize,
}

/// Enumerate every index carrying the reserved suffix and classify it.
pub async fn scan(
    ctx: &RebuildContext<'_>,
    state: &StateStore,
) -> Result<Vec<OrphanCandidate>, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();

    let collections = with_retry(ctx, "list collections", || {
        gateway.list_collections(deadline)
    })
    .await?;

    let mut candidates = Vec::new();
    for collection in &collections {
        let indexes = with_retry(ctx, "list indexes", || {
            gateway.list_indexes(collection, deadline)
        })
        .await?;

        for index in indexes.iter().filter(|i| i.is_temp()) {
            let original_name = IndexSpec::original_name_of_temp(&index.name)
                .unwrap_or("")
                .to_string();
            let disposition = if !state.has_state() {
                OrphanDisposition::NoState
            } else {
                match state.recorded_phase(collection, &original_name) {
                    Some(Phase::Done) => OrphanDisposition::CompletedRebuild,
                    Some(phase) => OrphanDisposition::InFlight(phase),
                    None => OrphanDisposition::NoState,
                }
            };
            candidates.push(OrphanCandidate {
                collection: collection.clone(),
                temp_name: index.name.clone(),
                original_name,
                disposition,
            });
        }
    }
    Ok(candidates)
}

/// Resolve scanned candidates. `assume_yes` is the batch confirmation flag;
/// without it every non-automatic drop goes through the prompt.
pub async fn resolve(
    ctx: &RebuildContext<'_>,
    state: &mut StateStore,
    prompt: &dyn Prompt,
    assume_yes: bool,
    candidates: &[OrphanCandidate],
) -> Result<ReconcileSummary, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();
    let mut summary = ReconcileSummary::default();

    for candidate in candidates {
        let drop_it = match candidate.disposition {
            OrphanDisposition::CompletedRebuild => {
                info!(
                    "{}.{}: leftover of a completed rebuild - removing",
                    candidate.collection, candidate.temp_name
                );
                true
            }
            OrphanDisposition::InFlight(phase) => {
                warn!(
                    "{}.{}: rebuild of '{}' was interrupted in phase '{}'",
                    candidate.collection,
                    candidate.temp_name,
                    candidate.original_name,
                    phase
                );
                if matches!(phase, Phase::Swapping | Phase::Swapped) {
                    warn!(
                        "{}.{}: the original index may be missing - rerunning \
                         the rebuild restores it from the recorded spec",
                        candidate.collection, candidate.original_name
                    );
                }
                assume_yes
                    || prompt.confirm(&format!(
                        "drop covering index '{}' on '{}' (recorded phase '{}')?",
                        candidate.temp_name, candidate.collection, phase
                    ))?
            }
            OrphanDisposition::NoState => {
                warn!(
                    "{}.{}: covering index with no matching state record",
                    candidate.collection, candidate.temp_name
                );
                assume_yes
                    || prompt.confirm(&format!(
                        "drop unrecorded covering index '{}' on '{}'?",
                        candidate.temp_name, candidate.collection
                    ))?
            }
        };

        if !drop_it {
            summary.kept += 1;
            continue;
        }

        let collection = candidate.collection.as_str();
        let temp_name = candidate.temp_name.as_str();
        with_retry(ctx, "drop orphaned covering index", || {
            gateway.drop_index(collection, temp_name, deadline)
        })
        .await?;
        summary.dropped += 1;

        // with the artifact gone an in-flight record restarts from scratch
        if matches!(candidate.disposition, OrphanDisposition::InFlight(_)) {
            state.set_phase(
                collection,
                &candidate.original_name,
                Phase::Planned,
                Some("covering index removed by cleanup".to_string()),
            )?;
        }
    }

    Ok(summary)
}
