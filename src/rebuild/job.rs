//! Top-level job entry points for the three commands, plus the append-only
//! performance log.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Error;
use log::{info, warn};

use crate::compact::{self, CompactSummary};
use crate::config::JobConfig;
use crate::error::RebuildError;
use crate::mongo::{DriverGateway, MongoGateway};
use crate::rebuild::collection::{self, CollectionOutcome};
use crate::rebuild::reconcile::{self, OrphanCandidate};
use crate::rebuild::{with_retry, RebuildContext};
use crate::state::{sanitize_db_name, StateStore};
use crate::tools;
use crate::tools::prompt::{AutoConfirm, Prompt, TtyPrompt};

/// Advisory, human-readable run log. Write failures are reported but never
/// fail the job.
pub struct PerfLog {
    file: Option<File>,
}

impl PerfLog {
    pub fn create(dir: &Path, cluster: &str, db: &str) -> Result<Self, Error> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}_{}_{}.log",
            cluster,
            sanitize_db_name(db),
            proxmox::tools::time::epoch_i64()
        ));
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Some(file) })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn line(&mut self, message: &str) {
        if let Some(file) = &mut self.file {
            let stamp = proxmox::tools::time::epoch_to_rfc3339_utc(
                proxmox::tools::time::epoch_i64(),
            )
            .unwrap_or_else(|_| "-".to_string());
            if let Err(err) = writeln!(file, "{} {}", stamp, message) {
                warn!("unable to write performance log: {}", err);
            }
        }
    }
}

#[derive(Debug)]
pub struct JobSummary {
    pub cluster: String,
    pub collections: Vec<(String, CollectionOutcome)>,
    pub rebuilt: usize,
    pub failed: usize,
    pub skipped_collections: usize,
    pub aborted: bool,
    pub reclaimed_bytes: Option<u64>,
}

impl JobSummary {
    pub fn exit_code(&self) -> i32 {
        if self.aborted {
            2
        } else if self.failed > 0 {
            1
        } else {
            0
        }
    }
}

#[derive(Debug)]
pub struct CleanupSummary {
    pub candidates: Vec<OrphanCandidate>,
    pub dropped: usize,
    pub kept: usize,
}

fn make_prompt(config: &JobConfig) -> Box<dyn Prompt> {
    if config.safe_run {
        Box::new(TtyPrompt)
    } else {
        Box::new(AutoConfirm(false))
    }
}

fn spawn_interrupt_handler(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received - stopping at the next safe point");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

/// `rebuild`: Cover-Swap-Cleanup across the configured database.
pub async fn run_rebuild(config: &JobConfig) -> Result<JobSummary, RebuildError> {
    let gateway = DriverGateway::connect(&config.uri, &config.database).await?;
    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(cancel.clone());
    let prompt = make_prompt(config);
    run_rebuild_with(&gateway, config, prompt.as_ref(), &cancel).await
}

pub async fn run_rebuild_with(
    gateway: &dyn MongoGateway,
    config: &JobConfig,
    prompt: &dyn Prompt,
    cancel: &AtomicBool,
) -> Result<JobSummary, RebuildError> {
    let ctx = RebuildContext { gateway, config, cancel };
    let deadline = ctx.deadline();

    let version = with_retry(&ctx, "buildInfo", || gateway.server_version(deadline)).await?;
    if (version.0, version.1) < (4, 4) {
        return Err(RebuildError::precondition(format!(
            "online index builds need MongoDB 4.4 or later, server is {}.{}.{}",
            version.0, version.1, version.2
        )));
    }

    let mut state = StateStore::open(
        &config.runtime_dir,
        gateway.cluster_name(),
        &config.database,
        config.lock_wait,
    )?;
    let mut perf = PerfLog::create(&config.log_dir, gateway.cluster_name(), &config.database)?;
    perf.line(&format!(
        "rebuild started on {}/{}",
        gateway.cluster_name(),
        config.database
    ));

    // leftovers from an interrupted run are classified before any new work
    let candidates = reconcile::scan(&ctx, &state).await?;
    if !candidates.is_empty() {
        let outcome =
            reconcile::resolve(&ctx, &mut state, prompt, config.assume_yes, &candidates)
                .await?;
        info!(
            "reconciled leftover covering indexes: {} dropped, {} kept",
            outcome.dropped, outcome.kept
        );
        perf.line(&format!(
            "reconciler: {} dropped, {} kept",
            outcome.dropped, outcome.kept
        ));
    }

    state.ensure_job()?;

    let collection_matcher = config.collection_matcher()?;
    let index_matcher = config.index_matcher()?;
    let all = with_retry(&ctx, "list collections", || gateway.list_collections(deadline))
        .await?;
    let targets: Vec<String> = all
        .into_iter()
        .filter(|name| collection_matcher.matches(name))
        .collect();

    let mut summary = JobSummary {
        cluster: gateway.cluster_name().to_string(),
        collections: Vec::new(),
        rebuilt: 0,
        failed: 0,
        skipped_collections: 0,
        aborted: false,
        reclaimed_bytes: None,
    };

    let started = std::time::Instant::now();
    for name in &targets {
        if ctx.cancelled() {
            summary.aborted = true;
            break;
        }
        if let Some(limit) = config.job_time_limit {
            if started.elapsed() >= limit {
                warn!(
                    "job time limit of {}s reached - remaining collections are \
                     left for the next run",
                    limit.as_secs()
                );
                summary.aborted = true;
                break;
            }
        }
        let result = collection::process_collection(
            &ctx,
            &mut state,
            &mut perf,
            prompt,
            &index_matcher,
            name,
        )
        .await?;
        summary.rebuilt += result.rebuilt;
        summary.failed += result.failed;
        if result.outcome == CollectionOutcome::Skipped {
            summary.skipped_collections += 1;
        }
        summary.collections.push((name.clone(), result.outcome));
        if result.outcome == CollectionOutcome::Aborted {
            // no further collections are scheduled
            summary.aborted = true;
            break;
        }
    }

    if summary.aborted {
        perf.line("rebuild aborted by operator");
        return Ok(summary);
    }

    if config.compact_after_rebuild && summary.failed == 0 {
        let compaction = compact::run_compaction(&ctx, prompt, &targets).await?;
        perf.line(&format!(
            "compaction reclaimed {}",
            tools::format_bytes(compaction.reclaimed)
        ));
        summary.reclaimed_bytes = Some(compaction.reclaimed);
    }

    if state.is_fully_done() {
        state.remove()?;
        perf.line("state file removed after a fully successful run");
    }

    perf.line(&format!(
        "rebuild finished: {} rebuilt, {} failed, {} collection(s) skipped",
        summary.rebuilt, summary.failed, summary.skipped_collections
    ));
    Ok(summary)
}

/// `cleanup`: orphan reconciliation only. Dry-run unless candidates are
/// confirmed interactively or with the batch flag.
pub async fn run_cleanup(config: &JobConfig) -> Result<CleanupSummary, RebuildError> {
    let gateway = DriverGateway::connect(&config.uri, &config.database).await?;
    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(cancel.clone());
    let prompt = make_prompt(config);
    run_cleanup_with(&gateway, config, prompt.as_ref(), &cancel).await
}

pub async fn run_cleanup_with(
    gateway: &dyn MongoGateway,
    config: &JobConfig,
    prompt: &dyn Prompt,
    cancel: &AtomicBool,
) -> Result<CleanupSummary, RebuildError> {
    let ctx = RebuildContext { gateway, config, cancel };

    let mut state = StateStore::open(
        &config.runtime_dir,
        gateway.cluster_name(),
        &config.database,
        config.lock_wait,
    )?;

    let candidates = reconcile::scan(&ctx, &state).await?;
    if candidates.is_empty() {
        info!("no leftover covering indexes found");
        return Ok(CleanupSummary { candidates, dropped: 0, kept: 0 });
    }

    let outcome =
        reconcile::resolve(&ctx, &mut state, prompt, config.assume_yes, &candidates).await?;
    Ok(CleanupSummary {
        candidates,
        dropped: outcome.dropped,
        kept: outcome.kept,
    })
}

/// `compact`: the compaction stage on its own.
pub async fn run_compact(config: &JobConfig) -> Result<CompactSummary, RebuildError> {
    let gateway = DriverGateway::connect(&config.uri, &config.database).await?;
    let cancel = Arc::new(AtomicBool::new(false));
    spawn_interrupt_handler(cancel.clone());
    let prompt = make_prompt(config);
    run_compact_with(&gateway, config, prompt.as_ref(), &cancel).await
}

pub async fn run_compact_with(
    gateway: &dyn MongoGateway,
    config: &JobConfig,
    prompt: &dyn Prompt,
    cancel: &AtomicBool,
) -> Result<CompactSummary, RebuildError> {
    let ctx = RebuildContext { gateway, config, cancel };
    let deadline = ctx.deadline();

    let matcher = config.collection_matcher()?;
    let all = with_retry(&ctx, "list collections", || gateway.list_collections(deadline))
        .await?;
    let targets: Vec<String> = all.into_iter().filter(|name| matcher.matches(name)).collect();

    compact::run_compaction(&ctx, prompt, &targets).await
}
