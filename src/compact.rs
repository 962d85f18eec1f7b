//! Storage reclamation after a rebuild.
//!
//! Two modes: per-collection `compact` (the default whenever name filters
//! narrow the run - it only touches what was targeted), and node-wide
//! `autoCompact runOnce` on servers that support it. Reclamation is
//! accounted with `collStats.storageSize` only and clamped at zero.

use log::{info, warn};
use mongodb::bson::doc;

use crate::error::RebuildError;
use crate::rebuild::{with_retry, RebuildContext};
use crate::tools;
use crate::tools::prompt::Prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    Manual,
    Auto,
}

#[derive(Debug)]
pub struct CollectionCompaction {
    pub name: String,
    pub storage_before: u64,
    pub storage_after: u64,
}

impl CollectionCompaction {
    pub fn reclaimed(&self) -> u64 {
        self.storage_before.saturating_sub(self.storage_after)
    }
}

#[derive(Debug)]
pub struct CompactSummary {
    pub mode: CompactMode,
    pub collections: Vec<CollectionCompaction>,
    pub reclaimed: u64,
}

pub async fn run_compaction(
    ctx: &RebuildContext<'_>,
    prompt: &dyn Prompt,
    collections: &[String],
) -> Result<CompactSummary, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();

    let version = with_retry(ctx, "buildInfo", || gateway.server_version(deadline)).await?;
    let replset = with_retry(ctx, "replSetGetStatus", || gateway.replset_status(deadline))
        .await?;

    let auto_supported = (version.0, version.1) >= (8, 0);
    let mut use_auto = auto_supported && !ctx.config.force_manual_compact;

    // autoCompact is node-scoped: with filters in effect it would touch
    // collections outside the targeted set
    if use_auto && ctx.config.has_scope_filters() {
        if ctx.config.safe_run {
            use_auto = prompt.confirm(
                "autoCompact works per node and will also compact collections \
                 outside the configured filters - use it anyway?",
            )?;
        } else {
            info!("name filters in effect - falling back to per-collection compact");
            use_auto = false;
        }
    }

    if use_auto {
        auto_compact(ctx, &replset, collections).await
    } else {
        manual_compact(ctx, prompt, &replset, collections).await
    }
}

async fn manual_compact(
    ctx: &RebuildContext<'_>,
    prompt: &dyn Prompt,
    replset: &crate::mongo::ReplSetInfo,
    collections: &[String],
) -> Result<CompactSummary, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();

    if !replset.has_secondary() {
        return Err(RebuildError::precondition(
            "compact needs a deployment with at least one secondary - \
             refusing to compact a primary-only deployment",
        ));
    }

    let mut summary = CompactSummary {
        mode: CompactMode::Manual,
        collections: Vec::new(),
        reclaimed: 0,
    };

    for name in collections {
        if ctx.cancelled() {
            return Err(RebuildError::Aborted);
        }
        if ctx.config.safe_run
            && !prompt.confirm(&format!("compact collection '{}'?", name))?
        {
            info!("skipping compaction of '{}'", name);
            continue;
        }

        let before = with_retry(ctx, "collStats", || gateway.coll_stats(name, deadline))
            .await?
            .storage_size;
        with_retry(ctx, "compact", || gateway.compact_collection(name, deadline)).await?;
        let after = with_retry(ctx, "collStats", || gateway.coll_stats(name, deadline))
            .await?
            .storage_size;

        let entry = CollectionCompaction {
            name: name.clone(),
            storage_before: before,
            storage_after: after,
        };
        info!(
            "compacted '{}': {} -> {} (reclaimed {})",
            name,
            tools::format_bytes(before),
            tools::format_bytes(after),
            tools::format_bytes(entry.reclaimed())
        );
        summary.reclaimed += entry.reclaimed();
        summary.collections.push(entry);
    }

    Ok(summary)
}

async fn auto_compact(
    ctx: &RebuildContext<'_>,
    replset: &crate::mongo::ReplSetInfo,
    collections: &[String],
) -> Result<CompactSummary, RebuildError> {
    let gateway = ctx.gateway;
    let deadline = ctx.deadline();

    let mut before = Vec::with_capacity(collections.len());
    for name in collections {
        let stats = with_retry(ctx, "collStats", || gateway.coll_stats(name, deadline))
            .await?;
        before.push((name.clone(), stats.storage_size));
    }

    // one pass per distinct node; an empty member list means a standalone
    // deployment, addressed through the existing connection
    let nodes: Vec<Option<String>> = if replset.nodes().is_empty() {
        vec![None]
    } else {
        replset.nodes().into_iter().map(Some).collect()
    };

    let mut started: Vec<Option<String>> = Vec::new();
    let result = async {
        for node in &nodes {
            set_auto_compact(ctx, node.as_deref(), true).await?;
            started.push(node.clone());
            info!(
                "autoCompact pass started on {}",
                node.as_deref().unwrap_or("the connected node")
            );
        }
        wait_for_auto_compact(ctx).await
    }
    .await;

    // autoCompact must be switched off on every exit path, including errors
    for node in &started {
        if let Err(err) = set_auto_compact(ctx, node.as_deref(), false).await {
            warn!(
                "unable to disable autoCompact on {}: {}",
                node.as_deref().unwrap_or("the connected node"),
                err
            );
        }
    }
    result?;

    let mut summary = CompactSummary {
        mode: CompactMode::Auto,
        collections: Vec::new(),
        reclaimed: 0,
    };
    for (name, storage_before) in before {
        let after = with_retry(ctx, "collStats", || gateway.coll_stats(&name, deadline))
            .await?
            .storage_size;
        let entry = CollectionCompaction {
            name,
            storage_before,
            storage_after: after,
        };
        summary.reclaimed += entry.reclaimed();
        summary.collections.push(entry);
    }
    Ok(summary)
}

async fn set_auto_compact(
    ctx: &RebuildContext<'_>,
    node: Option<&str>,
    enable: bool,
) -> Result<(), RebuildError> {
    let deadline = ctx.deadline();
    let target = ctx.config.free_space_target_mb;
    match node {
        Some(host) => {
            ctx.gateway
                .auto_compact(host, enable, if enable { target } else { None }, deadline)
                .await
        }
        None => {
            let mut command = doc! { "autoCompact": enable };
            if enable {
                command.insert("runOnce", true);
                if let Some(mb) = target {
                    command.insert("freeSpaceTargetMB", mb);
                }
            }
            ctx.gateway.run_admin(command, deadline).await.map(|_| ())
        }
    }
}

/// The pass is finished once `currentOp` shows no autoCompact operation.
async fn wait_for_auto_compact(ctx: &RebuildContext<'_>) -> Result<(), RebuildError> {
    let deadline = ctx.deadline();
    let policy = ctx.config.verify_retry;
    let mut attempt: u32 = 0;
    loop {
        if ctx.cancelled() {
            return Err(RebuildError::Aborted);
        }
        let ops = with_retry(ctx, "currentOp", || {
            ctx.gateway
                .current_op(doc! { "command.autoCompact": { "$exists": true } }, deadline)
        })
        .await?;
        if ops.is_empty() {
            return Ok(());
        }
        info!("autoCompact still running ({} operation(s))", ops.len());
        tokio::time::sleep(policy.delay(attempt.min(8))).await;
        attempt = attempt.saturating_add(1);
    }
}
