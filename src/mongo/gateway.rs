use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;

use crate::error::RebuildError;
use crate::index::IndexSpec;

/// The slice of `collStats` the rebuild cares about. Reclamation accounting
/// uses `storageSize` only - `size` is the logical data size and does not
/// move when storage is compacted.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollStats {
    pub storage_size: u64,
    pub count: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ReplSetInfo {
    pub set_name: Option<String>,
    pub primary: Option<String>,
    pub secondaries: Vec<String>,
}

impl ReplSetInfo {
    pub fn has_secondary(&self) -> bool {
        !self.secondaries.is_empty()
    }

    /// Primary first, then secondaries.
    pub fn nodes(&self) -> Vec<String> {
        self.primary
            .iter()
            .cloned()
            .chain(self.secondaries.iter().cloned())
            .collect()
    }
}

/// Contract over the driver, scoped to one database. Every method takes an
/// explicit per-call deadline; exceeding it surfaces as a retryable error.
#[async_trait]
pub trait MongoGateway: Send + Sync {
    /// Collection names, with views and `system.*` filtered out.
    async fn list_collections(&self, deadline: Duration) -> Result<Vec<String>, RebuildError>;

    async fn list_indexes(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<Vec<IndexSpec>, RebuildError>;

    /// Issue `createIndexes` and block until the (online) build finished.
    async fn create_index(
        &self,
        collection: &str,
        index: &IndexSpec,
        deadline: Duration,
    ) -> Result<(), RebuildError>;

    /// Idempotent: dropping an index that is already gone succeeds.
    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        deadline: Duration,
    ) -> Result<(), RebuildError>;

    async fn coll_stats(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<CollStats, RebuildError>;

    /// `compact` for a single collection on the connected deployment.
    async fn compact_collection(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<(), RebuildError>;

    /// Toggle `autoCompact` on one node (direct connection). `enable` runs a
    /// single pass (`runOnce`).
    async fn auto_compact(
        &self,
        host: &str,
        enable: bool,
        free_space_target_mb: Option<i64>,
        deadline: Duration,
    ) -> Result<(), RebuildError>;

    /// `currentOp` entries matching `filter`.
    async fn current_op(
        &self,
        filter: Document,
        deadline: Duration,
    ) -> Result<Vec<Document>, RebuildError>;

    async fn run_admin(
        &self,
        command: Document,
        deadline: Duration,
    ) -> Result<Document, RebuildError>;

    /// Replica-set topology; a standalone deployment yields the default
    /// (no name, no members).
    async fn replset_status(&self, deadline: Duration) -> Result<ReplSetInfo, RebuildError>;

    async fn server_version(&self, deadline: Duration)
        -> Result<(u64, u64, u64), RebuildError>;

    /// Replica-set name, or a deterministic identifier for standalone
    /// deployments. Scopes state files; never empty.
    fn cluster_name(&self) -> &str;
}
