//! In-memory MongoDB deployment used by the scenario tests, plus scripted
//! prompts and configuration helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::Document;

use mongo_reindex::config::JobConfig;
use mongo_reindex::error::{RebuildError, INDEX_OPTIONS_CONFLICT};
use mongo_reindex::index::IndexSpec;
use mongo_reindex::mongo::{CollStats, MongoGateway, ReplSetInfo};
use mongo_reindex::tools::prompt::Prompt;
use mongo_reindex::tools::retry::RetryPolicy;

/// One scripted failure: the next call of `op` (after `skip` successful
/// ones) returns this error.
pub struct Injection {
    pub op: &'static str,
    pub retryable: bool,
    pub skip: usize,
}

#[derive(Default)]
struct Deployment {
    collections: BTreeMap<String, Vec<IndexSpec>>,
    storage: BTreeMap<String, u64>,
    /// Audit log of mutating calls: `(op, collection, index-or-host)`.
    ops: Vec<(String, String, String)>,
    injections: Vec<Injection>,
}

impl Deployment {
    fn maybe_fail(&mut self, op: &str) -> Result<(), RebuildError> {
        if let Some(pos) = self.injections.iter().position(|i| i.op == op) {
            if self.injections[pos].skip > 0 {
                self.injections[pos].skip -= 1;
                return Ok(());
            }
            let injection = self.injections.remove(pos);
            return Err(if injection.retryable {
                RebuildError::retryable(format!("injected transient failure in {}", op))
            } else {
                RebuildError::fatal(format!("injected fatal failure in {}", op))
            });
        }
        Ok(())
    }
}

pub struct FakeGateway {
    inner: Mutex<Deployment>,
    cluster: String,
    version: (u64, u64, u64),
    replset: ReplSetInfo,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Deployment::default()),
            cluster: "rs0".to_string(),
            version: (7, 0, 4),
            replset: ReplSetInfo {
                set_name: Some("rs0".to_string()),
                primary: Some("db0:27017".to_string()),
                secondaries: vec!["db1:27017".to_string(), "db2:27017".to_string()],
            },
        }
    }

    pub fn with_version(mut self, version: (u64, u64, u64)) -> Self {
        self.version = version;
        self
    }

    pub fn with_replset(mut self, replset: ReplSetInfo) -> Self {
        self.replset = replset;
        self
    }

    pub fn add_collection(&self, name: &str, indexes: Vec<IndexSpec>, storage: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.collections.insert(name.to_string(), indexes);
        inner.storage.insert(name.to_string(), storage);
    }

    pub fn inject(&self, op: &'static str, retryable: bool) {
        self.inject_after(op, retryable, 0);
    }

    pub fn inject_after(&self, op: &'static str, retryable: bool, skip: usize) {
        self.inner
            .lock()
            .unwrap()
            .injections
            .push(Injection { op, retryable, skip });
    }

    pub fn indexes(&self, collection: &str) -> Vec<IndexSpec> {
        self.inner
            .lock()
            .unwrap()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn index_names(&self, collection: &str) -> Vec<String> {
        self.indexes(collection).iter().map(|i| i.name.clone()).collect()
    }

    pub fn storage(&self, collection: &str) -> u64 {
        *self.inner.lock().unwrap().storage.get(collection).unwrap_or(&0)
    }

    /// Mutating calls recorded for `collection` (create/drop/compact).
    pub fn mutations_on(&self, collection: &str) -> Vec<(String, String)> {
        self.inner
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|(_, coll, _)| coll == collection)
            .map(|(op, _, detail)| (op.clone(), detail.clone()))
            .collect()
    }

    pub fn all_mutations(&self) -> Vec<(String, String, String)> {
        self.inner.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl MongoGateway for FakeGateway {
    async fn list_collections(&self, _deadline: Duration) -> Result<Vec<String>, RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("list_collections")?;
        Ok(inner.collections.keys().cloned().collect())
    }

    async fn list_indexes(
        &self,
        collection: &str,
        _deadline: Duration,
    ) -> Result<Vec<IndexSpec>, RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("list_indexes")?;
        Ok(inner.collections.get(collection).cloned().unwrap_or_default())
    }

    async fn create_index(
        &self,
        collection: &str,
        index: &IndexSpec,
        _deadline: Duration,
    ) -> Result<(), RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("create_index")?;
        inner.ops.push((
            "create".to_string(),
            collection.to_string(),
            index.name.clone(),
        ));

        let indexes = inner.collections.entry(collection.to_string()).or_default();
        if let Some(existing) = indexes.iter().find(|i| i.name == index.name) {
            if existing.equivalent(index) {
                // same name, same spec: the server treats this as a no-op
                return Ok(());
            }
            return Err(RebuildError::Fatal {
                message: format!("index '{}' already exists with different options", index.name),
                code: Some(INDEX_OPTIONS_CONFLICT),
            });
        }
        indexes.push(index.clone());
        Ok(())
    }

    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        _deadline: Duration,
    ) -> Result<(), RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("drop_index")?;
        inner.ops.push((
            "drop".to_string(),
            collection.to_string(),
            name.to_string(),
        ));
        if let Some(indexes) = inner.collections.get_mut(collection) {
            indexes.retain(|i| i.name != name);
        }
        Ok(())
    }

    async fn coll_stats(
        &self,
        collection: &str,
        _deadline: Duration,
    ) -> Result<CollStats, RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("coll_stats")?;
        Ok(CollStats {
            storage_size: *inner.storage.get(collection).unwrap_or(&0),
            count: 0,
        })
    }

    async fn compact_collection(
        &self,
        collection: &str,
        _deadline: Duration,
    ) -> Result<(), RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("compact")?;
        inner.ops.push((
            "compact".to_string(),
            collection.to_string(),
            String::new(),
        ));
        if let Some(storage) = inner.storage.get_mut(collection) {
            *storage /= 2;
        }
        Ok(())
    }

    async fn auto_compact(
        &self,
        host: &str,
        enable: bool,
        _free_space_target_mb: Option<i64>,
        _deadline: Duration,
    ) -> Result<(), RebuildError> {
        let mut inner = self.inner.lock().unwrap();
        inner.maybe_fail("auto_compact")?;
        let op = if enable { "autocompact-on" } else { "autocompact-off" };
        inner.ops.push((op.to_string(), String::new(), host.to_string()));
        Ok(())
    }

    async fn current_op(
        &self,
        _filter: Document,
        _deadline: Duration,
    ) -> Result<Vec<Document>, RebuildError> {
        Ok(Vec::new())
    }

    async fn run_admin(
        &self,
        _command: Document,
        _deadline: Duration,
    ) -> Result<Document, RebuildError> {
        Ok(Document::new())
    }

    async fn replset_status(&self, _deadline: Duration) -> Result<ReplSetInfo, RebuildError> {
        Ok(self.replset.clone())
    }

    async fn server_version(
        &self,
        _deadline: Duration,
    ) -> Result<(u64, u64, u64), RebuildError> {
        Ok(self.version)
    }

    fn cluster_name(&self) -> &str {
        &self.cluster
    }
}

/// Answers prompts from a fixed script and records every question.
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<bool>>,
    pub questions: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            questions: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> usize {
        self.questions.lock().unwrap().len()
    }
}

impl Prompt for ScriptedPrompt {
    fn confirm(&self, message: &str) -> Result<bool, anyhow::Error> {
        self.questions.lock().unwrap().push(message.to_string());
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
    }
}

/// Per-test scratch directories plus a configuration with fast retries.
pub struct TestEnv {
    pub config: JobConfig,
    root: PathBuf,
}

impl TestEnv {
    pub fn new(name: &str) -> Self {
        let mut root = std::env::temp_dir();
        root.push(format!("mongo-reindex-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&root);

        let mut config = JobConfig::new(
            Some("mongodb://db0:27017".to_string()),
            Some("app".to_string()),
        )
        .unwrap();
        config.safe_run = false;
        config.runtime_dir = root.join("runtime");
        config.log_dir = root.join("logs");
        let fast = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            backoff: 1.5,
            max_delay: Duration::from_millis(5),
        };
        config.rpc_retry = fast;
        config.verify_retry = fast;

        Self { config, root }
    }

    pub fn state_file(&self) -> PathBuf {
        mongo_reindex::state::state_file_path(&self.config.runtime_dir, "rs0", "app")
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
