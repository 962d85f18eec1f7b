//! Durable job state.
//!
//! One JSON file per `(cluster, database)` records every index rebuild and
//! its phase. The file is read once at startup and rewritten atomically
//! after each phase transition; an adjacent flock guarantees a single
//! writer. The persisted phases are what the orphan reconciler classifies
//! leftovers against, so the write ordering matters: destructive server
//! actions are recorded *before* they are issued, constructive ones after
//! they complete.

use std::convert::TryFrom;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use mongodb::bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RebuildError;
use crate::index::IndexSpec;
use crate::tools;

pub const STATE_SCHEMA_VERSION: u64 = 1;

/// Phase of a single index rebuild. Declaration order is the execution
/// order; [`Phase::Failed`] is terminal and outside the ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Planned,
    Covering,
    Covered,
    Swapping,
    Swapped,
    Cleaning,
    Done,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Planned => "planned",
            Phase::Covering => "covering",
            Phase::Covered => "covered",
            Phase::Swapping => "swapping",
            Phase::Swapped => "swapped",
            Phase::Cleaning => "cleaning",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Pending,
    Running,
    Done,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    pub original_name: String,
    pub temp_name: String,
    pub phase: Phase,
    pub original_spec: Value,
    pub original_options: Value,
    pub attempt: u32,
    pub started_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl IndexRecord {
    /// Reconstruct the original index from the recorded spec. Needed when
    /// the server no longer has it (interrupted swap).
    pub fn original_index(&self) -> Result<IndexSpec, Error> {
        Ok(IndexSpec::new(
            self.original_name.clone(),
            json_to_doc(&self.original_spec)?,
            json_to_doc(&self.original_options)?,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionRecord {
    pub name: String,
    pub status: CollectionStatus,
    pub indexes: Vec<IndexRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobState {
    pub schema_version: u64,
    pub cluster_name: String,
    pub db_name: String,
    pub started_at: String,
    pub collections: Vec<CollectionRecord>,
}

/// Replace anything outside `[A-Za-z0-9_-]` so two databases on the same
/// cluster always map to distinct, filesystem-safe file names.
pub fn sanitize_db_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

pub fn state_file_path(runtime_dir: &Path, cluster: &str, db: &str) -> PathBuf {
    runtime_dir.join(format!("{}_{}_state.json", cluster, sanitize_db_name(db)))
}

fn lock_file_path(runtime_dir: &Path, cluster: &str, db: &str) -> PathBuf {
    runtime_dir.join(format!("{}_{}_state.lock", cluster, sanitize_db_name(db)))
}

pub fn doc_to_json(doc: &Document) -> Result<Value, Error> {
    Ok(serde_json::to_value(doc)?)
}

pub fn json_to_doc(value: &Value) -> Result<Document, Error> {
    match Bson::try_from(value.clone())? {
        Bson::Document(doc) => Ok(doc),
        other => bail!("expected a JSON object, got {:?}", other),
    }
}

fn now_rfc3339() -> Result<String, Error> {
    proxmox::tools::time::epoch_to_rfc3339_utc(proxmox::tools::time::epoch_i64())
}

pub struct StateStore {
    path: PathBuf,
    state: Option<JobState>,
    cluster: String,
    db: String,
    _lock: File,
}

impl StateStore {
    /// Acquire the advisory lock and load any prior state.
    ///
    /// A held lock means another live process owns this `(cluster, db)` -
    /// that is a precondition failure, not something to wait out. A state
    /// file with an unknown schema version is quarantined (renamed with an
    /// `.incompatible` suffix) and the run starts fresh.
    pub fn open(
        runtime_dir: &Path,
        cluster: &str,
        db: &str,
        lock_wait: Duration,
    ) -> Result<Self, RebuildError> {
        std::fs::create_dir_all(runtime_dir).map_err(|err| {
            RebuildError::fatal(format!("unable to create {:?} - {}", runtime_dir, err))
        })?;

        let lock_path = lock_file_path(runtime_dir, cluster, db);
        let lock = tools::fs::lock_file(&lock_path, lock_wait).map_err(|err| {
            RebuildError::precondition(format!(
                "another run owns {}/{} ({})",
                cluster, db, err
            ))
        })?;

        let path = state_file_path(runtime_dir, cluster, db);
        let state = Self::load(&path)?;

        Ok(Self {
            path,
            state,
            cluster: cluster.to_string(),
            db: db.to_string(),
            _lock: lock,
        })
    }

    fn load(path: &Path) -> Result<Option<JobState>, RebuildError> {
        let content = proxmox::tools::fs::file_read_optional_string(path)
            .map_err(RebuildError::from)?;
        let content = match content {
            Some(content) => content,
            None => return Ok(None),
        };

        let compatible = serde_json::from_str::<Value>(&content)
            .ok()
            .map(|value| value["schemaVersion"] == Value::from(STATE_SCHEMA_VERSION))
            .unwrap_or(false);
        if !compatible {
            let mut quarantine = path.as_os_str().to_owned();
            quarantine.push(".incompatible");
            log::warn!(
                "state file {:?} is unreadable or has an unknown schema version, \
                 moving it to {:?}",
                path,
                quarantine
            );
            std::fs::rename(path, &quarantine).map_err(|err| {
                RebuildError::fatal(format!("unable to quarantine {:?} - {}", path, err))
            })?;
            return Ok(None);
        }

        let state: JobState = serde_json::from_str(&content).map_err(|err| {
            RebuildError::fatal(format!("unable to parse state file {:?} - {}", path, err))
        })?;
        Ok(Some(state))
    }

    pub fn job(&self) -> Option<&JobState> {
        self.state.as_ref()
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Create the job record if this is a fresh run.
    pub fn ensure_job(&mut self) -> Result<(), Error> {
        if self.state.is_none() {
            self.state = Some(JobState {
                schema_version: STATE_SCHEMA_VERSION,
                cluster_name: self.cluster.clone(),
                db_name: self.db.clone(),
                started_at: now_rfc3339()?,
                collections: Vec::new(),
            });
            self.persist()?;
        }
        Ok(())
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionRecord, Error> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| format_err!("no job state - ensure_job() not called"))?;
        let pos = state.collections.iter().position(|c| c.name == name);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                state.collections.push(CollectionRecord {
                    name: name.to_string(),
                    status: CollectionStatus::Pending,
                    indexes: Vec::new(),
                });
                state.collections.len() - 1
            }
        };
        Ok(&mut state.collections[pos])
    }

    pub fn set_collection_status(
        &mut self,
        name: &str,
        status: CollectionStatus,
    ) -> Result<(), Error> {
        self.collection_mut(name)?.status = status;
        self.persist()
    }

    /// Upsert the record for `(collection, original)` and return the phase
    /// to resume from. An existing record keeps its recorded spec and gets
    /// its attempt counter bumped.
    pub fn ensure_index_record(
        &mut self,
        collection: &str,
        original: &IndexSpec,
        temp_name: &str,
    ) -> Result<Phase, Error> {
        let now = now_rfc3339()?;
        let record = {
            let coll = self.collection_mut(collection)?;
            match coll.indexes.iter_mut().find(|r| r.original_name == original.name) {
                Some(record) => {
                    record.attempt += 1;
                    record.updated_at = now;
                    record.phase
                }
                None => {
                    coll.indexes.push(IndexRecord {
                        original_name: original.name.clone(),
                        temp_name: temp_name.to_string(),
                        phase: Phase::Planned,
                        original_spec: doc_to_json(&original.keys)?,
                        original_options: doc_to_json(&original.options)?,
                        attempt: 1,
                        started_at: now.clone(),
                        updated_at: now,
                        last_error: None,
                    });
                    Phase::Planned
                }
            }
        };
        self.persist()?;
        Ok(record)
    }

    /// Record a phase transition and persist it durably before returning.
    pub fn set_phase(
        &mut self,
        collection: &str,
        original_name: &str,
        phase: Phase,
        last_error: Option<String>,
    ) -> Result<(), Error> {
        let now = now_rfc3339()?;
        {
            let coll = self.collection_mut(collection)?;
            let record = coll
                .indexes
                .iter_mut()
                .find(|r| r.original_name == original_name)
                .ok_or_else(|| {
                    format_err!("no index record for {}.{}", collection, original_name)
                })?;
            record.phase = phase;
            record.updated_at = now;
            record.last_error = last_error;
        }
        self.persist()
    }

    pub fn recorded_phase(&self, collection: &str, original_name: &str) -> Option<Phase> {
        self.state.as_ref().and_then(|state| {
            state
                .collections
                .iter()
                .find(|c| c.name == collection)?
                .indexes
                .iter()
                .find(|r| r.original_name == original_name)
                .map(|r| r.phase)
        })
    }

    pub fn records_for(&self, collection: &str) -> Vec<IndexRecord> {
        self.state
            .as_ref()
            .and_then(|state| state.collections.iter().find(|c| c.name == collection))
            .map(|c| c.indexes.clone())
            .unwrap_or_default()
    }

    /// Every index record still shy of `done`, across all collections.
    pub fn unfinished_records(&self) -> Vec<(String, IndexRecord)> {
        let mut out = Vec::new();
        if let Some(state) = &self.state {
            for coll in &state.collections {
                for record in &coll.indexes {
                    if record.phase != Phase::Done {
                        out.push((coll.name.clone(), record.clone()));
                    }
                }
            }
        }
        out
    }

    /// True once every recorded index ended in `done` and no collection
    /// aborted or failed. Only such a run may delete its state file.
    pub fn is_fully_done(&self) -> bool {
        match &self.state {
            Some(state) => state.collections.iter().all(|coll| {
                !matches!(coll.status, CollectionStatus::Aborted | CollectionStatus::Failed)
                    && coll.indexes.iter().all(|r| r.phase == Phase::Done)
            }),
            None => true,
        }
    }

    pub fn persist(&self) -> Result<(), Error> {
        let state = match &self.state {
            Some(state) => state,
            None => return Ok(()),
        };
        let raw = serde_json::to_vec_pretty(state)?;
        tools::fs::file_set_contents(&self.path, &raw)
    }

    /// Remove the state file after a fully successful run.
    pub fn remove(&mut self) -> Result<(), Error> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)
                .map_err(|err| format_err!("unable to remove {:?} - {}", self.path, err))?;
        }
        self.state = None;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mongodb::bson::doc;

    fn scratch_dir(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mongo-reindex-state-test-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&path);
        path
    }

    fn sample_index() -> IndexSpec {
        IndexSpec::new("email_1", doc! { "email": 1 }, Document::new())
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_db_name("app_db-1"), "app_db-1");
        assert_eq!(sanitize_db_name("weird db/ü"), "weird_db__");
    }

    #[test]
    fn distinct_databases_get_distinct_files() {
        let dir = PathBuf::from("/tmp/runtime");
        let a = state_file_path(&dir, "rs0", "app_one");
        let b = state_file_path(&dir, "rs0", "app_two");
        assert_ne!(a, b);
        assert_eq!(
            state_file_path(&dir, "rs0", "appöne"),
            dir.join("rs0_app_ne_state.json")
        );
    }

    #[test]
    fn phase_roundtrip_and_resume() -> Result<(), Error> {
        let dir = scratch_dir("roundtrip");
        let wait = Duration::from_millis(100);

        {
            let mut store = StateStore::open(&dir, "rs0", "app", wait).map_err(Error::msg)?;
            store.ensure_job()?;
            let phase = store.ensure_index_record("users", &sample_index(), "email_1_cover_temp")?;
            assert_eq!(phase, Phase::Planned);
            store.set_phase("users", "email_1", Phase::Swapping, None)?;
        }

        {
            let mut store = StateStore::open(&dir, "rs0", "app", wait).map_err(Error::msg)?;
            assert!(store.has_state());
            assert_eq!(store.recorded_phase("users", "email_1"), Some(Phase::Swapping));

            // the recorded spec reconstructs the original index
            let records = store.records_for("users");
            assert_eq!(records.len(), 1);
            let original = records[0].original_index()?;
            assert!(original.equivalent(&sample_index()));

            // attempt counter bumps on resume
            let phase = store.ensure_index_record("users", &sample_index(), "email_1_cover_temp")?;
            assert_eq!(phase, Phase::Swapping);
            assert_eq!(store.records_for("users")[0].attempt, 2);
        }

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn schema_mismatch_is_quarantined() -> Result<(), Error> {
        let dir = scratch_dir("quarantine");
        std::fs::create_dir_all(&dir)?;
        let path = state_file_path(&dir, "rs0", "app");
        std::fs::write(&path, r#"{ "schemaVersion": 99, "collections": [] }"#)?;

        let store = StateStore::open(&dir, "rs0", "app", Duration::from_millis(100))
            .map_err(Error::msg)?;
        assert!(!store.has_state());
        assert!(!path.exists());
        let mut quarantined = path.as_os_str().to_owned();
        quarantined.push(".incompatible");
        assert!(PathBuf::from(quarantined).exists());

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn second_opener_is_refused() -> Result<(), Error> {
        let dir = scratch_dir("lock");
        let wait = Duration::from_millis(100);

        let _first = StateStore::open(&dir, "rs0", "app", wait).map_err(Error::msg)?;
        match StateStore::open(&dir, "rs0", "app", wait) {
            Err(RebuildError::Precondition { .. }) => (),
            other => panic!("expected a precondition error, got {:?}", other.is_ok()),
        }

        // a different database on the same cluster is not in contention
        let _other = StateStore::open(&dir, "rs0", "other", wait).map_err(Error::msg)?;

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn fully_done_gates_removal() -> Result<(), Error> {
        let dir = scratch_dir("done");
        let wait = Duration::from_millis(100);
        let mut store = StateStore::open(&dir, "rs0", "app", wait).map_err(Error::msg)?;
        store.ensure_job()?;
        store.ensure_index_record("users", &sample_index(), "email_1_cover_temp")?;
        store.set_collection_status("users", CollectionStatus::Running)?;
        assert!(!store.is_fully_done());

        store.set_phase("users", "email_1", Phase::Done, None)?;
        store.set_collection_status("users", CollectionStatus::Done)?;
        assert!(store.is_fully_done());

        store.remove()?;
        assert!(!state_file_path(&dir, "rs0", "app").exists());

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
