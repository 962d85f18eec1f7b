//! Run configuration: one struct with explicit defaults, populated from CLI
//! parameters with environment fallbacks for the connection settings.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Error};
use proxmox::api::schema::{ApiStringFormat, EnumEntry, Schema, StringSchema};
use proxmox::const_regex;

use crate::tools::matcher::NameMatcher;
use crate::tools::retry::RetryPolicy;

pub const DEFAULT_LOG_DIR: &str = "./rebuild_logs";
pub const DEFAULT_RUNTIME_DIR: &str = "./.rebuild_runtime";

const_regex! {
    pub DATABASE_NAME_REGEX = r"^[^/\\. \x22$]+$";
}

pub const MONGODB_URI_SCHEMA: Schema = StringSchema::new(
    "MongoDB connection URI (defaults to the MONGODB_URI environment variable).",
)
.schema();

pub const DATABASE_SCHEMA: Schema = StringSchema::new(
    "Target database name (defaults to the MONGODB_DATABASE environment variable).",
)
.format(&ApiStringFormat::Pattern(&DATABASE_NAME_REGEX))
.schema();

pub const COLLECTION_GLOB_LIST_SCHEMA: Schema = StringSchema::new(
    "Comma separated collection name globs; '*' matches any run of non-dot characters.",
)
.schema();

pub const INDEX_GLOB_LIST_SCHEMA: Schema =
    StringSchema::new("Comma separated index name globs.").schema();

pub const DIR_SCHEMA: Schema = StringSchema::new("Directory path.").schema();

pub const OUTPUT_FORMAT: Schema = StringSchema::new("Output format.")
    .format(&ApiStringFormat::Enum(&[
        EnumEntry::new("text", "Text format"),
        EnumEntry::new("json", "JSON format"),
        EnumEntry::new("json-pretty", "JSON pretty print"),
    ]))
    .schema();

/// Everything a run needs to know, resolved once by the command layer.
#[derive(Clone)]
pub struct JobConfig {
    pub uri: String,
    pub database: String,
    pub specified_collections: Vec<String>,
    pub ignored_collections: Vec<String>,
    pub specified_indexes: Vec<String>,
    pub ignored_indexes: Vec<String>,
    /// Interactive confirmations before touching collections and indexes.
    pub safe_run: bool,
    pub log_dir: PathBuf,
    pub runtime_dir: PathBuf,
    /// Never use autoCompact, even when the server supports it.
    pub force_manual_compact: bool,
    /// Rebuild unique indexes despite the duplicate-admission race.
    pub allow_unique: bool,
    /// Batch confirmation for orphan drops (`cleanup --yes`).
    pub assume_yes: bool,
    /// Run the compaction stage after a successful rebuild.
    pub compact_after_rebuild: bool,
    pub free_space_target_mb: Option<i64>,
    /// Per-RPC deadline.
    pub call_deadline: Duration,
    /// Overall wall-clock cap for a rebuild run; `None` means unlimited.
    /// Checked between collections - running work is never cut short.
    pub job_time_limit: Option<Duration>,
    /// Bounded wait for the state lock before refusing to run.
    pub lock_wait: Duration,
    /// Retry budget for transient RPC failures.
    pub rpc_retry: RetryPolicy,
    /// Poll budget for index verification.
    pub verify_retry: RetryPolicy,
}

impl JobConfig {
    /// Resolve URI and database, falling back to the environment. The values
    /// are used verbatim - nothing here ever goes through a shell.
    pub fn new(uri: Option<String>, database: Option<String>) -> Result<Self, Error> {
        let uri = match uri.or_else(|| std::env::var("MONGODB_URI").ok()) {
            Some(uri) if !uri.is_empty() => uri,
            _ => bail!("no connection URI given (use --uri or set MONGODB_URI)"),
        };
        let database = match database.or_else(|| std::env::var("MONGODB_DATABASE").ok()) {
            Some(db) if !db.is_empty() => db,
            _ => bail!("no database given (use --database or set MONGODB_DATABASE)"),
        };

        Ok(Self {
            uri,
            database,
            specified_collections: Vec::new(),
            ignored_collections: Vec::new(),
            specified_indexes: Vec::new(),
            ignored_indexes: Vec::new(),
            safe_run: true,
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
            force_manual_compact: false,
            allow_unique: false,
            assume_yes: false,
            compact_after_rebuild: false,
            free_space_target_mb: None,
            call_deadline: Duration::from_secs(300),
            job_time_limit: None,
            lock_wait: Duration::from_secs(5),
            rpc_retry: RetryPolicy::default(),
            verify_retry: RetryPolicy::default(),
        })
    }

    pub fn collection_matcher(&self) -> Result<NameMatcher, Error> {
        NameMatcher::new(&self.specified_collections, &self.ignored_collections)
    }

    pub fn index_matcher(&self) -> Result<NameMatcher, Error> {
        NameMatcher::new(&self.specified_indexes, &self.ignored_indexes)
    }

    /// Any collection or index filter in effect? Decides whether autoCompact
    /// (node-scoped) is appropriate.
    pub fn has_scope_filters(&self) -> bool {
        !self.specified_collections.is_empty()
            || !self.ignored_collections.is_empty()
            || !self.specified_indexes.is_empty()
            || !self.ignored_indexes.is_empty()
    }
}
