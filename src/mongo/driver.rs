use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{ClientOptions, ServerAddress};
use mongodb::results::CollectionType;
use mongodb::{Client, Database};

use crate::error::{
    classify_driver_error, RebuildError, INDEX_NOT_FOUND, NAMESPACE_NOT_FOUND,
};
use crate::index::IndexSpec;
use crate::mongo::gateway::{CollStats, MongoGateway, ReplSetInfo};

/// `NoReplicationEnabled` - replSetGetStatus on a standalone server.
const NO_REPLICATION_ENABLED: i32 = 76;

pub struct DriverGateway {
    client: Client,
    db: Database,
    base_options: ClientOptions,
    cluster_name: String,
}

impl DriverGateway {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, RebuildError> {
        let options = ClientOptions::parse(uri)
            .await
            .map_err(classify_driver_error)?;
        let client = Client::with_options(options.clone()).map_err(classify_driver_error)?;
        let db = client.database(database);

        // fail fast on unreachable deployments
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(classify_driver_error)?;

        let cluster_name = resolve_cluster_name(&client, &options).await;

        Ok(Self { client, db, base_options: options, cluster_name })
    }

    async fn timed<T, F>(
        &self,
        what: &str,
        deadline: Duration,
        fut: F,
    ) -> Result<T, RebuildError>
    where
        F: Future<Output = Result<T, mongodb::error::Error>> + Send,
    {
        match tokio::time::timeout(deadline, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify_driver_error(err)),
            Err(_) => Err(RebuildError::retryable(format!(
                "{} exceeded its deadline of {}s",
                what,
                deadline.as_secs()
            ))),
        }
    }
}

/// Replica-set name when there is one, otherwise a deterministic hash of the
/// sorted seed host list. Used only to scope state files.
async fn resolve_cluster_name(client: &Client, options: &ClientOptions) -> String {
    if let Some(name) = &options.repl_set_name {
        if !name.is_empty() {
            return name.clone();
        }
    }

    if let Ok(status) = client
        .database("admin")
        .run_command(doc! { "replSetGetStatus": 1 })
        .await
    {
        if let Ok(name) = status.get_str("set") {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }

    let mut hosts: Vec<String> = options.hosts.iter().map(|h| h.to_string()).collect();
    hosts.sort();
    let mut hasher = siphasher::sip::SipHasher::new();
    hosts.join(",").hash(&mut hasher);
    format!("standalone-{:016x}", hasher.finish())
}

fn get_u64(doc: &Document, key: &str) -> u64 {
    match doc.get(key) {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) => v.max(0.0) as u64,
        _ => 0,
    }
}

#[async_trait]
impl MongoGateway for DriverGateway {
    async fn list_collections(&self, deadline: Duration) -> Result<Vec<String>, RebuildError> {
        let specs = self
            .timed("listCollections", deadline, async {
                let cursor = self.db.list_collections().await?;
                cursor.try_collect::<Vec<_>>().await
            })
            .await?;

        let mut names: Vec<String> = specs
            .into_iter()
            .filter(|spec| !matches!(spec.collection_type, CollectionType::View))
            .map(|spec| spec.name)
            .filter(|name| !name.starts_with("system."))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn list_indexes(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<Vec<IndexSpec>, RebuildError> {
        let result = self
            .timed("listIndexes", deadline, async {
                let cursor = self
                    .db
                    .run_cursor_command(doc! { "listIndexes": collection })
                    .await?;
                cursor.try_collect::<Vec<Document>>().await
            })
            .await;

        let docs = match result {
            Ok(docs) => docs,
            // a vanished collection simply has no indexes
            Err(err) if err.server_code() == Some(NAMESPACE_NOT_FOUND) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut indexes = Vec::with_capacity(docs.len());
        for doc in &docs {
            indexes.push(IndexSpec::from_server_doc(doc).map_err(RebuildError::from)?);
        }
        Ok(indexes)
    }

    async fn create_index(
        &self,
        collection: &str,
        index: &IndexSpec,
        deadline: Duration,
    ) -> Result<(), RebuildError> {
        let command = doc! {
            "createIndexes": collection,
            "indexes": [index.to_create_doc()],
        };
        self.timed("createIndexes", deadline, self.db.run_command(command))
            .await?;
        Ok(())
    }

    async fn drop_index(
        &self,
        collection: &str,
        name: &str,
        deadline: Duration,
    ) -> Result<(), RebuildError> {
        let command = doc! { "dropIndexes": collection, "index": name };
        match self
            .timed("dropIndexes", deadline, self.db.run_command(command))
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.server_code(),
                    Some(INDEX_NOT_FOUND) | Some(NAMESPACE_NOT_FOUND)
                ) =>
            {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn coll_stats(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<CollStats, RebuildError> {
        let stats = self
            .timed(
                "collStats",
                deadline,
                self.db.run_command(doc! { "collStats": collection }),
            )
            .await?;
        Ok(CollStats {
            storage_size: get_u64(&stats, "storageSize"),
            count: get_u64(&stats, "count"),
        })
    }

    async fn compact_collection(
        &self,
        collection: &str,
        deadline: Duration,
    ) -> Result<(), RebuildError> {
        self.timed(
            "compact",
            deadline,
            self.db.run_command(doc! { "compact": collection }),
        )
        .await?;
        Ok(())
    }

    async fn auto_compact(
        &self,
        host: &str,
        enable: bool,
        free_space_target_mb: Option<i64>,
        deadline: Duration,
    ) -> Result<(), RebuildError> {
        let address = ServerAddress::parse(host).map_err(classify_driver_error)?;
        let mut options = self.base_options.clone();
        options.hosts = vec![address];
        options.direct_connection = Some(true);
        options.repl_set_name = None;
        let client = Client::with_options(options).map_err(classify_driver_error)?;

        let mut command = doc! { "autoCompact": enable };
        if enable {
            command.insert("runOnce", true);
            if let Some(mb) = free_space_target_mb {
                command.insert("freeSpaceTargetMB", mb);
            }
        }
        self.timed(
            "autoCompact",
            deadline,
            client.database("admin").run_command(command),
        )
        .await?;
        Ok(())
    }

    async fn current_op(
        &self,
        filter: Document,
        deadline: Duration,
    ) -> Result<Vec<Document>, RebuildError> {
        let mut command = doc! { "currentOp": 1 };
        for (key, value) in filter.iter() {
            command.insert(key.clone(), value.clone());
        }
        let result = self
            .timed(
                "currentOp",
                deadline,
                self.client.database("admin").run_command(command),
            )
            .await?;

        let ops = match result.get_array("inprog") {
            Ok(ops) => ops
                .iter()
                .filter_map(|op| match op {
                    Bson::Document(doc) => Some(doc.clone()),
                    _ => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        Ok(ops)
    }

    async fn run_admin(
        &self,
        command: Document,
        deadline: Duration,
    ) -> Result<Document, RebuildError> {
        self.timed(
            "admin command",
            deadline,
            self.client.database("admin").run_command(command),
        )
        .await
    }

    async fn replset_status(&self, deadline: Duration) -> Result<ReplSetInfo, RebuildError> {
        let status = match self
            .run_admin(doc! { "replSetGetStatus": 1 }, deadline)
            .await
        {
            Ok(status) => status,
            Err(err) if err.server_code() == Some(NO_REPLICATION_ENABLED) => {
                return Ok(ReplSetInfo::default());
            }
            Err(err) => return Err(err),
        };

        let mut info = ReplSetInfo {
            set_name: status.get_str("set").ok().map(|s| s.to_string()),
            ..Default::default()
        };
        if let Ok(members) = status.get_array("members") {
            for member in members {
                let member = match member {
                    Bson::Document(doc) => doc,
                    _ => continue,
                };
                let name = match member.get_str("name") {
                    Ok(name) => name.to_string(),
                    Err(_) => continue,
                };
                match member.get_i32("state").unwrap_or(-1) {
                    1 => info.primary = Some(name),
                    2 => info.secondaries.push(name),
                    _ => (),
                }
            }
        }
        Ok(info)
    }

    async fn server_version(
        &self,
        deadline: Duration,
    ) -> Result<(u64, u64, u64), RebuildError> {
        let info = self.run_admin(doc! { "buildInfo": 1 }, deadline).await?;

        if let Ok(parts) = info.get_array("versionArray") {
            let part = |idx: usize| -> u64 {
                match parts.get(idx) {
                    Some(Bson::Int32(v)) => (*v).max(0) as u64,
                    Some(Bson::Int64(v)) => (*v).max(0) as u64,
                    _ => 0,
                }
            };
            return Ok((part(0), part(1), part(2)));
        }

        let version = info.get_str("version").unwrap_or("");
        let mut parts = version.split('.').map(|p| p.parse::<u64>().unwrap_or(0));
        Ok((
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
            parts.next().unwrap_or(0),
        ))
    }

    fn cluster_name(&self) -> &str {
        &self.cluster_name
    }
}
