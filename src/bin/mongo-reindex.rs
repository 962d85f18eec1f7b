use std::path::PathBuf;

use anyhow::Error;
use serde_json::{json, Value};

use proxmox::api::{api, cli::*};

use mongo_reindex::config::{
    JobConfig, COLLECTION_GLOB_LIST_SCHEMA, DATABASE_SCHEMA, DIR_SCHEMA,
    INDEX_GLOB_LIST_SCHEMA, MONGODB_URI_SCHEMA, OUTPUT_FORMAT,
};
use mongo_reindex::error::RebuildError;
use mongo_reindex::rebuild::reconcile::OrphanDisposition;
use mongo_reindex::rebuild::{run_cleanup, run_compact, run_rebuild};
use mongo_reindex::tools;

fn job_config(param: &Value) -> Result<JobConfig, Error> {
    let mut config = JobConfig::new(
        param["uri"].as_str().map(|s| s.to_string()),
        param["database"].as_str().map(|s| s.to_string()),
    )?;

    if let Some(list) = param["specified-collections"].as_str() {
        config.specified_collections = tools::split_list(list);
    }
    if let Some(list) = param["ignored-collections"].as_str() {
        config.ignored_collections = tools::split_list(list);
    }
    if let Some(list) = param["specified-indexes"].as_str() {
        config.specified_indexes = tools::split_list(list);
    }
    if let Some(list) = param["ignored-indexes"].as_str() {
        config.ignored_indexes = tools::split_list(list);
    }

    let safe_run = param["safe-run"].as_bool().unwrap_or(true);
    let no_safe_run = param["no-safe-run"].as_bool().unwrap_or(false);
    config.safe_run = safe_run && !no_safe_run;

    if let Some(dir) = param["log-dir"].as_str() {
        config.log_dir = PathBuf::from(dir);
    }
    if let Some(dir) = param["runtime-dir"].as_str() {
        config.runtime_dir = PathBuf::from(dir);
    }

    config.allow_unique = param["allow-unique"].as_bool().unwrap_or(false);
    config.assume_yes = param["yes"].as_bool().unwrap_or(false);
    config.compact_after_rebuild = param["compact"].as_bool().unwrap_or(false);
    config.force_manual_compact = param["force-manual-compact"].as_bool().unwrap_or(false);
    config.free_space_target_mb = param["free-space-target-mb"].as_i64();

    Ok(config)
}

fn fail(command: &str, err: RebuildError) -> ! {
    eprintln!("{} failed: {}", command, err);
    std::process::exit(err.exit_code());
}

#[api(
    input: {
        properties: {
            uri: {
                schema: MONGODB_URI_SCHEMA,
                optional: true,
            },
            database: {
                schema: DATABASE_SCHEMA,
                optional: true,
            },
            "specified-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "ignored-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "specified-indexes": {
                schema: INDEX_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "ignored-indexes": {
                schema: INDEX_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "safe-run": {
                description: "Ask for confirmation before touching a collection or index.",
                type: bool,
                optional: true,
                default: true,
            },
            "no-safe-run": {
                description: "Disable all interactive confirmations.",
                type: bool,
                optional: true,
                default: false,
            },
            "log-dir": {
                schema: DIR_SCHEMA,
                optional: true,
            },
            "runtime-dir": {
                schema: DIR_SCHEMA,
                optional: true,
            },
            "allow-unique": {
                description: "Rebuild unique indexes although concurrent writes can admit duplicates while the covering index builds.",
                type: bool,
                optional: true,
                default: false,
            },
            "yes": {
                description: "Confirm leftover covering index drops without prompting.",
                type: bool,
                optional: true,
                default: false,
            },
            "compact": {
                description: "Run the compaction stage after a successful rebuild.",
                type: bool,
                optional: true,
                default: false,
            },
            "force-manual-compact": {
                description: "Never use autoCompact; compact each collection individually.",
                type: bool,
                optional: true,
                default: false,
            },
            "free-space-target-mb": {
                description: "freeSpaceTargetMB forwarded to autoCompact.",
                type: Integer,
                optional: true,
                minimum: 1,
            },
        },
    },
)]
/// Rebuild secondary indexes online (cover, swap, cleanup).
async fn rebuild(param: Value) -> Result<Value, Error> {
    let config = job_config(&param)?;

    match run_rebuild(&config).await {
        Ok(summary) => {
            for (name, outcome) in &summary.collections {
                println!("{}: {:?}", name, outcome);
            }
            println!(
                "rebuilt {} index(es), {} failed, {} collection(s) skipped",
                summary.rebuilt, summary.failed, summary.skipped_collections
            );
            if let Some(bytes) = summary.reclaimed_bytes {
                println!("reclaimed {}", tools::format_bytes(bytes));
            }
            let code = summary.exit_code();
            if code != 0 {
                std::process::exit(code);
            }
            Ok(Value::Null)
        }
        Err(err) => fail("rebuild", err),
    }
}

#[api(
    input: {
        properties: {
            uri: {
                schema: MONGODB_URI_SCHEMA,
                optional: true,
            },
            database: {
                schema: DATABASE_SCHEMA,
                optional: true,
            },
            "specified-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "ignored-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "safe-run": {
                description: "Ask before dropping anything.",
                type: bool,
                optional: true,
                default: true,
            },
            "no-safe-run": {
                description: "Disable interactive confirmations (pure dry-run unless --yes is given).",
                type: bool,
                optional: true,
                default: false,
            },
            "runtime-dir": {
                schema: DIR_SCHEMA,
                optional: true,
            },
            "yes": {
                description: "Confirm every candidate drop without prompting.",
                type: bool,
                optional: true,
                default: false,
            },
            "output-format": {
                schema: OUTPUT_FORMAT,
                optional: true,
            },
        },
    },
)]
/// List and clean up leftover covering indexes from interrupted runs.
async fn cleanup(param: Value) -> Result<Value, Error> {
    let output_format = get_output_format(&param);
    let config = job_config(&param)?;

    match run_cleanup(&config).await {
        Ok(summary) => {
            let data: Value = summary
                .candidates
                .iter()
                .map(|candidate| {
                    let action = match candidate.disposition {
                        OrphanDisposition::CompletedRebuild => {
                            "drop (completed rebuild)".to_string()
                        }
                        OrphanDisposition::InFlight(phase) => {
                            format!("needs confirmation (recorded phase '{}')", phase)
                        }
                        OrphanDisposition::NoState => {
                            "needs confirmation (no state record)".to_string()
                        }
                    };
                    json!({
                        "collection": candidate.collection,
                        "index": candidate.temp_name,
                        "original": candidate.original_name,
                        "action": action,
                    })
                })
                .collect::<Vec<Value>>()
                .into();
            format_and_print_result(&data, &output_format);
            println!("{} dropped, {} kept", summary.dropped, summary.kept);
            Ok(Value::Null)
        }
        Err(err) => fail("cleanup", err),
    }
}

#[api(
    input: {
        properties: {
            uri: {
                schema: MONGODB_URI_SCHEMA,
                optional: true,
            },
            database: {
                schema: DATABASE_SCHEMA,
                optional: true,
            },
            "specified-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "ignored-collections": {
                schema: COLLECTION_GLOB_LIST_SCHEMA,
                optional: true,
            },
            "safe-run": {
                description: "Ask before compacting each collection.",
                type: bool,
                optional: true,
                default: true,
            },
            "no-safe-run": {
                description: "Disable interactive confirmations.",
                type: bool,
                optional: true,
                default: false,
            },
            "force-manual-compact": {
                description: "Never use autoCompact; compact each collection individually.",
                type: bool,
                optional: true,
                default: false,
            },
            "free-space-target-mb": {
                description: "freeSpaceTargetMB forwarded to autoCompact.",
                type: Integer,
                optional: true,
                minimum: 1,
            },
        },
    },
)]
/// Reclaim storage by compacting collections.
async fn compact(param: Value) -> Result<Value, Error> {
    let config = job_config(&param)?;

    match run_compact(&config).await {
        Ok(summary) => {
            for entry in &summary.collections {
                println!(
                    "{}: {} -> {} (reclaimed {})",
                    entry.name,
                    tools::format_bytes(entry.storage_before),
                    tools::format_bytes(entry.storage_after),
                    tools::format_bytes(entry.reclaimed())
                );
            }
            println!("total reclaimed: {}", tools::format_bytes(summary.reclaimed));
            Ok(Value::Null)
        }
        Err(err) => fail("compact", err),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cmd_def = CliCommandMap::new()
        .insert("rebuild", CliCommand::new(&API_METHOD_REBUILD))
        .insert("cleanup", CliCommand::new(&API_METHOD_CLEANUP))
        .insert("compact", CliCommand::new(&API_METHOD_COMPACT));

    let rpcenv = CliEnvironment::new();
    run_cli_command(
        cmd_def,
        rpcenv,
        Some(|future| mongo_reindex::tools::runtime::main(future)),
    );
}
