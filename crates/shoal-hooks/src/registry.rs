//! Hook construction by registered class name.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use shoal_core::{Error, Result};

use crate::catalog::{
    CleanupConcurrencyWorkloads, CleanupShardedCollections, DropUserCollections, MagicRestore,
    RestoreFuzzedSettings, ToggleWriteConflicts,
};
use crate::js_hook::{BackgroundJsHook, DataConsistencyHook, PerClusterDataConsistencyHook};
use crate::Hook;

fn parse_options<T: DeserializeOwned>(class: &str, options: serde_yaml::Value) -> Result<T> {
    let options = match options {
        serde_yaml::Value::Null => serde_yaml::Value::Mapping(Default::default()),
        other => other,
    };
    serde_yaml::from_value(options)
        .map_err(|err| Error::config(format!("hook {class}: {err}")))
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct NoOptions {}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SkipTestsOptions {
    #[serde(default)]
    skip_tests: Vec<String>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CleanupWorkloadsOptions {
    #[serde(default)]
    same_db: bool,
    #[serde(default)]
    same_collection: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CleanupShardedOptions {
    #[serde(default = "default_sharded_db")]
    db_name: String,
}

fn default_sharded_db() -> String {
    "shardedcoll".to_string()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteConflictsOptions {
    #[serde(default = "default_activation_probability")]
    activation_probability: f64,
}

fn default_activation_probability() -> f64 {
    0.01
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RestoreSettingsOptions {
    #[serde(default)]
    parameters: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MagicRestoreOptions {
    num_tests: usize,
}

/// Build the hook registered under `class`, configured from the suite's
/// options mapping. An unknown class is a configuration error.
pub fn create_hook(class: &str, options: serde_yaml::Value) -> Result<Box<dyn Hook>> {
    let hook: Box<dyn Hook> = match class {
        // Synchronous data-consistency probes.
        "CheckReplDBHash" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(PerClusterDataConsistencyHook::new(
                class,
                "jstests/hooks/run_check_repl_dbhash.js",
            ))
        }
        "ValidateCollections" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(PerClusterDataConsistencyHook::new(
                class,
                "jstests/hooks/run_validate_collections.js",
            ))
        }
        "CheckShardFilteringMetadata" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(DataConsistencyHook::new(
                class,
                "jstests/hooks/run_check_shard_filtering_metadata.js",
            ))
        }

        // Background probes.
        "AnalyzeShardKeysInBackground" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_analyze_shard_key_background.js",
            ))
        }
        "RunDbCheckInBackground" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_dbcheck_background.js",
            ))
        }
        "ValidateDirectSecondaryReads" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_validate_direct_secondary_reads.js",
            ))
        }
        "CollectQueryStats" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_collect_query_stats_background.js",
            ))
        }
        "ValidateCollectionsInBackground" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_validate_collections_background.js",
            ))
        }
        "CheckReplDBHashInBackground" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(BackgroundJsHook::new(
                class,
                "jstests/hooks/run_check_repl_dbhash_background.js",
            ))
        }
        "CheckMetadataConsistencyInBackground" => {
            let opts: SkipTestsOptions = parse_options(class, options)?;
            Box::new(
                BackgroundJsHook::new(
                    class,
                    "jstests/hooks/run_check_metadata_consistency.js",
                )
                .with_skip_tests(opts.skip_tests),
            )
        }

        // Dataset-level hooks.
        "CleanupConcurrencyWorkloads" => {
            let opts: CleanupWorkloadsOptions = parse_options(class, options)?;
            Box::new(CleanupConcurrencyWorkloads::new(
                class,
                opts.same_db,
                opts.same_collection,
            ))
        }
        "CleanupShardedCollections" => {
            let opts: CleanupShardedOptions = parse_options(class, options)?;
            Box::new(CleanupShardedCollections::new(class, opts.db_name))
        }
        "DropUserCollections" => {
            parse_options::<NoOptions>(class, options)?;
            Box::new(DropUserCollections::new(class))
        }
        "ToggleWriteConflicts" => {
            let opts: WriteConflictsOptions = parse_options(class, options)?;
            Box::new(ToggleWriteConflicts::new(class, opts.activation_probability))
        }
        "RestoreFuzzedSettings" => {
            let opts: RestoreSettingsOptions = parse_options(class, options)?;
            Box::new(RestoreFuzzedSettings::new(class, opts.parameters))
        }
        "MagicRestore" => {
            let opts: MagicRestoreOptions = parse_options(class, options)?;
            Box::new(MagicRestore::new(class, opts.num_tests)?)
        }

        other => {
            return Err(Error::config(format!("unknown hook class {other}")));
        }
    };
    Ok(hook)
}
