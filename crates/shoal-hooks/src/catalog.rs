//! Dataset-level hooks that drive admin commands directly rather than
//! running a script.

use serde_json::{json, Map, Value};

use shoal_core::{Error, Result};
use shoal_fixture::client::command_ok;
use shoal_testing::ReportSink;

use crate::js_hook::JsHook;
use crate::{primary_target, Hook, HookContext};

/// Databases the cleanup hooks never touch.
const RESERVED_DATABASES: [&str; 4] = ["admin", "config", "local", "$external"];

fn run_checked(ctx: &HookContext, target: &str, db: &str, command: Value) -> Result<Value> {
    let response = ctx.client.run_command(target, db, &command)?;
    if !command_ok(&response) {
        return Err(Error::server_failure(format!(
            "command {command} against {target} failed: {response}"
        )));
    }
    Ok(response)
}

fn drop_user_databases(ctx: &HookContext, target: &str) -> Result<Vec<String>> {
    let response = run_checked(
        ctx,
        target,
        "admin",
        json!({"listDatabases": 1, "nameOnly": true}),
    )?;
    let names: Vec<String> = response
        .get("databases")
        .and_then(Value::as_array)
        .map(|dbs| {
            dbs.iter()
                .filter_map(|db| db.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut dropped = Vec::new();
    for name in names {
        if RESERVED_DATABASES.contains(&name.as_str()) {
            continue;
        }
        run_checked(ctx, target, &name, json!({"dropDatabase": 1}))?;
        dropped.push(name);
    }
    Ok(dropped)
}

/// Drops the databases concurrency workloads leave behind.
///
/// Workload suites sharing one database (or one collection) across the whole
/// execution only get cleaned up after the suite; otherwise after every test.
pub struct CleanupConcurrencyWorkloads {
    name: String,
    same_db: bool,
    same_collection: bool,
}

impl CleanupConcurrencyWorkloads {
    pub fn new(name: impl Into<String>, same_db: bool, same_collection: bool) -> Self {
        Self {
            name: name.into(),
            // Sharing a collection implies sharing its database.
            same_db: same_db || same_collection,
            same_collection,
        }
    }

    fn cleanup(&self, ctx: &HookContext) -> Result<()> {
        let target = primary_target(&ctx.connection.connection_string);
        let dropped = drop_user_databases(ctx, target)?;
        tracing::info!(
            target: "shoal::hooks",
            hook = %self.name,
            dropped = dropped.len(),
            same_collection = self.same_collection,
            "cleaned up workload databases"
        );
        Ok(())
    }
}

impl Hook for CleanupConcurrencyWorkloads {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_test(
        &mut self,
        _test_name: &str,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        if self.same_db {
            return Ok(());
        }
        self.cleanup(ctx)
    }

    fn after_suite(
        &mut self,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
        _suite_failed: bool,
    ) -> Result<()> {
        if self.same_db {
            self.cleanup(ctx)?;
        }
        Ok(())
    }
}

/// Drops the database sharded-collection workloads write into after every
/// test.
pub struct CleanupShardedCollections {
    name: String,
    db_name: String,
}

impl CleanupShardedCollections {
    pub fn new(name: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_name: db_name.into(),
        }
    }
}

impl Hook for CleanupShardedCollections {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_test(
        &mut self,
        _test_name: &str,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        let target = primary_target(&ctx.connection.connection_string);
        run_checked(ctx, target, &self.db_name, json!({"dropDatabase": 1}))?;
        Ok(())
    }
}

/// Drops every user database once the suite is over.
pub struct DropUserCollections {
    name: String,
}

impl DropUserCollections {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Hook for DropUserCollections {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_suite(
        &mut self,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
        _suite_failed: bool,
    ) -> Result<()> {
        let target = primary_target(&ctx.connection.connection_string);
        drop_user_databases(ctx, target)?;
        Ok(())
    }
}

/// Enables the write-conflict failpoint on every independent cluster before
/// each test and disables it afterwards.
pub struct ToggleWriteConflicts {
    name: String,
    activation_probability: f64,
}

impl ToggleWriteConflicts {
    pub fn new(name: impl Into<String>, activation_probability: f64) -> Self {
        Self {
            name: name.into(),
            activation_probability,
        }
    }

    fn set_failpoint(&self, ctx: &HookContext, mode: Value) -> Result<()> {
        for cluster in &ctx.clusters {
            let target = primary_target(&cluster.connection.connection_string);
            run_checked(
                ctx,
                target,
                "admin",
                json!({
                    "configureFailPoint": "WTWriteConflictException",
                    "mode": mode,
                }),
            )?;
        }
        Ok(())
    }
}

impl Hook for ToggleWriteConflicts {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_test(
        &mut self,
        _test_name: &str,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        self.set_failpoint(
            ctx,
            json!({"activationProbability": self.activation_probability}),
        )
    }

    fn after_test(
        &mut self,
        _test_name: &str,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
    ) -> Result<()> {
        self.set_failpoint(ctx, json!("off"))
    }
}

/// Restores server parameters a fuzzer may have perturbed, once the suite
/// is over.
pub struct RestoreFuzzedSettings {
    name: String,
    parameters: Map<String, Value>,
}

impl RestoreFuzzedSettings {
    pub fn new(name: impl Into<String>, parameters: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            parameters,
        }
    }
}

impl Hook for RestoreFuzzedSettings {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_suite(
        &mut self,
        ctx: &HookContext,
        _report: &mut dyn ReportSink,
        _suite_failed: bool,
    ) -> Result<()> {
        for cluster in &ctx.clusters {
            let target = primary_target(&cluster.connection.connection_string);
            for (parameter, value) in &self.parameters {
                let mut command = Map::new();
                command.insert("setParameter".to_string(), json!(1));
                command.insert(parameter.clone(), value.clone());
                run_checked(ctx, target, "admin", Value::Object(command))?;
            }
        }
        Ok(())
    }
}

/// Opens a backup cursor halfway through the suite and runs a magic restore
/// at the end, comparing the restored state against the live one.
pub struct MagicRestore {
    name: String,
    num_tests: usize,
    tests_seen: usize,
    backup: JsHook,
    restore: JsHook,
}

impl MagicRestore {
    pub fn new(name: impl Into<String>, num_tests: usize) -> Result<Self> {
        if num_tests == 0 {
            return Err(Error::config("MagicRestore requires a positive num_tests"));
        }
        let name = name.into();
        Ok(Self {
            backup: JsHook::new(name.clone(), "jstests/hooks/magic_restore_backup.js"),
            restore: JsHook::new(name.clone(), "jstests/hooks/magic_restore.js"),
            name,
            num_tests,
            tests_seen: 0,
        })
    }

    fn backup_point(&self) -> usize {
        self.num_tests.div_ceil(2)
    }
}

impl Hook for MagicRestore {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_test(
        &mut self,
        test_name: &str,
        ctx: &HookContext,
        report: &mut dyn ReportSink,
    ) -> Result<()> {
        self.tests_seen += 1;
        if self.tests_seen == self.backup_point() {
            self.backup
                .run_script(test_name, ctx, &ctx.connection, report)?;
        }
        if self.tests_seen == self.num_tests {
            self.restore
                .run_script(test_name, ctx, &ctx.connection, report)
                .map_err(|err| err.promote_to_server_failure())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_fixture::ClusterClient;
    use shoal_testing::{ConnectionInfo, Report};
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    /// Records every command and answers from a script of responses.
    struct ScriptedClient {
        commands: Mutex<Vec<(String, String, Value)>>,
        responses: Mutex<Vec<Value>>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<Value>) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }
    }

    impl ClusterClient for ScriptedClient {
        fn run_command(&self, target: &str, db: &str, command: &Value) -> Result<Value> {
            self.commands
                .lock()
                .unwrap()
                .push((target.to_string(), db.to_string(), command.clone()));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(json!({"ok": 1}))
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn ctx(client: Arc<ScriptedClient>) -> HookContext {
        let connection = ConnectionInfo {
            connection_string: "localhost:20017,localhost:20018".to_string(),
            driver_url: "mongodb://localhost:20017,localhost:20018".to_string(),
        };
        HookContext {
            connection: connection.clone(),
            clusters: vec![crate::ClusterInfo {
                name: "shard-rs0".to_string(),
                connection: ConnectionInfo {
                    connection_string: "shard-rs0/localhost:20000".to_string(),
                    driver_url: "mongodb://localhost:20000/?replicaSet=shard-rs0".to_string(),
                },
            }],
            client,
            shell: PathBuf::from("mongo"),
        }
    }

    #[test]
    fn cleanup_drops_only_user_databases() {
        let client = Arc::new(ScriptedClient::new(vec![json!({
            "ok": 1,
            "databases": [
                {"name": "admin"},
                {"name": "config"},
                {"name": "test"},
                {"name": "workload0"},
            ],
        })]));
        let mut hook = CleanupConcurrencyWorkloads::new("CleanupConcurrencyWorkloads", false, false);
        let mut report = Report::new();
        hook.after_test("a.js", &ctx(Arc::clone(&client)), &mut report)
            .unwrap();

        let commands = client.commands.lock().unwrap();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0].0, "localhost:20017");
        assert_eq!(commands[1].1, "test");
        assert_eq!(commands[1].2, json!({"dropDatabase": 1}));
        assert_eq!(commands[2].1, "workload0");
    }

    #[test]
    fn same_db_cleanup_waits_for_the_suite_end() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let mut hook = CleanupConcurrencyWorkloads::new("CleanupConcurrencyWorkloads", true, false);
        let mut report = Report::new();

        hook.after_test("a.js", &ctx(Arc::clone(&client)), &mut report)
            .unwrap();
        assert!(client.commands.lock().unwrap().is_empty());

        hook.after_suite(&ctx(Arc::clone(&client)), &mut report, false)
            .unwrap();
        assert!(!client.commands.lock().unwrap().is_empty());
    }

    #[test]
    fn write_conflicts_toggle_on_then_off_per_cluster() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let mut hook = ToggleWriteConflicts::new("ToggleWriteConflicts", 0.05);
        let mut report = Report::new();
        let hook_ctx = ctx(Arc::clone(&client));

        hook.before_test("a.js", &hook_ctx, &mut report).unwrap();
        hook.after_test("a.js", &hook_ctx, &mut report).unwrap();

        let commands = client.commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        // Replica-set prefix is stripped from the per-cluster target.
        assert_eq!(commands[0].0, "localhost:20000");
        assert_eq!(
            commands[0].2["mode"],
            json!({"activationProbability": 0.05})
        );
        assert_eq!(commands[1].2["mode"], json!("off"));
    }

    #[test]
    fn failed_cleanup_command_is_a_server_failure() {
        let client = Arc::new(ScriptedClient::new(vec![json!({"ok": 0, "code": 13})]));
        let mut hook = DropUserCollections::new("DropUserCollections");
        let mut report = Report::new();
        let err = hook
            .after_suite(&ctx(client), &mut report, false)
            .unwrap_err();
        assert!(matches!(err, Error::ServerFailure(_)));
    }

    #[test]
    fn magic_restore_fires_at_the_midpoint_and_the_end() {
        let hook = MagicRestore::new("MagicRestore", 5).unwrap();
        assert_eq!(hook.backup_point(), 3);
        assert!(MagicRestore::new("MagicRestore", 0).is_err());
    }
}
