//! Script-backed hooks: run a JS file against the fixture after each test.

use std::path::PathBuf;

use shoal_core::Result;
use shoal_testing::{ConnectionInfo, JsTestCase, ReportEntry, ReportSink};

use crate::dynamic::{ContinuousDynamicTestCase, DynamicTestCase};
use crate::{Hook, HookContext};

/// Runs a fixed JS file in `after_test`. A failing script is recorded
/// against the dynamic case and reported as a test failure.
pub struct JsHook {
    name: String,
    js_file: PathBuf,
    shell_options: Vec<String>,
}

impl JsHook {
    pub fn new(name: impl Into<String>, js_file: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            js_file: js_file.into(),
            shell_options: Vec::new(),
        }
    }

    pub fn with_shell_options(mut self, options: Vec<String>) -> Self {
        self.shell_options = options;
        self
    }

    pub fn js_file(&self) -> &std::path::Path {
        &self.js_file
    }

    pub(crate) fn make_case(
        &self,
        test_name: &str,
        ctx: &HookContext,
        connection: &ConnectionInfo,
    ) -> Result<DynamicTestCase> {
        let case = JsTestCase::new(&self.js_file, &ctx.shell)
            .with_shell_options(self.shell_options.clone());
        DynamicTestCase::new(&self.name, test_name, Box::new(case), connection)
    }

    /// Build, run and record one dynamic case against `connection`.
    pub(crate) fn run_script(
        &self,
        test_name: &str,
        ctx: &HookContext,
        connection: &ConnectionInfo,
        report: &mut dyn ReportSink,
    ) -> Result<()> {
        let mut case = self.make_case(test_name, ctx, connection)?;
        let outcome = case.run()?;
        report.add_test(ReportEntry {
            display_name: case.display_name().to_string(),
            outcome: outcome.clone(),
            hook: Some(self.name.clone()),
        });
        outcome.into_result(case.display_name())
    }
}

impl Hook for JsHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_test(
        &mut self,
        test_name: &str,
        ctx: &HookContext,
        report: &mut dyn ReportSink,
    ) -> Result<()> {
        self.run_script(test_name, ctx, &ctx.connection, report)
    }
}

/// A [`JsHook`] whose failure means the fixture can no longer be trusted:
/// test failures are promoted to server failures, stopping the suite.
pub struct DataConsistencyHook {
    inner: JsHook,
}

impl DataConsistencyHook {
    pub fn new(name: impl Into<String>, js_file: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsHook::new(name, js_file),
        }
    }
}

impl Hook for DataConsistencyHook {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn after_test(
        &mut self,
        test_name: &str,
        ctx: &HookContext,
        report: &mut dyn ReportSink,
    ) -> Result<()> {
        self.inner
            .run_script(test_name, ctx, &ctx.connection, report)
            .map_err(|err| err.promote_to_server_failure())
    }
}

/// A data-consistency hook that runs its script once against every
/// independent cluster of the fixture, with a fresh dynamic case per
/// cluster.
pub struct PerClusterDataConsistencyHook {
    inner: JsHook,
}

impl PerClusterDataConsistencyHook {
    pub fn new(name: impl Into<String>, js_file: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsHook::new(name, js_file),
        }
    }
}

impl Hook for PerClusterDataConsistencyHook {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn after_test(
        &mut self,
        test_name: &str,
        ctx: &HookContext,
        report: &mut dyn ReportSink,
    ) -> Result<()> {
        for cluster in &ctx.clusters {
            tracing::debug!(
                target: "shoal::hooks",
                hook = %self.inner.name(),
                cluster = %cluster.name,
                "running per-cluster probe"
            );
            self.inner
                .run_script(test_name, ctx, &cluster.connection, report)
                .map_err(|err| err.promote_to_server_failure())?;
        }
        Ok(())
    }
}

/// A [`JsHook`] that runs concurrently with the test instead of after it.
///
/// `skip_tests` suppresses the probe for tests known to be incompatible
/// with it.
pub struct BackgroundJsHook {
    inner: JsHook,
    skip_tests: Vec<String>,
}

impl BackgroundJsHook {
    pub fn new(name: impl Into<String>, js_file: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsHook::new(name, js_file),
            skip_tests: Vec::new(),
        }
    }

    pub fn with_skip_tests(mut self, skip_tests: Vec<String>) -> Self {
        self.skip_tests = skip_tests;
        self
    }
}

impl Hook for BackgroundJsHook {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn is_background(&self) -> bool {
        true
    }

    fn background_case(
        &self,
        test_name: &str,
        ctx: &HookContext,
    ) -> Result<Option<ContinuousDynamicTestCase>> {
        if self.skip_tests.iter().any(|skip| skip == test_name) {
            tracing::info!(
                target: "shoal::hooks",
                hook = %self.inner.name(),
                test = %test_name,
                "skipping background probe for incompatible test"
            );
            return Ok(None);
        }
        let case = self.inner.make_case(test_name, ctx, &ctx.connection)?;
        Ok(Some(ContinuousDynamicTestCase::new(case)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_core::Error;
    use shoal_fixture::ClusterClient;
    use shoal_testing::Report;
    use std::sync::Arc;

    struct NeverClient;

    impl ClusterClient for NeverClient {
        fn run_command(
            &self,
            _target: &str,
            _db: &str,
            _command: &serde_json::Value,
        ) -> Result<serde_json::Value> {
            Err(Error::server_failure("unreachable"))
        }
    }

    fn ctx() -> HookContext {
        HookContext {
            connection: ConnectionInfo {
                connection_string: "localhost:20000".to_string(),
                driver_url: "mongodb://localhost:20000".to_string(),
            },
            clusters: Vec::new(),
            client: Arc::new(NeverClient),
            shell: PathBuf::from("mongo"),
        }
    }

    #[test]
    fn background_hook_skips_listed_tests() {
        let hook = BackgroundJsHook::new(
            "CheckMetadataConsistencyInBackground",
            "jstests/hooks/run_check_metadata_consistency.js",
        )
        .with_skip_tests(vec!["jstests/core/bad.js".to_string()]);

        assert!(hook.is_background());
        let case = hook.background_case("jstests/core/bad.js", &ctx()).unwrap();
        assert!(case.is_none());

        let case = hook.background_case("jstests/core/ok.js", &ctx()).unwrap();
        assert_eq!(
            case.unwrap().display_name(),
            "jstests/core/ok.js:CheckMetadataConsistencyInBackground"
        );
    }

    #[cfg(unix)]
    #[test]
    fn data_consistency_failure_is_promoted_to_server_failure() {
        // The "shell" is /bin/sh and the "script" asks it to fail, so the
        // dynamic case reports a test failure which the hook promotes.
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("probe.sh");
        std::fs::write(&script, "#!/bin/sh\nexit 1\n").unwrap();
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let mut hook = DataConsistencyHook::new("CheckReplDBHash", "ignored.js");
        let mut hook_ctx = ctx();
        hook_ctx.shell = script;

        let mut report = Report::new();
        let err = hook
            .after_test("jstests/core/find.js", &hook_ctx, &mut report)
            .unwrap_err();
        assert!(matches!(err, Error::ServerFailure(_)));
        assert_eq!(report.num_failed(), 1);
        assert_eq!(
            report.entries()[0].hook.as_deref(),
            Some("CheckReplDBHash")
        );
    }
}
