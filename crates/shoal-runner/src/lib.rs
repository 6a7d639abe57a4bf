//! The suite runner: selection, case construction, fixture wiring, and the
//! execution loop.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use shoal_archive::{ArchivalPolicy, TgzFileSink};
use shoal_core::{Error, Result};
use shoal_fixture::{PortAllocator, ShardedClusterConfig, ShardedClusterFixture, ShellClient};
use shoal_select::{select_tests, FsExplorer, Selection, SelectionFamily};
use shoal_suite::{FixtureDescription, RunConfig, Suite};
use shoal_testing::{
    ConnectionInfo, JsTestCase, ProgramTestCase, Report, TestCase, TestOutcome,
};

pub mod executor;

pub use executor::{run_fixtureless_tests, run_suite_tests};

/// Driver script that runs a group of workload files in one shell process.
const WORKLOAD_RUNNER_JS: &str = "jstests/concurrency/fsm_libs/resmoke_runner.js";

/// Aggregate result of one suite execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteSummary {
    pub passed: usize,
    pub failed: usize,
    pub errored: usize,
    pub duration: Duration,
}

impl SuiteSummary {
    fn from_report(report: &Report, duration: Duration) -> Self {
        Self {
            passed: report.num_passed(),
            failed: report.num_failed(),
            errored: report.num_errored(),
            duration,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }
}

/// A test that sleeps for the number of seconds its name says. Used to hold
/// fixture resources in soak configurations.
struct SleepTestCase {
    display_name: String,
    seconds: u64,
}

impl SleepTestCase {
    fn new(name: &str) -> Result<Self> {
        let seconds = name
            .parse::<u64>()
            .map_err(|_| Error::config(format!("sleep test name {name:?} is not a number")))?;
        Ok(Self {
            display_name: format!("sleep_{seconds}"),
            seconds,
        })
    }
}

impl TestCase for SleepTestCase {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn configure(&mut self, _connection: &ConnectionInfo) -> Result<()> {
        Ok(())
    }

    fn run(&mut self) -> Result<TestOutcome> {
        let start = Instant::now();
        std::thread::sleep(Duration::from_secs(self.seconds));
        Ok(TestOutcome::passed(start.elapsed()))
    }
}

/// Select, build, and run the tests of `suite` per `run`.
///
/// Test failures are reflected in the summary, not in the `Err` variant;
/// `Err` means the suite stopped early (configuration problem, fixture
/// failure, stop directive).
pub fn execute_suite(suite: &Suite, run: &RunConfig) -> Result<SuiteSummary> {
    let explorer = FsExplorer::new();
    let mut selection = select_tests(suite.kind(), suite.selector(), &explorer, &run.select)?;

    if selection.selected.is_empty() {
        tracing::warn!(target: "shoal::runner", suite = %suite.name(), "no tests selected");
    }

    if run.shuffle {
        let seed = run.seed.unwrap_or_else(rand::random);
        tracing::info!(target: "shoal::runner", suite = %suite.name(), seed, "shuffling tests");
        let mut rng = StdRng::seed_from_u64(seed);
        selection.selected.shuffle(&mut rng);
        if let Some(groups) = &mut selection.groups {
            groups.shuffle(&mut rng);
        }
    }

    if run.dry_run {
        for test in &selection.selected {
            tracing::info!(target: "shoal::runner", %test, "would run");
        }
        for test in &selection.excluded {
            tracing::debug!(target: "shoal::runner", %test, "excluded");
        }
        return Ok(SuiteSummary {
            passed: 0,
            failed: 0,
            errored: 0,
            duration: Duration::ZERO,
        });
    }

    let cases = build_cases(suite, &selection, &run.shell)?;
    let mut hooks = suite.build_hooks()?;
    let mut report = Report::new();
    let start = Instant::now();

    let result = match suite.fixture() {
        Some(description) => {
            let config = resolved_fixture_config(suite, description, run)?;
            let allocator = Arc::new(PortAllocator::new(run.base_port));
            // The management client authenticates with the fixture's
            // credentials when the suite names any.
            let client = Arc::new(ShellClient::new(&run.shell, config.auth_options.clone()));
            let mut fixture = ShardedClusterFixture::new(config, allocator, client)?;
            let policy = build_policy(suite, run);
            run_suite_tests(
                &mut fixture,
                cases,
                &mut hooks,
                policy.as_ref(),
                &run.shell,
                &mut report,
            )
        }
        None => {
            if !hooks.is_empty() {
                return Err(Error::config(format!(
                    "suite {} declares hooks but no fixture",
                    suite.name()
                )));
            }
            run_fixtureless_tests(cases, &mut report)
        }
    };

    let summary = SuiteSummary::from_report(&report, start.elapsed());
    tracing::info!(
        target: "shoal::runner",
        suite = %suite.name(),
        passed = summary.passed,
        failed = summary.failed,
        errored = summary.errored,
        duration = ?summary.duration,
        "suite finished"
    );

    result.map(|()| summary)
}

/// The suite's fixture configuration with run-level overrides applied.
fn resolved_fixture_config(
    suite: &Suite,
    description: &FixtureDescription,
    run: &RunConfig,
) -> Result<ShardedClusterConfig> {
    let mut config = suite.fixture_config(description)?;
    if let Some(num_shards) = run.num_shards {
        config.num_shards = num_shards;
        // Re-check: mixed_bin_versions coverage depends on the shard count.
        config.validate()?;
    }
    Ok(config)
}

fn build_policy(suite: &Suite, run: &RunConfig) -> Option<ArchivalPolicy> {
    let config = suite.archive_config().cloned()?;
    Some(
        ArchivalPolicy::new(
            Some(config),
            run.task.clone(),
            run.execution,
            Box::new(TgzFileSink::new(&run.archive_dir)),
        )
        .with_archive_all(run.archive_all),
    )
}

/// Turn the selection into runnable cases according to the kind's family.
fn build_cases(
    suite: &Suite,
    selection: &Selection,
    shell: &Path,
) -> Result<Vec<Box<dyn TestCase>>> {
    match suite.kind().family() {
        SelectionFamily::Js | SelectionFamily::File => Ok(selection
            .selected
            .iter()
            .map(|test| Box::new(JsTestCase::new(test, shell)) as Box<dyn TestCase>)
            .collect()),
        SelectionFamily::MultiJs => {
            let groups = selection.groups.as_ref().ok_or_else(|| {
                Error::internal("multi-JS selection produced no groups")
            })?;
            Ok(groups
                .iter()
                .enumerate()
                .map(|(index, group)| {
                    let mut test_data = serde_json::Map::new();
                    test_data.insert(
                        "workloadFiles".to_string(),
                        serde_json::Value::Array(
                            group
                                .iter()
                                .map(|file| serde_json::Value::String(file.clone()))
                                .collect(),
                        ),
                    );
                    Box::new(
                        JsTestCase::new(WORKLOAD_RUNNER_JS, shell)
                            .with_display_name(format!("workload_group_{index}"))
                            .with_test_data(test_data),
                    ) as Box<dyn TestCase>
                })
                .collect())
        }
        SelectionFamily::CppProgram => Ok(selection
            .selected
            .iter()
            .map(|program| {
                Box::new(ProgramTestCase::new(program).with_connection_argument())
                    as Box<dyn TestCase>
            })
            .collect()),
        SelectionFamily::DbTest => {
            let binary = suite.selector().binary.clone().ok_or_else(|| {
                Error::config(format!(
                    "suite {} selects db tests but names no binary",
                    suite.name()
                ))
            })?;
            Ok(selection
                .selected
                .iter()
                .map(|test| {
                    Box::new(
                        ProgramTestCase::new(&binary)
                            .with_display_name(test)
                            .with_args(vec![test.clone()])
                            .with_connection_argument(),
                    ) as Box<dyn TestCase>
                })
                .collect())
        }
        SelectionFamily::Name => selection
            .selected
            .iter()
            .map(|name| {
                SleepTestCase::new(name).map(|case| Box::new(case) as Box<dyn TestCase>)
            })
            .collect(),
    }
}
