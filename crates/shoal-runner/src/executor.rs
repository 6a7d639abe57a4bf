//! The per-suite execution loop.
//!
//! Ordering per test: `before_test` → background hooks resumed → test body →
//! background hooks paused → `after_test` → archival decision. Suite-level:
//! every hook sees one `before_suite` before any test and one `after_suite`
//! after all tests, and the fixture is torn down last.

use std::path::Path;

use shoal_archive::{ArchivalPolicy, ArchiveEvent, FixtureSnapshot};
use shoal_core::{Error, Result};
use shoal_fixture::{Fixture, TeardownMode};
use shoal_hooks::{BackgroundJob, ClusterInfo, Hook, HookContext};
use shoal_testing::{ConnectionInfo, Report, ReportEntry, ReportSink, TestCase, TestOutcome, TestStatus};

/// Adapts the fixture lifecycle to what the archival policy needs: abort,
/// snapshot, restart.
struct FixtureArchiveAdapter<'a> {
    fixture: &'a mut dyn Fixture,
}

impl FixtureSnapshot for FixtureArchiveAdapter<'_> {
    fn teardown_for_archive(&mut self) -> Result<()> {
        self.fixture.teardown(TeardownMode::Abort)
    }

    fn archive_path(&self) -> Option<std::path::PathBuf> {
        self.fixture.path_for_archival()
    }

    fn restart(&mut self) -> Result<()> {
        self.fixture.setup()?;
        self.fixture.await_ready()
    }
}

fn build_hook_context(fixture: &dyn Fixture, shell: &Path) -> Result<HookContext> {
    let connection = ConnectionInfo {
        connection_string: fixture.internal_connection_string()?,
        driver_url: fixture.driver_connection_url()?,
    };
    let mut clusters = Vec::new();
    for (index, cluster) in fixture.independent_clusters().iter().enumerate() {
        let connection_string = cluster.internal_connection_string()?;
        let name = match connection_string.split_once('/') {
            Some((prefix, _)) => prefix.to_string(),
            None => format!("cluster{index}"),
        };
        clusters.push(ClusterInfo {
            name,
            connection: ConnectionInfo {
                connection_string,
                driver_url: cluster.driver_connection_url()?,
            },
        });
    }
    Ok(HookContext {
        connection,
        clusters,
        client: fixture.client(),
        shell: shell.to_path_buf(),
    })
}

/// Run `tests` against `fixture` with `hooks`, recording into `report`.
///
/// Returns `Err` when the suite stopped early: a server failure, a stop
/// directive from archival, or a harness bug. Ordinary test failures are
/// recorded and do not produce an `Err`.
pub fn run_suite_tests(
    fixture: &mut dyn Fixture,
    tests: Vec<Box<dyn TestCase>>,
    hooks: &mut [Box<dyn Hook>],
    policy: Option<&ArchivalPolicy>,
    shell: &Path,
    report: &mut Report,
) -> Result<()> {
    if let Err(err) = fixture.setup().and_then(|()| fixture.await_ready()) {
        // Partially started children still hold ports and processes.
        let _ = fixture.teardown(TeardownMode::Kill);
        return Err(err);
    }

    let mut ctx = build_hook_context(fixture, shell)?;

    let mut jobs: Vec<(usize, BackgroundJob)> = hooks
        .iter()
        .enumerate()
        .filter(|(_, hook)| hook.is_background())
        .map(|(index, hook)| (index, BackgroundJob::spawn(hook.name())))
        .collect();

    let mut fatal: Option<Error> = None;

    for hook in hooks.iter_mut() {
        if let Err(err) = hook.before_suite(&ctx, report) {
            fatal = Some(err);
            break;
        }
    }

    if fatal.is_none() {
        'tests: for mut case in tests {
            let test_name = case.display_name().to_string();

            for hook in hooks.iter_mut() {
                if let Err(err) = hook.before_test(&test_name, &ctx, report) {
                    fatal = Some(err);
                    break 'tests;
                }
            }

            let mut resumed = Vec::new();
            for (hook_index, job) in &jobs {
                match hooks[*hook_index].background_case(&test_name, &ctx) {
                    Ok(Some(background_case)) => {
                        if let Err(err) = job.resume(background_case) {
                            fatal = Some(err);
                            break 'tests;
                        }
                        resumed.push(*hook_index);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        fatal = Some(err);
                        break 'tests;
                    }
                }
            }

            let outcome = match case
                .configure(&ctx.connection)
                .and_then(|()| case.run())
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    let outcome = TestOutcome {
                        status: TestStatus::Errored,
                        return_code: None,
                        duration: std::time::Duration::ZERO,
                        message: Some(err.to_string()),
                    };
                    report.add_test(ReportEntry {
                        display_name: test_name.clone(),
                        outcome,
                        hook: None,
                    });
                    fatal = Some(err);
                    break 'tests;
                }
            };
            let test_passed = outcome.is_success();
            report.add_test(ReportEntry {
                display_name: test_name.clone(),
                outcome,
                hook: None,
            });

            // Pause the background probes; a failure in one means the
            // fixture can no longer be trusted.
            let mut failed_hook: Option<String> = None;
            for (hook_index, job) in &jobs {
                if !resumed.contains(hook_index) {
                    continue;
                }
                if let Err(err) = job.pause() {
                    let err = err.promote_to_server_failure();
                    tracing::error!(
                        target: "shoal::runner",
                        hook = %job.hook_name(),
                        error = %err,
                        "background probe failed"
                    );
                    failed_hook = Some(job.hook_name().to_string());
                    if fatal.is_none() {
                        fatal = Some(err);
                    }
                }
            }

            if fatal.is_none() {
                for hook in hooks.iter_mut() {
                    match hook.after_test(&test_name, &ctx, report) {
                        Ok(()) => {}
                        Err(Error::TestFailure(message)) => {
                            // Recorded against the test; execution continues.
                            tracing::warn!(
                                target: "shoal::runner",
                                hook = %hook.name(),
                                %message,
                                "hook failed after test"
                            );
                            failed_hook = Some(hook.name().to_string());
                        }
                        Err(err) => {
                            failed_hook = Some(hook.name().to_string());
                            fatal = Some(err);
                            break;
                        }
                    }
                }
            }

            if let Some(policy) = policy {
                let event = ArchiveEvent {
                    test_name: &test_name,
                    success: test_passed && failed_hook.is_none(),
                    hook: failed_hook.as_deref(),
                };
                if policy.should_archive(&event) {
                    let mut adapter = FixtureArchiveAdapter {
                        fixture: &mut *fixture,
                    };
                    match policy.archive(&event, &mut adapter) {
                        Ok(()) => {
                            // Ports move on restart; re-derive the context.
                            ctx = build_hook_context(fixture, shell)?;
                        }
                        Err(err) => {
                            if fatal.is_none() {
                                fatal = Some(err);
                            }
                            break 'tests;
                        }
                    }
                }
            }

            if fatal.is_some() {
                break 'tests;
            }
        }
    }

    for (_, job) in jobs.drain(..) {
        let hook_name = job.hook_name().to_string();
        if let Err(err) = job.stop() {
            let err = err.promote_to_server_failure();
            if fatal.is_none() {
                fatal = Some(err);
            } else {
                tracing::warn!(
                    target: "shoal::runner",
                    hook = %hook_name,
                    error = %err,
                    "background job left an error at shutdown"
                );
            }
        }
    }

    let suite_failed = fatal.is_some();
    for hook in hooks.iter_mut() {
        if let Err(err) = hook.after_suite(&ctx, report, suite_failed) {
            if fatal.is_none() {
                fatal = Some(err);
            } else {
                tracing::warn!(
                    target: "shoal::runner",
                    hook = %hook.name(),
                    error = %err,
                    "after-suite hook failed"
                );
            }
        }
    }

    if let Err(err) = fixture.teardown(TeardownMode::Graceful) {
        if fatal.is_none() {
            fatal = Some(err);
        } else {
            tracing::warn!(target: "shoal::runner", error = %err, "fixture teardown failed");
        }
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run `tests` with no fixture (unit-test kinds). Hooks are not supported
/// on fixtureless suites.
pub fn run_fixtureless_tests(tests: Vec<Box<dyn TestCase>>, report: &mut Report) -> Result<()> {
    let connection = ConnectionInfo {
        connection_string: String::new(),
        driver_url: String::new(),
    };
    for mut case in tests {
        let test_name = case.display_name().to_string();
        case.configure(&connection)?;
        let outcome = case.run()?;
        report.add_test(ReportEntry {
            display_name: test_name,
            outcome,
            hook: None,
        });
    }
    Ok(())
}
