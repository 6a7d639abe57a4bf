//! Data-file archival on test failure.
//!
//! When a test or hook fails, the policy snapshots the fixture's on-disk
//! data directories so the state can be inspected later. The fixture is
//! aborted first (SIGABRT preserves more state than a clean shutdown),
//! archived, then restarted. An archive-write failure is only a warning; a
//! fixture that cannot be restarted stops the whole execution.

use std::collections::HashMap;
use std::path::PathBuf;

use globset::Glob;
use parking_lot::Mutex;
use serde::Deserialize;

use shoal_core::{Error, Result};

pub mod sink;

pub use sink::{ArchiveSink, TgzFileSink};

/// `true`/`false`, or an explicit list of patterns/names.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ArchiveMatch {
    All(bool),
    Listed(Vec<String>),
}

impl Default for ArchiveMatch {
    fn default() -> Self {
        Self::All(false)
    }
}

/// The `archive` block of a suite description.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    /// Also archive passing tests.
    #[serde(default)]
    pub on_success: bool,
    /// Which tests to archive: `true` for all, or a list of glob patterns
    /// matched against the test path.
    #[serde(default)]
    pub tests: ArchiveMatch,
    /// Hook class names whose failures trigger archival.
    #[serde(default)]
    pub hooks: ArchiveMatch,
}

/// One failed (or passed) result being considered for archival.
#[derive(Debug, Clone)]
pub struct ArchiveEvent<'a> {
    pub test_name: &'a str,
    pub success: bool,
    /// The hook that produced the result, when it was not a primary test.
    pub hook: Option<&'a str>,
}

/// What the policy needs from the fixture. The executor adapts the real
/// fixture; tests substitute a scripted fake.
pub trait FixtureSnapshot {
    /// Abort the fixture processes so their on-disk state is preserved.
    fn teardown_for_archive(&mut self) -> Result<()>;

    /// Root of the data directories to snapshot.
    fn archive_path(&self) -> Option<PathBuf>;

    /// `setup()` + `await_ready()` after the snapshot is taken.
    fn restart(&mut self) -> Result<()>;
}

pub struct ArchivalPolicy {
    config: Option<ArchiveConfig>,
    /// Archive every result regardless of config (command-line override).
    archive_all: bool,
    task: String,
    execution: u32,
    bucket: String,
    sink: Box<dyn ArchiveSink>,
    repeats: Mutex<HashMap<String, u32>>,
}

impl ArchivalPolicy {
    pub fn new(
        config: Option<ArchiveConfig>,
        task: impl Into<String>,
        execution: u32,
        sink: Box<dyn ArchiveSink>,
    ) -> Self {
        Self {
            config,
            archive_all: false,
            task: task.into(),
            execution,
            bucket: "mongodatafiles".to_string(),
            sink,
            repeats: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_archive_all(mut self, archive_all: bool) -> Self {
        self.archive_all = archive_all;
        self
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    /// The decision table: should this event be archived?
    pub fn should_archive(&self, event: &ArchiveEvent<'_>) -> bool {
        let Some(config) = &self.config else {
            return false;
        };
        if event.success && !config.on_success {
            return false;
        }
        if let Some(hook) = event.hook {
            match &config.hooks {
                ArchiveMatch::All(true) => return true,
                ArchiveMatch::All(false) => {}
                ArchiveMatch::Listed(names) => {
                    if names.iter().any(|name| name == hook) {
                        return true;
                    }
                }
            }
        }
        match &config.tests {
            ArchiveMatch::All(all) => {
                if *all {
                    return true;
                }
            }
            ArchiveMatch::Listed(patterns) => {
                if patterns
                    .iter()
                    .any(|pattern| pattern_matches(pattern, event.test_name))
                {
                    return true;
                }
            }
        }
        self.archive_all
    }

    /// Snapshot the fixture's data files for `event` and restart it.
    pub fn archive(&self, event: &ArchiveEvent<'_>, fixture: &mut dyn FixtureSnapshot) -> Result<()> {
        if let Err(err) = fixture.teardown_for_archive() {
            tracing::warn!(
                target: "shoal::archive",
                error = %err,
                "fixture abort before archive failed; archiving anyway"
            );
        }

        let repeat = self.next_repeat(event.test_name);
        let file_name = format!(
            "mongo-data-{}-{}-{}-{}.tgz",
            self.task,
            sanitize(event.test_name),
            self.execution,
            repeat
        );

        if let Some(path) = fixture.archive_path() {
            match self
                .sink
                .archive(event.test_name, &[path], &self.bucket, &file_name)
            {
                Ok(()) => {
                    tracing::info!(
                        target: "shoal::archive",
                        test = %event.test_name,
                        file = %file_name,
                        "archived data files"
                    );
                }
                Err(message) => {
                    tracing::warn!(
                        target: "shoal::archive",
                        test = %event.test_name,
                        %message,
                        "archive sink failed"
                    );
                }
            }
        } else {
            tracing::warn!(
                target: "shoal::archive",
                test = %event.test_name,
                "fixture has no archival path; nothing to snapshot"
            );
        }

        fixture.restart().map_err(|err| {
            Error::stop_execution(format!(
                "fixture restart after archiving {} failed: {err}",
                event.test_name
            ))
        })
    }

    fn next_repeat(&self, test_name: &str) -> u32 {
        let mut repeats = self.repeats.lock();
        let counter = repeats.entry(test_name.to_string()).or_insert(0);
        let repeat = *counter;
        *counter += 1;
        repeat
    }
}

fn pattern_matches(pattern: &str, test_name: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(test_name),
        Err(_) => pattern == test_name,
    }
}

fn sanitize(test_name: &str) -> String {
    test_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
