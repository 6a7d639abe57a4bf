//! Suite descriptions: the YAML document naming what to run, against which
//! fixture, with which hooks.
//!
//! A parsed [`Suite`] is resolved eagerly: unknown test kinds, fixture
//! classes, or hook classes fail at load time, before anything starts.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use shoal_archive::ArchiveConfig;
use shoal_core::{Error, Result};
use shoal_fixture::ShardedClusterConfig;
use shoal_hooks::{create_hook, Hook};
use shoal_select::{SelectOptions, SelectorConfig, TestKind};

/// The `fixture` block: class name plus opaque class-specific options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixtureDescription {
    pub class: String,
    #[serde(default)]
    pub options: serde_yaml::Value,
}

/// One entry of the `hooks` list. Everything besides `class` is the hook's
/// own options mapping.
#[derive(Debug, Clone, Deserialize)]
pub struct HookDescription {
    pub class: String,
    #[serde(flatten)]
    pub options: serde_yaml::Mapping,
}

/// The raw YAML shape of a suite file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteDescription {
    pub test_kind: String,
    pub selector: SelectorConfig,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub fixture: Option<FixtureDescription>,
    #[serde(default)]
    pub hooks: Vec<HookDescription>,
    #[serde(default)]
    pub archive: Option<ArchiveConfig>,
}

/// A loaded and resolved suite.
pub struct Suite {
    name: String,
    kind: TestKind,
    description: SuiteDescription,
}

impl Suite {
    pub fn from_file(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let text = std::fs::read_to_string(path)?;
        Self::parse(name, &text)
    }

    pub fn parse(name: impl Into<String>, text: &str) -> Result<Self> {
        let name = name.into();
        let description: SuiteDescription = serde_yaml::from_str(text)
            .map_err(|err| Error::config(format!("suite {name}: {err}")))?;
        let kind = TestKind::from_str(&description.test_kind)?;

        let suite = Self {
            name,
            kind,
            description,
        };
        suite.validate()?;
        Ok(suite)
    }

    fn validate(&self) -> Result<()> {
        self.description.selector.validate(self.kind)?;
        if let Some(fixture) = &self.description.fixture {
            // Resolving the options also surfaces malformed fields now.
            self.fixture_config(fixture)?;
        }
        // Constructing the hooks validates their classes and options.
        self.build_hooks()?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TestKind {
        self.kind
    }

    pub fn selector(&self) -> &SelectorConfig {
        &self.description.selector
    }

    pub fn archive_config(&self) -> Option<&ArchiveConfig> {
        self.description.archive.as_ref()
    }

    pub fn fixture(&self) -> Option<&FixtureDescription> {
        self.description.fixture.as_ref()
    }

    /// Resolve the fixture block into the sharded-cluster configuration.
    pub fn fixture_config(
        &self,
        fixture: &FixtureDescription,
    ) -> Result<ShardedClusterConfig> {
        match fixture.class.as_str() {
            "ShardedClusterFixture" => {
                let options = match fixture.options.clone() {
                    serde_yaml::Value::Null => {
                        serde_yaml::Value::Mapping(Default::default())
                    }
                    other => other,
                };
                let config: ShardedClusterConfig = serde_yaml::from_value(options)
                    .map_err(|err| {
                        Error::config(format!("suite {}: fixture options: {err}", self.name))
                    })?;
                config.validate()?;
                Ok(config)
            }
            other => Err(Error::config(format!(
                "suite {}: unknown fixture class {other}",
                self.name
            ))),
        }
    }

    /// Construct fresh hook instances in registration order.
    pub fn build_hooks(&self) -> Result<Vec<Box<dyn Hook>>> {
        self.description
            .hooks
            .iter()
            .map(|hook| {
                create_hook(
                    &hook.class,
                    serde_yaml::Value::Mapping(hook.options.clone()),
                )
            })
            .collect()
    }
}

/// Immutable run-level configuration, assembled once from the command line.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Database shell used for JS tests and script-backed hooks.
    pub shell: PathBuf,
    /// Select and report, but construct no fixture and run nothing.
    pub dry_run: bool,
    /// Shuffle the selected tests before execution.
    pub shuffle: bool,
    /// Seed for shuffling and multi-JS grouping.
    pub seed: Option<u64>,
    /// Task identifier embedded in archive filenames.
    pub task: String,
    /// Execution (retry) number embedded in archive filenames.
    pub execution: u32,
    /// Archive every result regardless of the suite's archive config.
    pub archive_all: bool,
    /// Local directory archives are written under.
    pub archive_dir: PathBuf,
    /// First port handed to fixture processes.
    pub base_port: u16,
    /// Override the suite's shard count.
    pub num_shards: Option<usize>,
    /// Selection-time knobs (CLI test files, extra tag filters).
    pub select: SelectOptions,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("mongo"),
            dry_run: false,
            shuffle: false,
            seed: None,
            task: "local".to_string(),
            execution: 0,
            archive_all: false,
            archive_dir: PathBuf::from("archive"),
            base_port: 20000,
            num_shards: None,
            select: SelectOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MINIMAL: &str = r#"
test_kind: js_test
selector:
  roots:
    - jstests/core/*.js
"#;

    const SHARDED: &str = r#"
test_kind: js_test
description: core tests against a 2-shard cluster
selector:
  roots:
    - jstests/core/*.js
  exclude_with_any_tags:
    - assumes_standalone_mongod
fixture:
  class: ShardedClusterFixture
  options:
    num_shards: 2
    enable_balancer: false
hooks:
  - class: CheckReplDBHash
  - class: ValidateCollections
  - class: CheckMetadataConsistencyInBackground
    skip_tests:
      - jstests/core/bad.js
archive:
  tests: true
  hooks:
    - CheckReplDBHash
"#;

    #[test]
    fn minimal_suite_parses_with_defaults() {
        let suite = Suite::parse("core", MINIMAL).unwrap();
        assert_eq!(suite.name(), "core");
        assert_eq!(suite.kind(), TestKind::JsTest);
        assert!(suite.fixture().is_none());
        assert!(suite.archive_config().is_none());
        assert!(suite.build_hooks().unwrap().is_empty());
    }

    #[test]
    fn full_suite_resolves_fixture_and_hooks() {
        let suite = Suite::parse("core_sharded", SHARDED).unwrap();
        let fixture = suite.fixture().unwrap();
        let config = suite.fixture_config(fixture).unwrap();
        assert_eq!(config.num_shards, 2);
        assert!(!config.enable_balancer);

        let hooks = suite.build_hooks().unwrap();
        assert_eq!(hooks.len(), 3);
        assert_eq!(hooks[0].name(), "CheckReplDBHash");
        assert!(hooks[2].is_background());

        let archive = suite.archive_config().unwrap();
        assert_eq!(archive.tests, shoal_archive::ArchiveMatch::All(true));
    }

    #[test]
    fn unknown_test_kind_is_a_configuration_error() {
        let err = Suite::parse("bad", "test_kind: basket_weaving\nselector:\n  roots: []\n")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_hook_class_fails_at_load_time() {
        let text = format!("{MINIMAL}hooks:\n  - class: NoSuchHook\n");
        let err = Suite::parse("bad", &text).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("NoSuchHook"));
    }

    #[test]
    fn unknown_fixture_class_fails_at_load_time() {
        let text = format!("{MINIMAL}fixture:\n  class: TimeMachineFixture\n");
        let err = Suite::parse("bad", &text).err().unwrap();
        assert!(err.to_string().contains("TimeMachineFixture"));
    }

    #[test]
    fn suite_files_load_by_stem_name() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("core_sharded.yml");
        std::fs::write(&path, SHARDED).unwrap();
        let suite = Suite::from_file(&path).unwrap();
        assert_eq!(suite.name(), "core_sharded");
    }
}
