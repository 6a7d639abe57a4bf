//! The per-kind filtering pipeline.
//!
//! Pipeline order: determine roots, expand, apply `exclude_files`, apply the
//! combined tag expression, force-include, sort. Every step preserves the
//! invariant that `selected` and `excluded` are disjoint and their union is
//! exactly the expanded roots.

use std::collections::{HashMap, HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use shoal_core::path::normalize;
use shoal_core::{Error, Result};

use crate::config::SelectorConfig;
use crate::explorer::TestFileExplorer;
use crate::kinds::{SelectionFamily, TestKind};

/// Run-level selection knobs. Populated once from the command line; the
/// selector itself holds no mutable global state.
#[derive(Debug, Clone)]
pub struct SelectOptions {
    /// Sort the selection by case-folded name. When false, input order is
    /// preserved.
    pub order_tests_by_name: bool,
    /// Explicit test identifiers passed on the command line. These replace
    /// the suite's roots, preserve duplicates, and for C++ and DB tests
    /// bypass the filtering pipeline entirely.
    pub cli_test_files: Vec<String>,
    /// Extra `include_with_any_tags` entries from the command line.
    pub include_with_any_tags: Vec<String>,
    /// Extra `exclude_with_any_tags` entries from the command line.
    pub exclude_with_any_tags: Vec<String>,
    /// Extra tag files layered after the suite's own.
    pub tag_files: Vec<String>,
    /// Seed for multi-JS group shuffling. `None` seeds from entropy.
    pub shuffle_seed: Option<u64>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            order_tests_by_name: true,
            cli_test_files: Vec::new(),
            include_with_any_tags: Vec::new(),
            exclude_with_any_tags: Vec::new(),
            tag_files: Vec::new(),
            shuffle_seed: None,
        }
    }
}

/// Result of selection for one kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub selected: Vec<String>,
    pub excluded: Vec<String>,
    /// Multi-JS kinds additionally assemble the selection into groups.
    pub groups: Option<Vec<Vec<String>>>,
}

/// Select the tests of `kind` described by `config`.
pub fn select_tests(
    kind: TestKind,
    config: &SelectorConfig,
    explorer: &dyn TestFileExplorer,
    opts: &SelectOptions,
) -> Result<Selection> {
    config.validate(kind)?;

    let family = kind.family();

    // C++ and DB tests passed explicitly on the command line skip the
    // filtering pipeline; the roots become the result directly.
    if matches!(
        family,
        SelectionFamily::CppProgram | SelectionFamily::DbTest
    ) && !opts.cli_test_files.is_empty()
    {
        return Ok(Selection {
            selected: opts.cli_test_files.clone(),
            excluded: Vec::new(),
            groups: None,
        });
    }

    if family == SelectionFamily::DbTest {
        return select_db_tests(config, explorer, opts);
    }

    let mut selection = Pipeline::new(kind, config, explorer, opts).run()?;

    if family == SelectionFamily::MultiJs {
        selection.groups = Some(make_groups(
            &selection.selected,
            config.group_size,
            config.group_count_multiplier.unwrap_or(1.0),
            opts.shuffle_seed,
        ));
    }

    Ok(selection)
}

struct Pipeline<'a> {
    kind: TestKind,
    config: &'a SelectorConfig,
    explorer: &'a dyn TestFileExplorer,
    opts: &'a SelectOptions,
    selected: Vec<String>,
    excluded: Vec<String>,
}

impl<'a> Pipeline<'a> {
    fn new(
        kind: TestKind,
        config: &'a SelectorConfig,
        explorer: &'a dyn TestFileExplorer,
        opts: &'a SelectOptions,
    ) -> Self {
        Self {
            kind,
            config,
            explorer,
            opts,
            selected: Vec::new(),
            excluded: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Selection> {
        let roots = self.roots()?;
        self.selected = self.expand_roots(roots)?;
        self.apply_exclude_files()?;
        self.apply_tag_expression()?;
        self.force_include();
        if self.opts.order_tests_by_name {
            self.selected.sort_by_key(|name| name.to_lowercase());
        }

        tracing::debug!(
            target: "shoal::select",
            kind = %self.kind,
            selected = self.selected.len(),
            excluded = self.excluded.len(),
            "selection complete"
        );

        Ok(Selection {
            selected: self.selected,
            excluded: self.excluded,
            groups: None,
        })
    }

    fn roots(&self) -> Result<Vec<String>> {
        if !self.opts.cli_test_files.is_empty() {
            return Ok(self.opts.cli_test_files.clone());
        }
        if let Some(roots) = &self.config.roots {
            return Ok(roots.clone());
        }
        if let Some(root) = &self.config.root {
            return self.explorer.read_root_file(root);
        }
        Err(Error::config(format!(
            "selector for {} must specify either `root` or `roots`",
            self.kind
        )))
    }

    fn expand_roots(&self, roots: Vec<String>) -> Result<Vec<String>> {
        if !self.kind.tests_are_files() {
            return Ok(roots);
        }

        let mut expanded = Vec::new();
        for entry in roots {
            if self.explorer.is_glob_pattern(&entry) {
                expanded.extend(self.explorer.glob(&entry)?);
            } else {
                let entry = normalize(&entry);
                if !self.explorer.isfile(&entry) {
                    return Err(Error::config(format!(
                        "selector root {entry:?} is not an existing file"
                    )));
                }
                expanded.push(entry);
            }
        }

        // Duplicates are preserved only for explicit command-line test paths.
        if self.opts.cli_test_files.is_empty() {
            let mut seen = HashSet::new();
            expanded.retain(|entry| seen.insert(entry.clone()));
        }
        Ok(expanded)
    }

    fn apply_exclude_files(&mut self) -> Result<()> {
        for pattern in &self.config.exclude_files {
            let pattern = normalize(pattern);
            let matched_any = self
                .selected
                .iter()
                .chain(self.excluded.iter())
                .any(|entry| entry_matches(self.explorer, entry, &pattern));
            if !matched_any {
                return Err(Error::config(format!(
                    "exclude_files entry {pattern:?} does not match any test"
                )));
            }

            let (moved, kept): (Vec<_>, Vec<_>) =
                std::mem::take(&mut self.selected).into_iter().partition(
                    |entry| entry_matches(self.explorer, entry, &pattern),
                );
            self.selected = kept;
            self.excluded.extend(moved);
        }
        Ok(())
    }

    fn apply_tag_expression(&mut self) -> Result<()> {
        let Some(expr) = self.config.combined_tag_expression(
            &self.opts.include_with_any_tags,
            &self.opts.exclude_with_any_tags,
        ) else {
            return Ok(());
        };

        let tag_map = self.load_tag_files()?;

        let mut kept = Vec::new();
        for entry in std::mem::take(&mut self.selected) {
            let mut tags: HashSet<String> =
                tag_map.get(&entry).cloned().unwrap_or_default().into_iter().collect();
            if self.kind.has_inline_tags() {
                tags.extend(self.explorer.jstest_tags(&entry)?);
            }
            if expr.matches(&tags) {
                kept.push(entry);
            } else {
                self.excluded.push(entry);
            }
        }
        self.selected = kept;
        Ok(())
    }

    fn load_tag_files(&self) -> Result<HashMap<String, Vec<String>>> {
        let mut accumulator = HashMap::new();
        self.explorer.parse_tag_files(
            self.kind.as_str(),
            &self.config.tag_files,
            &mut accumulator,
        )?;
        self.explorer
            .parse_tag_files(self.kind.as_str(), &self.opts.tag_files, &mut accumulator)?;
        Ok(accumulator)
    }

    /// Restore entries matching `include_files` regardless of how they were
    /// excluded; entries matching nothing move to the excluded set. A
    /// non-empty include list is therefore also a restriction.
    fn force_include(&mut self) {
        if self.config.include_files.is_empty() {
            return;
        }

        let patterns: Vec<String> = self
            .config
            .include_files
            .iter()
            .map(|p| normalize(p))
            .collect();
        let matches_any = |entry: &String| {
            patterns
                .iter()
                .any(|pattern| entry_matches(self.explorer, entry, pattern))
        };

        let mut selected = Vec::new();
        let mut excluded = Vec::new();
        // Walk selected-then-excluded so restored entries keep a stable order.
        for entry in std::mem::take(&mut self.selected) {
            if matches_any(&entry) {
                selected.push(entry);
            } else {
                excluded.push(entry);
            }
        }
        for entry in std::mem::take(&mut self.excluded) {
            if matches_any(&entry) {
                selected.push(entry);
            } else {
                excluded.push(entry);
            }
        }
        self.selected = selected;
        self.excluded = excluded;
    }
}

fn entry_matches(explorer: &dyn TestFileExplorer, entry: &str, pattern: &str) -> bool {
    if explorer.is_glob_pattern(pattern) {
        explorer.fnmatchcase(entry, pattern)
    } else {
        entry == pattern
    }
}

fn select_db_tests(
    config: &SelectorConfig,
    explorer: &dyn TestFileExplorer,
    opts: &SelectOptions,
) -> Result<Selection> {
    // DB tests carry no tags; any `include_with_any_tags` request can never
    // match, so the selection is empty by definition.
    if !config.include_with_any_tags.is_empty() || !opts.include_with_any_tags.is_empty() {
        return Ok(Selection::default());
    }

    let binary = config
        .binary
        .as_deref()
        .ok_or_else(|| Error::config("db_test selector requires `binary`"))?;
    let names = explorer.list_dbtests(binary)?;

    let (selected, excluded): (Vec<_>, Vec<_>) = names.into_iter().partition(|name| {
        config.include_suites.is_empty()
            || config
                .include_suites
                .iter()
                .any(|pattern| explorer.fnmatchcase(name, pattern))
    });

    let mut selection = Selection {
        selected,
        excluded,
        groups: None,
    };
    if opts.order_tests_by_name {
        selection.selected.sort_by_key(|name| name.to_lowercase());
    }
    Ok(selection)
}

/// Assemble a flat selection into rolling groups of `group_size`.
///
/// The corpus is shuffled once; whenever the queue runs out mid-group it is
/// refilled with a reshuffled copy of the corpus, so a test may appear in
/// more than one group. Total test-uses is `len * multiplier`, rounded up.
/// Without a `group_size` (command-line invocation) the whole selection is a
/// single group.
fn make_groups(
    selected: &[String],
    group_size: Option<usize>,
    multiplier: f64,
    seed: Option<u64>,
) -> Vec<Vec<String>> {
    let Some(group_size) = group_size else {
        return vec![selected.to_vec()];
    };
    if selected.is_empty() {
        return Vec::new();
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let total_uses = ((selected.len() as f64) * multiplier).ceil() as usize;
    let mut corpus = selected.to_vec();
    corpus.shuffle(&mut rng);
    let mut queue: VecDeque<String> = corpus.into();

    let mut groups = Vec::new();
    let mut used = 0;
    while used < total_uses {
        let mut group = Vec::new();
        while group.len() < group_size && used < total_uses {
            if queue.is_empty() {
                let mut refill = selected.to_vec();
                refill.shuffle(&mut rng);
                queue.extend(refill);
            }
            group.push(queue.pop_front().expect("queue refilled above"));
            used += 1;
        }
        groups.push(group);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use globset::GlobBuilder;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    /// In-memory explorer: a set of files with optional inline tags, plus a
    /// canned db-test listing.
    #[derive(Default)]
    struct FakeExplorer {
        files: BTreeMap<String, Vec<String>>,
        dbtests: Option<Result<Vec<String>>>,
        tag_files: HashMap<String, HashMap<String, Vec<String>>>,
    }

    impl FakeExplorer {
        fn with_files(entries: &[(&str, &[&str])]) -> Self {
            let mut files = BTreeMap::new();
            for (path, tags) in entries {
                files.insert(
                    path.to_string(),
                    tags.iter().map(|t| t.to_string()).collect(),
                );
            }
            Self {
                files,
                ..Self::default()
            }
        }
    }

    impl TestFileExplorer for FakeExplorer {
        fn glob(&self, pattern: &str) -> Result<Vec<String>> {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|err| Error::config(err.to_string()))?
                .compile_matcher();
            Ok(self
                .files
                .keys()
                .filter(|path| glob.is_match(path))
                .cloned()
                .collect())
        }

        fn isfile(&self, path: &str) -> bool {
            self.files.contains_key(path)
        }

        fn read_root_file(&self, _path: &str) -> Result<Vec<String>> {
            unimplemented!("tests use explicit roots")
        }

        fn jstest_tags(&self, path: &str) -> Result<Vec<String>> {
            Ok(self.files.get(path).cloned().unwrap_or_default())
        }

        fn parse_tag_files(
            &self,
            _kind: &str,
            tag_files: &[String],
            accumulator: &mut HashMap<String, Vec<String>>,
        ) -> Result<()> {
            for file in tag_files {
                if let Some(entries) = self.tag_files.get(file) {
                    for (path, tags) in entries {
                        accumulator
                            .entry(path.clone())
                            .or_default()
                            .extend(tags.iter().cloned());
                    }
                }
            }
            Ok(())
        }

        fn list_dbtests(&self, _binary: &str) -> Result<Vec<String>> {
            match &self.dbtests {
                Some(Ok(names)) => Ok(names.clone()),
                Some(Err(_)) => Err(Error::internal("dbtest binary exited non-zero")),
                None => Ok(Vec::new()),
            }
        }
    }

    fn config_yaml(yaml: &str) -> SelectorConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn include_and_exclude_files_partition_the_roots() {
        let explorer = FakeExplorer::with_files(&[
            ("dir/subdir1/a.js", &[]),
            ("dir/subdir1/b.js", &[]),
            ("dir/subdir2/c.js", &[]),
        ]);
        let config = config_yaml(
            "roots: [dir/subdir1/*.js, dir/subdir2/*.js]\nexclude_files: [dir/subdir1/a.js]\n",
        );

        let selection =
            select_tests(TestKind::JsTest, &config, &explorer, &SelectOptions::default()).unwrap();
        assert_eq!(
            selection.selected,
            names(&["dir/subdir1/b.js", "dir/subdir2/c.js"])
        );
        assert_eq!(selection.excluded, names(&["dir/subdir1/a.js"]));
    }

    #[test]
    fn all_of_tag_expression_requires_every_tag() {
        let explorer = FakeExplorer::with_files(&[
            ("a.js", &["t1", "t2"]),
            ("b.js", &["t1"]),
            ("c.js", &["t2"]),
        ]);
        let config = config_yaml(
            "roots: ['*.js']\ninclude_tags: { $allOf: [t1, t2] }\n",
        );

        let selection =
            select_tests(TestKind::JsTest, &config, &explorer, &SelectOptions::default()).unwrap();
        assert_eq!(selection.selected, names(&["a.js"]));
        assert_eq!(selection.excluded, names(&["b.js", "c.js"]));
    }

    #[test]
    fn force_include_overrides_tag_exclusion() {
        let explorer = FakeExplorer::with_files(&[
            ("a.js", &["t1", "t2"]),
            ("b.js", &["t1"]),
            ("c.js", &["t2"]),
        ]);
        let config = config_yaml(
            "roots: ['*.js']\nexclude_tags: t1\ninclude_files: [a.js]\n",
        );

        let selection =
            select_tests(TestKind::JsTest, &config, &explorer, &SelectOptions::default()).unwrap();
        assert_eq!(selection.selected, names(&["a.js"]));
        assert_eq!(selection.excluded, names(&["c.js", "b.js"]));
    }

    #[test]
    fn selection_and_exclusion_partition_the_expansion() {
        let explorer = FakeExplorer::with_files(&[
            ("a.js", &["t1"]),
            ("b.js", &["t2"]),
            ("c.js", &[]),
        ]);
        let config = config_yaml("roots: ['*.js']\nexclude_with_any_tags: [t1]\n");

        let selection =
            select_tests(TestKind::JsTest, &config, &explorer, &SelectOptions::default()).unwrap();

        let mut union: Vec<String> = selection
            .selected
            .iter()
            .chain(&selection.excluded)
            .cloned()
            .collect();
        union.sort();
        assert_eq!(union, names(&["a.js", "b.js", "c.js"]));
        assert!(selection
            .selected
            .iter()
            .all(|entry| !selection.excluded.contains(entry)));
    }

    #[test]
    fn empty_filter_lists_are_no_ops() {
        let explorer = FakeExplorer::with_files(&[("a.js", &[]), ("b.js", &[])]);
        let plain = config_yaml("roots: ['*.js']\n");
        let with_empty = config_yaml("roots: ['*.js']\ninclude_files: []\nexclude_files: []\n");

        let opts = SelectOptions::default();
        assert_eq!(
            select_tests(TestKind::JsTest, &plain, &explorer, &opts).unwrap(),
            select_tests(TestKind::JsTest, &with_empty, &explorer, &opts).unwrap()
        );
    }

    #[test]
    fn exclude_entry_matching_nothing_is_an_error() {
        let explorer = FakeExplorer::with_files(&[("a.js", &[])]);
        let config = config_yaml("roots: ['*.js']\nexclude_files: [missing.js]\n");
        let err = select_tests(
            TestKind::JsTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn include_files_is_permissive_about_missing_entries() {
        let explorer = FakeExplorer::with_files(&[("a.js", &[])]);
        let config = config_yaml("roots: ['*.js']\ninclude_files: [a.js, missing.js]\n");
        let selection = select_tests(
            TestKind::JsTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert_eq!(selection.selected, names(&["a.js"]));
    }

    #[test]
    fn non_glob_roots_must_exist() {
        let explorer = FakeExplorer::with_files(&[("a.js", &[])]);
        let config = config_yaml("roots: [missing.js]\n");
        let err = select_tests(
            TestKind::JsTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn duplicates_preserved_only_for_explicit_cli_paths() {
        let explorer = FakeExplorer::with_files(&[("a.js", &[])]);
        let config = config_yaml("roots: [a.js, a.js]\n");
        let selection = select_tests(
            TestKind::JsTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert_eq!(selection.selected, names(&["a.js"]));

        let opts = SelectOptions {
            cli_test_files: names(&["a.js", "a.js"]),
            ..SelectOptions::default()
        };
        let selection = select_tests(TestKind::JsTest, &config, &explorer, &opts).unwrap();
        assert_eq!(selection.selected, names(&["a.js", "a.js"]));
    }

    #[test]
    fn unsorted_selection_preserves_input_order() {
        let explorer = FakeExplorer::with_files(&[("b.js", &[]), ("a.js", &[])]);
        let config = config_yaml("roots: [b.js, a.js]\n");
        let opts = SelectOptions {
            order_tests_by_name: false,
            ..SelectOptions::default()
        };
        let selection = select_tests(TestKind::JsTest, &config, &explorer, &opts).unwrap();
        assert_eq!(selection.selected, names(&["b.js", "a.js"]));
    }

    #[test]
    fn tag_file_tags_union_with_inline_tags() {
        let mut explorer = FakeExplorer::with_files(&[("a.js", &["inline"]), ("b.js", &[])]);
        explorer.tag_files.insert(
            "extra.yml".to_string(),
            HashMap::from([("b.js".to_string(), vec!["filed".to_string()])]),
        );
        let config = config_yaml(
            "roots: ['*.js']\ninclude_with_any_tags: [inline, filed]\ntag_files: [extra.yml]\n",
        );
        let selection = select_tests(
            TestKind::JsTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert_eq!(selection.selected, names(&["a.js", "b.js"]));
    }

    #[test]
    fn multi_js_grouping_builds_a_rolling_queue() {
        let explorer = FakeExplorer::with_files(&[
            ("w1.js", &[]),
            ("w2.js", &[]),
            ("w3.js", &[]),
            ("w4.js", &[]),
        ]);
        let config = config_yaml(
            "roots: ['*.js']\ngroup_size: 3\ngroup_count_multiplier: 2\n",
        );
        let opts = SelectOptions {
            shuffle_seed: Some(42),
            ..SelectOptions::default()
        };
        let selection =
            select_tests(TestKind::ParallelFsmWorkloadTest, &config, &explorer, &opts).unwrap();

        let groups = selection.groups.unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 3);
        assert_eq!(groups[2].len(), 2);

        let corpus: HashSet<&str> = ["w1.js", "w2.js", "w3.js", "w4.js"].into();
        for group in &groups {
            for test in group {
                assert!(corpus.contains(test.as_str()));
            }
        }
    }

    #[test]
    fn multi_js_without_group_size_is_a_single_group() {
        let explorer = FakeExplorer::with_files(&[("w1.js", &[]), ("w2.js", &[])]);
        let config = config_yaml("roots: ['*.js']\n");
        let selection = select_tests(
            TestKind::ParallelFsmWorkloadTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert_eq!(
            selection.groups,
            Some(vec![names(&["w1.js", "w2.js"])])
        );
    }

    #[test]
    fn db_tests_with_any_tags_select_nothing() {
        let mut explorer = FakeExplorer::default();
        explorer.dbtests = Some(Ok(names(&["BasicTest", "IndexTest"])));
        let config = config_yaml("binary: build/dbtest\ninclude_with_any_tags: [t1]\n");
        let selection = select_tests(
            TestKind::DbTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert!(selection.selected.is_empty());
        assert!(selection.excluded.is_empty());
    }

    #[test]
    fn db_tests_filter_by_include_suites() {
        let mut explorer = FakeExplorer::default();
        explorer.dbtests = Some(Ok(names(&["IndexTest", "QueryTest", "IndexBuild"])));
        let config = config_yaml("binary: build/dbtest\ninclude_suites: ['Index*']\n");
        let selection = select_tests(
            TestKind::DbTest,
            &config,
            &explorer,
            &SelectOptions::default(),
        )
        .unwrap();
        assert_eq!(selection.selected, names(&["IndexBuild", "IndexTest"]));
        assert_eq!(selection.excluded, names(&["QueryTest"]));
    }

    #[test]
    fn explicit_cli_paths_bypass_the_pipeline_for_db_tests() {
        let explorer = FakeExplorer::default();
        let config = config_yaml("binary: build/dbtest\nexclude_files: [whatever]\n");
        let opts = SelectOptions {
            cli_test_files: names(&["OnlyThis"]),
            ..SelectOptions::default()
        };
        let selection = select_tests(TestKind::DbTest, &config, &explorer, &opts).unwrap();
        assert_eq!(selection.selected, names(&["OnlyThis"]));
    }
}
