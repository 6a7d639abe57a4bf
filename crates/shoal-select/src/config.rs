//! The selector configuration shape shared by every test kind.

use serde::Deserialize;

use shoal_core::{Error, Result};

use crate::expr::TagExpr;
use crate::kinds::{SelectionFamily, TestKind};

/// Immutable description of how to filter one kind of test.
///
/// Kind-specific fields (`group_size`, `binary`, ...) are rejected at
/// validation time when they appear under a kind that does not understand
/// them.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectorConfig {
    /// Path to a file listing test identifiers, one per line.
    /// Mutually exclusive with `roots`.
    pub root: Option<String>,
    /// Explicit list of test identifiers and/or glob patterns.
    pub roots: Option<Vec<String>>,

    #[serde(default)]
    pub include_files: Vec<String>,
    #[serde(default)]
    pub exclude_files: Vec<String>,

    /// Tag expression a test's tags must match. Mutually exclusive with
    /// `exclude_tags`.
    pub include_tags: Option<TagExpr>,
    /// Tag expression a test's tags must *not* match.
    pub exclude_tags: Option<TagExpr>,

    #[serde(default)]
    pub include_with_all_tags: Vec<String>,
    #[serde(default)]
    pub include_with_any_tags: Vec<String>,
    #[serde(default)]
    pub exclude_with_any_tags: Vec<String>,

    /// Tag files layering extra tags onto tests of this kind.
    #[serde(default)]
    pub tag_files: Vec<String>,

    // Multi-JS variant.
    pub group_size: Option<usize>,
    pub group_count_multiplier: Option<f64>,

    // DB-test variant.
    pub binary: Option<String>,
    #[serde(default)]
    pub include_suites: Vec<String>,
}

impl SelectorConfig {
    /// Check the invariants that hold for every kind, plus the kind-specific
    /// field restrictions.
    pub fn validate(&self, kind: TestKind) -> Result<()> {
        if self.root.is_some() && self.roots.is_some() {
            return Err(Error::config(
                "selector options `root` and `roots` are mutually exclusive",
            ));
        }
        if self.include_tags.is_some() && self.exclude_tags.is_some() {
            return Err(Error::config(
                "selector options `include_tags` and `exclude_tags` are mutually exclusive",
            ));
        }

        let family = kind.family();
        if (self.group_size.is_some() || self.group_count_multiplier.is_some())
            && family != SelectionFamily::MultiJs
        {
            return Err(Error::config(format!(
                "selector options `group_size`/`group_count_multiplier` are not valid for {kind}"
            )));
        }
        if (self.binary.is_some() || !self.include_suites.is_empty())
            && family != SelectionFamily::DbTest
        {
            return Err(Error::config(format!(
                "selector options `binary`/`include_suites` are not valid for {kind}"
            )));
        }
        if let Some(group_size) = self.group_size {
            if group_size == 0 {
                return Err(Error::config("`group_size` must be a positive integer"));
            }
        }
        Ok(())
    }

    /// The combined tag expression of steps 4's inputs, or `None` when no
    /// tag-based filtering was requested.
    ///
    /// `extra_include_any` / `extra_exclude_any` come from the run-level
    /// configuration (command-line flags) and combine with the suite's own
    /// lists.
    pub fn combined_tag_expression(
        &self,
        extra_include_any: &[String],
        extra_exclude_any: &[String],
    ) -> Option<TagExpr> {
        let mut clauses = Vec::new();
        if let Some(include) = &self.include_tags {
            clauses.push(include.clone());
        }
        if !self.include_with_all_tags.is_empty() {
            clauses.push(TagExpr::all_of_tags(&self.include_with_all_tags));
        }
        let include_any: Vec<String> = self
            .include_with_any_tags
            .iter()
            .chain(extra_include_any)
            .cloned()
            .collect();
        if !include_any.is_empty() {
            clauses.push(TagExpr::any_of_tags(&include_any));
        }
        if let Some(exclude) = &self.exclude_tags {
            clauses.push(TagExpr::Not(Box::new(exclude.clone())));
        }
        let exclude_any: Vec<String> = self
            .exclude_with_any_tags
            .iter()
            .chain(extra_exclude_any)
            .cloned()
            .collect();
        if !exclude_any.is_empty() {
            clauses.push(TagExpr::Not(Box::new(TagExpr::any_of_tags(&exclude_any))));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(TagExpr::AllOf(clauses))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_yaml(yaml: &str) -> SelectorConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn root_and_roots_are_mutually_exclusive() {
        let config = from_yaml("root: roots.txt\nroots: [a.js]\n");
        assert!(config.validate(TestKind::JsTest).is_err());
    }

    #[test]
    fn include_and_exclude_tags_are_mutually_exclusive() {
        let config = from_yaml("roots: [a.js]\ninclude_tags: t1\nexclude_tags: t2\n");
        assert!(config.validate(TestKind::JsTest).is_err());
    }

    #[test]
    fn kind_specific_fields_are_rejected_elsewhere() {
        let config = from_yaml("roots: [a.js]\ngroup_size: 3\n");
        assert!(config.validate(TestKind::JsTest).is_err());
        assert!(config.validate(TestKind::ParallelFsmWorkloadTest).is_ok());

        let config = from_yaml("binary: build/dbtest\n");
        assert!(config.validate(TestKind::JsTest).is_err());
        assert!(config.validate(TestKind::DbTest).is_ok());
    }

    #[test]
    fn unknown_selector_fields_fail_to_parse() {
        let err = serde_yaml::from_str::<SelectorConfig>("rots: [a.js]\n");
        assert!(err.is_err());
    }

    #[test]
    fn combined_expression_folds_all_inputs() {
        let config = from_yaml(
            "roots: [a.js]\ninclude_tags: t1\nexclude_with_any_tags: [t2]\n",
        );
        let expr = config
            .combined_tag_expression(&[], &["t3".to_string()])
            .unwrap();

        let matching: std::collections::HashSet<String> =
            ["t1".to_string()].into_iter().collect();
        assert!(expr.matches(&matching));

        for blocked in ["t2", "t3"] {
            let set: std::collections::HashSet<String> =
                ["t1".to_string(), blocked.to_string()].into_iter().collect();
            assert!(!expr.matches(&set), "expected {blocked} to exclude");
        }
    }

    #[test]
    fn no_tag_options_means_no_expression() {
        let config = from_yaml("roots: [a.js]\n");
        assert!(config.combined_tag_expression(&[], &[]).is_none());
    }
}
