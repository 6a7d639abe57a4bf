//! Data-access facade for the selector.
//!
//! Everything the selection pipeline learns about the outside world (file
//! existence, glob expansion, tag files, inline JS tags, external binary
//! enumeration) goes through [`TestFileExplorer`], so tests can substitute a
//! fake and the pipeline stays purely functional.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use globset::GlobBuilder;

use shoal_core::{Error, Result};
use shoal_globber::GlobCache;
use shoal_process::{run_command, RunOptions};

use crate::tags_config::TagsConfig;

pub trait TestFileExplorer {
    fn is_glob_pattern(&self, s: &str) -> bool {
        shoal_globber::is_glob_pattern(s)
    }

    /// Expand a glob pattern into normalized paths.
    fn glob(&self, pattern: &str) -> Result<Vec<String>>;

    /// Predicate on a real file.
    fn isfile(&self, path: &str) -> bool;

    /// One string per non-empty, whitespace-trimmed line of `path`.
    fn read_root_file(&self, path: &str) -> Result<Vec<String>>;

    /// Inline tags extracted from the head of a JS test file.
    fn jstest_tags(&self, path: &str) -> Result<Vec<String>>;

    /// Case-sensitive fnmatch: `*` and `?` match across path separators.
    fn fnmatchcase(&self, name: &str, pattern: &str) -> bool {
        fnmatchcase(name, pattern)
    }

    /// Merge tag files for `kind` into `accumulator` (test path to tags).
    /// Later files extend earlier ones.
    fn parse_tag_files(
        &self,
        kind: &str,
        tag_files: &[String],
        accumulator: &mut HashMap<String, Vec<String>>,
    ) -> Result<()> {
        for tag_file in tag_files {
            let config = TagsConfig::from_file(Path::new(tag_file))?;
            for pattern in config.get_test_patterns(kind) {
                let tags = config.get_tags(kind, &pattern);
                let paths = if self.is_glob_pattern(&pattern) {
                    self.glob(&pattern)?
                } else {
                    vec![shoal_core::path::normalize(&pattern)]
                };
                for path in paths {
                    accumulator
                        .entry(path)
                        .or_default()
                        .extend(tags.iter().cloned());
                }
            }
        }
        Ok(())
    }

    /// Enumerate the tests inside an external test binary.
    fn list_dbtests(&self, binary: &str) -> Result<Vec<String>>;
}

/// Case-sensitive fnmatch over whole strings.
pub fn fnmatchcase(name: &str, pattern: &str) -> bool {
    GlobBuilder::new(pattern)
        .literal_separator(false)
        .build()
        .map(|glob| glob.compile_matcher().is_match(name))
        .unwrap_or(false)
}

/// Real file-system-backed explorer.
#[derive(Default)]
pub struct FsExplorer {
    globs: GlobCache,
}

impl FsExplorer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TestFileExplorer for FsExplorer {
    fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.globs.glob(pattern)?.as_slice().to_vec())
    }

    fn isfile(&self, path: &str) -> bool {
        Path::new(path).is_file()
    }

    fn read_root_file(&self, path: &str) -> Result<Vec<String>> {
        let raw = fs::read_to_string(path)?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn jstest_tags(&self, path: &str) -> Result<Vec<String>> {
        let raw = fs::read_to_string(path)?;
        parse_js_inline_tags(&raw)
            .map_err(|err| Error::config(format!("{path}: {err}")))
    }

    fn list_dbtests(&self, binary: &str) -> Result<Vec<String>> {
        let args = vec!["--list".to_string()];
        let result = run_command(Path::new(binary), &args, RunOptions::default())?;
        if !result.status.success() {
            return Err(Error::internal(format!(
                "{binary} failed to enumerate tests (exit status {}): {}",
                result.status, result.output.stderr
            )));
        }
        Ok(result
            .output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Extract tags from a leading `/** @tags: [a, b] */` block comment.
///
/// Anything before the comment other than whitespace or line comments means
/// the file carries no inline tags. The tag list may span multiple lines.
fn parse_js_inline_tags(source: &str) -> std::result::Result<Vec<String>, String> {
    let mut rest = source;
    loop {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("//") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
            continue;
        }
        break;
    }

    let Some(comment_start) = rest.strip_prefix("/*") else {
        return Ok(Vec::new());
    };
    let Some(end) = comment_start.find("*/") else {
        return Err("unterminated block comment".to_string());
    };
    let comment = &comment_start[..end];

    let Some(after_marker) = comment.split_once("@tags:").map(|(_, tail)| tail) else {
        return Ok(Vec::new());
    };
    let after_marker = after_marker.trim_start();
    let Some(list) = after_marker.strip_prefix('[') else {
        return Err("expected '[' after @tags:".to_string());
    };
    let Some(end) = list.find(']') else {
        return Err("unterminated @tags list".to_string());
    };

    let mut tags = Vec::new();
    for item in list[..end].split(',') {
        // Each line of a multi-line list may carry a leading `*` gutter.
        let item = item
            .trim()
            .trim_start_matches('*')
            .trim()
            .trim_matches(|c| c == '"' || c == '\'');
        if !item.is_empty() {
            tags.push(item.to_string());
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_single_line_tag_annotations() {
        let source = "/** @tags: [requires_sharding, slow] */\nassert(true);\n";
        assert_eq!(
            parse_js_inline_tags(source).unwrap(),
            vec!["requires_sharding", "slow"]
        );
    }

    #[test]
    fn parses_multi_line_tag_annotations() {
        let source = r#"// Top-of-file comment.
/**
 * @tags: [
 *   requires_replication,
 *   'uses_transactions',
 * ]
 */
let x = 1;
"#;
        assert_eq!(
            parse_js_inline_tags(source).unwrap(),
            vec!["requires_replication", "uses_transactions"]
        );
    }

    #[test]
    fn files_without_annotations_have_no_tags() {
        assert!(parse_js_inline_tags("let x = 1;\n").unwrap().is_empty());
        assert!(parse_js_inline_tags("/* just a comment */\n").unwrap().is_empty());
    }

    #[test]
    fn malformed_annotations_are_errors() {
        assert!(parse_js_inline_tags("/* @tags: requires_sharding */").is_err());
        assert!(parse_js_inline_tags("/* @tags: [a, b */").is_err());
    }

    #[test]
    fn fnmatchcase_is_case_sensitive_and_crosses_separators() {
        assert!(fnmatchcase("jstests/core/a.js", "jstests/*.js"));
        assert!(fnmatchcase("WiredTigerTest", "Wired*"));
        assert!(!fnmatchcase("wiredtigertest", "Wired*"));
        assert!(fnmatchcase("a/b/c", "a/?/c"));
    }

    #[test]
    fn read_root_file_trims_and_skips_blank_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("roots.txt");
        fs::write(&path, "  one.js \n\n two.js\n").unwrap();
        let explorer = FsExplorer::new();
        assert_eq!(
            explorer.read_root_file(path.to_str().unwrap()).unwrap(),
            vec!["one.js", "two.js"]
        );
    }
}
