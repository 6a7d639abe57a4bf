//! Persistent mapping of test patterns to tags.
//!
//! Serialized as YAML with insertion order preserved:
//!
//! ```yaml
//! selector:
//!   js_test:
//!     jstests/core/*.js:
//!       - requires_sharding
//! ```

use std::cmp::Ordering;
use std::fs;
use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use shoal_core::{Error, Result};

type PatternTags = IndexMap<String, Vec<String>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagsConfig {
    #[serde(default)]
    selector: IndexMap<String, PatternTags>,
}

impl TagsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_str(&raw)
            .map_err(|err| Error::config(format!("failed to parse {}: {err}", path.display())))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|err| Error::config(format!("malformed tag file: {err}")))
    }

    /// Patterns registered for `kind`, in definition order.
    pub fn get_test_patterns(&self, kind: &str) -> Vec<String> {
        self.selector
            .get(kind)
            .map(|patterns| patterns.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tags attached to `pattern` under `kind`; empty when absent.
    pub fn get_tags(&self, kind: &str, pattern: &str) -> Vec<String> {
        self.selector
            .get(kind)
            .and_then(|patterns| patterns.get(pattern))
            .cloned()
            .unwrap_or_default()
    }

    /// Attach `tag` to `pattern` under `kind`.
    ///
    /// Returns true when the tag was inserted, false when it was already
    /// present. On insertion the pattern's tag list is re-sorted with `cmp`
    /// (string order when `None`).
    pub fn add_tag(
        &mut self,
        kind: &str,
        pattern: &str,
        tag: &str,
        cmp: Option<&dyn Fn(&str, &str) -> Ordering>,
    ) -> bool {
        let tags = self
            .selector
            .entry(kind.to_string())
            .or_default()
            .entry(pattern.to_string())
            .or_default();

        if tags.iter().any(|existing| existing == tag) {
            return false;
        }

        tags.push(tag.to_string());
        match cmp {
            Some(cmp) => tags.sort_by(|a, b| cmp(a, b)),
            None => tags.sort(),
        }
        true
    }

    /// Dump the configuration to `path`, optionally preceded by a wrapped
    /// preamble comment. Mappings serialize in insertion order.
    pub fn write_file(&self, path: &Path, preamble: Option<&str>) -> Result<()> {
        let mut file = fs::File::create(path)?;
        if let Some(preamble) = preamble {
            for line in wrap_comment(preamble, 100) {
                writeln!(file, "# {line}")?;
            }
        }
        let body = serde_yaml::to_string(self)
            .map_err(|err| Error::internal(format!("failed to serialize tag file: {err}")))?;
        file.write_all(body.as_bytes())?;
        Ok(())
    }
}

fn wrap_comment(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > width {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}
