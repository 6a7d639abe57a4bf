//! Glob expansion with `**` support and per-pattern memoization.
//!
//! Patterns are POSIX-style globs where `*`, `?` and `[...]` match within a
//! single path component and `**` matches zero or more components. Results
//! are normalized (single separators, no trailing slash, no `.` components)
//! and sorted.
//!
//! The same patterns are evaluated many times during selection (roots,
//! excludes, tag files), so expansions are memoized keyed by the exact
//! pattern string.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use parking_lot::Mutex;
use walkdir::WalkDir;

use shoal_core::path::{normalize, split};
use shoal_core::{Error, Result};

/// Returns true when `s` contains glob metacharacters.
pub fn is_glob_pattern(s: &str) -> bool {
    s.contains('*') || s.contains('?') || s.contains('[')
}

/// Memoizing glob expander.
#[derive(Default)]
pub struct GlobCache {
    memo: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl GlobCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expand `pattern` lazily. The iterator is restartable: calling `iglob`
    /// again with the same pattern replays the memoized expansion.
    pub fn iglob(&self, pattern: &str) -> Result<impl Iterator<Item = String>> {
        let results = self.glob(pattern)?;
        Ok(GlobIter { results, index: 0 })
    }

    /// Expand `pattern` into a sorted, normalized list of matching paths.
    pub fn glob(&self, pattern: &str) -> Result<Arc<Vec<String>>> {
        if let Some(cached) = self.memo.lock().get(pattern) {
            return Ok(Arc::clone(cached));
        }

        let results = Arc::new(expand(pattern)?);
        self.memo
            .lock()
            .insert(pattern.to_string(), Arc::clone(&results));
        Ok(results)
    }
}

struct GlobIter {
    results: Arc<Vec<String>>,
    index: usize,
}

impl Iterator for GlobIter {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let item = self.results.get(self.index)?.clone();
        self.index += 1;
        Some(item)
    }
}

fn expand(pattern: &str) -> Result<Vec<String>> {
    let normalized = normalize(pattern);
    let (root, components): (&str, Vec<&str>) = if let Some(rest) = normalized.strip_prefix('/') {
        ("/", rest.split('/').collect())
    } else {
        (".", normalized.split('/').collect())
    };

    let mut results = Vec::new();
    walk(Path::new(root), &components, &mut results)?;

    // Compatibility rule: a pattern whose basename is exactly `**` that
    // matched nothing emits its dirname, provided the dirname exists.
    if results.is_empty() {
        let (dirname, basename) = split(&normalized);
        if basename == "**" {
            let dir = if dirname.is_empty() { "." } else { dirname };
            if Path::new(dir).is_dir() {
                results.push(normalize(dir));
            }
        }
    }

    results.sort();
    results.dedup();
    Ok(results)
}

fn walk(dir: &Path, components: &[&str], out: &mut Vec<String>) -> Result<()> {
    let Some((head, rest)) = components.split_first() else {
        return Ok(());
    };

    if *head == "**" {
        if rest.is_empty() {
            // One or more components: every descendant, but not `dir` itself.
            // An empty directory therefore matches nothing here and is picked
            // up by the dirname fallback in `expand`.
            for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
                let entry = entry.map_err(io_error)?;
                out.push(normalize(&entry.path().to_string_lossy()));
            }
        } else {
            // Zero components: keep matching in the current directory.
            walk(dir, rest, out)?;
            for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
                let entry = entry.map_err(io_error)?;
                if entry.file_type().is_dir() {
                    walk(entry.path(), rest, out)?;
                }
            }
        }
        return Ok(());
    }

    if is_glob_pattern(head) {
        let matcher = compile_component(head)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            // Glob components do not match hidden entries unless the pattern
            // itself starts with a dot.
            if name.starts_with('.') && !head.starts_with('.') {
                continue;
            }
            if !matcher.is_match(name.as_ref()) {
                continue;
            }
            let path = entry.path();
            if rest.is_empty() {
                out.push(normalize(&path.to_string_lossy()));
            } else if path.is_dir() {
                walk(&path, rest, out)?;
            }
        }
        return Ok(());
    }

    let next = dir.join(head);
    if rest.is_empty() {
        if next.exists() {
            out.push(normalize(&next.to_string_lossy()));
        }
    } else if next.is_dir() {
        walk(&next, rest, out)?;
    }
    Ok(())
}

fn compile_component(pattern: &str) -> Result<GlobMatcher> {
    let glob = GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map_err(|err| Error::config(format!("invalid glob pattern {pattern:?}: {err}")))?;
    Ok(glob.compile_matcher())
}

fn io_error(err: walkdir::Error) -> Error {
    match err.into_io_error() {
        Some(io) => Error::Io(io),
        None => Error::internal("file tree walk produced a non-io error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    struct Cwd {
        previous: std::path::PathBuf,
    }

    // Glob expansion is relative to the working directory, matching how test
    // identifiers are written in suite files. Tests serialize on a lock since
    // the working directory is process-global.
    fn in_dir(dir: &Path) -> (Cwd, parking_lot::MutexGuard<'static, ()>) {
        static LOCK: Mutex<()> = Mutex::new(());
        let guard = LOCK.lock();
        let previous = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        (Cwd { previous }, guard)
    }

    impl Drop for Cwd {
        fn drop(&mut self) {
            std::env::set_current_dir(&self.previous).unwrap();
        }
    }

    #[test]
    fn star_matches_within_a_single_component() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/a.js"));
        touch(&tmp.path().join("dir/b.js"));
        touch(&tmp.path().join("dir/sub/c.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        let results = cache.glob("dir/*.js").unwrap();
        assert_eq!(results.as_slice(), &["dir/a.js", "dir/b.js"]);
    }

    #[test]
    fn double_star_matches_zero_or_more_components() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/a.js"));
        touch(&tmp.path().join("dir/sub/deep/b.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        let results = cache.glob("dir/**/*.js").unwrap();
        assert_eq!(
            results.as_slice(),
            &["dir/a.js", "dir/sub/deep/b.js"]
        );
    }

    #[test]
    fn trailing_double_star_yields_all_files() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/a.js"));
        touch(&tmp.path().join("dir/sub/b.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        let results = cache.glob("dir/**").unwrap();
        assert_eq!(
            results.as_slice(),
            &["dir/a.js", "dir/sub", "dir/sub/b.js"]
        );
    }

    #[test]
    fn trailing_double_star_falls_back_to_dirname() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("empty")).unwrap();
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        assert_eq!(cache.glob("empty/**").unwrap().as_slice(), &["empty"]);
        assert!(cache.glob("missing/**").unwrap().is_empty());
    }

    #[test]
    fn literal_paths_must_exist() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/a.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        assert_eq!(cache.glob("dir/a.js").unwrap().as_slice(), &["dir/a.js"]);
        assert!(cache.glob("dir/missing.js").unwrap().is_empty());
    }

    #[test]
    fn expansion_is_memoized_by_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/a.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        assert_eq!(cache.glob("dir/*.js").unwrap().len(), 1);

        // A file created after the first expansion is not observed.
        touch(&tmp.path().join("dir/b.js"));
        assert_eq!(cache.glob("dir/*.js").unwrap().len(), 1);

        // The iterator is restartable across calls.
        let first: Vec<_> = cache.iglob("dir/*.js").unwrap().collect();
        let second: Vec<_> = cache.iglob("dir/*.js").unwrap().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn hidden_entries_are_not_matched_by_globs() {
        let tmp = tempfile::tempdir().unwrap();
        touch(&tmp.path().join("dir/.hidden.js"));
        touch(&tmp.path().join("dir/a.js"));
        let (_cwd, _guard) = in_dir(tmp.path());

        let cache = GlobCache::new();
        assert_eq!(cache.glob("dir/*.js").unwrap().as_slice(), &["dir/a.js"]);
    }
}
