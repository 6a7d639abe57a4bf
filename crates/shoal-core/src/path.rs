//! Path normalization helpers.
//!
//! Test identifiers and glob patterns are POSIX-style strings throughout the
//! harness; normalization keeps selection, exclusion and tag-file matching
//! comparable by string equality.

/// Normalize a POSIX-style path string: collapse repeated separators, drop
/// redundant `.` components, and strip any trailing slash.
///
/// `normalize("")` and `normalize(".")` both return `"."`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut components: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => continue,
            other => components.push(other),
        }
    }

    let joined = components.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Split a normalized pattern into its dirname and basename.
///
/// Mirrors `os.path.split` for the patterns the globber accepts: the dirname
/// of a single-component pattern is `""`.
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => ("", path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_separators_and_dots() {
        assert_eq!(normalize("a//b/./c/"), "a/b/c");
        assert_eq!(normalize("./a/b"), "a/b");
        assert_eq!(normalize("/a//b"), "/a/b");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("."), ".");
    }

    #[test]
    fn split_separates_dirname_and_basename() {
        assert_eq!(split("a/b/c"), ("a/b", "c"));
        assert_eq!(split("c"), ("", "c"));
        assert_eq!(split("a/**"), ("a", "**"));
    }
}
