// src/core/path_set.rs

use indexmap::IndexSet;
use std::path::PathBuf;

/// The platform separator of search-path lists.
pub const PATH_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };

/// Directories an environment prepends to the inherited search path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathSet {
    paths: Vec<PathBuf>,
}

impl PathSet {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub fn replace(&mut self, paths: Vec<PathBuf>) {
        self.paths = paths;
    }

    /// Joins the owned directories with `inherited` (a separator-delimited list), dropping
    /// duplicates and empty segments. The first occurrence of a directory keeps its place.
    pub fn compute(&self, inherited: Option<&str>) -> String {
        let mut entries: IndexSet<String> = self
            .paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        entries.extend(
            inherited
                .unwrap_or_default()
                .split(PATH_SEPARATOR)
                .filter(|segment| !segment.is_empty())
                .map(str::to_string),
        );
        entries
            .into_iter()
            .collect::<Vec<_>>()
            .join(&PATH_SEPARATOR.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(parts: &[&str]) -> String {
        parts.join(&PATH_SEPARATOR.to_string())
    }

    #[test]
    fn test_compute_prepends_and_deduplicates() {
        let set = PathSet::new(vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        let inherited = joined(&["/b", "/c"]);

        assert_eq!(set.compute(Some(&inherited)), joined(&["/a", "/b", "/c"]));
    }

    #[test]
    fn test_compute_without_inherited_path() {
        let set = PathSet::new(vec![PathBuf::from("/a"), PathBuf::from("/a")]);

        assert_eq!(set.compute(None), "/a");
        assert_eq!(PathSet::default().compute(Some("")), "");
    }

    #[test]
    fn test_compute_skips_empty_segments() {
        let set = PathSet::default();
        let inherited = joined(&["/x", "", "/y", "/x"]);

        assert_eq!(set.compute(Some(&inherited)), joined(&["/x", "/y"]));
    }
}
