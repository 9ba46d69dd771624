//! Materialized path computation.
//!
//! # Responsibility
//! - Derive a node path from its parent path and own id.
//! - Answer ancestry questions from path strings alone, without I/O.
//!
//! # Invariants
//! - A root path equals the node id.
//! - A child path equals `parent_path + separator + id`.
//! - `A` is an ancestor of `B` iff `B.path` starts with `A.path + separator`.

/// Path arithmetic for one separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathModel {
    separator: char,
}

impl PathModel {
    pub fn new(separator: char) -> Self {
        Self { separator }
    }

    pub fn separator(&self) -> char {
        self.separator
    }

    pub fn root_path(&self, id: &str) -> String {
        id.to_string()
    }

    pub fn child_path(&self, parent_path: &str, id: &str) -> String {
        let mut path = String::with_capacity(parent_path.len() + id.len() + 1);
        path.push_str(parent_path);
        path.push(self.separator);
        path.push_str(id);
        path
    }

    /// Ancestor ids from root down, excluding the node itself.
    pub fn ancestor_ids<'a>(&self, path: &'a str) -> Vec<&'a str> {
        let mut segments: Vec<&str> = path.split(self.separator).collect();
        segments.pop();
        segments
    }

    /// Number of segments; 0 for a node that has no path yet.
    pub fn depth(&self, path: Option<&str>) -> usize {
        match path {
            Some(value) if !value.is_empty() => value.split(self.separator).count(),
            _ => 0,
        }
    }

    /// First segment of a path.
    pub fn root_id<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.split(self.separator).next().filter(|id| !id.is_empty())
    }

    /// Prefix that every descendant path of `path` starts with.
    pub fn descendant_prefix(&self, path: &str) -> String {
        let mut prefix = String::with_capacity(path.len() + 1);
        prefix.push_str(path);
        prefix.push(self.separator);
        prefix
    }

    pub fn is_descendant_prefix(&self, candidate_path: &str, ancestor_path: &str) -> bool {
        candidate_path.len() > ancestor_path.len() + self.separator.len_utf8()
            && candidate_path.starts_with(ancestor_path)
            && candidate_path[ancestor_path.len()..].starts_with(self.separator)
    }

    /// Rewrites the `previous` prefix of `path` to `replacement`.
    ///
    /// Returns `None` when `path` does not live under `previous`.
    pub fn splice_prefix(&self, path: &str, previous: &str, replacement: &str) -> Option<String> {
        if !self.is_descendant_prefix(path, previous) {
            return None;
        }
        let mut spliced = String::with_capacity(replacement.len() + path.len() - previous.len());
        spliced.push_str(replacement);
        spliced.push_str(&path[previous.len()..]);
        Some(spliced)
    }

    /// Drops every segment equal to `id`.
    ///
    /// Returns `None` when `path` has no such segment.
    pub fn remove_segment(&self, path: &str, id: &str) -> Option<String> {
        let segments: Vec<&str> = path.split(self.separator).collect();
        if !segments.contains(&id) {
            return None;
        }
        let kept: Vec<&str> = segments.into_iter().filter(|segment| *segment != id).collect();
        let mut buffer = [0u8; 4];
        Some(kept.join(self.separator.encode_utf8(&mut buffer)))
    }

    pub fn contains_separator(&self, id: &str) -> bool {
        id.contains(self.separator)
    }
}

impl Default for PathModel {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PATH_SEPARATOR)
    }
}
