//! Directory listings synthesized from the flat reference namespace.
//!
//! References form a flat `path -> value` set; listings need a tree. The
//! cache splits every path on `/`, registers the full chain of
//! intermediate directories, and serves `ls`/`isdir`/`info` lookups until
//! the next mutation invalidates it.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// One listing row. `size` is `None` for whole-URL files until `info`
/// fills it in from the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Full path of the entry, not just the basename.
    pub name: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: Option<u64>) -> Self {
        DirEntry {
            name: name.into(),
            kind: EntryKind::File,
            size,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        DirEntry {
            name: name.into(),
            kind: EntryKind::Directory,
            size: Some(0),
        }
    }
}

#[derive(Debug, Default)]
pub struct DirCache {
    dirs: HashMap<String, Vec<DirEntry>>,
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(p, _)| p).unwrap_or("")
}

impl DirCache {
    /// Build the tree from `(path, declared size)` pairs.
    pub fn build(entries: impl IntoIterator<Item = (String, Option<u64>)>) -> Self {
        let mut cache = DirCache {
            dirs: HashMap::new(),
        };
        cache.dirs.insert(String::new(), Vec::new());
        for (path, size) in entries {
            let parent = parent_of(&path).to_string();
            cache.ensure_dir(&parent);
            cache
                .dirs
                .get_mut(&parent)
                .expect("parent registered above")
                .push(DirEntry::file(path, size));
        }
        for listing in cache.dirs.values_mut() {
            listing.sort_by(|a, b| a.name.cmp(&b.name));
        }
        cache
    }

    fn ensure_dir(&mut self, path: &str) {
        if self.dirs.contains_key(path) {
            return;
        }
        self.dirs.insert(path.to_string(), Vec::new());
        let parent = parent_of(path).to_string();
        self.ensure_dir(&parent);
        self.dirs
            .get_mut(&parent)
            .expect("parent registered above")
            .push(DirEntry::directory(path));
    }

    pub fn ls(&self, path: &str) -> Option<&[DirEntry]> {
        self.dirs.get(path).map(|v| v.as_slice())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains_key(path)
    }

    /// The file entry for `path`, if its parent directory lists one.
    pub fn entry(&self, path: &str) -> Option<&DirEntry> {
        self.dirs
            .get(parent_of(path))?
            .iter()
            .find(|e| e.name == path)
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DirCache {
        DirCache::build(vec![
            ("a/b/c/deep".to_string(), Some(4)),
            ("a/top".to_string(), Some(1)),
            ("root".to_string(), None),
        ])
    }

    #[test]
    fn intermediate_directories_are_created() {
        let c = cache();
        assert!(c.is_dir(""));
        assert!(c.is_dir("a"));
        assert!(c.is_dir("a/b"));
        assert!(c.is_dir("a/b/c"));
        assert!(!c.is_dir("a/top"));
    }

    #[test]
    fn every_directory_is_listed_in_its_parent() {
        let c = cache();
        let root: Vec<&str> = c.ls("").unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(root, vec!["a", "root"]);
        let a: Vec<&str> = c.ls("a").unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(a, vec!["a/b", "a/top"]);
        assert_eq!(c.ls("a/b/c").unwrap().len(), 1);
    }

    #[test]
    fn file_entries_carry_sizes() {
        let c = cache();
        assert_eq!(c.entry("a/b/c/deep").unwrap().size, Some(4));
        assert_eq!(c.entry("root").unwrap().size, None);
        assert_eq!(c.entry("a/b").unwrap().kind, EntryKind::Directory);
        assert!(c.entry("missing").is_none());
    }
}
