//! Eagerly loaded in-memory reference map.

use indexmap::IndexMap;

use crate::reference::Reference;

/// `path -> Reference`, fully resident. Built from a parsed JSON spec;
/// later insertions of an existing key override the earlier value.
#[derive(Debug, Default)]
pub struct EagerRefMap {
    refs: IndexMap<String, Reference>,
}

impl EagerRefMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Reference> {
        self.refs.get(key)
    }

    pub fn put(&mut self, key: String, value: Reference) {
        self.refs.insert(key, value);
    }

    /// Remove a key outright. No tombstone at this layer.
    pub fn delete(&mut self, key: &str) -> Option<Reference> {
        self.refs.shift_remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.refs.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.refs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Reference)> {
        self.refs.iter()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

// -- Tests --------------------------------------------------------------------
