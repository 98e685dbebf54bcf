//! Git credential-helper protocol support.
//!
//! Implements the line-oriented `key=value` format that `git credential`
//! uses to talk to helper programs, plus the insertion-ordered property map
//! the format requires.

pub mod codec;

// ---------------------------------------------------------------------------
// PropertyMap
// ---------------------------------------------------------------------------

/// A string-to-string map backed by a plain vector. Keys are preserved in
/// insertion order and are unique: setting an existing key replaces its value
/// in place.
///
/// Lookup and insertion are O(n), which is only suited to small maps. This is
/// not for performance, only for guaranteeing consistent iteration ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropertyMap {
    pairs: Vec<(String, String)>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            pairs: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Set `key` to `value`. An existing key keeps its original position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        for pair in &mut self.pairs {
            if pair.0 == key {
                pair.1 = value;
                return;
            }
        }
        self.pairs.push((key, value));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
