use std::collections::BTreeSet;

use anyhow::Result;

use crate::error::GraphError;

/// In-memory set of full image ids, resolvable by any unambiguous prefix.
///
/// This is what turns user-facing short ids into full ids. It is never
/// persisted; the graph rebuilds it from the store root on startup, keeping
/// the filesystem the single source of truth.
#[derive(Debug, Default)]
pub struct TruncIndex {
    ids: BTreeSet<String>,
}

impl TruncIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &str) {
        self.ids.insert(id.to_string());
    }

    pub fn delete(&mut self, id: &str) {
        self.ids.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Resolve a full id or unambiguous prefix to the stored full id.
    ///
    /// The empty prefix is refused: it would match everything.
    pub fn get(&self, prefix: &str) -> Result<String> {
        if prefix.is_empty() {
            anyhow::bail!(GraphError::InvalidId(prefix.to_string()));
        }
        // The ids are ordered, so every id sharing the prefix sits in one
        // contiguous range starting at the prefix itself.
        let mut matches = self
            .ids
            .range(prefix.to_string()..)
            .take_while(|id| id.starts_with(prefix));
        let Some(first) = matches.next() else {
            anyhow::bail!(GraphError::NotFound(prefix.to_string()));
        };
        if matches.next().is_some() {
            anyhow::bail!(GraphError::Ambiguous(prefix.to_string()));
        }
        Ok(first.clone())
    }
}
