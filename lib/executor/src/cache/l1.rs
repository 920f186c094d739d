use dashmap::DashMap;

use crate::response::value::NodeId;

/// Request-scoped cache of merged entities, keyed by entity cache key (without prefix).
///
/// Values point into the execution's response document, so a hit reuses data already
/// merged by an earlier fetch of the same request.
#[derive(Debug, Default)]
pub struct L1Cache {
    entries: DashMap<String, NodeId>,
}

impl L1Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<NodeId> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    pub fn insert(&self, key: String, node: NodeId) {
        self.entries.insert(key, node);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
