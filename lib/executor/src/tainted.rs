use ahash::HashSet;

use crate::{
    fetch::FetchInfo,
    response::value::{Document, NodeId, Value},
    utils::consts::ENTITIES_FIELD_NAME,
};

const MAX_CONTAINMENT_DEPTH: usize = 32;

/// Finds the entities of an `_entities` response whose nullable `@requires` field failed.
///
/// Only errors with a path of the form `["_entities", index, .., field]` are looked at.
/// The object holding `field` must carry a `__typename`, its `field` must be null, and the
/// `(typename, field)` pair must be a nullable requires dependency of the fetch.
pub fn tainted_indices(
    info: Option<&FetchInfo>,
    doc: &Document,
    entities: NodeId,
    errors: NodeId,
) -> Vec<usize> {
    let Some(info) = info else {
        return Vec::new();
    };
    let Some(errors) = doc.as_array(errors) else {
        return Vec::new();
    };

    let mut indices = Vec::new();
    for error in errors {
        let Some(path) = doc.field(*error, "path").and_then(|path| doc.as_array(path)) else {
            continue;
        };
        let Some((first, rest)) = path.split_first() else {
            continue;
        };
        if doc.as_str(*first) != Some(ENTITIES_FIELD_NAME) {
            continue;
        }
        let Some((field, object_path)) = rest.split_last() else {
            continue;
        };
        let Some(field) = doc.as_str(*field) else {
            continue;
        };
        let Some((object, index)) = select_object_and_index(doc, entities, object_path) else {
            continue;
        };
        let Some(value) = doc.field(object, field) else {
            continue;
        };
        if !doc.is_null(value) {
            continue;
        }
        let Some(typename) = doc.typename(object) else {
            continue;
        };
        if info.is_nullable_requires(typename, field) && !indices.contains(&index) {
            indices.push(index);
        }
    }
    indices
}

/// Walks `path` (indices and field names) from the entities array. Returns the reached
/// value and the entity index the path starts with.
fn select_object_and_index(
    doc: &Document,
    entities: NodeId,
    path: &[NodeId],
) -> Option<(NodeId, usize)> {
    let (first, rest) = path.split_first()?;
    let index = path_index(doc, *first)?;
    let mut current = *doc.as_array(entities)?.get(index)?;
    for segment in rest {
        current = match doc.get(current) {
            Value::Array(items) => *items.get(path_index(doc, *segment)?)?,
            Value::Object(_) => doc.field(current, doc.as_str(*segment)?)?,
            _ => return None,
        };
    }
    Some((current, index))
}

fn path_index(doc: &Document, segment: NodeId) -> Option<usize> {
    match doc.get(segment) {
        Value::U64(n) => usize::try_from(*n).ok(),
        Value::I64(n) => usize::try_from(*n).ok(),
        _ => None,
    }
}

/// Response objects that must not feed later fetches, identified by handle.
#[derive(Debug, Default)]
pub struct TaintedObjects {
    nodes: HashSet<NodeId>,
}

impl TaintedObjects {
    pub fn insert(&mut self, node: NodeId) {
        self.nodes.insert(node);
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `node` is tainted or contains a tainted value. Containment is only checked
    /// down to a fixed depth; deeper values count as clean.
    pub fn is_tainted(&self, doc: &Document, node: NodeId) -> bool {
        !self.nodes.is_empty() && self.contains(doc, node, 0)
    }

    fn contains(&self, doc: &Document, node: NodeId, depth: usize) -> bool {
        if self.nodes.contains(&node) {
            return true;
        }
        if depth >= MAX_CONTAINMENT_DEPTH {
            return false;
        }
        match doc.get(node) {
            Value::Array(items) => items.iter().any(|item| self.contains(doc, *item, depth + 1)),
            Value::Object(fields) => fields
                .iter()
                .any(|(_, value)| self.contains(doc, *value, depth + 1)),
            _ => false,
        }
    }

    /// Drops tainted items, keeping the order of the rest.
    pub fn filter_items(&self, doc: &Document, items: &[NodeId]) -> Vec<NodeId> {
        items
            .iter()
            .copied()
            .filter(|item| !self.is_tainted(doc, *item))
            .collect()
    }
}
