use core::fmt;
use std::hash::{Hash, Hasher};

use bytes::BufMut;
use serde::de::{self, DeserializeSeed, Deserializer, MapAccess, SeqAccess, Visitor};
use xxhash_rust::xxh3::Xxh3;

use crate::{
    json_writer::{write_and_escape_string, write_bool, write_f64, write_i64, write_u64},
    utils::consts::{
        CLOSE_BRACE, CLOSE_BRACKET, COLON, COMMA, NULL, OPEN_BRACE, OPEN_BRACKET,
        TYPENAME_FIELD_NAME,
    },
};

/// Stable handle of a value stored in a [`Document`].
///
/// Handles are never invalidated during an execution: merging mutates values in place
/// and new values are only appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Array(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Boolean,
            Value::I64(_) | Value::U64(_) | Value::F64(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ValueKind {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Arena holding the response tree of one execution.
///
/// Subgraph responses and cache payloads are parsed straight into the arena and linked
/// into the tree by [`crate::response::merge`]. Values are addressed by [`NodeId`].
#[derive(Debug, Clone)]
pub struct Document {
    values: Vec<Value>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self { values: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn push(&mut self, value: Value) -> NodeId {
        let id = NodeId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    pub fn push_null(&mut self) -> NodeId {
        self.push(Value::Null)
    }

    pub fn push_object(&mut self) -> NodeId {
        self.push(Value::Object(Vec::new()))
    }

    #[inline]
    pub fn get(&self, id: NodeId) -> &Value {
        &self.values[id.index()]
    }

    #[inline]
    pub fn get_mut(&mut self, id: NodeId) -> &mut Value {
        &mut self.values[id.index()]
    }

    pub fn set(&mut self, id: NodeId, value: Value) {
        self.values[id.index()] = value;
    }

    pub fn is_null(&self, id: NodeId) -> bool {
        matches!(self.get(id), Value::Null)
    }

    pub fn as_str(&self, id: NodeId) -> Option<&str> {
        match self.get(id) {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.get(id) {
            Value::Array(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    pub fn as_object(&self, id: NodeId) -> Option<&[(String, NodeId)]> {
        match self.get(id) {
            Value::Object(fields) => Some(fields.as_slice()),
            _ => None,
        }
    }

    pub fn field(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.as_object(id)?
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| *value)
    }

    pub fn typename(&self, id: NodeId) -> Option<&str> {
        self.field(id, TYPENAME_FIELD_NAME)
            .and_then(|value| self.as_str(value))
    }

    /// Walks `path` starting at `id`. Object keys are matched by name, array elements by
    /// their numeric position.
    pub fn get_path<S: AsRef<str>>(&self, id: NodeId, path: &[S]) -> Option<NodeId> {
        let mut current = id;
        for segment in path {
            let segment = segment.as_ref();
            current = match self.get(current) {
                Value::Object(_) => self.field(current, segment)?,
                Value::Array(items) => {
                    let index = segment.parse::<usize>().ok()?;
                    *items.get(index)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Inserts or replaces `key` on an object value. Non-objects are left untouched.
    pub fn set_field(&mut self, id: NodeId, key: &str, value: NodeId) {
        if let Value::Object(fields) = self.get_mut(id) {
            match fields.iter_mut().find(|(name, _)| name == key) {
                Some((_, existing)) => *existing = value,
                None => fields.push((key.to_string(), value)),
            }
        }
    }

    /// Wraps `id` into nested objects, one per path segment: `["a","b"]` gives `{"a":{"b":<id>}}`.
    pub fn wrap_in_path<S: AsRef<str>>(&mut self, id: NodeId, path: &[S]) -> NodeId {
        let mut current = id;
        for segment in path.iter().rev() {
            current = self.push(Value::Object(vec![(segment.as_ref().to_string(), current)]));
        }
        current
    }

    pub fn parse(&mut self, bytes: &[u8]) -> Result<NodeId, DocumentError> {
        let mut deserializer = sonic_rs::Deserializer::from_slice(bytes);
        NodeSeed { document: self }
            .deserialize(&mut deserializer)
            .map_err(|err| DocumentError::InvalidJson(err.to_string()))
    }

    /// Copies the value behind `id` in `other` into this document.
    pub fn import(&mut self, other: &Document, id: NodeId) -> NodeId {
        let value = match other.get(id) {
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.import(other, *item))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), self.import(other, *value)))
                    .collect(),
            ),
            scalar => scalar.clone(),
        };
        self.push(value)
    }

    /// Deep copy of the value behind `id`, so the copy can be mutated independently.
    pub fn duplicate(&mut self, id: NodeId) -> NodeId {
        let value = match self.get(id).clone() {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.duplicate(item))
                    .collect(),
            ),
            Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(name, value)| (name, self.duplicate(value)))
                    .collect(),
            ),
            scalar => scalar,
        };
        self.push(value)
    }

    pub fn write<B: BufMut>(&self, id: NodeId, out: &mut B) {
        match self.get(id) {
            Value::Null => out.put(NULL),
            Value::Bool(b) => write_bool(out, *b),
            Value::I64(n) => write_i64(out, *n),
            Value::U64(n) => write_u64(out, *n),
            Value::F64(n) => write_f64(out, *n),
            Value::String(s) => write_and_escape_string(out, s),
            Value::Array(items) => {
                out.put(OPEN_BRACKET);
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.put(COMMA);
                    }
                    self.write(*item, out);
                }
                out.put(CLOSE_BRACKET);
            }
            Value::Object(fields) => {
                out.put(OPEN_BRACE);
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        out.put(COMMA);
                    }
                    write_and_escape_string(out, name);
                    out.put(COLON);
                    self.write(*value, out);
                }
                out.put(CLOSE_BRACE);
            }
        }
    }

    pub fn to_bytes(&self, id: NodeId) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.write(id, &mut out);
        out
    }

    pub fn to_json_string(&self, id: NodeId) -> String {
        // The writer only ever emits valid UTF-8.
        String::from_utf8_lossy(&self.to_bytes(id)).into_owned()
    }

    /// Structural hash of a value, used to deduplicate identical representations.
    pub fn hash_node(&self, id: NodeId) -> u64 {
        let mut hasher = Xxh3::new();
        self.hash_into(id, &mut hasher);
        hasher.finish()
    }

    fn hash_into<H: Hasher>(&self, id: NodeId, state: &mut H) {
        match self.get(id) {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::I64(i) => i.hash(state),
            Value::U64(u) => u.hash(state),
            Value::F64(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Array(items) => {
                items.len().hash(state);
                for item in items {
                    self.hash_into(*item, state);
                }
            }
            Value::Object(fields) => {
                fields.len().hash(state);
                for (name, value) in fields {
                    name.hash(state);
                    self.hash_into(*value, state);
                }
            }
        }
    }
}

/// Deserializes one JSON value directly into a [`Document`].
pub struct NodeSeed<'d> {
    pub document: &'d mut Document,
}

impl<'de> DeserializeSeed<'de> for NodeSeed<'_> {
    type Value = NodeId;

    fn deserialize<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(NodeVisitor {
            document: self.document,
        })
    }
}

struct NodeVisitor<'d> {
    document: &'d mut Document,
}

impl<'de> Visitor<'de> for NodeVisitor<'_> {
    type Value = NodeId;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("any valid JSON value")
    }

    fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
        Ok(self.document.push(Value::Bool(value)))
    }

    fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
        Ok(self.document.push(Value::I64(value)))
    }

    fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
        Ok(self.document.push(Value::U64(value)))
    }

    fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
        Ok(self.document.push(Value::F64(value)))
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(self.document.push(Value::String(value.to_owned())))
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(self.document.push(Value::String(value)))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E> {
        Ok(self.document.push_null())
    }

    fn visit_none<E>(self) -> Result<Self::Value, E> {
        Ok(self.document.push_null())
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let document = self.document;
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element_seed(NodeSeed {
            document: &mut *document,
        })? {
            items.push(item);
        }
        Ok(document.push(Value::Array(items)))
    }

    fn visit_map<M>(self, mut map: M) -> Result<Self::Value, M::Error>
    where
        M: MapAccess<'de>,
    {
        let document = self.document;
        let mut fields: Vec<(String, NodeId)> = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value_seed(NodeSeed {
                document: &mut *document,
            })?;
            match fields.iter_mut().find(|(name, _)| *name == key) {
                Some((_, existing)) => *existing = value,
                None => fields.push((key, value)),
            }
        }
        Ok(document.push(Value::Object(fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_prints_preserving_field_order() {
        let mut doc = Document::new();
        let root = doc
            .parse(br#"{"b":1,"a":[true,null,"x\"y"],"c":{"d":-2,"e":1.5}}"#)
            .unwrap();
        insta::assert_snapshot!(doc.to_json_string(root), @r#"{"b":1,"a":[true,null,"x\"y"],"c":{"d":-2,"e":1.5}}"#);
    }

    #[test]
    fn walks_paths_through_objects_and_arrays() {
        let mut doc = Document::new();
        let root = doc
            .parse(br#"{"data":{"users":[{"id":"1"},{"id":"2","__typename":"User"}]}}"#)
            .unwrap();

        let second = doc.get_path(root, &["data", "users", "1"]).unwrap();
        assert_eq!(doc.typename(second), Some("User"));
        assert_eq!(
            doc.get_path(root, &["data", "users", "0", "id"])
                .and_then(|id| doc.as_str(id)),
            Some("1")
        );
        assert!(doc.get_path(root, &["data", "missing"]).is_none());
        assert!(doc.get_path(root, &["data", "users", "7"]).is_none());
    }

    #[test]
    fn identical_values_hash_equally() {
        let mut doc = Document::new();
        let a = doc.parse(br#"{"__typename":"User","id":"1"}"#).unwrap();
        let b = doc.parse(br#"{"__typename":"User","id":"1"}"#).unwrap();
        let c = doc.parse(br#"{"__typename":"User","id":"2"}"#).unwrap();
        assert_eq!(doc.hash_node(a), doc.hash_node(b));
        assert_ne!(doc.hash_node(a), doc.hash_node(c));
    }

    #[test]
    fn wraps_values_in_object_path() {
        let mut doc = Document::new();
        let inner = doc.parse(br#"{"id":"1"}"#).unwrap();
        let wrapped = doc.wrap_in_path(inner, &["data", "user"]);
        assert_eq!(doc.to_json_string(wrapped), r#"{"data":{"user":{"id":"1"}}}"#);
    }

    #[test]
    fn duplicates_are_independent() {
        let mut doc = Document::new();
        let original = doc.parse(br#"{"user":{"id":"1"}}"#).unwrap();
        let copy = doc.duplicate(original);
        let name = doc.push(Value::String("Ada".to_string()));
        let user = doc.field(copy, "user").unwrap();
        doc.set_field(user, "name", name);
        assert_eq!(doc.to_json_string(original), r#"{"user":{"id":"1"}}"#);
        assert_eq!(doc.to_json_string(copy), r#"{"user":{"id":"1","name":"Ada"}}"#);
    }

    #[test]
    fn rejects_invalid_json() {
        let mut doc = Document::new();
        assert!(doc.parse(b"{\"a\":").is_err());
    }
}
