use bytes::BufMut;
use indexmap::IndexMap;
use serde::{de, Deserialize, Deserializer, Serialize};
use sonic_rs::Value as JsonValue;
use std::fmt;

use crate::{
    json_writer::{write_and_escape_string, write_object_key, write_u64},
    response::value::{Document, NodeId, Value},
    utils::consts::{CLOSE_BRACE, CLOSE_BRACKET, COMMA, NULL, OPEN_BRACE, OPEN_BRACKET},
};

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<GraphQLErrorLocation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<GraphQLErrorPathSegment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<IndexMap<String, JsonValue>>,
}

impl From<String> for GraphQLError {
    fn from(message: String) -> Self {
        GraphQLError {
            message,
            ..Default::default()
        }
    }
}

impl From<&str> for GraphQLError {
    fn from(message: &str) -> Self {
        message.to_string().into()
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct GraphQLErrorLocation {
    pub line: usize,
    pub column: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum GraphQLErrorPathSegment {
    String(String),
    Index(usize),
}

impl From<&str> for GraphQLErrorPathSegment {
    fn from(value: &str) -> Self {
        GraphQLErrorPathSegment::String(value.to_string())
    }
}

impl From<usize> for GraphQLErrorPathSegment {
    fn from(value: usize) -> Self {
        GraphQLErrorPathSegment::Index(value)
    }
}

impl fmt::Display for GraphQLErrorPathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphQLErrorPathSegment::String(s) => f.write_str(s),
            GraphQLErrorPathSegment::Index(i) => write!(f, "{}", i),
        }
    }
}

impl<'de> Deserialize<'de> for GraphQLErrorPathSegment {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct PathSegmentVisitor;

        impl<'de> de::Visitor<'de> for PathSegmentVisitor {
            type Value = GraphQLErrorPathSegment;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a string or an integer for a GraphQL path segment")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GraphQLErrorPathSegment::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GraphQLErrorPathSegment::String(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(GraphQLErrorPathSegment::Index(value as usize))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                if value < 0 {
                    return Err(E::custom(format!(
                        "path segment must be a non-negative integer, but got {}",
                        value
                    )));
                }
                Ok(GraphQLErrorPathSegment::Index(value as usize))
            }
        }

        deserializer.deserialize_any(PathSegmentVisitor)
    }
}

impl GraphQLError {
    pub fn with_path(mut self, path: Vec<GraphQLErrorPathSegment>) -> Self {
        self.path = Some(path);
        self
    }

    pub fn extension(&self, key: &str) -> Option<&JsonValue> {
        self.extensions.as_ref().and_then(|ext| ext.get(key))
    }

    /// Reads a subgraph error object out of the document.
    ///
    /// Locations with a non-positive or non-integer line/column are dropped, and the
    /// `locations` field disappears entirely when none survive or `omit_locations` is set.
    pub fn from_document(doc: &Document, id: NodeId, omit_locations: bool) -> Option<Self> {
        let fields = doc.as_object(id)?;
        let mut error = GraphQLError::default();

        for (key, value) in fields {
            match key.as_str() {
                "message" => {
                    error.message = match doc.get(*value) {
                        Value::String(s) => s.clone(),
                        _ => String::new(),
                    };
                }
                "locations" if !omit_locations => {
                    let locations: Vec<GraphQLErrorLocation> = doc
                        .as_array(*value)
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|location| {
                            Some(GraphQLErrorLocation {
                                line: positive_integer(doc, doc.field(*location, "line")?)?,
                                column: positive_integer(doc, doc.field(*location, "column")?)?,
                            })
                        })
                        .collect();
                    if !locations.is_empty() {
                        error.locations = Some(locations);
                    }
                }
                "path" => {
                    if let Some(items) = doc.as_array(*value) {
                        let path = items
                            .iter()
                            .filter_map(|segment| match doc.get(*segment) {
                                Value::String(s) => Some(GraphQLErrorPathSegment::String(s.clone())),
                                Value::U64(i) => Some(GraphQLErrorPathSegment::Index(*i as usize)),
                                Value::I64(i) if *i >= 0 => {
                                    Some(GraphQLErrorPathSegment::Index(*i as usize))
                                }
                                _ => None,
                            })
                            .collect();
                        error.path = Some(path);
                    }
                }
                "extensions" => {
                    if let Some(ext_fields) = doc.as_object(*value) {
                        let mut extensions = IndexMap::with_capacity(ext_fields.len());
                        for (name, ext_value) in ext_fields {
                            let bytes = doc.to_bytes(*ext_value);
                            if let Ok(parsed) = sonic_rs::from_slice::<JsonValue>(&bytes) {
                                extensions.insert(name.clone(), parsed);
                            }
                        }
                        error.extensions = Some(extensions);
                    }
                }
                _ => {}
            }
        }

        Some(error)
    }

    pub fn write<B: BufMut>(&self, out: &mut B) {
        out.put(OPEN_BRACE);
        write_object_key(out, "message", true);
        write_and_escape_string(out, &self.message);

        if let Some(locations) = &self.locations {
            write_object_key(out, "locations", false);
            out.put(OPEN_BRACKET);
            for (i, location) in locations.iter().enumerate() {
                if i > 0 {
                    out.put(COMMA);
                }
                out.put(OPEN_BRACE);
                write_object_key(out, "line", true);
                write_u64(out, location.line as u64);
                write_object_key(out, "column", false);
                write_u64(out, location.column as u64);
                out.put(CLOSE_BRACE);
            }
            out.put(CLOSE_BRACKET);
        }

        if let Some(path) = &self.path {
            write_object_key(out, "path", false);
            write_path(out, path);
        }

        if let Some(extensions) = &self.extensions {
            write_object_key(out, "extensions", false);
            match sonic_rs::to_vec(extensions) {
                Ok(bytes) => out.put(bytes.as_slice()),
                Err(_) => out.put(NULL),
            }
        }

        out.put(CLOSE_BRACE);
    }
}

pub fn write_path<B: BufMut>(out: &mut B, path: &[GraphQLErrorPathSegment]) {
    out.put(OPEN_BRACKET);
    for (i, segment) in path.iter().enumerate() {
        if i > 0 {
            out.put(COMMA);
        }
        match segment {
            GraphQLErrorPathSegment::String(s) => write_and_escape_string(out, s),
            GraphQLErrorPathSegment::Index(index) => write_u64(out, *index as u64),
        }
    }
    out.put(CLOSE_BRACKET);
}

fn positive_integer(doc: &Document, id: NodeId) -> Option<usize> {
    match doc.get(id) {
        Value::U64(n) if *n > 0 => Some(*n as usize),
        Value::I64(n) if *n > 0 => Some(*n as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_json(input: &str, omit_locations: bool) -> String {
        let mut doc = Document::new();
        let id = doc.parse(input.as_bytes()).unwrap();
        let error = GraphQLError::from_document(&doc, id, omit_locations).unwrap();
        let mut out = Vec::new();
        error.write(&mut out);
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn keeps_only_valid_locations() {
        insta::assert_snapshot!(
            error_json(
                r#"{"message":"boom","locations":[{"line":0,"column":1},{"line":"1","column":2},{"line":3,"column":4}],"path":["a",0]}"#,
                false
            ),
            @r#"{"message":"boom","locations":[{"line":3,"column":4}],"path":["a",0]}"#
        );
    }

    #[test]
    fn drops_locations_when_none_are_valid() {
        insta::assert_snapshot!(
            error_json(r#"{"message":"boom","locations":[{"line":-1,"column":1}]}"#, false),
            @r#"{"message":"boom"}"#
        );
    }

    #[test]
    fn omits_locations_when_configured() {
        insta::assert_snapshot!(
            error_json(r#"{"message":"boom","locations":[{"line":1,"column":1}]}"#, true),
            @r#"{"message":"boom"}"#
        );
    }

    #[test]
    fn path_segments_serialize_untagged() {
        let error = GraphQLError::from("x").with_path(vec!["user".into(), 2.into()]);
        let json = sonic_rs::to_string(&error).unwrap();
        assert_eq!(json, r#"{"message":"x","path":["user",2]}"#);
    }

    #[test]
    fn keeps_extensions() {
        insta::assert_snapshot!(
            error_json(r#"{"message":"boom","extensions":{"code":"X","nested":{"a":[1]}}}"#, false),
            @r#"{"message":"boom","extensions":{"code":"X","nested":{"a":[1]}}}"#
        );
    }
}
