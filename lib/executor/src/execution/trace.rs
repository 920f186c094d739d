use std::time::Duration;

use ahash::HashMap;
use serde::Serialize;
use sonic_rs::Value as JsonValue;

use crate::{
    fetch::{FetchItem, FetchTreeNode},
    response::value::{Document, Value},
};

const REDACTED: &str = "****";
const SENSITIVE_HEADERS: [&str; 6] = [
    "authorization",
    "www-authenticate",
    "proxy-authenticate",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

#[derive(Debug, Clone)]
pub struct TraceOptions {
    pub enabled: bool,
    pub exclude_raw_input_data: bool,
    pub exclude_input: bool,
    pub exclude_output: bool,
    pub redact_headers: bool,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            exclude_raw_input_data: false,
            exclude_input: false,
            exclude_output: false,
            redact_headers: true,
        }
    }
}

/// What a single fetch sent and received.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DataSourceLoadTrace {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_input_data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_error: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub load_skipped: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub l1_cache_hit: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub l2_cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_load_nanos: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_load_pretty: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl DataSourceLoadTrace {
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_load_nanos = Some(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX));
        self.duration_load_pretty = Some(humantime::format_duration(duration).to_string());
    }
}

/// Parses bytes for the trace output, keeping them as a string when they are not JSON.
pub fn trace_value(bytes: &[u8]) -> JsonValue {
    sonic_rs::from_slice::<JsonValue>(bytes)
        .unwrap_or_else(|_| JsonValue::from(String::from_utf8_lossy(bytes).as_ref()))
}

/// Replaces the values of sensitive entries of the input's `header` object with a
/// redaction marker. Inputs that are not JSON objects are returned as they are.
pub fn redact_headers(input: &[u8]) -> Vec<u8> {
    let mut doc = Document::new();
    let Ok(root) = doc.parse(input) else {
        return input.to_vec();
    };
    let Some(headers) = doc.field(root, "header") else {
        return input.to_vec();
    };
    let sensitive: Vec<String> = match doc.as_object(headers) {
        Some(fields) => fields
            .iter()
            .map(|(name, _)| name)
            .filter(|name| {
                SENSITIVE_HEADERS
                    .iter()
                    .any(|header| header.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect(),
        None => return input.to_vec(),
    };
    for name in sensitive {
        let marker = doc.push(Value::String(REDACTED.to_string()));
        let list = doc.push(Value::Array(vec![marker]));
        doc.set_field(headers, &name, list);
    }
    doc.to_bytes(root)
}

/// Fetch tree annotated with the trace of every fetch, for an external renderer.
#[derive(Debug, Clone, Serialize)]
pub struct FetchTreeTraceNode {
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FetchTreeTraceNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchTraceNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchTraceNode {
    pub kind: &'static str,
    pub source_id: String,
    pub source_name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<DataSourceLoadTrace>,
}

impl FetchTreeTraceNode {
    /// Builds the trace tree, taking the trace of each fetch out of `traces` by its
    /// pre-order fetch id.
    pub fn build(tree: &FetchTreeNode, traces: &mut HashMap<usize, DataSourceLoadTrace>) -> Self {
        let mut next_id = 0;
        Self::build_node(tree, traces, &mut next_id)
    }

    fn build_node(
        node: &FetchTreeNode,
        traces: &mut HashMap<usize, DataSourceLoadTrace>,
        next_id: &mut usize,
    ) -> Self {
        match node {
            FetchTreeNode::Single(item) => {
                let id = *next_id;
                *next_id += 1;
                FetchTreeTraceNode {
                    kind: node.kind_name(),
                    children: Vec::new(),
                    fetch: Some(FetchTraceNode::new(item, traces.remove(&id))),
                }
            }
            FetchTreeNode::Sequence { children } | FetchTreeNode::Parallel { children } => {
                FetchTreeTraceNode {
                    kind: node.kind_name(),
                    children: children
                        .iter()
                        .map(|child| Self::build_node(child, traces, next_id))
                        .collect(),
                    fetch: None,
                }
            }
        }
    }
}

impl FetchTraceNode {
    fn new(item: &FetchItem, trace: Option<DataSourceLoadTrace>) -> Self {
        let info = item.fetch.info();
        FetchTraceNode {
            kind: item.fetch.kind_name(),
            source_id: info
                .map(|info| info.data_source_id.clone())
                .unwrap_or_default(),
            source_name: info
                .map(|info| info.data_source_name.clone())
                .unwrap_or_default(),
            path: item.response_path.clone(),
            trace,
        }
    }
}
