use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    context::Context,
    json_writer::write_and_escape_string,
    resolve::{
        resolvable::{render_object, ObjectRenderError},
        shape::Object,
    },
    response::value::{Document, NodeId, Value},
    utils::consts::{COMMA, NULL},
};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("invalid object variable: {0}")]
    InvalidObject(#[from] ObjectRenderError),
}

/// How a variable value is written into the template output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableRenderer {
    /// The JSON value as-is.
    #[default]
    Json,
    /// The JSON text of the value, as a JSON string.
    JsonString,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateSegment {
    Static {
        data: String,
    },
    /// Value at `path` inside the current item.
    Object {
        path: Vec<String>,
        #[serde(default)]
        renderer: VariableRenderer,
    },
    /// Value at `path` inside the request variables.
    Context {
        path: Vec<String>,
        #[serde(default)]
        renderer: VariableRenderer,
    },
    /// Request header values, comma separated.
    Header {
        name: String,
    },
    /// The current item rendered through an object shape.
    ResolvableObject {
        shape: Object,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputTemplate {
    pub segments: Vec<TemplateSegment>,
    /// When an object variable is missing or null, the whole output becomes `null`.
    /// Batch fetches rely on it to drop items.
    #[serde(default)]
    pub set_template_output_to_null_on_variable_null: bool,
}

/// The data a template reads object variables from.
#[derive(Debug, Clone, Copy)]
pub struct TemplateData<'a> {
    pub doc: &'a Document,
    pub node: Option<NodeId>,
}

enum Flow {
    Continue,
    OutputNull,
}

impl InputTemplate {
    pub fn from_static(data: impl Into<String>) -> Self {
        InputTemplate {
            segments: vec![TemplateSegment::Static { data: data.into() }],
            set_template_output_to_null_on_variable_null: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Renders the template, appending to `out`. Names of request variables that were
    /// referenced but not provided are collected into `undefined`.
    pub fn render(
        &self,
        ctx: &Context,
        data: Option<TemplateData<'_>>,
        out: &mut Vec<u8>,
        undefined: &mut Vec<String>,
    ) -> Result<(), RenderError> {
        let start = out.len();
        for segment in &self.segments {
            if let Flow::OutputNull = self.render_segment(ctx, data, segment, out, undefined)? {
                out.truncate(start);
                out.put(NULL);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Renders the template as a complete input, recording undefined variables in it.
    pub fn render_input(
        &self,
        ctx: &Context,
        data: Option<TemplateData<'_>>,
    ) -> Result<Vec<u8>, RenderError> {
        let mut out = Vec::with_capacity(128);
        let mut undefined = Vec::new();
        self.render(ctx, data, &mut out, &mut undefined)?;
        Ok(set_undefined_variables(out, &undefined))
    }

    fn render_segment(
        &self,
        ctx: &Context,
        data: Option<TemplateData<'_>>,
        segment: &TemplateSegment,
        out: &mut Vec<u8>,
        undefined: &mut Vec<String>,
    ) -> Result<Flow, RenderError> {
        match segment {
            TemplateSegment::Static { data } => out.put(data.as_bytes()),
            TemplateSegment::Object { path, renderer } => {
                let value = data.and_then(|data| {
                    let node = data.doc.get_path(data.node?, path)?;
                    (!data.doc.is_null(node)).then_some((data.doc, node))
                });
                match value {
                    Some((doc, node)) => write_variable(doc, node, *renderer, out),
                    None if self.set_template_output_to_null_on_variable_null => {
                        return Ok(Flow::OutputNull)
                    }
                    None => out.put(NULL),
                }
            }
            TemplateSegment::Context { path, renderer } => {
                let variables = ctx.variables();
                match variables.root().and_then(|root| variables.doc().get_path(root, path)) {
                    Some(node) => write_variable(variables.doc(), node, *renderer, out),
                    None => {
                        out.put(NULL);
                        if let Some(name) = path.first() {
                            undefined.push(name.clone());
                        }
                    }
                }
            }
            TemplateSegment::Header { name } => {
                for (i, value) in ctx.headers().get_all(name.as_str()).iter().enumerate() {
                    if i > 0 {
                        out.put(COMMA);
                    }
                    out.put(value.as_bytes());
                }
            }
            TemplateSegment::ResolvableObject { shape } => {
                match data.and_then(|data| data.node.map(|node| (data.doc, node))) {
                    Some((doc, node)) => render_object(doc, node, shape, out)?,
                    None => out.put(NULL),
                }
            }
        }
        Ok(Flow::Continue)
    }
}

fn write_variable(doc: &Document, node: NodeId, renderer: VariableRenderer, out: &mut Vec<u8>) {
    match renderer {
        VariableRenderer::Json => doc.write(node, out),
        VariableRenderer::JsonString => match doc.get(node) {
            Value::String(s) => write_and_escape_string(out, s),
            _ => write_and_escape_string(out, &doc.to_json_string(node)),
        },
    }
}

/// Adds `"undefined":[..names]` to a rendered JSON object input so the data source
/// can tell omitted variables apart from explicit nulls.
pub fn set_undefined_variables(input: Vec<u8>, undefined: &[String]) -> Vec<u8> {
    if undefined.is_empty() {
        return input;
    }
    let mut doc = Document::new();
    let Ok(root) = doc.parse(&input) else {
        return input;
    };
    if doc.as_object(root).is_none() {
        return input;
    }
    let names = undefined
        .iter()
        .map(|name| doc.push(Value::String(name.clone())))
        .collect();
    let list = doc.push(Value::Array(names));
    doc.set_field(root, "undefined", list);
    doc.to_bytes(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::shape::builders::{field, object, string};
    use http::{HeaderMap, HeaderValue};

    fn segments(json: &str) -> InputTemplate {
        sonic_rs::from_str(json).unwrap()
    }

    #[test]
    fn renders_object_and_context_variables() {
        let ctx = Context::builder()
            .variables(br#"{"first":10}"#)
            .unwrap()
            .build();
        let mut doc = Document::new();
        let item = doc.parse(br#"{"id":"1","name":"Ada"}"#).unwrap();

        let template = segments(
            r#"{"segments":[
                {"type":"static","data":"{\"id\":"},
                {"type":"object","path":["id"]},
                {"type":"static","data":",\"first\":"},
                {"type":"context","path":["first"]},
                {"type":"static","data":",\"after\":"},
                {"type":"context","path":["after"]},
                {"type":"static","data":"}"}
            ]}"#,
        );
        let input = template
            .render_input(&ctx, Some(TemplateData { doc: &doc, node: Some(item) }))
            .unwrap();
        insta::assert_snapshot!(
            String::from_utf8(input).unwrap(),
            @r#"{"id":"1","first":10,"after":null,"undefined":["after"]}"#
        );
    }

    #[test]
    fn null_object_variable_nulls_whole_output() {
        let ctx = Context::builder().build();
        let mut doc = Document::new();
        let item = doc.parse(br#"{"id":null}"#).unwrap();
        let mut template = segments(
            r#"{"segments":[
                {"type":"static","data":"{\"id\":"},
                {"type":"object","path":["id"]},
                {"type":"static","data":"}"}
            ]}"#,
        );

        let mut out = b"prefix:".to_vec();
        template
            .render(&ctx, Some(TemplateData { doc: &doc, node: Some(item) }), &mut out, &mut vec![])
            .unwrap();
        assert_eq!(out, b"prefix:{\"id\":null}");

        template.set_template_output_to_null_on_variable_null = true;
        let mut out = b"prefix:".to_vec();
        template
            .render(&ctx, Some(TemplateData { doc: &doc, node: Some(item) }), &mut out, &mut vec![])
            .unwrap();
        assert_eq!(out, b"prefix:null");
    }

    #[test]
    fn joins_header_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-tenant", HeaderValue::from_static("a"));
        headers.append("x-tenant", HeaderValue::from_static("b"));
        let ctx = Context::builder().headers(headers).build();
        let template = InputTemplate {
            segments: vec![TemplateSegment::Header {
                name: "X-Tenant".to_string(),
            }],
            set_template_output_to_null_on_variable_null: false,
        };
        let mut out = Vec::new();
        template.render(&ctx, None, &mut out, &mut vec![]).unwrap();
        assert_eq!(out, b"a,b");
    }

    #[test]
    fn renders_representations_through_shape() {
        let ctx = Context::builder().build();
        let mut doc = Document::new();
        let item = doc
            .parse(br#"{"__typename":"User","id":"1","name":"Ada"}"#)
            .unwrap();
        let template = InputTemplate {
            segments: vec![TemplateSegment::ResolvableObject {
                shape: object(
                    &[],
                    false,
                    vec![
                        field("__typename", string(&["__typename"], false)),
                        field("id", string(&["id"], false)),
                    ],
                ),
            }],
            set_template_output_to_null_on_variable_null: false,
        };
        let mut out = Vec::new();
        template
            .render(&ctx, Some(TemplateData { doc: &doc, node: Some(item) }), &mut out, &mut vec![])
            .unwrap();
        assert_eq!(out, br#"{"__typename":"User","id":"1"}"#);

        let broken = doc.parse(br#"{"__typename":"User"}"#).unwrap();
        let mut out = Vec::new();
        assert!(template
            .render(&ctx, Some(TemplateData { doc: &doc, node: Some(broken) }), &mut out, &mut vec![])
            .is_err());
    }

    #[test]
    fn renders_json_as_string() {
        let ctx = Context::builder()
            .variables(br#"{"filter":{"a":1}}"#)
            .unwrap()
            .build();
        let template = InputTemplate {
            segments: vec![TemplateSegment::Context {
                path: vec!["filter".to_string()],
                renderer: VariableRenderer::JsonString,
            }],
            set_template_output_to_null_on_variable_null: false,
        };
        let mut out = Vec::new();
        template.render(&ctx, None, &mut out, &mut vec![]).unwrap();
        assert_eq!(out, br#""{\"a\":1}""#);
    }
}
