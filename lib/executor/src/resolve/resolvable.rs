use bytes::BufMut;
use tracing::{instrument, trace};

use crate::{
    fetch::OperationType,
    json_writer::write_object_key,
    resolve::{
        error_behavior::ErrorBehavior,
        shape::{Array, Node, Object, Scalar},
    },
    response::{
        graphql_error::{GraphQLError, GraphQLErrorPathSegment},
        value::{Document, NodeId, Value},
    },
    utils::consts::{
        CLOSE_BRACE, CLOSE_BRACKET, COMMA, EMPTY_OBJECT, NULL, OPEN_BRACE, OPEN_BRACKET,
    },
};

#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub error_behavior: ErrorBehavior,
    pub operation_type: OperationType,
}

/// Client-visible payload produced by [`resolve`].
#[derive(Debug)]
pub struct ResolvedResponse {
    pub body: Vec<u8>,
    pub errors: Vec<GraphQLError>,
    pub data_is_null: bool,
}

/// Null must bubble to the enclosing node.
#[derive(Debug, Clone, Copy)]
struct Bubble;

type Walk = Result<(), Bubble>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Response(ErrorBehavior),
    /// Rendering of input variables: the first error aborts the render.
    Strict,
}

struct Resolvable<'a> {
    doc: &'a Document,
    mode: Mode,
    root_type_name: &'static str,
    out: Vec<u8>,
    path: Vec<GraphQLErrorPathSegment>,
    parent_types: Vec<Option<String>>,
    errors: Vec<GraphQLError>,
    halted: bool,
}

/// Walks `shape` against the merged document and renders `{"errors":[..],"data":..}`.
///
/// `errors` are the errors collected while loading; they are printed before errors
/// raised during resolution.
#[instrument(level = "trace", skip_all, fields(error_behavior = %options.error_behavior))]
pub fn resolve(
    doc: &Document,
    data: Option<NodeId>,
    shape: &Object,
    errors: Vec<GraphQLError>,
    options: &ResolveOptions,
) -> ResolvedResponse {
    let has_data = data
        .and_then(|id| doc.as_object(id))
        .is_some_and(|fields| !fields.is_empty());

    let mut resolvable = Resolvable {
        doc,
        mode: Mode::Response(options.error_behavior),
        root_type_name: options.operation_type.root_type_name(),
        out: Vec::with_capacity(1024),
        path: Vec::new(),
        parent_types: Vec::new(),
        errors,
        halted: false,
    };

    // Errors without any data: skip the walk, it would only add non-null errors.
    let data_is_null = if !resolvable.errors.is_empty() && !has_data {
        true
    } else {
        match data {
            Some(root) => resolvable.walk_object(shape, root).is_err(),
            None => true,
        }
    };

    if data_is_null {
        resolvable.out.clear();
    }

    let mut body = Vec::with_capacity(resolvable.out.len() + 64);
    body.put(OPEN_BRACE);
    let mut first = true;
    if !resolvable.errors.is_empty() {
        write_object_key(&mut body, "errors", true);
        body.put(OPEN_BRACKET);
        for (i, error) in resolvable.errors.iter().enumerate() {
            if i > 0 {
                body.put(COMMA);
            }
            error.write(&mut body);
        }
        body.put(CLOSE_BRACKET);
        first = false;
    }
    write_object_key(&mut body, "data", first);
    if data_is_null {
        body.put(NULL);
    } else {
        body.put(resolvable.out.as_slice());
    }
    body.put(CLOSE_BRACE);

    trace!(
        errors = resolvable.errors.len(),
        data_is_null,
        "response resolved"
    );

    ResolvedResponse {
        body,
        errors: resolvable.errors,
        data_is_null,
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ObjectRenderError {
    pub message: String,
}

/// Renders `item` through an object shape, e.g. to build entity representations.
/// Any violation of the shape aborts the render.
pub fn render_object(
    doc: &Document,
    item: NodeId,
    shape: &Object,
    out: &mut Vec<u8>,
) -> Result<(), ObjectRenderError> {
    let mut resolvable = Resolvable {
        doc,
        mode: Mode::Strict,
        root_type_name: OperationType::Query.root_type_name(),
        out: std::mem::take(out),
        path: Vec::new(),
        parent_types: Vec::new(),
        errors: Vec::new(),
        halted: false,
    };
    let result = resolvable.walk_object(shape, item);
    *out = resolvable.out;
    match result {
        Ok(()) => Ok(()),
        Err(Bubble) => Err(ObjectRenderError {
            message: resolvable
                .errors
                .into_iter()
                .next()
                .map(|e| e.message)
                .unwrap_or_else(|| "invalid object".to_string()),
        }),
    }
}

impl Resolvable<'_> {
    fn walk_node(&mut self, node: &Node, parent: NodeId) -> Walk {
        match node {
            Node::Object(object) => self.walk_object(object, parent),
            Node::Array(array) => self.walk_array(array, parent),
            Node::String(s) => self.walk_scalar(s, parent, ScalarKind::String),
            Node::Boolean(s) => self.walk_scalar(s, parent, ScalarKind::Boolean),
            Node::Integer(s) => self.walk_scalar(s, parent, ScalarKind::Integer),
            Node::Float(s) => self.walk_scalar(s, parent, ScalarKind::Float),
            Node::BigInt(s) | Node::Scalar(s) => self.walk_scalar(s, parent, ScalarKind::Any),
            Node::Null => {
                self.out.put(NULL);
                Ok(())
            }
            Node::EmptyObject => {
                self.out.put(EMPTY_OBJECT);
                Ok(())
            }
            Node::EmptyArray => {
                self.out.put(OPEN_BRACKET);
                self.out.put(CLOSE_BRACKET);
                Ok(())
            }
        }
    }

    fn walk_object(&mut self, object: &Object, parent: NodeId) -> Walk {
        let value = self.doc.get_path(parent, &object.path);
        self.push_path(&object.path);
        let result = self.walk_object_value(object, value);
        self.pop_path(&object.path);
        result
    }

    fn walk_object_value(&mut self, object: &Object, value: Option<NodeId>) -> Walk {
        let value = match value {
            Some(value) if !self.doc.is_null(value) => value,
            _ => return self.null_or_error(object.nullable),
        };
        if !matches!(self.doc.get(value), Value::Object(_)) {
            self.add_error("Object cannot represent non-object value.".to_string());
            return self.fail();
        }

        let type_name = object
            .type_name
            .clone()
            .or_else(|| self.doc.typename(value).map(str::to_string));
        self.parent_types.push(type_name);

        let checkpoint = self.out.len();
        self.out.put(OPEN_BRACE);
        let mut first = true;
        let mut result = Ok(());
        for field in &object.fields {
            if !field.on_type_names.is_empty() && self.skip_on_type_names(value, &field.on_type_names) {
                continue;
            }
            write_object_key(&mut self.out, &field.name, first);
            first = false;
            if let Err(bubble) = self.walk_node(&field.value, value) {
                result = Err(bubble);
                break;
            }
        }
        self.parent_types.pop();

        match result {
            Ok(()) => {
                self.out.put(CLOSE_BRACE);
                Ok(())
            }
            Err(bubble) => self.absorb(object.nullable, checkpoint, bubble),
        }
    }

    fn walk_array(&mut self, array: &Array, parent: NodeId) -> Walk {
        let value = self.doc.get_path(parent, &array.path);
        self.push_path(&array.path);
        let result = self.walk_array_value(array, value);
        self.pop_path(&array.path);
        result
    }

    fn walk_array_value(&mut self, array: &Array, value: Option<NodeId>) -> Walk {
        let value = match value {
            Some(value) if !self.doc.is_null(value) => value,
            _ => return self.null_or_error(array.nullable),
        };
        let items = match self.doc.get(value) {
            Value::Array(items) => items.clone(),
            _ => {
                self.add_error("Array cannot represent non-array value.".to_string());
                return self.fail();
            }
        };

        let checkpoint = self.out.len();
        self.out.put(OPEN_BRACKET);
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.out.put(COMMA);
            }
            self.path.push(GraphQLErrorPathSegment::Index(i));
            let result = self.walk_node(&array.item, item);
            self.path.pop();
            if let Err(bubble) = result {
                return self.absorb(array.nullable, checkpoint, bubble);
            }
        }
        self.out.put(CLOSE_BRACKET);
        Ok(())
    }

    fn walk_scalar(&mut self, scalar: &Scalar, parent: NodeId, kind: ScalarKind) -> Walk {
        let value = self.doc.get_path(parent, &scalar.path);
        self.push_path(&scalar.path);
        let result = match value {
            Some(value) if !self.doc.is_null(value) => {
                if kind.accepts(self.doc.get(value)) {
                    self.doc.write(value, &mut self.out);
                    Ok(())
                } else {
                    let raw = match self.doc.get(value) {
                        Value::String(s) => s.clone(),
                        _ => self.doc.to_json_string(value),
                    };
                    self.add_error(kind.mismatch_message(&raw));
                    self.fail()
                }
            }
            _ => self.null_or_error(scalar.nullable),
        };
        self.pop_path(&scalar.path);
        result
    }

    fn skip_on_type_names(&self, value: NodeId, on_type_names: &[String]) -> bool {
        match self.doc.typename(value) {
            Some(type_name) => !on_type_names.iter().any(|name| name == type_name),
            None => true,
        }
    }

    fn null_or_error(&mut self, nullable: bool) -> Walk {
        if nullable {
            self.out.put(NULL);
            return Ok(());
        }
        let message = format!(
            "Cannot return null for non-nullable field '{}'.",
            self.field_coordinate()
        );
        self.add_error(message);
        self.fail()
    }

    /// Reacts to an error raised at the current position.
    fn fail(&mut self) -> Walk {
        match self.mode {
            Mode::Response(ErrorBehavior::Null) => {
                self.out.put(NULL);
                Ok(())
            }
            Mode::Response(ErrorBehavior::Halt) | Mode::Strict => {
                self.halted = true;
                Err(Bubble)
            }
            Mode::Response(ErrorBehavior::Propagate) => Err(Bubble),
        }
    }

    /// A child bubbled a null: a nullable container swallows it by rendering itself as null.
    fn absorb(&mut self, nullable: bool, checkpoint: usize, bubble: Bubble) -> Walk {
        if nullable && !self.halted {
            self.out.truncate(checkpoint);
            self.out.put(NULL);
            return Ok(());
        }
        Err(bubble)
    }

    fn field_coordinate(&self) -> String {
        let type_name = self
            .parent_types
            .last()
            .cloned()
            .flatten()
            .unwrap_or_else(|| self.root_type_name.to_string());
        let field_name = self
            .path
            .iter()
            .rev()
            .find_map(|segment| match segment {
                GraphQLErrorPathSegment::String(name) => Some(name.as_str()),
                GraphQLErrorPathSegment::Index(_) => None,
            })
            .unwrap_or_default();
        format!("{}.{}", type_name, field_name)
    }

    fn add_error(&mut self, message: String) {
        self.errors.push(GraphQLError {
            message,
            path: Some(self.path.clone()),
            ..Default::default()
        });
    }

    fn push_path(&mut self, path: &[String]) {
        self.path
            .extend(path.iter().map(|s| GraphQLErrorPathSegment::String(s.clone())));
    }

    fn pop_path(&mut self, path: &[String]) {
        self.path.truncate(self.path.len() - path.len());
    }
}

#[derive(Debug, Clone, Copy)]
enum ScalarKind {
    String,
    Boolean,
    Integer,
    Float,
    Any,
}

impl ScalarKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ScalarKind::String => matches!(value, Value::String(_)),
            ScalarKind::Boolean => matches!(value, Value::Bool(_)),
            ScalarKind::Integer => matches!(value, Value::I64(_) | Value::U64(_)),
            ScalarKind::Float => matches!(value, Value::I64(_) | Value::U64(_) | Value::F64(_)),
            ScalarKind::Any => true,
        }
    }

    fn mismatch_message(self, raw: &str) -> String {
        let (type_name, expected) = match self {
            ScalarKind::String => ("String", "string"),
            ScalarKind::Boolean => ("Bool", "boolean"),
            ScalarKind::Integer => ("Int", "integer"),
            ScalarKind::Float => ("Float", "float"),
            ScalarKind::Any => ("Scalar", "scalar"),
        };
        format!(
            "{} cannot represent non-{} value: \\\"{}\\\"",
            type_name, expected, raw
        )
    }
}
