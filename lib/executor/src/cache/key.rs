use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::{
    cache::CacheEntry,
    context::Context,
    fetch::GraphCoordinate,
    json_writer::{write_and_escape_string, write_object_key},
    resolve::shape::{Node, Object},
    response::value::{Document, DocumentError, NodeId, Value},
    utils::consts::{
        CLOSE_BRACE, CLOSE_BRACKET, COMMA, NULL, OPEN_BRACE, OPEN_BRACKET, TYPENAME_FIELD_NAME,
    },
};

const FALLBACK_ENTITY_TYPENAME: &str = "Entity";

/// How cache keys of a fetch are derived from its items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheKeyTemplate {
    RootQuery(RootQueryCacheKeyTemplate),
    Entity(EntityCacheKeyTemplate),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootQueryCacheKeyTemplate {
    pub root_fields: Vec<QueryField>,
    /// Lets a root field fetch derive the key an entity fetch of the same entity would use.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_key_mappings: Vec<EntityKeyMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryField {
    pub coordinate: GraphCoordinate,
    #[serde(default)]
    pub args: Vec<FieldArgument>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldArgument {
    pub name: String,
    pub variable: ArgumentVariable,
}

/// Where an argument value is read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ArgumentVariable {
    /// Request variables.
    Context { path: Vec<String> },
    /// The fetch item.
    Object { path: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityKeyMapping {
    pub entity_type_name: String,
    pub field_mappings: Vec<EntityFieldMapping>,
}

/// `argument_path` starts with the argument name, the rest walks into its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFieldMapping {
    pub entity_key_field: String,
    pub argument_path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCacheKeyTemplate {
    /// Key fields of the entity, `__typename` included.
    pub keys: Object,
}

/// Keys derived for one fetch item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub item: NodeId,
    pub keys: Vec<String>,
    /// Path under which the entity sits in the item, when the fetch is a root field fetch
    /// whose keys were derived through entity key mappings.
    pub entity_merge_path: Option<Vec<String>>,
}

impl CacheKeyTemplate {
    pub fn is_entity(&self) -> bool {
        matches!(self, CacheKeyTemplate::Entity(_))
    }

    /// Root field fetches with entity key mappings produce entity keys, which is what the
    /// request-scoped cache is keyed by.
    pub fn produces_entity_keys(&self) -> bool {
        match self {
            CacheKeyTemplate::Entity(_) => true,
            CacheKeyTemplate::RootQuery(t) => !t.entity_key_mappings.is_empty(),
        }
    }

    /// Renders the keys of every item. A non-empty `prefix` is prepended as `prefix:`.
    pub fn render(
        &self,
        ctx: &Context,
        doc: &Document,
        items: &[NodeId],
        prefix: &str,
    ) -> Vec<CacheKey> {
        let mut buf = Vec::with_capacity(64);
        items
            .iter()
            .map(|&item| {
                let keys = match self {
                    CacheKeyTemplate::Entity(t) => {
                        buf.clear();
                        write_entity_key(doc, item, &t.keys, &mut buf);
                        vec![with_prefix(prefix, &buf)]
                    }
                    CacheKeyTemplate::RootQuery(t) => t.render_item(ctx, doc, item, prefix, &mut buf),
                };
                CacheKey {
                    item,
                    keys,
                    entity_merge_path: None,
                }
            })
            .collect()
    }

    /// Path under which the entity sits in a root field response, for templates that
    /// produce entity keys from root field arguments.
    pub fn entity_merge_path(&self, merge_path: &[String]) -> Option<Vec<String>> {
        let CacheKeyTemplate::RootQuery(t) = self else {
            return None;
        };
        if t.entity_key_mappings.is_empty() {
            return None;
        }
        if !merge_path.is_empty() {
            return Some(merge_path.to_vec());
        }
        match t.root_fields.as_slice() {
            [field] => Some(vec![field.coordinate.field_name.clone()]),
            _ => None,
        }
    }
}

impl RootQueryCacheKeyTemplate {
    fn render_item(
        &self,
        ctx: &Context,
        doc: &Document,
        item: NodeId,
        prefix: &str,
        buf: &mut Vec<u8>,
    ) -> Vec<String> {
        let derived = self.render_entity_keys(ctx, doc, item, prefix, buf);
        if !derived.is_empty() {
            return derived;
        }

        self.root_fields
            .iter()
            .map(|field| {
                buf.clear();
                buf.put(OPEN_BRACE);
                write_object_key(buf, TYPENAME_FIELD_NAME, true);
                write_and_escape_string(buf, &field.coordinate.type_name);
                write_object_key(buf, "field", false);
                write_and_escape_string(buf, &field.coordinate.field_name);
                if !field.args.is_empty() {
                    write_object_key(buf, "args", false);
                    buf.put(OPEN_BRACE);
                    for (i, arg) in field.args.iter().enumerate() {
                        write_object_key(buf, &arg.name, i == 0);
                        match arg.value(ctx, doc, item) {
                            Some((source, value)) => source.write(value, buf),
                            None => buf.put(NULL),
                        }
                    }
                    buf.put(CLOSE_BRACE);
                }
                buf.put(CLOSE_BRACE);
                with_prefix(prefix, buf)
            })
            .collect()
    }

    fn render_entity_keys(
        &self,
        ctx: &Context,
        doc: &Document,
        item: NodeId,
        prefix: &str,
        buf: &mut Vec<u8>,
    ) -> Vec<String> {
        let mut keys = Vec::new();
        for mapping in &self.entity_key_mappings {
            for field in &self.root_fields {
                buf.clear();
                if mapping.write_key(field, ctx, doc, item, buf) {
                    let key = with_prefix(prefix, buf);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
        keys
    }
}

impl FieldArgument {
    fn value<'a>(
        &self,
        ctx: &'a Context,
        doc: &'a Document,
        item: NodeId,
    ) -> Option<(&'a Document, NodeId)> {
        match &self.variable {
            ArgumentVariable::Context { path } => {
                let variables = ctx.variables();
                variables.get(path).map(|value| (variables.doc(), value))
            }
            ArgumentVariable::Object { path } => doc.get_path(item, path).map(|value| (doc, value)),
        }
    }
}

impl EntityKeyMapping {
    /// Writes `{"__typename":T,"key":{..}}` from the arguments of `field`. Returns false
    /// when a mapped argument is missing or null.
    fn write_key(
        &self,
        field: &QueryField,
        ctx: &Context,
        doc: &Document,
        item: NodeId,
        out: &mut Vec<u8>,
    ) -> bool {
        if self.field_mappings.is_empty() {
            return false;
        }
        out.put(OPEN_BRACE);
        write_object_key(out, TYPENAME_FIELD_NAME, true);
        write_and_escape_string(out, &self.entity_type_name);
        write_object_key(out, "key", false);
        out.put(OPEN_BRACE);
        for (i, mapping) in self.field_mappings.iter().enumerate() {
            let Some((arg_name, rest)) = mapping.argument_path.split_first() else {
                return false;
            };
            let value = field
                .args
                .iter()
                .find(|arg| &arg.name == arg_name)
                .and_then(|arg| arg.value(ctx, doc, item))
                .and_then(|(source, value)| Some((source, source.get_path(value, rest)?)))
                .filter(|(source, value)| !source.is_null(*value));
            let Some((source, value)) = value else {
                return false;
            };
            write_object_key(out, &mapping.entity_key_field, i == 0);
            source.write(value, out);
        }
        out.put(CLOSE_BRACE);
        out.put(CLOSE_BRACE);
        true
    }
}

/// Writes `{"__typename":T,"key":{..}}` for an entity item. Only fields of `keys` are
/// included; null values are left out. A missing `__typename` falls back to `Entity`.
fn write_entity_key(doc: &Document, item: NodeId, keys: &Object, out: &mut Vec<u8>) {
    out.put(OPEN_BRACE);
    write_object_key(out, TYPENAME_FIELD_NAME, true);
    write_and_escape_string(out, doc.typename(item).unwrap_or(FALLBACK_ENTITY_TYPENAME));
    write_object_key(out, "key", false);
    write_key_object(doc, item, keys, true, out);
    out.put(CLOSE_BRACE);
}

fn write_key_object(doc: &Document, item: NodeId, object: &Object, top_level: bool, out: &mut Vec<u8>) {
    out.put(OPEN_BRACE);
    let mut first = true;
    for field in &object.fields {
        if top_level && field.name == TYPENAME_FIELD_NAME {
            continue;
        }
        let Some(value) = doc.get_path(item, field.value.path()) else {
            continue;
        };
        if doc.is_null(value) {
            continue;
        }
        write_object_key(out, &field.name, first);
        first = false;
        write_key_value(doc, value, &field.value, out);
    }
    out.put(CLOSE_BRACE);
}

fn write_key_value(doc: &Document, value: NodeId, node: &Node, out: &mut Vec<u8>) {
    match (node, doc.get(value)) {
        (Node::Object(object), Value::Object(_)) => write_key_object(doc, value, object, false, out),
        (Node::Array(array), Value::Array(elements)) => {
            out.put(OPEN_BRACKET);
            for (i, element) in elements.iter().enumerate() {
                if i > 0 {
                    out.put(COMMA);
                }
                match doc.get_path(*element, array.item.path()) {
                    Some(inner) => write_key_value(doc, inner, &array.item, out),
                    None => out.put(NULL),
                }
            }
            out.put(CLOSE_BRACKET);
        }
        _ => doc.write(value, out),
    }
}

fn with_prefix(prefix: &str, key: &[u8]) -> String {
    let key = String::from_utf8_lossy(key);
    if prefix.is_empty() {
        key.into_owned()
    } else {
        format!("{prefix}:{key}")
    }
}

/// The part of an item stored in the cache: the sub-document at the entity merge path,
/// or the whole item when there is none or it does not resolve.
pub fn cached_node(doc: &Document, key: &CacheKey) -> NodeId {
    key.entity_merge_path
        .as_deref()
        .and_then(|path| doc.get_path(key.item, path))
        .unwrap_or(key.item)
}

/// Turns keys into cache entries holding the serialized item data.
pub fn cache_keys_to_entries(doc: &Document, keys: &[CacheKey]) -> Vec<CacheEntry> {
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let value = bytes::Bytes::from(doc.to_bytes(cached_node(doc, key)));
        for name in &key.keys {
            entries.push(CacheEntry {
                key: name.clone(),
                value: value.clone(),
                remaining_ttl: None,
            });
        }
    }
    entries
}

/// Parses a cached payload into `doc`, wrapping it back under the entity merge path.
pub fn load_cached_value(
    doc: &mut Document,
    payload: &[u8],
    entity_merge_path: Option<&[String]>,
) -> Result<NodeId, DocumentError> {
    let value = doc.parse(payload)?;
    Ok(match entity_merge_path {
        Some(path) if !path.is_empty() => doc.wrap_in_path(value, path),
        _ => value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::shape::builders::{array, field, object, string};

    fn root_template(json: &str) -> CacheKeyTemplate {
        sonic_rs::from_str(json).unwrap()
    }

    fn entity_template() -> CacheKeyTemplate {
        CacheKeyTemplate::Entity(EntityCacheKeyTemplate {
            keys: object(
                &[],
                false,
                vec![
                    field("__typename", string(&["__typename"], false)),
                    field("id", string(&["id"], false)),
                ],
            ),
        })
    }

    #[test]
    fn renders_root_field_keys() {
        let template = root_template(
            r#"{"kind":"root_query","root_fields":[
                {"coordinate":{"type_name":"Query","field_name":"search"},"args":[
                    {"name":"term","variable":{"source":"context","path":["term"]}},
                    {"name":"max","variable":{"source":"context","path":["max"]}},
                    {"name":"after","variable":{"source":"context","path":["after"]}}
                ]},
                {"coordinate":{"type_name":"Query","field_name":"hero"}}
            ]}"#,
        );
        let ctx = Context::builder()
            .variables(br#"{"term":"C3PO","max":10}"#)
            .unwrap()
            .build();
        let mut doc = Document::new();
        let item = doc.parse(b"{}").unwrap();

        let keys = template.render(&ctx, &doc, &[item], "");
        assert_eq!(
            keys[0].keys,
            vec![
                r#"{"__typename":"Query","field":"search","args":{"term":"C3PO","max":10,"after":null}}"#,
                r#"{"__typename":"Query","field":"hero"}"#,
            ]
        );
        assert_eq!(keys, template.render(&ctx, &doc, &[item], ""));

        let prefixed = template.render(&ctx, &doc, &[item], "prefix");
        assert_eq!(prefixed[0].keys[1], r#"prefix:{"__typename":"Query","field":"hero"}"#);
    }

    #[test]
    fn renders_object_arguments_from_the_item() {
        let template = root_template(
            r#"{"kind":"root_query","root_fields":[
                {"coordinate":{"type_name":"Subscription","field_name":"messageAdded"},"args":[
                    {"name":"filter","variable":{"source":"object","path":["filter"]}}
                ]}
            ]}"#,
        );
        let ctx = Context::builder().build();
        let mut doc = Document::new();
        let item = doc.parse(br#"{"filter":{"room":"123","ids":[1,2]}}"#).unwrap();
        let keys = template.render(&ctx, &doc, &[item], "");
        insta::assert_snapshot!(keys[0].keys[0], @r#"{"__typename":"Subscription","field":"messageAdded","args":{"filter":{"room":"123","ids":[1,2]}}}"#);
    }

    #[test]
    fn renders_entity_keys() {
        let template = CacheKeyTemplate::Entity(EntityCacheKeyTemplate {
            keys: object(
                &[],
                false,
                vec![
                    field("__typename", string(&["__typename"], false)),
                    field("sku", string(&["sku"], false)),
                    field("upc", string(&["upc"], true)),
                    field("tags", array(&["tags"], false, string(&[], false))),
                ],
            ),
        });
        let ctx = Context::builder().build();
        let mut doc = Document::new();
        let first = doc
            .parse(br#"{"__typename":"Product","sku":"ABC","upc":null,"tags":["a","b"],"name":"Trilby"}"#)
            .unwrap();
        let second = doc.parse(br#"{"sku":"XYZ"}"#).unwrap();

        let keys = template.render(&ctx, &doc, &[first, second], "cache");
        assert_eq!(
            keys[0].keys,
            vec![r#"cache:{"__typename":"Product","key":{"sku":"ABC","tags":["a","b"]}}"#]
        );
        assert_eq!(
            keys[1].keys,
            vec![r#"cache:{"__typename":"Entity","key":{"sku":"XYZ"}}"#]
        );
    }

    fn mapped_template() -> CacheKeyTemplate {
        root_template(
            r#"{"kind":"root_query",
                "root_fields":[{"coordinate":{"type_name":"Query","field_name":"user"},"args":[
                    {"name":"id","variable":{"source":"context","path":["id"]}}
                ]}],
                "entity_key_mappings":[{"entity_type_name":"User","field_mappings":[
                    {"entity_key_field":"id","argument_path":["id"]}
                ]}]
            }"#,
        )
    }

    #[test]
    fn root_field_with_mappings_derives_entity_key() {
        let ctx = Context::builder()
            .variables(br#"{"id":"1234"}"#)
            .unwrap()
            .build();
        let mut doc = Document::new();
        let root = doc.parse(b"{}").unwrap();
        let entity = doc.parse(br#"{"__typename":"User","id":"1234"}"#).unwrap();

        let derived = mapped_template().render(&ctx, &doc, &[root], "");
        let from_entity = entity_template().render(&ctx, &doc, &[entity], "");
        assert_eq!(derived[0].keys, from_entity[0].keys);
        assert_eq!(derived[0].keys[0], r#"{"__typename":"User","key":{"id":"1234"}}"#);

        let missing = Context::builder().build();
        let fallback = mapped_template().render(&missing, &doc, &[root], "");
        assert_eq!(
            fallback[0].keys[0],
            r#"{"__typename":"Query","field":"user","args":{"id":null}}"#
        );
    }

    #[test]
    fn entity_merge_path_selection() {
        let mapped = mapped_template();
        assert_eq!(mapped.entity_merge_path(&[]), Some(vec!["user".to_string()]));
        assert_eq!(
            mapped.entity_merge_path(&["data".to_string(), "user".to_string()]),
            Some(vec!["data".to_string(), "user".to_string()])
        );
        assert_eq!(entity_template().entity_merge_path(&[]), None);

        let CacheKeyTemplate::RootQuery(mut plain) = mapped.clone() else {
            unreachable!()
        };
        plain.entity_key_mappings.clear();
        assert_eq!(CacheKeyTemplate::RootQuery(plain).entity_merge_path(&[]), None);

        let CacheKeyTemplate::RootQuery(mut multiple) = mapped else {
            unreachable!()
        };
        multiple.root_fields.push(multiple.root_fields[0].clone());
        assert_eq!(CacheKeyTemplate::RootQuery(multiple).entity_merge_path(&[]), None);
    }

    #[test]
    fn stores_entity_data_and_rewraps_it_on_load() {
        let mut doc = Document::new();
        let item = doc
            .parse(br#"{"user":{"__typename":"User","id":"1234","username":"Me"}}"#)
            .unwrap();
        let key = CacheKey {
            item,
            keys: vec![r#"{"__typename":"User","key":{"id":"1234"}}"#.to_string()],
            entity_merge_path: Some(vec!["user".to_string()]),
        };
        let entries = cache_keys_to_entries(&doc, &[key]);
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0].value.as_ref(),
            br#"{"__typename":"User","id":"1234","username":"Me"}"#
        );

        let loaded = load_cached_value(&mut doc, &entries[0].value, Some(&["user".to_string()])).unwrap();
        assert_eq!(
            doc.to_json_string(loaded),
            r#"{"user":{"__typename":"User","id":"1234","username":"Me"}}"#
        );
    }

    #[test]
    fn unresolved_merge_path_stores_whole_item() {
        let mut doc = Document::new();
        let item = doc.parse(br#"{"user":{"id":"1234"}}"#).unwrap();
        let key = CacheKey {
            item,
            keys: vec!["key1".to_string()],
            entity_merge_path: Some(vec!["nonexistent".to_string()]),
        };
        let entries = cache_keys_to_entries(&doc, &[key]);
        assert_eq!(entries[0].value.as_ref(), br#"{"user":{"id":"1234"}}"#);
    }
}
