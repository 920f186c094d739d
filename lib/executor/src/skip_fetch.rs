use crate::{
    fetch::{FetchInfo, OperationType},
    resolve::shape::{Node, Object},
    response::value::{Document, NodeId, Value},
};

/// Outcome of checking whether the items already hold what a fetch would provide.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SkipCheck {
    pub can_skip: bool,
    /// Items that are not covered yet. Null items stay listed but never block a skip.
    pub remaining: Vec<NodeId>,
}

/// All-or-nothing check: the fetch is skipped only if every item already satisfies the
/// fetch's `provides_data` shape. Mutations are never skipped.
pub fn can_skip_fetch(info: Option<&FetchInfo>, doc: &Document, items: &[NodeId]) -> SkipCheck {
    let provides = match info {
        Some(info) if info.operation_type != OperationType::Mutation => info.provides_data.as_ref(),
        _ => None,
    };
    let Some(provides) = provides else {
        return SkipCheck {
            can_skip: false,
            remaining: items.to_vec(),
        };
    };

    let remaining: Vec<NodeId> = items
        .iter()
        .copied()
        .filter(|item| doc.is_null(*item) || !satisfies(doc, *item, provides))
        .collect();
    SkipCheck {
        can_skip: remaining.iter().all(|item| doc.is_null(*item)),
        remaining,
    }
}

/// Whether the object at `node` holds every field of `shape` with valid nullability.
pub fn satisfies(doc: &Document, node: NodeId, shape: &Object) -> bool {
    if doc.as_object(node).is_none() {
        return false;
    }
    let typename = doc.typename(node);
    shape.fields.iter().all(|field| {
        if !field.on_type_names.is_empty()
            && !typename.is_some_and(|t| field.on_type_names.iter().any(|name| name == t))
        {
            return true;
        }
        let value = doc.get_path(node, field.value.path());
        value_satisfies(doc, value, &field.value)
    })
}

fn value_satisfies(doc: &Document, value: Option<NodeId>, node: &Node) -> bool {
    let Some(value) = value.filter(|value| !doc.is_null(*value)) else {
        return node.nullable();
    };
    match node {
        Node::Object(object) => satisfies(doc, value, object),
        Node::Array(array) => match doc.get(value) {
            Value::Array(elements) => elements.iter().all(|element| {
                value_satisfies(doc, doc.get_path(*element, array.item.path()), &array.item)
            }),
            _ => false,
        },
        Node::EmptyObject => doc.as_object(value).is_some(),
        Node::EmptyArray => doc.as_array(value).is_some(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::shape::builders::{array, field, object, string};

    fn info(operation_type: OperationType, provides: Object) -> FetchInfo {
        FetchInfo {
            operation_type,
            provides_data: Some(provides),
            ..Default::default()
        }
    }

    fn user_shape() -> Object {
        object(
            &[],
            false,
            vec![field(
                "user",
                Node::Object(object(
                    &["user"],
                    false,
                    vec![
                        field("id", string(&["id"], false)),
                        field("email", string(&["email"], true)),
                    ],
                )),
            )],
        )
    }

    fn parse_all(doc: &mut Document, items: &[&str]) -> Vec<NodeId> {
        items.iter().map(|item| doc.parse(item.as_bytes()).unwrap()).collect()
    }

    #[test]
    fn skips_when_every_item_is_covered() {
        let mut doc = Document::new();
        let items = parse_all(
            &mut doc,
            &[r#"{"user":{"id":"1","email":null}}"#, r#"{"user":{"id":"2"}}"#],
        );
        let check = can_skip_fetch(Some(&info(OperationType::Query, user_shape())), &doc, &items);
        assert!(check.can_skip);
        assert!(check.remaining.is_empty());
    }

    #[test]
    fn one_incomplete_item_blocks_the_whole_fetch() {
        let mut doc = Document::new();
        let items = parse_all(
            &mut doc,
            &[
                r#"{"user":{"id":"1"}}"#,
                r#"{"user":{"email":"a@b.c"}}"#,
                r#"{"user":{"id":null}}"#,
            ],
        );
        let check = can_skip_fetch(Some(&info(OperationType::Query, user_shape())), &doc, &items);
        assert!(!check.can_skip);
        assert_eq!(check.remaining, items[1..].to_vec());
    }

    #[test]
    fn never_skips_mutations_or_unknown_fetches() {
        let mut doc = Document::new();
        let items = parse_all(&mut doc, &[r#"{"user":{"id":"1"}}"#]);
        assert!(!can_skip_fetch(Some(&info(OperationType::Mutation, user_shape())), &doc, &items).can_skip);
        assert!(!can_skip_fetch(None, &doc, &items).can_skip);
        let without_shape = FetchInfo::default();
        assert!(!can_skip_fetch(Some(&without_shape), &doc, &items).can_skip);
    }

    #[test]
    fn null_items_need_nothing() {
        let mut doc = Document::new();
        let items = parse_all(&mut doc, &["null"]);
        let check = can_skip_fetch(
            Some(&info(OperationType::Query, object(&[], false, vec![]))),
            &doc,
            &items,
        );
        assert!(check.can_skip);
        assert_eq!(check.remaining, items);
    }

    #[test]
    fn null_items_stay_listed_next_to_complete_ones() {
        let shape = object(&[], false, vec![field("id", string(&["id"], false))]);
        let mut doc = Document::new();
        let items = parse_all(&mut doc, &[r#"{"id":"1"}"#, "null"]);
        let check = can_skip_fetch(Some(&info(OperationType::Query, shape)), &doc, &items);
        assert!(check.can_skip);
        assert_eq!(check.remaining, items[1..]);
    }

    #[test]
    fn walks_nested_arrays() {
        let shape = object(
            &[],
            false,
            vec![field(
                "matrix",
                array(&["matrix"], true, array(&[], false, string(&[], false))),
            )],
        );
        let fetch = info(OperationType::Query, shape);
        let mut doc = Document::new();

        let valid = parse_all(&mut doc, &[r#"{"matrix":[["a"],["b","c"],[]]}"#, r#"{"matrix":[]}"#]);
        assert!(can_skip_fetch(Some(&fetch), &doc, &valid).can_skip);

        let invalid = parse_all(&mut doc, &[r#"{"matrix":[["a"],[null]]}"#]);
        assert!(!can_skip_fetch(Some(&fetch), &doc, &invalid).can_skip);
    }
}
