use crate::{
    fetch::FetchItemPathElement,
    response::value::{Document, NodeId, Value},
};

/// Collects the objects a fetch reads its input from and merges its output into.
///
/// Arrays (and arrays of arrays) along the path are flattened, nulls are dropped and
/// elements carrying a type filter only keep objects of the listed types.
pub fn select_items(doc: &Document, root: NodeId, path: &[FetchItemPathElement]) -> Vec<NodeId> {
    let mut items = vec![root];
    for element in path {
        let mut next = Vec::with_capacity(items.len());
        for item in items {
            if let Some(value) = doc.get_path(item, &element.path) {
                flatten_into(doc, value, &element.type_names, &mut next);
            }
        }
        items = next;
        if items.is_empty() {
            break;
        }
    }
    items
}

fn flatten_into(doc: &Document, value: NodeId, type_names: &[String], out: &mut Vec<NodeId>) {
    match doc.get(value) {
        Value::Null => {}
        Value::Array(values) => {
            for value in values {
                flatten_into(doc, *value, type_names, out);
            }
        }
        _ => {
            if type_names.is_empty()
                || doc
                    .typename(value)
                    .is_some_and(|name| type_names.iter().any(|t| t == name))
            {
                out.push(value);
            }
        }
    }
}

/// Prints `items` the way data sources and traces see them: a single item as itself,
/// several as an array.
pub fn write_items(doc: &Document, items: &[NodeId], out: &mut Vec<u8>) {
    match items {
        [] => {}
        [item] => doc.write(*item, out),
        _ => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                doc.write(*item, out);
            }
            out.push(b']');
        }
    }
}
