use crate::{
    response::graphql_error::{GraphQLError, GraphQLErrorPathSegment},
    utils::consts::ENTITIES_FIELD_NAME,
};

const LIST_MARKER: &str = "@";

/**
 * Maps `[_entities, 0, field]` onto the response path of the fetch.
 *
 * For example if the error path is `[_entities, 1, name]`
 * and the response path is `query.products.@.author`
 * it becomes `["products", 1, "author", "name"]`.
 *
 * An `_entities` segment that ends the path is dropped. Paths without `_entities`
 * are left untouched.
 */
pub fn rewrite_entities_path(error: &mut GraphQLError, response_path_elements: &[&str]) {
    let Some(path) = error.path.as_mut() else {
        return;
    };
    let Some(position) = path
        .iter()
        .position(|segment| matches!(segment, GraphQLErrorPathSegment::String(s) if s == ENTITIES_FIELD_NAME))
    else {
        return;
    };

    if position + 1 == path.len() {
        path.pop();
        return;
    }

    let index = match path.get(position + 1) {
        Some(GraphQLErrorPathSegment::Index(index)) => Some(*index),
        _ => None,
    };
    let rest_start = if index.is_some() { position + 2 } else { position + 1 };

    let elements = match response_path_elements.first() {
        Some(&("query" | "mutation" | "subscription")) => &response_path_elements[1..],
        _ => response_path_elements,
    };
    // The entity index only locates the innermost list.
    let last_marker = elements.iter().rposition(|element| *element == LIST_MARKER);

    let mut rewritten = Vec::with_capacity(elements.len() + path.len() - rest_start);
    for (i, element) in elements.iter().enumerate() {
        if *element == LIST_MARKER {
            if Some(i) == last_marker {
                if let Some(index) = index {
                    rewritten.push(GraphQLErrorPathSegment::Index(index));
                }
            }
            continue;
        }
        rewritten.push(GraphQLErrorPathSegment::String(element.to_string()));
    }
    rewritten.extend_from_slice(&path[rest_start..]);
    *path = rewritten;
}

pub fn add_subgraph_info_to_error(mut error: GraphQLError, subgraph_name: &str) -> GraphQLError {
    let mut extensions = error.extensions.unwrap_or_default();
    if !extensions.contains_key("serviceName") {
        extensions.insert("serviceName".to_string(), subgraph_name.into());
    }
    if !extensions.contains_key("code") {
        extensions.insert("code".to_string(), "DOWNSTREAM_SERVICE_ERROR".into());
    }
    error.extensions = Some(extensions);
    error
}
