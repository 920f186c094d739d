use crate::response::value::{Document, NodeId, Value, ValueKind};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("incompatible types at path '{path}': cannot merge {source_kind} into {target_kind}")]
    IncompatibleTypes {
        path: String,
        target_kind: ValueKind,
        source_kind: ValueKind,
    },
    #[error("arrays of different length at path '{path}': {target_len} != {source_len}")]
    ArrayLengthMismatch {
        path: String,
        target_len: usize,
        source_len: usize,
    },
}

/// Merges `source` into `target`, both living in `doc`.
///
/// Objects are unioned recursively, arrays are merged element-wise and scalars are
/// replaced. A null source never overwrites existing data, a null target is replaced.
pub fn deep_merge(doc: &mut Document, target: NodeId, source: NodeId) -> Result<(), MergeError> {
    let mut path = Vec::new();
    deep_merge_internal(doc, target, source, &mut path)
}

/// Wraps `source` along `merge_path` and merges it into `target`.
pub fn merge_with_path<S: AsRef<str>>(
    doc: &mut Document,
    target: NodeId,
    source: NodeId,
    merge_path: &[S],
) -> Result<(), MergeError> {
    if merge_path.is_empty() {
        return deep_merge(doc, target, source);
    }
    let wrapped = doc.wrap_in_path(source, merge_path);
    deep_merge(doc, target, wrapped)
}

fn deep_merge_internal(
    doc: &mut Document,
    target: NodeId,
    source: NodeId,
    path: &mut Vec<String>,
) -> Result<(), MergeError> {
    if target == source {
        return Ok(());
    }

    let target_kind = doc.get(target).kind();
    let source_kind = doc.get(source).kind();

    match (target_kind, source_kind) {
        (_, ValueKind::Null) => Ok(()),
        (ValueKind::Null, _) => {
            let value = doc.get(source).clone();
            doc.set(target, value);
            Ok(())
        }
        (ValueKind::Object, ValueKind::Object) => {
            let source_fields = doc.as_object(source).map(<[_]>::to_vec).unwrap_or_default();
            for (key, source_value) in source_fields {
                match doc.field(target, &key) {
                    Some(target_value) => {
                        path.push(key);
                        deep_merge_internal(doc, target_value, source_value, path)?;
                        path.pop();
                    }
                    None => doc.set_field(target, &key, source_value),
                }
            }
            Ok(())
        }
        (ValueKind::Array, ValueKind::Array) => {
            let target_items = doc.as_array(target).map(<[_]>::to_vec).unwrap_or_default();
            let source_items = doc.as_array(source).map(<[_]>::to_vec).unwrap_or_default();
            if target_items.len() != source_items.len() {
                return Err(MergeError::ArrayLengthMismatch {
                    path: path.join("."),
                    target_len: target_items.len(),
                    source_len: source_items.len(),
                });
            }
            for (i, (t, s)) in target_items.into_iter().zip(source_items).enumerate() {
                path.push(i.to_string());
                deep_merge_internal(doc, t, s, path)?;
                path.pop();
            }
            Ok(())
        }
        (ValueKind::Object | ValueKind::Array, _) | (_, ValueKind::Object | ValueKind::Array) => {
            Err(MergeError::IncompatibleTypes {
                path: path.join("."),
                target_kind,
                source_kind,
            })
        }
        _ => {
            let value: Value = doc.get(source).clone();
            doc.set(target, value);
            Ok(())
        }
    }
}
