use serde::{Deserialize, Serialize};

/// Node of the response shape produced by the planner. Read-only during resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Object(Object),
    Array(Array),
    String(Scalar),
    Boolean(Scalar),
    Integer(Scalar),
    Float(Scalar),
    BigInt(Scalar),
    Scalar(Scalar),
    Null,
    EmptyObject,
    EmptyArray,
}

impl Node {
    pub fn path(&self) -> &[String] {
        match self {
            Node::Object(o) => &o.path,
            Node::Array(a) => &a.path,
            Node::String(s)
            | Node::Boolean(s)
            | Node::Integer(s)
            | Node::Float(s)
            | Node::BigInt(s)
            | Node::Scalar(s) => &s.path,
            Node::Null | Node::EmptyObject | Node::EmptyArray => &[],
        }
    }

    pub fn nullable(&self) -> bool {
        match self {
            Node::Object(o) => o.nullable,
            Node::Array(a) => a.nullable,
            Node::String(s)
            | Node::Boolean(s)
            | Node::Integer(s)
            | Node::Float(s)
            | Node::BigInt(s)
            | Node::Scalar(s) => s.nullable,
            Node::Null | Node::EmptyObject | Node::EmptyArray => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Object {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub nullable: bool,
    /// Exact GraphQL type of the object, used in error messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: Node,
    /// Type condition guard: the field is only rendered when the parent's `__typename`
    /// is one of these.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_type_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Array {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub nullable: bool,
    pub item: Box<Node>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scalar {
    #[serde(default)]
    pub path: Vec<String>,
    #[serde(default)]
    pub nullable: bool,
}

impl Object {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
pub(crate) mod builders {
    use super::*;

    fn path(path: &[&str]) -> Vec<String> {
        path.iter().map(|s| s.to_string()).collect()
    }

    pub fn object(path_: &[&str], nullable: bool, fields: Vec<Field>) -> Object {
        Object {
            path: path(path_),
            nullable,
            type_name: None,
            fields,
        }
    }

    pub fn field(name: &str, value: Node) -> Field {
        Field {
            name: name.to_string(),
            value,
            on_type_names: vec![],
        }
    }

    pub fn string(path_: &[&str], nullable: bool) -> Node {
        Node::String(Scalar {
            path: path(path_),
            nullable,
        })
    }

    pub fn integer(path_: &[&str], nullable: bool) -> Node {
        Node::Integer(Scalar {
            path: path(path_),
            nullable,
        })
    }

    pub fn array(path_: &[&str], nullable: bool, item: Node) -> Node {
        Node::Array(Array {
            path: path(path_),
            nullable,
            item: Box::new(item),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_nodes() {
        let node: Node = sonic_rs::from_str(
            r#"{"kind":"object","path":["user"],"nullable":true,"fields":[
                {"name":"id","value":{"kind":"string","path":["id"]}},
                {"name":"tags","value":{"kind":"array","path":["tags"],"nullable":true,"item":{"kind":"string"}}},
                {"name":"meta","value":{"kind":"empty_object"}}
            ]}"#,
        )
        .unwrap();

        let Node::Object(object) = node else {
            panic!("expected object");
        };
        assert!(object.nullable);
        assert_eq!(object.fields.len(), 3);
        assert!(!object.field("id").unwrap().value.nullable());
        assert_eq!(object.field("tags").unwrap().value.path(), ["tags"]);
    }
}
