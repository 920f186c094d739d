use serde::{Deserialize, Serialize};

use crate::{
    cache::FetchCacheConfiguration,
    fetch::input_template::InputTemplate,
    resolve::shape::Object,
};

pub mod input_template;
pub mod items;

/// Closed set of nodes the scheduler walks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FetchTreeNode {
    Single(FetchItem),
    Sequence { children: Vec<FetchTreeNode> },
    Parallel { children: Vec<FetchTreeNode> },
}

impl FetchTreeNode {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FetchTreeNode::Single(_) => "Single",
            FetchTreeNode::Sequence { .. } => "Sequence",
            FetchTreeNode::Parallel { .. } => "Parallel",
        }
    }

    /// Number of fetches in the subtree. Fetches are numbered in pre-order, so a node's
    /// id plus this count is the id of its next sibling.
    pub fn fetch_count(&self) -> usize {
        match self {
            FetchTreeNode::Single(_) => 1,
            FetchTreeNode::Sequence { children } | FetchTreeNode::Parallel { children } => {
                children.iter().map(FetchTreeNode::fetch_count).sum()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchItem {
    pub fetch: Fetch,
    /// Where in the response the items feeding this fetch live.
    #[serde(default)]
    pub fetch_path: Vec<FetchItemPathElement>,
    /// Dot separated response path, e.g. `query.users.@.reviews`. `@` marks list items.
    #[serde(default)]
    pub response_path: String,
}

impl FetchItem {
    pub fn response_path_elements(&self) -> Vec<&str> {
        if self.response_path.is_empty() {
            return Vec::new();
        }
        self.response_path.split('.').collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchItemPathElementKind {
    Object,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchItemPathElement {
    pub kind: FetchItemPathElementKind,
    pub path: Vec<String>,
    /// Only objects with one of these `__typename`s are selected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Fetch {
    Single(SingleFetch),
    Entity(EntityFetch),
    BatchEntity(BatchEntityFetch),
}

/// Fields shared by every fetch variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfiguration {
    /// Name of the data source in the [`crate::executors::map::DataSourceMap`].
    pub data_source: String,
    #[serde(default)]
    pub post_processing: PostProcessing,
    #[serde(default)]
    pub caching: FetchCacheConfiguration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<FetchInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleFetch {
    #[serde(flatten)]
    pub configuration: FetchConfiguration,
    pub input_template: InputTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFetch {
    #[serde(flatten)]
    pub configuration: FetchConfiguration,
    pub input: EntityInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityInput {
    pub header: InputTemplate,
    pub item: InputTemplate,
    #[serde(default)]
    pub skip_err_item: bool,
    pub footer: InputTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntityFetch {
    #[serde(flatten)]
    pub configuration: FetchConfiguration,
    pub input: BatchInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInput {
    pub header: InputTemplate,
    pub items: Vec<InputTemplate>,
    pub separator: InputTemplate,
    pub footer: InputTemplate,
    #[serde(default)]
    pub skip_null_items: bool,
    #[serde(default)]
    pub skip_empty_object_items: bool,
    #[serde(default)]
    pub skip_err_items: bool,
}

impl Fetch {
    pub fn configuration(&self) -> &FetchConfiguration {
        match self {
            Fetch::Single(f) => &f.configuration,
            Fetch::Entity(f) => &f.configuration,
            Fetch::BatchEntity(f) => &f.configuration,
        }
    }

    pub fn info(&self) -> Option<&FetchInfo> {
        self.configuration().info.as_ref()
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Fetch::Single(_) => "Single",
            Fetch::Entity(_) => "Entity",
            Fetch::BatchEntity(_) => "BatchEntity",
        }
    }

    pub fn is_entity(&self) -> bool {
        matches!(self, Fetch::Entity(_) | Fetch::BatchEntity(_))
    }

    /// Name reported in fetch errors: the info's data source name, else the source id.
    pub fn subgraph_name(&self) -> Option<&str> {
        let info = self.info()?;
        [info.data_source_name.as_str(), info.data_source_id.as_str()]
            .into_iter()
            .find(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PostProcessing {
    /// Sub-path of the data source response holding the data, e.g. `["data"]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_response_data_path: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub select_response_errors_path: Option<Vec<String>>,
    /// Path under each item at which the selected data is merged.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merge_path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_template: Option<InputTemplate>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum OperationType {
    #[default]
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    pub fn root_type_name(&self) -> &'static str {
        match self {
            OperationType::Query => "Query",
            OperationType::Mutation => "Mutation",
            OperationType::Subscription => "Subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCoordinate {
    pub type_name: String,
    pub field_name: String,
}

/// Why a `(type, field)` pair is part of a fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReason {
    pub type_name: String,
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub by_subgraphs: Vec<String>,
    #[serde(default)]
    pub by_user: bool,
    #[serde(default)]
    pub is_key: bool,
    #[serde(default)]
    pub is_requires: bool,
    #[serde(default)]
    pub nullable: bool,
}

/// Planner metadata about a fetch. Read-only during execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchInfo {
    #[serde(default)]
    pub data_source_id: String,
    #[serde(default)]
    pub data_source_name: String,
    #[serde(default)]
    pub root_fields: Vec<GraphCoordinate>,
    #[serde(default)]
    pub operation_type: OperationType,
    /// Shape of the data this fetch contributes to each item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provides_data: Option<Object>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetch_reasons: Vec<FetchReason>,
}

impl FetchInfo {
    pub fn is_nullable_requires(&self, type_name: &str, field_name: &str) -> bool {
        self.fetch_reasons.iter().any(|reason| {
            reason.is_requires
                && reason.nullable
                && reason.type_name == type_name
                && reason.field_name == field_name
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_plan() {
        let node: FetchTreeNode = sonic_rs::from_str(
            r#"{
                "kind": "Sequence",
                "children": [
                    {
                        "kind": "Single",
                        "fetch": {
                            "kind": "Single",
                            "data_source": "users",
                            "post_processing": {"select_response_data_path": ["data"]},
                            "input_template": {"segments": [{"type": "static", "data": "{}"}]}
                        }
                    },
                    {
                        "kind": "Parallel",
                        "children": []
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(node.fetch_count(), 1);
        let FetchTreeNode::Sequence { children } = node else {
            panic!("expected sequence");
        };
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].kind_name(), "Single");
        let FetchTreeNode::Single(item) = &children[0] else {
            panic!("expected single");
        };
        assert_eq!(item.fetch.configuration().data_source, "users");
        assert!(item.response_path_elements().is_empty());
    }

    #[test]
    fn subgraph_name_prefers_data_source_name() {
        let mut configuration = FetchConfiguration {
            data_source: "products".to_string(),
            info: Some(FetchInfo {
                data_source_id: "0".to_string(),
                data_source_name: "products".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let fetch = Fetch::Single(SingleFetch {
            configuration: configuration.clone(),
            input_template: InputTemplate::default(),
        });
        assert_eq!(fetch.subgraph_name(), Some("products"));

        configuration.info = None;
        let fetch = Fetch::Single(SingleFetch {
            configuration,
            input_template: InputTemplate::default(),
        });
        assert_eq!(fetch.subgraph_name(), None);
    }
}
