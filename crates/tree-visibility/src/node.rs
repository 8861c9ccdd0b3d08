//! Node identities.
//!
//! The hierarchy layer produces generic [`HierarchyNode`]s whose kind-specific
//! fields live in an untyped extended-data bag. The visibility engine works on
//! [`VisibilityNode`], a tagged union in which kind-specific fields only exist
//! on the matching variant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tree_visibility_core::{Id64, IdSet, Result, VisibilityError};

/// A synthetic node grouping sibling elements that share a class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassGroupingNode {
    /// Full name of the grouping class.
    pub class_name: String,
    /// Category all grouped elements belong to.
    pub category_id: Id64,
    /// Grouped element ids per owning model.
    pub elements_by_model: BTreeMap<Id64, IdSet>,
}

impl ClassGroupingNode {
    /// Total number of grouped elements across all models.
    pub fn element_count(&self) -> usize {
        self.elements_by_model.values().map(|ids| ids.len()).sum()
    }
}

/// Identity of a tree node for visibility purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VisibilityNode {
    /// One subject node, possibly merging several subject ids.
    Subject { ids: IdSet },
    /// A model.
    Model { id: Id64 },
    /// A category, either under a model (models tree) or spanning all models
    /// that contain it (categories tree).
    Category { id: Id64, model_id: Option<Id64> },
    /// A subcategory of a category.
    SubCategory { category_id: Id64, id: Id64 },
    /// A geometric element.
    Element {
        id: Id64,
        model_id: Id64,
        category_id: Id64,
        parent_element_id: Option<Id64>,
    },
    /// A class grouping node.
    ClassGrouping(ClassGroupingNode),
    /// A classification table.
    ClassificationTable { id: Id64 },
    /// A classification.
    Classification { id: Id64 },
}

/// Lookup key of a node inside a filtered subtree.
///
/// Categories are keyed together with their model because the same category
/// appears under many models with different matches below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeKey {
    Subject(Id64),
    Model(Id64),
    Category { id: Id64, model_id: Option<Id64> },
    SubCategory { category_id: Id64, id: Id64 },
    Element(Id64),
    ClassificationTable(Id64),
    Classification(Id64),
}

impl VisibilityNode {
    /// Create a subject node for a single subject id.
    pub fn subject(id: Id64) -> Self {
        Self::Subject {
            ids: IdSet::from([id]),
        }
    }

    /// Create a model node.
    pub fn model(id: Id64) -> Self {
        Self::Model { id }
    }

    /// Create a category node under a model.
    pub fn category(id: Id64, model_id: Id64) -> Self {
        Self::Category {
            id,
            model_id: Some(model_id),
        }
    }

    /// Create a category node spanning every model that contains it.
    pub fn category_in_all_models(id: Id64) -> Self {
        Self::Category { id, model_id: None }
    }

    /// Create an element node without a parent element.
    pub fn element(id: Id64, model_id: Id64, category_id: Id64) -> Self {
        Self::Element {
            id,
            model_id,
            category_id,
            parent_element_id: None,
        }
    }

    /// Whether the node may report a partial status.
    pub fn is_container(&self) -> bool {
        !matches!(self, Self::Element { .. })
    }

    /// Short kind name, used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Subject { .. } => "subject",
            Self::Model { .. } => "model",
            Self::Category { .. } => "category",
            Self::SubCategory { .. } => "subCategory",
            Self::Element { .. } => "element",
            Self::ClassGrouping(_) => "classGrouping",
            Self::ClassificationTable { .. } => "classificationTable",
            Self::Classification { .. } => "classification",
        }
    }

    /// Filtered-subtree keys of this node.
    ///
    /// A subject merging several ids has one key per id. Grouping nodes have
    /// none; a filtered tree restricts them by their grouped elements.
    pub fn keys(&self) -> Vec<NodeKey> {
        match self {
            Self::Subject { ids } => ids.iter().copied().map(NodeKey::Subject).collect(),
            Self::Model { id } => vec![NodeKey::Model(*id)],
            Self::Category { id, model_id } => vec![NodeKey::Category {
                id: *id,
                model_id: *model_id,
            }],
            Self::SubCategory { category_id, id } => vec![NodeKey::SubCategory {
                category_id: *category_id,
                id: *id,
            }],
            Self::Element { id, .. } => vec![NodeKey::Element(*id)],
            Self::ClassGrouping(_) => Vec::new(),
            Self::ClassificationTable { id } => vec![NodeKey::ClassificationTable(*id)],
            Self::Classification { id } => vec![NodeKey::Classification(*id)],
        }
    }

    /// Classify a generic hierarchy node.
    pub fn try_from_hierarchy_node(node: &HierarchyNode) -> Result<Self> {
        let extended = match &node.extended_data {
            Some(value) => ExtendedData::deserialize(value).map_err(|err| {
                VisibilityError::invalid_node(format!(
                    "node '{}' has malformed extended data: {err}",
                    node.label
                ))
            })?,
            None => ExtendedData::default(),
        };

        match &node.key {
            HierarchyNodeKey::ClassGrouping {
                class_name,
                instances,
            } => classify_grouping(node, class_name, instances, extended),
            HierarchyNodeKey::Instances(instances) => classify_instances(node, instances, extended),
        }
    }
}

impl TryFrom<&HierarchyNode> for VisibilityNode {
    type Error = VisibilityError;

    fn try_from(node: &HierarchyNode) -> Result<Self> {
        Self::try_from_hierarchy_node(node)
    }
}

/// An ECInstance key: class name plus id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceKey {
    pub class_name: String,
    pub id: Id64,
}

impl InstanceKey {
    pub fn new(class_name: impl Into<String>, id: Id64) -> Self {
        Self {
            class_name: class_name.into(),
            id,
        }
    }
}

/// Key of a generic hierarchy node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HierarchyNodeKey {
    /// A node representing one or more instances.
    Instances(Vec<InstanceKey>),
    /// A class grouping node and the instances it groups.
    ClassGrouping {
        class_name: String,
        instances: Vec<InstanceKey>,
    },
}

/// A generic tree node produced by the hierarchy definition layer.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyNode {
    pub key: HierarchyNodeKey,
    pub label: String,
    pub extended_data: Option<serde_json::Value>,
}

impl HierarchyNode {
    pub fn new(key: HierarchyNodeKey, label: impl Into<String>) -> Self {
        Self {
            key,
            label: label.into(),
            extended_data: None,
        }
    }

    pub fn with_extended_data(mut self, data: serde_json::Value) -> Self {
        self.extended_data = Some(data);
        self
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExtendedData {
    is_subject: bool,
    is_model: bool,
    is_category: bool,
    is_sub_category: bool,
    is_classification_table: bool,
    is_classification: bool,
    model_id: Option<Id64>,
    category_id: Option<Id64>,
    parent_element_id: Option<Id64>,
    model_elements_map: Option<BTreeMap<Id64, Vec<Id64>>>,
}

fn first_id(node: &HierarchyNode, instances: &[InstanceKey]) -> Result<Id64> {
    instances.first().map(|key| key.id).ok_or_else(|| {
        VisibilityError::invalid_node(format!("node '{}' has no instance keys", node.label))
    })
}

fn classify_instances(
    node: &HierarchyNode,
    instances: &[InstanceKey],
    extended: ExtendedData,
) -> Result<VisibilityNode> {
    if extended.is_subject {
        return Ok(VisibilityNode::Subject {
            ids: instances.iter().map(|key| key.id).collect(),
        });
    }
    let id = first_id(node, instances)?;
    if extended.is_model {
        return Ok(VisibilityNode::Model { id });
    }
    if extended.is_category {
        return Ok(VisibilityNode::Category {
            id,
            model_id: extended.model_id,
        });
    }
    if extended.is_sub_category {
        let category_id = extended.category_id.ok_or_else(|| {
            VisibilityError::invalid_node(format!(
                "subcategory node '{}' is missing categoryId",
                node.label
            ))
        })?;
        return Ok(VisibilityNode::SubCategory { category_id, id });
    }
    if extended.is_classification_table {
        return Ok(VisibilityNode::ClassificationTable { id });
    }
    if extended.is_classification {
        return Ok(VisibilityNode::Classification { id });
    }
    match (extended.model_id, extended.category_id) {
        (Some(model_id), Some(category_id)) => Ok(VisibilityNode::Element {
            id,
            model_id,
            category_id,
            parent_element_id: extended.parent_element_id,
        }),
        _ => Err(VisibilityError::invalid_node(format!(
            "node '{}' is not a subject, model, category, classification or element",
            node.label
        ))),
    }
}

fn classify_grouping(
    node: &HierarchyNode,
    class_name: &str,
    instances: &[InstanceKey],
    extended: ExtendedData,
) -> Result<VisibilityNode> {
    let category_id = extended.category_id.ok_or_else(|| {
        VisibilityError::invalid_node(format!(
            "grouping node '{}' is missing categoryId",
            node.label
        ))
    })?;

    let elements_by_model = match (extended.model_elements_map, extended.model_id) {
        (Some(map), _) => map
            .into_iter()
            .map(|(model, ids)| (model, ids.into_iter().collect()))
            .collect(),
        (None, Some(model_id)) => {
            BTreeMap::from([(model_id, instances.iter().map(|key| key.id).collect())])
        }
        (None, None) => {
            return Err(VisibilityError::invalid_node(format!(
                "grouping node '{}' has neither modelElementsMap nor modelId",
                node.label
            )));
        }
    };

    Ok(VisibilityNode::ClassGrouping(ClassGroupingNode {
        class_name: class_name.to_string(),
        category_id,
        elements_by_model,
    }))
}
