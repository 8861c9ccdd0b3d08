//! Compiling request batches into one query and splitting its result.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tree_visibility_core::{Id64, IdSet, Result, VisibilityError};

use crate::query::{QueryBinding, QueryDefinition, QueryRow};

/// Key of one memoized id relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKey {
    /// Models under a subject and all its child subjects.
    SubjectModels(Id64),
    /// Categories of the elements in a model.
    ModelCategories(Id64),
    /// Models containing elements of a category.
    CategoryModels(Id64),
    /// Subcategories of a category.
    CategorySubCategories(Id64),
    /// Categories under a classification table or classification,
    /// including child classifications.
    ContainerCategories(Id64),
    /// Number of elements of `category` in `model`.
    CategoryElementsCount { model: Id64, category: Id64 },
}

/// Memoized value of a [`RelationKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationValue {
    Ids(Arc<IdSet>),
    Count(u64),
}

impl RelationValue {
    pub(crate) fn into_ids(self) -> Result<Arc<IdSet>> {
        match self {
            Self::Ids(ids) => Ok(ids),
            Self::Count(_) => Err(VisibilityError::inconsistent_state(
                "id relationship resolved to a count",
            )),
        }
    }

    pub(crate) fn into_count(self) -> Result<u64> {
        match self {
            Self::Count(count) => Ok(count),
            Self::Ids(_) => Err(VisibilityError::inconsistent_state(
                "element count resolved to an id set",
            )),
        }
    }
}

/// Relationship class; one CTE per class present in a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    SubjectModels,
    ModelCategories,
    CategoryModels,
    CategorySubCategories,
    ContainerCategories,
    CategoryElementsCount,
}

impl RelationKind {
    const ALL: [RelationKind; 6] = [
        Self::SubjectModels,
        Self::ModelCategories,
        Self::CategoryModels,
        Self::CategorySubCategories,
        Self::ContainerCategories,
        Self::CategoryElementsCount,
    ];

    /// Value of the `Relation` column.
    pub fn name(self) -> &'static str {
        match self {
            Self::SubjectModels => "SubjectModels",
            Self::ModelCategories => "ModelCategories",
            Self::CategoryModels => "CategoryModels",
            Self::CategorySubCategories => "CategorySubCategories",
            Self::ContainerCategories => "ContainerCategories",
            Self::CategoryElementsCount => "CategoryElementsCount",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Name of the id-set binding carrying the requested keys.
    pub fn keys_binding(self) -> &'static str {
        match self {
            Self::SubjectModels => "subject_models_keys",
            Self::ModelCategories => "model_categories_keys",
            Self::CategoryModels => "category_models_keys",
            Self::CategorySubCategories => "category_sub_categories_keys",
            Self::ContainerCategories => "container_categories_keys",
            Self::CategoryElementsCount => COUNT_MODELS_BINDING,
        }
    }

    fn ctes(self) -> &'static [&'static str] {
        match self {
            Self::SubjectModels => &[
                "SubjectTree(RootId, SubjectId) AS (
    SELECT s.ECInstanceId, s.ECInstanceId FROM bis.Subject s WHERE InVirtualSet(:subject_models_keys, s.ECInstanceId)
    UNION ALL
    SELECT t.RootId, s.ECInstanceId FROM SubjectTree t JOIN bis.Subject s ON s.Parent.Id = t.SubjectId
  )",
                "SubjectModels(KeyId, ValueId) AS (
    SELECT DISTINCT t.RootId, m.ECInstanceId
    FROM SubjectTree t
    JOIN bis.InformationPartitionElement p ON p.Parent.Id = t.SubjectId
    JOIN bis.GeometricModel3d m ON m.ModeledElement.Id = p.ECInstanceId
    WHERE NOT m.IsPrivate
  )",
            ],
            Self::ModelCategories => &["ModelCategories(KeyId, ValueId) AS (
    SELECT DISTINCT e.Model.Id, e.Category.Id FROM bis.GeometricElement3d e
    WHERE InVirtualSet(:model_categories_keys, e.Model.Id)
  )"],
            Self::CategoryModels => &["CategoryModels(KeyId, ValueId) AS (
    SELECT DISTINCT e.Category.Id, e.Model.Id FROM bis.GeometricElement3d e
    WHERE InVirtualSet(:category_models_keys, e.Category.Id)
  )"],
            Self::CategorySubCategories => &["CategorySubCategories(KeyId, ValueId) AS (
    SELECT sc.Parent.Id, sc.ECInstanceId FROM bis.SubCategory sc
    WHERE InVirtualSet(:category_sub_categories_keys, sc.Parent.Id)
  )"],
            Self::ContainerCategories => &[
                "ClassificationTree(RootId, ClassificationId) AS (
    SELECT c.ECInstanceId, c.ECInstanceId FROM ClassificationSystems.Classification c
    WHERE InVirtualSet(:container_categories_keys, c.ECInstanceId)
    UNION ALL
    SELECT c.Model.Id, c.ECInstanceId FROM ClassificationSystems.Classification c
    WHERE InVirtualSet(:container_categories_keys, c.Model.Id) AND c.Parent.Id IS NULL
    UNION ALL
    SELECT t.RootId, c.ECInstanceId FROM ClassificationTree t
    JOIN ClassificationSystems.Classification c ON c.Parent.Id = t.ClassificationId
  )",
                "ContainerCategories(KeyId, ValueId) AS (
    SELECT DISTINCT t.RootId, e.Category.Id
    FROM ClassificationTree t
    JOIN ClassificationSystems.ElementHasClassifications r ON r.TargetECInstanceId = t.ClassificationId
    JOIN bis.GeometricElement3d e ON e.ECInstanceId = r.SourceECInstanceId
  )",
            ],
            Self::CategoryElementsCount => &["CategoryElementsCount(KeyId, SecondaryKeyId, ValueCount) AS (
    SELECT e.Model.Id, e.Category.Id, COUNT(*) FROM bis.GeometricElement3d e
    WHERE InVirtualSet(:category_elements_count_models, e.Model.Id)
      AND InVirtualSet(:category_elements_count_categories, e.Category.Id)
    GROUP BY e.Model.Id, e.Category.Id
  )"],
        }
    }

    fn select(self) -> String {
        let name = self.name();
        match self {
            Self::CategoryElementsCount => format!(
                "SELECT '{name}' Relation, KeyId, SecondaryKeyId, NULL ValueId, ValueCount FROM {name}"
            ),
            _ => format!(
                "SELECT '{name}' Relation, KeyId, NULL SecondaryKeyId, ValueId, NULL ValueCount FROM {name}"
            ),
        }
    }
}

/// Binding names of the element count relation.
pub const COUNT_MODELS_BINDING: &str = "category_elements_count_models";
pub const COUNT_CATEGORIES_BINDING: &str = "category_elements_count_categories";

impl RelationKey {
    pub fn kind(self) -> RelationKind {
        match self {
            Self::SubjectModels(_) => RelationKind::SubjectModels,
            Self::ModelCategories(_) => RelationKind::ModelCategories,
            Self::CategoryModels(_) => RelationKind::CategoryModels,
            Self::CategorySubCategories(_) => RelationKind::CategorySubCategories,
            Self::ContainerCategories(_) => RelationKind::ContainerCategories,
            Self::CategoryElementsCount { .. } => RelationKind::CategoryElementsCount,
        }
    }

    /// Value of a key the query produced no rows for.
    pub fn empty_value(self) -> RelationValue {
        match self {
            Self::CategoryElementsCount { .. } => RelationValue::Count(0),
            _ => RelationValue::Ids(Arc::new(IdSet::new())),
        }
    }

    fn primary_id(self) -> Id64 {
        match self {
            Self::SubjectModels(id)
            | Self::ModelCategories(id)
            | Self::CategoryModels(id)
            | Self::CategorySubCategories(id)
            | Self::ContainerCategories(id) => id,
            Self::CategoryElementsCount { model, .. } => model,
        }
    }
}

/// Compile a batch of keys into one query.
///
/// Emits one CTE group per relationship class present and a `UNION ALL` of
/// their selects. All output rows share the columns `Relation`, `KeyId`,
/// `SecondaryKeyId`, `ValueId` and `ValueCount`.
pub fn compile(keys: &[RelationKey]) -> QueryDefinition {
    let mut by_kind: BTreeMap<RelationKind, IdSet> = BTreeMap::new();
    let mut count_categories = IdSet::new();
    for key in keys {
        by_kind.entry(key.kind()).or_default().insert(key.primary_id());
        if let RelationKey::CategoryElementsCount { category, .. } = key {
            count_categories.insert(*category);
        }
    }

    let mut query = QueryDefinition::default();
    let mut selects = Vec::with_capacity(by_kind.len());
    for (kind, ids) in by_kind {
        query.ctes.extend(kind.ctes().iter().map(|cte| cte.to_string()));
        selects.push(kind.select());
        query.bindings.push(QueryBinding::id_set(kind.keys_binding(), ids));
        if kind == RelationKind::CategoryElementsCount {
            query.bindings.push(QueryBinding::id_set(
                COUNT_CATEGORIES_BINDING,
                std::mem::take(&mut count_categories),
            ));
        }
    }
    query.ecsql = selects.join("\nUNION ALL\n");
    query
}

/// Split the rows of a compiled batch into per-key values.
///
/// Every requested key gets a value; keys without rows resolve empty.
/// Rows for keys that were not requested are ignored.
pub fn resolve(keys: &[RelationKey], rows: &[QueryRow]) -> Result<HashMap<RelationKey, RelationValue>> {
    let mut ids: HashMap<RelationKey, IdSet> = HashMap::new();
    let mut counts: HashMap<RelationKey, u64> = HashMap::new();

    for row in rows {
        let relation = row.str("Relation")?;
        let kind = RelationKind::from_name(relation)
            .ok_or_else(|| VisibilityError::query(format!("unknown relation '{relation}'")))?;
        let key_id = row.id("KeyId")?;
        match kind {
            RelationKind::CategoryElementsCount => {
                let key = RelationKey::CategoryElementsCount {
                    model: key_id,
                    category: row.id("SecondaryKeyId")?,
                };
                *counts.entry(key).or_default() += row.u64("ValueCount")?;
            }
            _ => {
                let key = match kind {
                    RelationKind::SubjectModels => RelationKey::SubjectModels(key_id),
                    RelationKind::ModelCategories => RelationKey::ModelCategories(key_id),
                    RelationKind::CategoryModels => RelationKey::CategoryModels(key_id),
                    RelationKind::CategorySubCategories => RelationKey::CategorySubCategories(key_id),
                    _ => RelationKey::ContainerCategories(key_id),
                };
                if let Some(value) = row.opt_id("ValueId")? {
                    ids.entry(key).or_default().insert(value);
                }
            }
        }
    }

    Ok(keys
        .iter()
        .map(|&key| {
            let value = match key {
                RelationKey::CategoryElementsCount { .. } => {
                    counts.get(&key).map(|&count| RelationValue::Count(count))
                }
                _ => ids.remove(&key).map(|set| RelationValue::Ids(Arc::new(set))),
            };
            (key, value.unwrap_or_else(|| key.empty_value()))
        })
        .collect())
}
