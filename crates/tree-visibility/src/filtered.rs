//! Filtered subtree resolution.
//!
//! When the tree is filtered, only the nodes on a path to a filter match are
//! shown. A container in such a tree must report and change the visibility
//! of its matches only, not of everything it would contain unfiltered.
//! [`FilteredTree`] maps each container on a match path to the match
//! targets below it.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::Instrument;
use tree_visibility_core::logging::{span_names, targets};
use tree_visibility_core::{Id64, IdSet, Result, VisibilityError, perf_span};

use crate::node::{ClassGroupingNode, NodeKey, VisibilityNode};

/// One node on a filter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathNode {
    Subject(Id64),
    Model(Id64),
    /// A category; its model comes from the preceding model node, if any.
    Category(Id64),
    /// A subcategory of the preceding category node.
    SubCategory(Id64),
    /// An element. Missing model or category are taken from the path.
    Element {
        id: Id64,
        model_id: Option<Id64>,
        category_id: Option<Id64>,
    },
    ClassificationTable(Id64),
    Classification(Id64),
}

/// Path from a root node down to a filter match, match last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPath(pub Vec<PathNode>);

impl FilterPath {
    pub fn new(nodes: impl IntoIterator<Item = PathNode>) -> Self {
        Self(nodes.into_iter().collect())
    }
}

impl From<Vec<PathNode>> for FilterPath {
    fn from(nodes: Vec<PathNode>) -> Self {
        Self(nodes)
    }
}

/// Looks up the paths to the nodes matching a filter text.
pub trait FilterPathsProvider: Send + Sync {
    fn filter_paths(&self, filter: &str) -> BoxFuture<'static, Result<Vec<FilterPath>>>;
}

#[derive(Debug, Default, Clone, Copy)]
struct PathContext {
    model: Option<Id64>,
    category: Option<Id64>,
    element: Option<Id64>,
}

fn path_error(index: usize, message: &str) -> VisibilityError {
    VisibilityError::invalid_filter_path(format!("path {index}: {message}"))
}

impl PathContext {
    fn convert(&mut self, node: PathNode, index: usize) -> Result<VisibilityNode> {
        let converted = match node {
            PathNode::Subject(id) => VisibilityNode::Subject {
                ids: IdSet::from([id]),
            },
            PathNode::Model(id) => {
                self.model = Some(id);
                VisibilityNode::Model { id }
            }
            PathNode::Category(id) => {
                self.category = Some(id);
                VisibilityNode::Category {
                    id,
                    model_id: self.model,
                }
            }
            PathNode::SubCategory(id) => VisibilityNode::SubCategory {
                category_id: self
                    .category
                    .ok_or_else(|| path_error(index, "subcategory without a preceding category"))?,
                id,
            },
            PathNode::Element {
                id,
                model_id,
                category_id,
            } => {
                let model_id = model_id
                    .or(self.model)
                    .ok_or_else(|| path_error(index, "element without a model"))?;
                let category_id = category_id
                    .or(self.category)
                    .ok_or_else(|| path_error(index, "element without a category"))?;
                let parent_element_id = self.element.replace(id);
                VisibilityNode::Element {
                    id,
                    model_id,
                    category_id,
                    parent_element_id,
                }
            }
            PathNode::ClassificationTable(id) => VisibilityNode::ClassificationTable { id },
            PathNode::Classification(id) => VisibilityNode::Classification { id },
        };
        Ok(converted)
    }
}

/// Match targets below each container of a filtered tree.
#[derive(Debug, Default)]
pub struct FilteredTree {
    targets: HashMap<NodeKey, Vec<VisibilityNode>>,
    matches: HashSet<NodeKey>,
}

impl FilteredTree {
    /// Build the target map from filter paths.
    pub fn build(paths: &[FilterPath]) -> Result<Self> {
        let mut tree = Self::default();
        for (index, path) in paths.iter().enumerate() {
            let mut context = PathContext::default();
            let nodes = path
                .0
                .iter()
                .map(|node| context.convert(*node, index))
                .collect::<Result<Vec<_>>>()?;
            let Some((target, ancestors)) = nodes.split_last() else {
                return Err(path_error(index, "empty path"));
            };

            tree.matches.extend(target.keys());
            for ancestor in ancestors {
                for key in ancestor.keys() {
                    let entry = tree.targets.entry(key).or_default();
                    if !entry.contains(target) {
                        entry.push(target.clone());
                    }
                }
            }
        }
        Ok(tree)
    }

    /// Targets restricting `node`, or `None` when the node is unrestricted.
    ///
    /// Matches themselves and nodes off every match path are unrestricted.
    pub fn targets_for(&self, node: &VisibilityNode) -> Option<Cow<'_, [VisibilityNode]>> {
        if let VisibilityNode::ClassGrouping(group) = node {
            return self.grouping_targets(group).map(Cow::Owned);
        }
        let keys = node.keys();
        if keys.iter().any(|key| self.matches.contains(key)) {
            return None;
        }
        let mut found = keys.iter().filter_map(|key| self.targets.get(key));
        let first = found.next()?;
        let Some(second) = found.next() else {
            return Some(Cow::Borrowed(first.as_slice()));
        };

        let mut merged = first.clone();
        for list in std::iter::once(second).chain(found) {
            for target in list {
                if !merged.contains(target) {
                    merged.push(target.clone());
                }
            }
        }
        Some(Cow::Owned(merged))
    }

    /// A grouping keeps its matched elements, and stands in for the targets
    /// of elements that only lead to a match.
    ///
    /// Grouped elements on no match path are left out. `None` when every
    /// grouped element is a match, or when none is on a path.
    fn grouping_targets(&self, group: &ClassGroupingNode) -> Option<Vec<VisibilityNode>> {
        let mut kept: BTreeMap<Id64, IdSet> = BTreeMap::new();
        let mut below: Vec<VisibilityNode> = Vec::new();
        let mut restricted = false;
        for (model_id, elements) in &group.elements_by_model {
            for element in elements {
                let key = NodeKey::Element(*element);
                if self.matches.contains(&key) {
                    kept.entry(*model_id).or_default().insert(*element);
                    continue;
                }
                restricted = true;
                for target in self.targets.get(&key).into_iter().flatten() {
                    if !below.contains(target) {
                        below.push(target.clone());
                    }
                }
            }
        }
        if !restricted || (kept.is_empty() && below.is_empty()) {
            return None;
        }

        let mut targets = Vec::with_capacity(below.len() + 1);
        if !kept.is_empty() {
            targets.push(VisibilityNode::ClassGrouping(ClassGroupingNode {
                class_name: group.class_name.clone(),
                category_id: group.category_id,
                elements_by_model: kept,
            }));
        }
        targets.extend(below);
        Some(targets)
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }
}

#[derive(Debug, Default)]
struct FilterState {
    filter: Option<String>,
    generation: u64,
}

/// Keeps the [`FilteredTree`] of the current filter text.
pub struct FilteredSubtreeResolver {
    provider: Arc<dyn FilterPathsProvider>,
    state: Mutex<FilterState>,
    tree: tokio::sync::Mutex<Option<(u64, Arc<FilteredTree>)>>,
}

impl FilteredSubtreeResolver {
    pub fn new(provider: Arc<dyn FilterPathsProvider>) -> Self {
        Self {
            provider,
            state: Mutex::new(FilterState::default()),
            tree: tokio::sync::Mutex::new(None),
        }
    }

    /// Change the filter text. Empty text clears the filter.
    ///
    /// Returns `true` if the filter changed.
    pub fn set_filter(&self, filter: Option<String>) -> bool {
        let filter = filter.filter(|text| !text.is_empty());
        let mut state = self.state.lock();
        if state.filter == filter {
            return false;
        }
        tracing::debug!(target: targets::FILTER, filter = ?filter, "filter changed");
        state.filter = filter;
        state.generation += 1;
        true
    }

    pub fn filter(&self) -> Option<String> {
        self.state.lock().filter.clone()
    }

    /// The tree of the current filter, or `None` when not filtering.
    ///
    /// Built once per filter text; concurrent callers share the build.
    pub async fn current_tree(&self) -> Result<Option<Arc<FilteredTree>>> {
        let (filter, generation) = {
            let state = self.state.lock();
            match &state.filter {
                Some(filter) => (filter.clone(), state.generation),
                None => return Ok(None),
            }
        };

        let mut slot = self.tree.lock().await;
        if let Some((built_for, tree)) = slot.as_ref()
            && *built_for == generation
        {
            return Ok(Some(Arc::clone(tree)));
        }

        let paths = self
            .provider
            .filter_paths(&filter)
            .instrument(perf_span(span_names::FILTER_BUILD))
            .await?;
        let tree = Arc::new(FilteredTree::build(&paths)?);
        tracing::debug!(
            target: targets::FILTER,
            paths = paths.len(),
            containers = tree.targets.len(),
            "filtered tree built"
        );
        *slot = Some((generation, Arc::clone(&tree)));
        Ok(Some(tree))
    }
}

static_assertions::assert_impl_all!(FilteredSubtreeResolver: Send, Sync);
