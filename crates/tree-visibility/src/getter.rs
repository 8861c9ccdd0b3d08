//! Visibility status computation.
//!
//! Every node kind has its own rule. Container statuses are reduced from the
//! statuses of what they contain: a model from its categories, a subject
//! from its models, a classification from its categories. Categories and
//! grouping nodes combine the category's default display with the
//! always/never-drawn members inside their scope.

use std::sync::Arc;

use futures_util::future::try_join_all;
use tree_visibility_core::logging::targets;
use tree_visibility_core::{CancellationToken, Id64, IdSet, Result, VisibilityError};

use crate::drawn_info::{DrawnElementInfo, DrawnSet, ElementScope};
use crate::ids_cache::IdsCache;
use crate::node::{ClassGroupingNode, VisibilityNode};
use crate::status::{StateAccumulator, VisibilityState, VisibilityStatus, tooltips};
use crate::viewport::{CategoryOverride, Viewport};

/// Computes [`VisibilityStatus`]es from viewport state and cached id
/// relationships.
pub struct VisibilityStatusGetter {
    viewport: Arc<dyn Viewport>,
    ids_cache: Arc<IdsCache>,
    drawn: Arc<DrawnElementInfo>,
}

/// Always/never-drawn members inside some scope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DrawnCounts {
    always: u64,
    never: u64,
}

impl DrawnCounts {
    fn is_empty(&self) -> bool {
        self.always == 0 && self.never == 0
    }
}

/// Category display before always/never-drawn members are applied.
#[derive(Debug, Clone, Copy)]
struct CategoryDefault {
    visible: bool,
    tooltip: Option<&'static str>,
}

impl CategoryDefault {
    fn status(self) -> VisibilityStatus {
        let status = VisibilityStatus::new(VisibilityState::from_displayed(self.visible));
        match self.tooltip {
            Some(tooltip) => status.with_tooltip(tooltip),
            None => status,
        }
    }
}

/// Combine a scope's default display with its drawn members.
///
/// Returns the status and whether the default decided it.
fn combine(default: CategoryDefault, exclusive: bool, total: u64, counts: DrawnCounts) -> (VisibilityStatus, bool) {
    if total > 0 && counts.never >= total {
        return (VisibilityStatus::hidden().with_tooltip(tooltips::ELEMENT_NEVER_DRAWN), false);
    }
    if total > 0 && counts.always >= total {
        return (VisibilityStatus::visible().with_tooltip(tooltips::ELEMENT_ALWAYS_DRAWN), false);
    }
    if exclusive {
        let status = if counts.always > 0 {
            VisibilityStatus::partial().with_tooltip(tooltips::SOME_ELEMENTS_VISIBLE)
        } else {
            VisibilityStatus::hidden().with_tooltip(tooltips::ELEMENT_NOT_IN_EXCLUSIVE)
        };
        return (status, false);
    }
    if default.visible && counts.never > 0 {
        return (VisibilityStatus::partial().with_tooltip(tooltips::SOME_ELEMENTS_HIDDEN), false);
    }
    if !default.visible && counts.always > 0 {
        return (VisibilityStatus::partial().with_tooltip(tooltips::SOME_ELEMENTS_VISIBLE), false);
    }
    (default.status(), true)
}

fn reduce(statuses: impl IntoIterator<Item = VisibilityStatus>, empty: VisibilityStatus) -> VisibilityStatus {
    let mut acc = StateAccumulator::new();
    let mut first_tooltip = None;
    for status in statuses {
        if acc.is_empty() {
            first_tooltip = status.tooltip.clone();
        }
        acc.push(status.state);
        if acc.is_determined() {
            break;
        }
    }
    match acc.state() {
        None => empty,
        Some(VisibilityState::Partial) => VisibilityStatus::partial(),
        // Uniform children: keep the explanation of the first one.
        Some(state) => VisibilityStatus {
            state,
            is_disabled: false,
            tooltip: first_tooltip,
        },
    }
}

impl VisibilityStatusGetter {
    pub fn new(viewport: Arc<dyn Viewport>, ids_cache: Arc<IdsCache>, drawn: Arc<DrawnElementInfo>) -> Self {
        Self {
            viewport,
            ids_cache,
            drawn,
        }
    }

    /// Status of `node`.
    ///
    /// With `targets`, a container reports the merged status of the filter
    /// matches below it instead of its whole scope.
    pub async fn get_visibility_status(
        &self,
        node: &VisibilityNode,
        targets: Option<&[VisibilityNode]>,
        cancel: &CancellationToken,
    ) -> Result<VisibilityStatus> {
        cancel.check()?;
        match targets {
            Some(targets) if node.is_container() && !targets.is_empty() => {
                tracing::trace!(
                    target: targets::GETTER,
                    kind = node.kind_name(),
                    targets = targets.len(),
                    "computing filtered status"
                );
                let mut statuses = Vec::with_capacity(targets.len());
                let mut acc = StateAccumulator::new();
                for target in targets {
                    let status = self.status(target, cancel).await?;
                    acc.push(status.state);
                    statuses.push(status);
                    if acc.is_determined() {
                        break;
                    }
                }
                Ok(reduce(statuses, VisibilityStatus::hidden()))
            }
            _ => self.status(node, cancel).await,
        }
    }

    async fn status(&self, node: &VisibilityNode, cancel: &CancellationToken) -> Result<VisibilityStatus> {
        match node {
            VisibilityNode::Subject { ids } => self.subject_status(ids, cancel).await,
            VisibilityNode::Model { id } => self.model_status(*id, cancel).await,
            VisibilityNode::Category {
                id,
                model_id: Some(model_id),
            } => self.model_category_status(*model_id, *id, true, cancel).await,
            VisibilityNode::Category { id, model_id: None } => self.category_status(*id, true, cancel).await,
            VisibilityNode::SubCategory { category_id, id } => {
                self.sub_category_status(*category_id, *id, cancel).await
            }
            VisibilityNode::Element {
                id,
                model_id,
                category_id,
                ..
            } => {
                cancel.check()?;
                Ok(self.element_status(*id, *model_id, *category_id))
            }
            VisibilityNode::ClassGrouping(group) => self.grouping_status(group, cancel).await,
            VisibilityNode::ClassificationTable { id } | VisibilityNode::Classification { id } => {
                self.classification_status(*id, cancel).await
            }
        }
    }

    fn category_default(&self, model: Id64, category: Id64) -> CategoryDefault {
        match self.viewport.per_model_category_override(model, category) {
            CategoryOverride::Show => CategoryDefault {
                visible: true,
                tooltip: Some(tooltips::CATEGORY_SHOWN_BY_OVERRIDE),
            },
            CategoryOverride::Hide => CategoryDefault {
                visible: false,
                tooltip: Some(tooltips::CATEGORY_HIDDEN_BY_OVERRIDE),
            },
            CategoryOverride::None => {
                let visible = self.viewport.views_category(category);
                CategoryDefault {
                    visible,
                    tooltip: (!visible).then_some(tooltips::CATEGORY_HIDDEN),
                }
            }
        }
    }

    fn element_status(&self, id: Id64, model: Id64, category: Id64) -> VisibilityStatus {
        if !self.viewport.views_model(model) {
            return VisibilityStatus::hidden().with_tooltip(tooltips::MODEL_HIDDEN);
        }
        if self.viewport.never_drawn().contains(&id) {
            return VisibilityStatus::hidden().with_tooltip(tooltips::ELEMENT_NEVER_DRAWN);
        }
        if self.viewport.always_drawn().contains(&id) {
            return VisibilityStatus::visible().with_tooltip(tooltips::ELEMENT_ALWAYS_DRAWN);
        }
        if self.viewport.is_always_drawn_exclusive() {
            return VisibilityStatus::hidden().with_tooltip(tooltips::ELEMENT_NOT_IN_EXCLUSIVE);
        }
        self.category_default(model, category).status()
    }

    async fn drawn_counts(&self, scope: &ElementScope, cancel: &CancellationToken) -> Result<DrawnCounts> {
        let mut always = IdSet::new();
        if !self.drawn.is_empty(DrawnSet::Always) {
            cancel.check()?;
            always = self.drawn.elements(DrawnSet::Always, scope).await?;
        }
        let mut never = IdSet::new();
        if !self.drawn.is_empty(DrawnSet::Never) {
            cancel.check()?;
            never = self.drawn.elements(DrawnSet::Never, scope).await?;
        }
        Ok(DrawnCounts {
            always: always.difference(&never).count() as u64,
            never: never.len() as u64,
        })
    }

    /// Category `category` restricted to `model`.
    async fn model_category_status(
        &self,
        model: Id64,
        category: Id64,
        refine_sub_categories: bool,
        cancel: &CancellationToken,
    ) -> Result<VisibilityStatus> {
        cancel.check()?;
        if !self.viewport.views_model(model) {
            return Ok(VisibilityStatus::hidden().with_tooltip(tooltips::MODEL_HIDDEN));
        }
        let default = self.category_default(model, category);
        let scope = ElementScope::model_category(model, category);
        let counts = self.drawn_counts(&scope, cancel).await?;
        let total = if counts.is_empty() {
            0
        } else {
            cancel.check()?;
            self.ids_cache.category_elements_count(model, category).await?
        };

        let (status, from_default) = combine(default, self.viewport.is_always_drawn_exclusive(), total, counts);
        if from_default && status.is_visible() && refine_sub_categories {
            return self.refine_with_sub_categories(category, status, cancel).await;
        }
        Ok(status)
    }

    /// A visible category with hidden subcategories is partial.
    async fn refine_with_sub_categories(
        &self,
        category: Id64,
        status: VisibilityStatus,
        cancel: &CancellationToken,
    ) -> Result<VisibilityStatus> {
        cancel.check()?;
        let sub_categories = self.ids_cache.category_sub_categories(category).await?;
        let any_hidden = sub_categories
            .iter()
            .any(|sub| !self.viewport.is_sub_category_displayed(*sub));
        Ok(if any_hidden {
            VisibilityStatus::partial().with_tooltip(tooltips::SUB_CATEGORY_HIDDEN)
        } else {
            status
        })
    }

    /// Category across every model that contains it.
    async fn category_status(
        &self,
        category: Id64,
        refine_sub_categories: bool,
        cancel: &CancellationToken,
    ) -> Result<VisibilityStatus> {
        cancel.check()?;
        let models = self.ids_cache.category_models(category).await?;
        if models.is_empty() {
            let visible = self.viewport.views_category(category);
            let status = VisibilityStatus::new(VisibilityState::from_displayed(visible));
            if visible && refine_sub_categories {
                return self.refine_with_sub_categories(category, status, cancel).await;
            }
            return Ok(if visible {
                status
            } else {
                status.with_tooltip(tooltips::CATEGORY_HIDDEN)
            });
        }

        let mut statuses = Vec::with_capacity(models.len());
        let mut acc = StateAccumulator::new();
        for model in models.iter() {
            let status = self
                .model_category_status(*model, category, refine_sub_categories, cancel)
                .await?;
            acc.push(status.state);
            statuses.push(status);
            if acc.is_determined() {
                break;
            }
        }
        Ok(reduce(statuses, VisibilityStatus::hidden()))
    }

    async fn sub_category_status(
        &self,
        category: Id64,
        sub_category: Id64,
        cancel: &CancellationToken,
    ) -> Result<VisibilityStatus> {
        let category_status = self.category_status(category, false, cancel).await?;
        if category_status.is_hidden() {
            return Ok(VisibilityStatus::hidden().with_tooltip(tooltips::CATEGORY_HIDDEN));
        }
        if !self.viewport.is_sub_category_displayed(sub_category) {
            return Ok(VisibilityStatus::hidden().with_tooltip(tooltips::SUB_CATEGORY_HIDDEN));
        }
        Ok(category_status)
    }

    async fn model_status(&self, model: Id64, cancel: &CancellationToken) -> Result<VisibilityStatus> {
        cancel.check()?;
        if !self.viewport.views_model(model) {
            return Ok(VisibilityStatus::hidden().with_tooltip(tooltips::MODEL_HIDDEN));
        }
        let categories = self.ids_cache.model_categories(model).await?;

        let unknown: Vec<Id64> = self
            .viewport
            .overridden_categories(model)
            .difference(&categories)
            .copied()
            .collect();
        if !unknown.is_empty() {
            tracing::warn!(
                target: targets::GETTER,
                %model,
                categories = ?unknown,
                "viewport overrides categories the id cache does not relate to the model"
            );
            return Err(VisibilityError::inconsistent_state(format!(
                "model {model} has overrides for unrelated categories {unknown:?}"
            )));
        }

        if categories.is_empty() {
            return Ok(VisibilityStatus::visible().with_tooltip(tooltips::MODEL_NO_CATEGORIES));
        }
        let statuses = try_join_all(
            categories
                .iter()
                .map(|category| self.model_category_status(model, *category, true, cancel)),
        )
        .await?;
        Ok(reduce(statuses, VisibilityStatus::visible()))
    }

    async fn subject_status(&self, subjects: &IdSet, cancel: &CancellationToken) -> Result<VisibilityStatus> {
        cancel.check()?;
        let models = self.ids_cache.subjects_models(subjects.iter().copied()).await?;
        if models.is_empty() {
            return Ok(VisibilityStatus::hidden()
                .disabled()
                .with_tooltip(tooltips::SUBJECT_NO_MODELS));
        }

        let mut statuses = Vec::with_capacity(models.len());
        let mut acc = StateAccumulator::new();
        for model in &models {
            let status = self.model_status(*model, cancel).await?;
            acc.push(status.state);
            statuses.push(status);
            if acc.is_determined() {
                tracing::trace!(
                    target: targets::GETTER,
                    checked = statuses.len(),
                    total = models.len(),
                    "subject status determined early"
                );
                break;
            }
        }
        Ok(reduce(statuses, VisibilityStatus::hidden()))
    }

    async fn grouping_status(&self, group: &ClassGroupingNode, cancel: &CancellationToken) -> Result<VisibilityStatus> {
        let exclusive = self.viewport.is_always_drawn_exclusive();
        let mut statuses = Vec::with_capacity(group.elements_by_model.len());
        for (model, elements) in &group.elements_by_model {
            cancel.check()?;
            if !self.viewport.views_model(*model) {
                statuses.push(VisibilityStatus::hidden().with_tooltip(tooltips::MODEL_HIDDEN));
                continue;
            }
            let default = self.category_default(*model, group.category_id);
            let counts = self
                .drawn_counts(&ElementScope::Elements(elements.clone()), cancel)
                .await?;
            let (status, _) = combine(default, exclusive, elements.len() as u64, counts);
            statuses.push(status);
        }
        Ok(reduce(statuses, VisibilityStatus::hidden()))
    }

    async fn classification_status(&self, container: Id64, cancel: &CancellationToken) -> Result<VisibilityStatus> {
        cancel.check()?;
        let categories = self.ids_cache.container_categories(container).await?;
        if categories.is_empty() {
            return Ok(VisibilityStatus::hidden()
                .disabled()
                .with_tooltip(tooltips::CLASSIFICATION_NO_CATEGORIES));
        }
        let mut statuses = Vec::with_capacity(categories.len());
        let mut acc = StateAccumulator::new();
        for category in categories.iter() {
            let status = self.category_status(*category, true, cancel).await?;
            acc.push(status.state);
            statuses.push(status);
            if acc.is_determined() {
                break;
            }
        }
        Ok(reduce(statuses, VisibilityStatus::hidden()))
    }
}
