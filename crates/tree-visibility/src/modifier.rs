//! Visibility changes.
//!
//! Turning a node on or off is translated into viewport writes. Writes that
//! make a descendant visible enable the owning models first, so a reader
//! never observes a category that is on while its model is still off.
//!
//! Every write is preceded by a disposed check. A change that outlives its
//! handler stops before touching the viewport.

use std::sync::Arc;

use futures_util::future::try_join_all;
use tree_visibility_core::logging::targets;
use tree_visibility_core::{CancellationToken, Id64, IdSet, Result, VisibilityError};

use crate::drawn_info::{DrawnElementInfo, DrawnSet, ElementScope};
use crate::ids_cache::IdsCache;
use crate::node::VisibilityNode;
use crate::viewport::{CategoryOverride, Viewport};

/// Elements of one category in one model.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ElementGroup {
    model: Id64,
    category: Id64,
    elements: IdSet,
}

/// Applies visibility changes to a viewport.
pub struct VisibilityStatusModifier {
    viewport: Arc<dyn Viewport>,
    ids_cache: Arc<IdsCache>,
    drawn: Arc<DrawnElementInfo>,
    disposed: CancellationToken,
}

impl VisibilityStatusModifier {
    pub fn new(
        viewport: Arc<dyn Viewport>,
        ids_cache: Arc<IdsCache>,
        drawn: Arc<DrawnElementInfo>,
        disposed: CancellationToken,
    ) -> Self {
        Self {
            viewport,
            ids_cache,
            drawn,
            disposed,
        }
    }

    /// Turn `node` on or off.
    ///
    /// With `targets`, a container applies the change to the filter matches
    /// below it only.
    pub async fn change_visibility(
        &self,
        node: &VisibilityNode,
        on: bool,
        targets: Option<&[VisibilityNode]>,
    ) -> Result<()> {
        match targets {
            Some(targets) if node.is_container() && !targets.is_empty() => {
                tracing::debug!(
                    target: targets::MODIFIER,
                    kind = node.kind_name(),
                    targets = targets.len(),
                    on,
                    "changing filtered visibility"
                );
                for target in targets {
                    self.change(target, on).await?;
                }
                Ok(())
            }
            _ => self.change(node, on).await,
        }
    }

    async fn change(&self, node: &VisibilityNode, on: bool) -> Result<()> {
        self.ensure_alive()?;
        match node {
            VisibilityNode::Subject { ids } => {
                let models = self.ids_cache.subjects_models(ids.iter().copied()).await?;
                self.change_models(&models, on)?;
                self.leave_exclusive_mode(on)
            }
            VisibilityNode::Model { id } => {
                self.change_models(&IdSet::from([*id]), on)?;
                self.leave_exclusive_mode(on)
            }
            VisibilityNode::Category {
                id,
                model_id: Some(model_id),
            } => self.change_model_category(*model_id, *id, on).await,
            VisibilityNode::Category { id, model_id: None } => {
                self.change_categories(&IdSet::from([*id]), on).await
            }
            VisibilityNode::SubCategory { category_id, id } => {
                self.change_sub_category(*category_id, *id, on).await
            }
            VisibilityNode::Element {
                id,
                model_id,
                category_id,
                ..
            } => self.change_elements(
                &[ElementGroup {
                    model: *model_id,
                    category: *category_id,
                    elements: IdSet::from([*id]),
                }],
                on,
            ),
            VisibilityNode::ClassGrouping(group) => {
                let groups: Vec<ElementGroup> = group
                    .elements_by_model
                    .iter()
                    .map(|(model, elements)| ElementGroup {
                        model: *model,
                        category: group.category_id,
                        elements: elements.clone(),
                    })
                    .collect();
                self.change_elements(&groups, on)
            }
            VisibilityNode::ClassificationTable { id } | VisibilityNode::Classification { id } => {
                let categories = self.ids_cache.container_categories(*id).await?;
                self.change_categories(&categories, on).await
            }
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed.is_cancelled() {
            tracing::debug!(target: targets::MODIFIER, "skipping viewport write after dispose");
            return Err(VisibilityError::Disposed);
        }
        Ok(())
    }

    fn change_models(&self, models: &IdSet, on: bool) -> Result<()> {
        if models.is_empty() {
            return Ok(());
        }
        self.ensure_alive()?;
        let models: Vec<Id64> = models.iter().copied().collect();
        self.viewport.change_model_display(&models, on);
        Ok(())
    }

    /// Enable the models in `models` that are currently off, in one batch.
    fn enable_hidden_models(&self, models: impl IntoIterator<Item = Id64>) -> Result<()> {
        let hidden: IdSet = models
            .into_iter()
            .filter(|m| !self.viewport.views_model(*m))
            .collect();
        if !hidden.is_empty() {
            tracing::trace!(target: targets::MODIFIER, models = hidden.len(), "enabling hidden models");
        }
        self.change_models(&hidden, true)
    }

    fn displayed_by_default(&self, model: Id64, category: Id64) -> bool {
        if self.viewport.is_always_drawn_exclusive() {
            return false;
        }
        match self.viewport.per_model_category_override(model, category) {
            CategoryOverride::Show => true,
            CategoryOverride::Hide => false,
            CategoryOverride::None => self.viewport.views_category(category),
        }
    }

    /// Element rule over several groups, with one write per drawn set.
    fn change_elements(&self, groups: &[ElementGroup], on: bool) -> Result<()> {
        if on {
            self.enable_hidden_models(groups.iter().map(|g| g.model))?;
        }

        let always = self.viewport.always_drawn();
        let never = self.viewport.never_drawn();
        let mut new_always = IdSet::clone(&always);
        let mut new_never = IdSet::clone(&never);

        for group in groups {
            let by_default = self.displayed_by_default(group.model, group.category);
            for element in &group.elements {
                if on {
                    new_never.remove(element);
                    if !by_default {
                        new_always.insert(*element);
                    }
                } else {
                    new_always.remove(element);
                    if by_default {
                        new_never.insert(*element);
                    }
                }
            }
        }

        if new_never != *never {
            self.ensure_alive()?;
            self.viewport.set_never_drawn(new_never);
        }
        if new_always != *always {
            self.ensure_alive()?;
            let exclusive = self.viewport.is_always_drawn_exclusive();
            self.viewport.set_always_drawn(new_always, exclusive);
        }
        Ok(())
    }

    /// Category under one model.
    async fn change_model_category(&self, model: Id64, category: Id64, on: bool) -> Result<()> {
        if on {
            self.enable_hidden_models([model])?;
        }
        self.ensure_alive()?;
        let value = if on { CategoryOverride::Show } else { CategoryOverride::Hide };
        self.viewport.set_per_model_category_override(&[model], &[category], value);

        if on {
            self.enable_sub_categories(category).await?;
        }
        self.clear_drawn_members(&IdSet::from([model]), &IdSet::from([category]))
            .await?;
        self.leave_exclusive_mode(on)
    }

    /// Exclusive always-drawn mode hides everything outside the set, so a
    /// container turned on switches it off and keeps the set's members.
    fn leave_exclusive_mode(&self, on: bool) -> Result<()> {
        if !on || !self.viewport.is_always_drawn_exclusive() {
            return Ok(());
        }
        self.ensure_alive()?;
        tracing::debug!(target: targets::MODIFIER, "leaving exclusive always-drawn mode");
        let always = self.viewport.always_drawn();
        self.viewport.set_always_drawn(IdSet::clone(&always), false);
        Ok(())
    }

    async fn enable_sub_categories(&self, category: Id64) -> Result<()> {
        let sub_categories = self.ids_cache.category_sub_categories(category).await?;
        for sub in sub_categories.iter() {
            if !self.viewport.is_sub_category_displayed(*sub) {
                self.ensure_alive()?;
                self.viewport.change_sub_category_display(*sub, true);
            }
        }
        Ok(())
    }

    /// Categories across every model that contains them.
    async fn change_categories(&self, categories: &IdSet, on: bool) -> Result<()> {
        if categories.is_empty() {
            return Ok(());
        }
        let model_sets = try_join_all(categories.iter().map(|c| self.ids_cache.category_models(*c))).await?;
        let models: IdSet = model_sets.iter().flat_map(|set| set.iter().copied()).collect();

        if on {
            self.enable_hidden_models(models.iter().copied())?;
        }
        let categories_list: Vec<Id64> = categories.iter().copied().collect();
        self.ensure_alive()?;
        self.viewport.change_category_display(&categories_list, on, on);

        if !models.is_empty() {
            let models_list: Vec<Id64> = models.iter().copied().collect();
            self.ensure_alive()?;
            self.viewport
                .set_per_model_category_override(&models_list, &categories_list, CategoryOverride::None);
        }
        self.clear_drawn_members(&models, categories).await?;
        self.leave_exclusive_mode(on)
    }

    async fn change_sub_category(&self, category: Id64, sub_category: Id64, on: bool) -> Result<()> {
        if on {
            let models = self.ids_cache.category_models(category).await?;
            self.enable_hidden_models(models.iter().copied())?;
            if !self.viewport.views_category(category) {
                self.ensure_alive()?;
                self.viewport.change_category_display(&[category], true, false);
            }
            // With the category flag on, a cleared override shows it.
            let hidden_by_override: Vec<Id64> = models
                .iter()
                .copied()
                .filter(|model| self.viewport.per_model_category_override(*model, category) == CategoryOverride::Hide)
                .collect();
            if !hidden_by_override.is_empty() {
                self.ensure_alive()?;
                self.viewport
                    .set_per_model_category_override(&hidden_by_override, &[category], CategoryOverride::None);
            }
        }
        self.ensure_alive()?;
        self.viewport.change_sub_category_display(sub_category, on);
        self.leave_exclusive_mode(on)
    }

    /// Remove the members of `categories` in `models` from both drawn sets.
    async fn clear_drawn_members(&self, models: &IdSet, categories: &IdSet) -> Result<()> {
        for set in [DrawnSet::Always, DrawnSet::Never] {
            if self.drawn.is_empty(set) {
                continue;
            }
            let mut members = IdSet::new();
            for model in models {
                let scope = ElementScope::ModelCategories {
                    model: *model,
                    categories: categories.clone(),
                };
                members.extend(self.drawn.elements(set, &scope).await?);
            }
            if members.is_empty() {
                continue;
            }

            self.ensure_alive()?;
            match set {
                DrawnSet::Always => {
                    let remaining: IdSet = self.viewport.always_drawn().difference(&members).copied().collect();
                    let exclusive = self.viewport.is_always_drawn_exclusive();
                    self.viewport.set_always_drawn(remaining, exclusive);
                }
                DrawnSet::Never => {
                    let remaining: IdSet = self.viewport.never_drawn().difference(&members).copied().collect();
                    self.viewport.set_never_drawn(remaining);
                }
            }
        }
        Ok(())
    }
}

