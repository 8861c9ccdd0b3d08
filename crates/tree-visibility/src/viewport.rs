//! Viewport collaborator contract.
//!
//! The viewport owns all display state: viewed models and categories,
//! subcategory flags, per-model category overrides and the always/never-drawn
//! element sets. The engine reads it through [`Viewport`] and writes it only
//! from the modifier.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tree_visibility_core::{Id64, IdSet, Signal};

/// Per-model category override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CategoryOverride {
    /// The viewport's category flag decides.
    #[default]
    None,
    Show,
    Hide,
}

/// The five change notifications a viewport exposes.
#[derive(Debug, Default)]
pub struct ViewportEvents {
    pub always_drawn_changed: Signal<()>,
    pub never_drawn_changed: Signal<()>,
    pub viewed_categories_changed: Signal<()>,
    pub viewed_models_changed: Signal<()>,
    pub per_model_category_overrides_changed: Signal<()>,
}

/// Identifies one of the [`ViewportEvents`] signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewportEventKind {
    AlwaysDrawnChanged,
    NeverDrawnChanged,
    ViewedCategoriesChanged,
    ViewedModelsChanged,
    PerModelCategoryOverridesChanged,
}

impl ViewportEventKind {
    pub const ALL: [ViewportEventKind; 5] = [
        Self::AlwaysDrawnChanged,
        Self::NeverDrawnChanged,
        Self::ViewedCategoriesChanged,
        Self::ViewedModelsChanged,
        Self::PerModelCategoryOverridesChanged,
    ];
}

impl ViewportEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, kind: ViewportEventKind) -> &Signal<()> {
        match kind {
            ViewportEventKind::AlwaysDrawnChanged => &self.always_drawn_changed,
            ViewportEventKind::NeverDrawnChanged => &self.never_drawn_changed,
            ViewportEventKind::ViewedCategoriesChanged => &self.viewed_categories_changed,
            ViewportEventKind::ViewedModelsChanged => &self.viewed_models_changed,
            ViewportEventKind::PerModelCategoryOverridesChanged => {
                &self.per_model_category_overrides_changed
            }
        }
    }
}

/// Display state of a viewport.
///
/// Every mutation applies its whole batch and fires at most one change event.
pub trait Viewport: Send + Sync {
    fn views_model(&self, model: Id64) -> bool;

    fn views_category(&self, category: Id64) -> bool;

    fn is_sub_category_displayed(&self, sub_category: Id64) -> bool;

    fn per_model_category_override(&self, model: Id64, category: Id64) -> CategoryOverride;

    /// Categories that have a non-`None` override for `model`.
    fn overridden_categories(&self, model: Id64) -> IdSet;

    fn always_drawn(&self) -> Arc<IdSet>;

    fn never_drawn(&self) -> Arc<IdSet>;

    /// Only always-drawn elements are displayed.
    fn is_always_drawn_exclusive(&self) -> bool;

    fn change_model_display(&self, models: &[Id64], on: bool);

    fn change_category_display(&self, categories: &[Id64], on: bool, enable_all_sub_categories: bool);

    fn change_sub_category_display(&self, sub_category: Id64, on: bool);

    fn set_per_model_category_override(
        &self,
        models: &[Id64],
        categories: &[Id64],
        value: CategoryOverride,
    );

    fn set_always_drawn(&self, elements: IdSet, exclusive: bool);

    fn clear_always_drawn(&self);

    fn set_never_drawn(&self, elements: IdSet);

    fn clear_never_drawn(&self);

    fn events(&self) -> &ViewportEvents;
}

#[derive(Debug, Default)]
struct ViewportState {
    viewed_models: IdSet,
    viewed_categories: IdSet,
    hidden_sub_categories: IdSet,
    category_sub_categories: HashMap<Id64, IdSet>,
    overrides: BTreeMap<(Id64, Id64), CategoryOverride>,
    always_drawn: Arc<IdSet>,
    never_drawn: Arc<IdSet>,
    exclusive: bool,
}

/// In-process [`Viewport`] for headless hosts and tests.
///
/// Subcategories are displayed unless explicitly turned off.
#[derive(Debug, Default)]
pub struct InMemoryViewport {
    state: RwLock<ViewportState>,
    events: ViewportEvents,
}

impl InMemoryViewport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `models` displayed.
    pub fn with_viewed_models(self, models: impl IntoIterator<Item = Id64>) -> Self {
        self.state.write().viewed_models.extend(models);
        self
    }

    /// Start with `categories` displayed.
    pub fn with_viewed_categories(self, categories: impl IntoIterator<Item = Id64>) -> Self {
        self.state.write().viewed_categories.extend(categories);
        self
    }

    /// Register the subcategories of `category`, so that enabling the
    /// category with all subcategories can turn them on.
    pub fn register_sub_categories(&self, category: Id64, sub_categories: impl IntoIterator<Item = Id64>) {
        self.state
            .write()
            .category_sub_categories
            .entry(category)
            .or_default()
            .extend(sub_categories);
    }

    /// Viewed models snapshot.
    pub fn viewed_models(&self) -> IdSet {
        self.state.read().viewed_models.clone()
    }

    /// Viewed categories snapshot.
    pub fn viewed_categories(&self) -> IdSet {
        self.state.read().viewed_categories.clone()
    }
}

fn toggle(set: &mut IdSet, ids: &[Id64], on: bool) -> bool {
    let mut changed = false;
    for &id in ids {
        changed |= if on { set.insert(id) } else { set.remove(&id) };
    }
    changed
}

impl Viewport for InMemoryViewport {
    fn views_model(&self, model: Id64) -> bool {
        self.state.read().viewed_models.contains(&model)
    }

    fn views_category(&self, category: Id64) -> bool {
        self.state.read().viewed_categories.contains(&category)
    }

    fn is_sub_category_displayed(&self, sub_category: Id64) -> bool {
        !self.state.read().hidden_sub_categories.contains(&sub_category)
    }

    fn per_model_category_override(&self, model: Id64, category: Id64) -> CategoryOverride {
        self.state
            .read()
            .overrides
            .get(&(model, category))
            .copied()
            .unwrap_or_default()
    }

    fn overridden_categories(&self, model: Id64) -> IdSet {
        self.state
            .read()
            .overrides
            .range((model, Id64::INVALID)..=(model, Id64::new(u64::MAX)))
            .map(|(&(_, category), _)| category)
            .collect()
    }

    fn always_drawn(&self) -> Arc<IdSet> {
        Arc::clone(&self.state.read().always_drawn)
    }

    fn never_drawn(&self) -> Arc<IdSet> {
        Arc::clone(&self.state.read().never_drawn)
    }

    fn is_always_drawn_exclusive(&self) -> bool {
        self.state.read().exclusive
    }

    fn change_model_display(&self, models: &[Id64], on: bool) {
        let changed = toggle(&mut self.state.write().viewed_models, models, on);
        if changed {
            self.events.viewed_models_changed.emit(());
        }
    }

    fn change_category_display(&self, categories: &[Id64], on: bool, enable_all_sub_categories: bool) {
        let changed = {
            let mut state = self.state.write();
            let mut changed = toggle(&mut state.viewed_categories, categories, on);
            if on && enable_all_sub_categories {
                let subs: Vec<Id64> = categories
                    .iter()
                    .filter_map(|c| state.category_sub_categories.get(c))
                    .flatten()
                    .copied()
                    .collect();
                changed |= toggle(&mut state.hidden_sub_categories, &subs, false);
            }
            changed
        };
        if changed {
            self.events.viewed_categories_changed.emit(());
        }
    }

    fn change_sub_category_display(&self, sub_category: Id64, on: bool) {
        let changed = toggle(&mut self.state.write().hidden_sub_categories, &[sub_category], !on);
        if changed {
            self.events.viewed_categories_changed.emit(());
        }
    }

    fn set_per_model_category_override(
        &self,
        models: &[Id64],
        categories: &[Id64],
        value: CategoryOverride,
    ) {
        let changed = {
            let mut state = self.state.write();
            let mut changed = false;
            for &model in models {
                for &category in categories {
                    let previous = match value {
                        CategoryOverride::None => state.overrides.remove(&(model, category)),
                        _ => state.overrides.insert((model, category), value),
                    };
                    changed |= previous.unwrap_or_default() != value;
                }
            }
            changed
        };
        if changed {
            self.events.per_model_category_overrides_changed.emit(());
        }
    }

    fn set_always_drawn(&self, elements: IdSet, exclusive: bool) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state.always_drawn != elements || state.exclusive != exclusive;
            state.always_drawn = Arc::new(elements);
            state.exclusive = exclusive;
            changed
        };
        if changed {
            self.events.always_drawn_changed.emit(());
        }
    }

    fn clear_always_drawn(&self) {
        self.set_always_drawn(IdSet::new(), false);
    }

    fn set_never_drawn(&self, elements: IdSet) {
        let changed = {
            let mut state = self.state.write();
            let changed = *state.never_drawn != elements;
            state.never_drawn = Arc::new(elements);
            changed
        };
        if changed {
            self.events.never_drawn_changed.emit(());
        }
    }

    fn clear_never_drawn(&self) {
        self.set_never_drawn(IdSet::new());
    }

    fn events(&self) -> &ViewportEvents {
        &self.events
    }
}

static_assertions::assert_impl_all!(InMemoryViewport: Send, Sync);
