//! Visibility statuses and their reduction.

use std::fmt;

/// Tri-state visibility of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VisibilityState {
    /// Everything the node governs is drawn.
    Visible,
    /// Nothing the node governs is drawn.
    #[default]
    Hidden,
    /// Some but not all of the node's scope is drawn.
    Partial,
}

impl VisibilityState {
    /// Map a boolean display flag to a state.
    pub fn from_displayed(displayed: bool) -> Self {
        if displayed { Self::Visible } else { Self::Hidden }
    }
}

impl fmt::Display for VisibilityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Partial => "partial",
        };
        f.write_str(name)
    }
}

/// Message keys used as status tooltips. Hosts localize them.
pub mod tooltips {
    pub const MODEL_HIDDEN: &str = "visibilityTooltips.model.hidden";
    pub const MODEL_NO_CATEGORIES: &str = "visibilityTooltips.model.noCategories";
    pub const CATEGORY_HIDDEN: &str = "visibilityTooltips.category.hidden";
    pub const CATEGORY_HIDDEN_BY_OVERRIDE: &str = "visibilityTooltips.category.hiddenThroughOverride";
    pub const CATEGORY_SHOWN_BY_OVERRIDE: &str = "visibilityTooltips.category.shownThroughOverride";
    pub const SUB_CATEGORY_HIDDEN: &str = "visibilityTooltips.subCategory.hidden";
    pub const ELEMENT_NEVER_DRAWN: &str = "visibilityTooltips.element.hiddenThroughNeverDrawnList";
    pub const ELEMENT_ALWAYS_DRAWN: &str = "visibilityTooltips.element.displayedThroughAlwaysDrawnList";
    pub const ELEMENT_NOT_IN_EXCLUSIVE: &str = "visibilityTooltips.element.hiddenDueToOtherElementsExclusivelyAlwaysDrawn";
    pub const SOME_ELEMENTS_HIDDEN: &str = "visibilityTooltips.someElementsAreHidden";
    pub const SOME_ELEMENTS_VISIBLE: &str = "visibilityTooltips.someElementsAreVisible";
    pub const SUBJECT_NO_MODELS: &str = "visibilityTooltips.subject.noModels";
    pub const CLASSIFICATION_NO_CATEGORIES: &str = "visibilityTooltips.classification.noCategories";
    pub const FAILED: &str = "visibilityStatus.failed";
}

/// Visibility status reported for a tree node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisibilityStatus {
    pub state: VisibilityState,
    /// The checkbox cannot be toggled.
    pub is_disabled: bool,
    /// Message key explaining the state.
    pub tooltip: Option<String>,
}

impl VisibilityStatus {
    pub fn new(state: VisibilityState) -> Self {
        Self {
            state,
            is_disabled: false,
            tooltip: None,
        }
    }

    pub fn visible() -> Self {
        Self::new(VisibilityState::Visible)
    }

    pub fn hidden() -> Self {
        Self::new(VisibilityState::Hidden)
    }

    pub fn partial() -> Self {
        Self::new(VisibilityState::Partial)
    }

    /// Mark the status as disabled.
    pub fn disabled(mut self) -> Self {
        self.is_disabled = true;
        self
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = Some(tooltip.into());
        self
    }

    /// Status reported when visibility could not be determined.
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::hidden()
            .disabled()
            .with_tooltip(format!("{}: {reason}", tooltips::FAILED))
    }

    pub fn is_visible(&self) -> bool {
        self.state == VisibilityState::Visible
    }

    pub fn is_hidden(&self) -> bool {
        self.state == VisibilityState::Hidden
    }

    pub fn is_partial(&self) -> bool {
        self.state == VisibilityState::Partial
    }
}

impl From<VisibilityState> for VisibilityStatus {
    fn from(state: VisibilityState) -> Self {
        Self::new(state)
    }
}

/// Reduces child states into one container state.
///
/// All visible gives visible, all hidden gives hidden, anything else gives
/// partial. An empty accumulator has no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateAccumulator {
    state: Option<VisibilityState>,
}

impl StateAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one child state.
    pub fn push(&mut self, state: VisibilityState) {
        self.state = Some(match self.state {
            None => state,
            Some(current) if current == state => current,
            Some(_) => VisibilityState::Partial,
        });
    }

    /// Whether further children can no longer change the result.
    pub fn is_determined(&self) -> bool {
        self.state == Some(VisibilityState::Partial)
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    pub fn state(&self) -> Option<VisibilityState> {
        self.state
    }
}

impl FromIterator<VisibilityState> for StateAccumulator {
    fn from_iter<I: IntoIterator<Item = VisibilityState>>(iter: I) -> Self {
        let mut acc = Self::new();
        for state in iter {
            acc.push(state);
            if acc.is_determined() {
                break;
            }
        }
        acc
    }
}
