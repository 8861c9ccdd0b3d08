//! Hierarchical visibility for CAD/BIM tree widgets.
//!
//! Models, categories and classifications trees show a tri-state checkbox on
//! every node. This crate computes those states from a viewport's display
//! state and applies checkbox toggles back to the viewport:
//!
//! - [`TreeVisibilityHandler`]: the per-tree façade
//! - [`VisibilityNode`]: node identities, classified from generic
//!   [`HierarchyNode`]s
//! - [`IdsCache`]: batched, memoized id relationship lookups
//! - [`DrawnElementInfo`]: always/never-drawn members indexed by model and
//!   category
//! - [`VisibilityStatusGetter`] / [`VisibilityStatusModifier`]: the per-kind
//!   read and write rules
//! - [`FilteredSubtreeResolver`]: match targets of filtered trees
//! - [`VisibilityChangeEventListener`]: debounced change notifications
//!
//! The data source and the viewport are collaborators supplied by the host
//! through [`QueryExecutor`] and [`Viewport`]. [`InMemoryViewport`] is a
//! complete in-process viewport.

pub mod drawn_info;
pub mod filtered;
pub mod getter;
pub mod handler;
pub mod ids_cache;
pub mod listener;
pub mod modifier;
pub mod node;
pub mod query;
pub mod status;
pub mod viewport;

pub use drawn_info::{DrawnElementInfo, DrawnSet, ElementScope};
pub use filtered::{FilterPath, FilterPathsProvider, FilteredSubtreeResolver, FilteredTree, PathNode};
pub use getter::VisibilityStatusGetter;
pub use handler::{TreeVisibilityHandler, TreeVisibilityHandlerProps};
pub use ids_cache::{IdsCache, IdsCacheStats, RelationKey};
pub use listener::{SuppressGuard, VisibilityChangeEventListener};
pub use modifier::VisibilityStatusModifier;
pub use node::{ClassGroupingNode, HierarchyNode, HierarchyNodeKey, InstanceKey, NodeKey, VisibilityNode};
pub use query::{BindingValue, QueryBinding, QueryDefinition, QueryExecutor, QueryOptions, QueryRow};
pub use status::{StateAccumulator, VisibilityState, VisibilityStatus, tooltips};
pub use viewport::{CategoryOverride, InMemoryViewport, Viewport, ViewportEventKind, ViewportEvents};

pub use tree_visibility_core::{CancellationToken, Id64, IdSet, Result, VisibilityConfig, VisibilityError};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        CancellationToken, Id64, IdSet, InMemoryViewport, QueryExecutor, Result, TreeVisibilityHandler,
        TreeVisibilityHandlerProps, Viewport, VisibilityError, VisibilityNode, VisibilityState,
        VisibilityStatus,
    };
}
