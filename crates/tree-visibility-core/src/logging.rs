//! Logging facilities for the visibility engine.
//!
//! The engine reports through `tracing`. Hosts install a subscriber and
//! filter by the targets below:
//!
//! ```ignore
//! tracing_subscriber::fmt()
//!     .with_env_filter("tree_visibility::ids_cache=debug,tree_visibility::perf=info")
//!     .init();
//! ```

/// Operation names carried by [`perf_span`] spans.
pub mod span_names {
    /// Execution of one batched relationship query.
    pub const IDS_BATCH: &str = "tree_visibility::ids_batch";
    /// Rebuild of the always/never-drawn element index.
    pub const DRAWN_INFO_REFRESH: &str = "tree_visibility::drawn_info_refresh";
    /// One user-initiated visibility change.
    pub const CHANGE_VISIBILITY: &str = "tree_visibility::change_visibility";
    /// Construction of a filtered subtree target map.
    pub const FILTER_BUILD: &str = "tree_visibility::filter_build";
}

/// Log targets, one per subsystem.
pub mod targets {
    pub const SIGNAL: &str = "tree_visibility_core::signal";
    pub const IDS_CACHE: &str = "tree_visibility::ids_cache";
    pub const DRAWN_INFO: &str = "tree_visibility::drawn_info";
    pub const GETTER: &str = "tree_visibility::getter";
    pub const MODIFIER: &str = "tree_visibility::modifier";
    pub const FILTER: &str = "tree_visibility::filtered";
    pub const LISTENER: &str = "tree_visibility::listener";
    pub const HANDLER: &str = "tree_visibility::handler";
}

/// Timing span for one operation.
///
/// The span is not entered. Attach it to a future with
/// `tracing::Instrument::instrument` so it follows the work across `.await`
/// points.
pub fn perf_span(name: &'static str) -> tracing::Span {
    tracing::info_span!(target: "tree_visibility::perf", "perf", operation = name)
}
