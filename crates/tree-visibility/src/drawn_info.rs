//! Always/never-drawn element info.
//!
//! The viewport only stores the always-drawn and never-drawn sets as flat
//! element ids. Visibility of a model or category needs to know which of
//! those elements belong to it, so this module resolves the model and
//! category of every member with one query and indexes the result.
//!
//! The index of each set is rebuilt lazily: change events only bump a
//! generation counter, and the next reader rebuilds once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::Instrument;
use tree_visibility_core::logging::{span_names, targets};
use tree_visibility_core::{
    CancellationToken, ConnectionId, Id64, IdSet, Result, VisibilityConfig, VisibilityError,
    perf_span,
};

use crate::query::{QueryBinding, QueryDefinition, QueryExecutor, QueryOptions, collect_rows};
use crate::viewport::Viewport;

/// Which viewport set to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawnSet {
    Always,
    Never,
}

impl DrawnSet {
    fn index(self) -> usize {
        match self {
            Self::Always => 0,
            Self::Never => 1,
        }
    }
}

impl fmt::Display for DrawnSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Always => "AlwaysDrawn",
            Self::Never => "NeverDrawn",
        })
    }
}

/// Subset of a drawn set to return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementScope {
    /// Members in a model.
    Model(Id64),
    /// Members in a model that belong to one of `categories`.
    ModelCategories { model: Id64, categories: IdSet },
    /// Members among the given elements. Needs no query.
    Elements(IdSet),
}

impl ElementScope {
    pub fn model_category(model: Id64, category: Id64) -> Self {
        Self::ModelCategories {
            model,
            categories: IdSet::from([category]),
        }
    }
}

/// Members of one drawn set, keyed by model then category.
#[derive(Debug, Default)]
struct DrawnIndex {
    generation: u64,
    by_model: HashMap<Id64, HashMap<Id64, IdSet>>,
}

impl DrawnIndex {
    fn select(&self, scope: &ElementScope) -> IdSet {
        let Some(categories) = (match scope {
            ElementScope::Model(model) | ElementScope::ModelCategories { model, .. } => {
                self.by_model.get(model)
            }
            ElementScope::Elements(_) => None,
        }) else {
            return IdSet::new();
        };
        match scope {
            ElementScope::ModelCategories { categories: wanted, .. } => wanted
                .iter()
                .filter_map(|c| categories.get(c))
                .flatten()
                .copied()
                .collect(),
            _ => categories.values().flatten().copied().collect(),
        }
    }
}

struct DrawnState {
    generations: [AtomicU64; 2],
    indexes: [tokio::sync::Mutex<Option<Arc<DrawnIndex>>>; 2],
}

/// Lazily indexed view of a viewport's always/never-drawn sets.
pub struct DrawnElementInfo {
    viewport: Arc<dyn Viewport>,
    executor: Arc<dyn QueryExecutor>,
    restart_token_prefix: String,
    state: Arc<DrawnState>,
    connections: Mutex<Option<[ConnectionId; 2]>>,
    cancel: CancellationToken,
}

impl DrawnElementInfo {
    /// Create the info and subscribe to the viewport's drawn-set events.
    pub fn new(
        viewport: Arc<dyn Viewport>,
        executor: Arc<dyn QueryExecutor>,
        config: &VisibilityConfig,
    ) -> Self {
        let state = Arc::new(DrawnState {
            generations: [AtomicU64::new(0), AtomicU64::new(0)],
            indexes: [tokio::sync::Mutex::new(None), tokio::sync::Mutex::new(None)],
        });

        let events = viewport.events();
        let always = {
            let state = Arc::clone(&state);
            events.always_drawn_changed.connect(move |_| {
                state.generations[DrawnSet::Always.index()].fetch_add(1, Ordering::AcqRel);
            })
        };
        let never = {
            let state = Arc::clone(&state);
            events.never_drawn_changed.connect(move |_| {
                state.generations[DrawnSet::Never.index()].fetch_add(1, Ordering::AcqRel);
            })
        };

        Self {
            viewport,
            executor,
            restart_token_prefix: config.drawn_info_restart_token_prefix.clone(),
            state,
            connections: Mutex::new(Some([always, never])),
            cancel: CancellationToken::new(),
        }
    }

    /// Members of `set` within `scope`.
    pub async fn elements(&self, set: DrawnSet, scope: &ElementScope) -> Result<IdSet> {
        if let ElementScope::Elements(ids) = scope {
            let members = self.members(set);
            return Ok(ids.intersection(&members).copied().collect());
        }
        let index = self.index(set).await?;
        Ok(index.select(scope))
    }

    /// Whether `set` has any members at all.
    pub fn is_empty(&self, set: DrawnSet) -> bool {
        self.members(set).is_empty()
    }

    fn members(&self, set: DrawnSet) -> Arc<IdSet> {
        match set {
            DrawnSet::Always => self.viewport.always_drawn(),
            DrawnSet::Never => self.viewport.never_drawn(),
        }
    }

    async fn index(&self, set: DrawnSet) -> Result<Arc<DrawnIndex>> {
        if self.cancel.is_cancelled() {
            return Err(VisibilityError::Disposed);
        }

        // Holding the async lock across the rebuild makes it single-flight.
        let mut slot = self.state.indexes[set.index()].lock().await;
        let generation = self.state.generations[set.index()].load(Ordering::Acquire);
        if let Some(index) = slot.as_ref()
            && index.generation == generation
        {
            return Ok(Arc::clone(index));
        }

        let index = Arc::new(
            self.build_index(set, generation)
                .instrument(perf_span(span_names::DRAWN_INFO_REFRESH))
                .await?,
        );
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    async fn build_index(&self, set: DrawnSet, generation: u64) -> Result<DrawnIndex> {
        let members = self.members(set);
        let mut index = DrawnIndex {
            generation,
            by_model: HashMap::new(),
        };
        if members.is_empty() {
            return Ok(index);
        }

        tracing::debug!(
            target: targets::DRAWN_INFO,
            set = %set,
            members = members.len(),
            generation,
            "rebuilding drawn element index"
        );
        let query = QueryDefinition::new(
            "SELECT e.ECInstanceId ElementId, e.Model.Id ModelId, e.Category.Id CategoryId \
             FROM bis.GeometricElement3d e \
             WHERE InVirtualSet(:element_ids, e.ECInstanceId)",
        )
        .with_binding(QueryBinding::id_set(ELEMENT_IDS_BINDING, members.as_ref().clone()));
        let options = QueryOptions::default()
            .with_restart_token(format!("{}/{set}", self.restart_token_prefix));

        let rows = collect_rows(self.executor.as_ref(), &query, &options, &self.cancel).await?;
        for row in rows {
            index
                .by_model
                .entry(row.id("ModelId")?)
                .or_default()
                .entry(row.id("CategoryId")?)
                .or_default()
                .insert(row.id("ElementId")?);
        }
        Ok(index)
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Disconnect from the viewport. Calling it again has no effect.
    pub fn dispose(&self) {
        self.cancel.cancel();
        if let Some([always, never]) = self.connections.lock().take() {
            let events = self.viewport.events();
            events.always_drawn_changed.disconnect(always);
            events.never_drawn_changed.disconnect(never);
            tracing::debug!(target: targets::DRAWN_INFO, "drawn element info disposed");
        }
    }
}

/// Binding carrying the members of the set being indexed.
pub const ELEMENT_IDS_BINDING: &str = "element_ids";

impl Drop for DrawnElementInfo {
    fn drop(&mut self) {
        self.dispose();
    }
}

static_assertions::assert_impl_all!(DrawnElementInfo: Send, Sync);
