//! Tree visibility handler.
//!
//! The façade a tree widget talks to. One handler is created per tree
//! instance; it owns the id relationship cache, the always/never-drawn info
//! and the change listener of that tree and disposes them together.

use std::sync::Arc;

use tracing::Instrument;
use tree_visibility_core::logging::{span_names, targets};
use tree_visibility_core::{
    CancellationToken, Result, Signal, VisibilityConfig, VisibilityError, perf_span,
};

use crate::drawn_info::DrawnElementInfo;
use crate::filtered::{FilterPathsProvider, FilteredSubtreeResolver};
use crate::getter::VisibilityStatusGetter;
use crate::ids_cache::{IdsCache, IdsCacheStats};
use crate::listener::VisibilityChangeEventListener;
use crate::modifier::VisibilityStatusModifier;
use crate::node::{HierarchyNode, VisibilityNode};
use crate::query::QueryExecutor;
use crate::status::VisibilityStatus;
use crate::viewport::Viewport;

/// Collaborators and settings of a [`TreeVisibilityHandler`].
pub struct TreeVisibilityHandlerProps {
    pub viewport: Arc<dyn Viewport>,
    pub executor: Arc<dyn QueryExecutor>,
    pub config: VisibilityConfig,
    /// Needed only by trees that can be filtered.
    pub filter_paths_provider: Option<Arc<dyn FilterPathsProvider>>,
}

impl TreeVisibilityHandlerProps {
    pub fn new(viewport: Arc<dyn Viewport>, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            viewport,
            executor,
            config: VisibilityConfig::default(),
            filter_paths_provider: None,
        }
    }

    pub fn with_config(mut self, config: VisibilityConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_filter_paths_provider(mut self, provider: Arc<dyn FilterPathsProvider>) -> Self {
        self.filter_paths_provider = Some(provider);
        self
    }
}

/// Visibility statuses and changes for one tree.
///
/// # Example
///
/// ```ignore
/// let handler = TreeVisibilityHandler::new(TreeVisibilityHandlerProps::new(viewport, executor))?;
/// handler.on_visibility_change().connect(|_| refresh_checkboxes());
///
/// let status = handler.get_visibility_status(&VisibilityNode::model(model_id)).await;
/// if !status.is_visible() {
///     handler.change_visibility(&VisibilityNode::model(model_id), true).await?;
/// }
/// ```
pub struct TreeVisibilityHandler {
    ids_cache: Arc<IdsCache>,
    drawn: Arc<DrawnElementInfo>,
    getter: VisibilityStatusGetter,
    modifier: VisibilityStatusModifier,
    listener: VisibilityChangeEventListener,
    resolver: Option<FilteredSubtreeResolver>,
    disposed: CancellationToken,
}

impl TreeVisibilityHandler {
    /// Create the handler. Must be called inside a Tokio runtime.
    pub fn new(props: TreeVisibilityHandlerProps) -> Result<Self> {
        let TreeVisibilityHandlerProps {
            viewport,
            executor,
            config,
            filter_paths_provider,
        } = props;

        let ids_cache = Arc::new(IdsCache::new(Arc::clone(&executor), &config)?);
        let drawn = Arc::new(DrawnElementInfo::new(Arc::clone(&viewport), executor, &config));
        let listener = VisibilityChangeEventListener::new(Arc::clone(&viewport), &config)?;
        let disposed = CancellationToken::new();

        let getter = VisibilityStatusGetter::new(Arc::clone(&viewport), Arc::clone(&ids_cache), Arc::clone(&drawn));
        let modifier = VisibilityStatusModifier::new(
            viewport,
            Arc::clone(&ids_cache),
            Arc::clone(&drawn),
            disposed.clone(),
        );

        tracing::debug!(
            target: targets::HANDLER,
            filterable = filter_paths_provider.is_some(),
            "tree visibility handler created"
        );
        Ok(Self {
            ids_cache,
            drawn,
            getter,
            modifier,
            listener,
            resolver: filter_paths_provider.map(FilteredSubtreeResolver::new),
            disposed,
        })
    }

    /// Status of `node`. Never fails: a status that cannot be determined is
    /// reported hidden and disabled, with the failure in the tooltip.
    pub async fn get_visibility_status(&self, node: &VisibilityNode) -> VisibilityStatus {
        match self.try_get_visibility_status(node).await {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(
                    target: targets::HANDLER,
                    kind = node.kind_name(),
                    %error,
                    "failed to determine visibility status"
                );
                VisibilityStatus::failed(error)
            }
        }
    }

    /// Status of `node`, or the error that prevented computing it.
    pub async fn try_get_visibility_status(&self, node: &VisibilityNode) -> Result<VisibilityStatus> {
        self.ensure_alive()?;
        let targets = self.targets_for(node).await?;
        self.getter
            .get_visibility_status(node, targets.as_deref(), &self.disposed)
            .await
            .map_err(|error| self.map_cancelled(error))
    }

    /// Statuses of many nodes.
    ///
    /// Cancelling `cancel` stops issuing lookups and fails the whole read
    /// with `Cancelled`. Other per-node failures become failed statuses.
    pub async fn get_visibility_statuses(
        &self,
        nodes: &[VisibilityNode],
        cancel: &CancellationToken,
    ) -> Result<Vec<VisibilityStatus>> {
        let mut statuses = Vec::with_capacity(nodes.len());
        for node in nodes {
            self.ensure_alive()?;
            cancel.check()?;
            let targets = self.targets_for(node).await?;
            let status = match self.getter.get_visibility_status(node, targets.as_deref(), cancel).await {
                Ok(status) => status,
                Err(VisibilityError::Cancelled) => {
                    tracing::debug!(
                        target: targets::HANDLER,
                        completed = statuses.len(),
                        total = nodes.len(),
                        "bulk visibility read cancelled"
                    );
                    return Err(VisibilityError::Cancelled);
                }
                Err(VisibilityError::Disposed) => return Err(VisibilityError::Disposed),
                Err(error) => VisibilityStatus::failed(error),
            };
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Classify a generic hierarchy node and return its status.
    pub async fn get_hierarchy_node_visibility(&self, node: &HierarchyNode) -> VisibilityStatus {
        match VisibilityNode::try_from_hierarchy_node(node) {
            Ok(node) => self.get_visibility_status(&node).await,
            Err(error) => {
                tracing::warn!(target: targets::HANDLER, label = %node.label, %error, "unclassifiable node");
                VisibilityStatus::failed(error)
            }
        }
    }

    /// Turn `node` on or off.
    ///
    /// Produces exactly one `on_visibility_change` notification, however
    /// many viewport writes the change needs.
    pub async fn change_visibility(&self, node: &VisibilityNode, on: bool) -> Result<()> {
        self.ensure_alive()?;
        let mut batch = self.listener.begin_batch();
        batch.notify_on_release();

        async {
            let targets = self.targets_for(node).await?;
            tracing::debug!(target: targets::HANDLER, kind = node.kind_name(), on, "changing visibility");
            self.modifier.change_visibility(node, on, targets.as_deref()).await
        }
        .instrument(perf_span(span_names::CHANGE_VISIBILITY))
        .await
    }

    /// Set the filter text of a filterable tree.
    ///
    /// Returns `true` if the filter changed. Container statuses depend on
    /// the filter, so a change notifies.
    pub fn set_filter(&self, filter: Option<String>) -> bool {
        let changed = self
            .resolver
            .as_ref()
            .is_some_and(|resolver| resolver.set_filter(filter));
        if changed {
            let mut batch = self.listener.begin_batch();
            batch.notify_on_release();
        }
        changed
    }

    pub fn on_visibility_change(&self) -> &Signal<()> {
        self.listener.on_visibility_change()
    }

    pub fn listener(&self) -> &VisibilityChangeEventListener {
        &self.listener
    }

    pub fn ids_cache_stats(&self) -> IdsCacheStats {
        self.ids_cache.stats()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Dispose the listener, the drawn info and the id cache.
    ///
    /// In-flight reads fail with `Disposed`; in-flight changes stop before
    /// their next viewport write. Calling it again has no effect.
    pub fn dispose(&self) {
        if self.disposed.is_cancelled() {
            return;
        }
        self.disposed.cancel();
        self.listener.dispose();
        self.drawn.dispose();
        self.ids_cache.dispose();
        tracing::debug!(target: targets::HANDLER, "tree visibility handler disposed");
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed.is_cancelled() {
            Err(VisibilityError::Disposed)
        } else {
            Ok(())
        }
    }

    fn map_cancelled(&self, error: VisibilityError) -> VisibilityError {
        match error {
            VisibilityError::Cancelled if self.disposed.is_cancelled() => VisibilityError::Disposed,
            other => other,
        }
    }

    /// Filter targets of `node` under the latest filter.
    async fn targets_for(&self, node: &VisibilityNode) -> Result<Option<Vec<VisibilityNode>>> {
        let Some(resolver) = &self.resolver else {
            return Ok(None);
        };
        let Some(tree) = resolver.current_tree().await? else {
            return Ok(None);
        };
        Ok(tree.targets_for(node).map(|targets| targets.into_owned()))
    }
}

impl Drop for TreeVisibilityHandler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for TreeVisibilityHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeVisibilityHandler")
            .field("ids_cache", &self.ids_cache)
            .field("filterable", &self.resolver.is_some())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

static_assertions::assert_impl_all!(TreeVisibilityHandler: Send, Sync);
