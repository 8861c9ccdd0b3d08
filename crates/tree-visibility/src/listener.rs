//! Visibility change notifications.
//!
//! [`VisibilityChangeEventListener`] turns the five viewport change events
//! into a single debounced `on_visibility_change` signal. Multi-step
//! mutations suppress notifications for their duration through a
//! [`SuppressGuard`] and produce at most one notification when the guard is
//! released.
//!
//! # Example
//!
//! ```ignore
//! let mut batch = listener.begin_batch();
//! batch.notify_on_release();
//! viewport.change_model_display(&models, true);
//! viewport.set_never_drawn(IdSet::new());
//! drop(batch); // one notification after the debounce window
//! ```

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tree_visibility_core::logging::targets;
use tree_visibility_core::{ConnectionId, Result, Signal, VisibilityConfig, VisibilityError};

use crate::viewport::{Viewport, ViewportEventKind};

#[derive(Debug, Default)]
struct ListenerState {
    suppress_count: usize,
    fired_during_suppress: bool,
    pending: Option<AbortHandle>,
    disposed: bool,
}

struct ListenerInner {
    state: Mutex<ListenerState>,
    on_visibility_change: Signal<()>,
    debounce: Duration,
    runtime: Handle,
}

impl ListenerInner {
    fn handle_event(self: &Arc<Self>, kind: ViewportEventKind) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }
        if state.suppress_count > 0 {
            tracing::trace!(target: targets::LISTENER, ?kind, "event recorded while suppressed");
            state.fired_during_suppress = true;
            return;
        }
        self.schedule(&mut state);
    }

    /// Start the debounce timer unless one is pending.
    fn schedule(self: &Arc<Self>, state: &mut ListenerState) {
        if state.pending.is_some() || state.disposed {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let debounce = self.debounce;
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire();
            }
        });
        state.pending = Some(task.abort_handle());
    }

    fn fire(&self) {
        {
            let mut state = self.state.lock();
            state.pending = None;
            if state.disposed {
                return;
            }
            if state.suppress_count > 0 {
                state.fired_during_suppress = true;
                return;
            }
        }
        tracing::debug!(target: targets::LISTENER, "visibility changed");
        self.on_visibility_change.emit(());
    }

    fn suppress(&self) {
        let mut state = self.state.lock();
        state.suppress_count += 1;
        if state.suppress_count == 1 {
            state.fired_during_suppress = false;
        }
    }

    fn resume(self: &Arc<Self>, force: bool) {
        let mut state = self.state.lock();
        if state.suppress_count == 0 {
            tracing::warn!(target: targets::LISTENER, "resume_change_events called without matching suppress");
            return;
        }
        state.suppress_count -= 1;
        if force {
            state.fired_during_suppress = true;
        }
        if state.suppress_count == 0 && state.fired_during_suppress {
            state.fired_during_suppress = false;
            self.schedule(&mut state);
        }
    }
}

/// Debounced, suppressible visibility change notifications.
pub struct VisibilityChangeEventListener {
    inner: Arc<ListenerInner>,
    viewport: Arc<dyn Viewport>,
    connections: Mutex<Vec<(ViewportEventKind, ConnectionId)>>,
}

impl VisibilityChangeEventListener {
    /// Subscribe to the viewport's change events.
    ///
    /// Must be called inside a Tokio runtime; the debounce timer runs on it.
    pub fn new(viewport: Arc<dyn Viewport>, config: &VisibilityConfig) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| VisibilityError::NoRuntime)?;
        let inner = Arc::new(ListenerInner {
            state: Mutex::new(ListenerState::default()),
            on_visibility_change: Signal::new(),
            debounce: config.change_debounce,
            runtime,
        });

        let events = viewport.events();
        let connections = ViewportEventKind::ALL
            .into_iter()
            .map(|kind| {
                let weak = Arc::downgrade(&inner);
                let id = events.signal(kind).connect(move |_| {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_event(kind);
                    }
                });
                (kind, id)
            })
            .collect();

        Ok(Self {
            inner,
            viewport,
            connections: Mutex::new(connections),
        })
    }

    /// Emitted once per debounce window in which the viewport changed.
    pub fn on_visibility_change(&self) -> &Signal<()> {
        &self.inner.on_visibility_change
    }

    /// Start recording events instead of notifying.
    ///
    /// The recorded-event flag is cleared only when the outermost suppression
    /// begins, so a nested call keeps events recorded under outer ones.
    ///
    /// Every call must be paired with [`resume_change_events`]. Prefer
    /// [`begin_batch`], which pairs them on every exit path.
    ///
    /// [`resume_change_events`]: Self::resume_change_events
    /// [`begin_batch`]: Self::begin_batch
    pub fn suppress_change_events(&self) {
        self.inner.suppress();
    }

    /// Undo one [`suppress_change_events`](Self::suppress_change_events).
    ///
    /// When the last suppression ends and an event was recorded meanwhile,
    /// the debounce timer starts.
    pub fn resume_change_events(&self) {
        self.inner.resume(false);
    }

    /// Suppress notifications until the returned guard is dropped.
    pub fn begin_batch(&self) -> SuppressGuard {
        self.inner.suppress();
        SuppressGuard {
            inner: Arc::clone(&self.inner),
            notify: false,
        }
    }

    /// Current suppression depth.
    pub fn suppress_depth(&self) -> usize {
        self.inner.state.lock().suppress_count
    }

    /// Whether a notification is scheduled.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    /// Cancel the pending notification and unsubscribe from the viewport.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            if let Some(pending) = state.pending.take() {
                pending.abort();
            }
        }
        let events = self.viewport.events();
        for (kind, id) in self.connections.lock().drain(..) {
            events.signal(kind).disconnect(id);
        }
        tracing::debug!(target: targets::LISTENER, "change event listener disposed");
    }
}

impl Drop for VisibilityChangeEventListener {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Scoped suppression of change notifications.
///
/// Resumes exactly once when dropped, including on early returns and `?`
/// propagation.
#[must_use = "notifications resume as soon as the guard is dropped"]
pub struct SuppressGuard {
    inner: Arc<ListenerInner>,
    notify: bool,
}

impl SuppressGuard {
    /// Notify after release even if no viewport event was recorded.
    pub fn notify_on_release(&mut self) {
        self.notify = true;
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        self.inner.resume(self.notify);
    }
}

impl std::fmt::Debug for SuppressGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuppressGuard").field("notify", &self.notify).finish()
    }
}

static_assertions::assert_impl_all!(VisibilityChangeEventListener: Send, Sync);
static_assertions::assert_impl_all!(SuppressGuard: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viewport::InMemoryViewport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tree_visibility_core::{Id64, IdSet};

    fn setup() -> (Arc<InMemoryViewport>, VisibilityChangeEventListener, Arc<AtomicUsize>) {
        let viewport = Arc::new(InMemoryViewport::new());
        let listener = VisibilityChangeEventListener::new(viewport.clone(), &VisibilityConfig::default()).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listener.on_visibility_change().connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (viewport, listener, count)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[test]
    fn test_new_requires_runtime() {
        let viewport = Arc::new(InMemoryViewport::new());
        assert!(matches!(
            VisibilityChangeEventListener::new(viewport, &VisibilityConfig::default()),
            Err(VisibilityError::NoRuntime)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_coalesce() {
        let (viewport, listener, count) = setup();
        viewport.change_model_display(&[Id64::new(1)], true);
        viewport.set_never_drawn(IdSet::from([Id64::new(2)]));
        assert!(listener.is_pending());
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!listener.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_resumes_on_error_path() {
        let (viewport, listener, count) = setup();

        fn failing(listener: &VisibilityChangeEventListener, viewport: &InMemoryViewport) -> Result<()> {
            let _batch = listener.begin_batch();
            viewport.change_model_display(&[Id64::new(1)], true);
            Err(VisibilityError::query("boom"))
        }
        assert!(failing(&listener, &viewport).is_err());
        assert_eq!(listener.suppress_depth(), 0);
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_notification() {
        let (_viewport, listener, count) = setup();
        {
            let _quiet = listener.begin_batch();
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        {
            let mut batch = listener.begin_batch();
            batch.notify_on_release();
        }
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbalanced_resume_is_ignored() {
        let (_viewport, listener, _count) = setup();
        listener.resume_change_events();
        assert_eq!(listener.suppress_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending() {
        let (viewport, listener, count) = setup();
        viewport.change_model_display(&[Id64::new(1)], true);
        listener.dispose();
        listener.dispose();
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(viewport.events().viewed_models_changed.connection_count(), 0);
    }
}
