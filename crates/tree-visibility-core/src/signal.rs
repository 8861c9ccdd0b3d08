//! Signal/slot primitive.
//!
//! A [`Signal`] carries change notifications from the viewport to the
//! visibility engine and from the engine to the tree widget. Slots are
//! closures keyed by a [`ConnectionId`]; emitting calls each of them on the
//! emitting thread.
//!
//! The slot list is copied out of the lock before any slot runs. A slot can
//! therefore disconnect itself, connect new slots or emit another signal.
//!
//! ```
//! use tree_visibility_core::Signal;
//!
//! let models_changed = Signal::<()>::new();
//! let id = models_changed.connect(|_| println!("viewed models changed"));
//! assert_eq!(models_changed.emit(()), 1);
//! assert!(models_changed.disconnect(id));
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};

use crate::logging::targets;

new_key_type! {
    /// Handle of one connected slot, used with [`Signal::disconnect`].
    pub struct ConnectionId;
}

type Slot<Args> = Arc<dyn Fn(&Args) + Send + Sync>;

/// Multi-slot notification channel.
///
/// `Args` is passed to every slot by reference; the engine's own signals
/// carry `()`.
pub struct Signal<Args> {
    slots: Mutex<SlotMap<ConnectionId, Slot<Args>>>,
}

impl<Args: 'static> Default for Signal<Args> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Args: 'static> std::fmt::Debug for Signal<Args> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.connection_count())
            .finish()
    }
}

impl<Args: 'static> Signal<Args> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotMap::with_key()),
        }
    }

    /// Register `slot`; it stays connected until [`disconnect`](Self::disconnect).
    pub fn connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) + Send + Sync + 'static,
    {
        self.slots.lock().insert(Arc::new(slot))
    }

    /// Returns `false` if `id` was not connected.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Call every connected slot with `args` and return how many ran.
    pub fn emit(&self, args: Args) -> usize {
        let slots: Vec<Slot<Args>> = self.slots.lock().values().cloned().collect();
        tracing::trace!(target: targets::SIGNAL, slots = slots.len(), "emit");
        for slot in &slots {
            slot(&args);
        }
        slots.len()
    }
}

static_assertions::assert_impl_all!(Signal<()>: Send, Sync);
