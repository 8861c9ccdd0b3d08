//! Per-key replay cells.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use tokio::sync::oneshot;
use tree_visibility_core::{Result, VisibilityError};

use super::batch::{RelationKey, RelationValue};

pub(super) type Waiter = oneshot::Sender<Result<RelationValue>>;

enum Cell {
    InFlight(Vec<Waiter>),
    Ready(RelationValue),
}

/// Outcome of looking up a key.
pub(super) enum Lookup {
    /// Memoized value.
    Ready(RelationValue),
    /// Somebody already requested the key; wait on the receiver.
    Joined(oneshot::Receiver<Result<RelationValue>>),
    /// First request for the key; the caller must enqueue it.
    Started(oneshot::Receiver<Result<RelationValue>>),
}

/// Cells keyed by relationship. Resolved cells are never invalidated; failed
/// cells are removed so the next access retries.
#[derive(Default)]
pub(super) struct CellMap {
    cells: HashMap<RelationKey, Cell>,
}

impl CellMap {
    /// Memoized value or a wait on the in-flight request; never starts one.
    pub(super) fn join(&mut self, key: RelationKey) -> Option<Lookup> {
        match self.cells.get_mut(&key)? {
            Cell::Ready(value) => Some(Lookup::Ready(value.clone())),
            Cell::InFlight(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Some(Lookup::Joined(rx))
            }
        }
    }

    pub(super) fn lookup(&mut self, key: RelationKey) -> Lookup {
        match self.cells.entry(key) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Cell::Ready(value) => Lookup::Ready(value.clone()),
                Cell::InFlight(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Lookup::Joined(rx)
                }
            },
            Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(Cell::InFlight(vec![tx]));
                Lookup::Started(rx)
            }
        }
    }

    /// Memoize `value` and wake the waiters of `key`.
    pub(super) fn resolve(&mut self, key: RelationKey, value: RelationValue) {
        let previous = self.cells.insert(key, Cell::Ready(value.clone()));
        if let Some(Cell::InFlight(waiters)) = previous {
            for waiter in waiters {
                let _ = waiter.send(Ok(value.clone()));
            }
        }
    }

    /// Drop the in-flight cell of `key` and fail its waiters.
    pub(super) fn reject(&mut self, key: RelationKey, error: &VisibilityError) {
        if let Some(Cell::InFlight(_)) = self.cells.get(&key)
            && let Some(Cell::InFlight(waiters)) = self.cells.remove(&key)
        {
            for waiter in waiters {
                let _ = waiter.send(Err(error.clone()));
            }
        }
    }

    /// Fail every in-flight cell.
    pub(super) fn reject_all(&mut self, error: &VisibilityError) {
        let pending: Vec<RelationKey> = self
            .cells
            .iter()
            .filter(|(_, cell)| matches!(cell, Cell::InFlight(_)))
            .map(|(key, _)| *key)
            .collect();
        for key in pending {
            self.reject(key, error);
        }
    }

    pub(super) fn ready_count(&self) -> usize {
        self.cells.values().filter(|c| matches!(c, Cell::Ready(_))).count()
    }

    pub(super) fn in_flight_count(&self) -> usize {
        self.cells.len() - self.ready_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree_visibility_core::Id64;

    #[test]
    fn test_single_flight_then_memoized() {
        let mut cells = CellMap::default();
        let key = RelationKey::ModelCategories(Id64::new(1));

        let Lookup::Started(mut first) = cells.lookup(key) else {
            panic!("first lookup must start");
        };
        let Lookup::Joined(mut second) = cells.lookup(key) else {
            panic!("second lookup must join");
        };
        assert_eq!(cells.in_flight_count(), 1);

        cells.resolve(key, RelationValue::Count(3));
        assert_eq!(first.try_recv().unwrap(), Ok(RelationValue::Count(3)));
        assert_eq!(second.try_recv().unwrap(), Ok(RelationValue::Count(3)));
        assert!(matches!(cells.lookup(key), Lookup::Ready(RelationValue::Count(3))));
    }

    #[test]
    fn test_join_never_starts() {
        let mut cells = CellMap::default();
        let key = RelationKey::ModelCategories(Id64::new(1));
        assert!(cells.join(key).is_none());
        assert_eq!(cells.in_flight_count(), 0);

        let _started = cells.lookup(key);
        assert!(matches!(cells.join(key), Some(Lookup::Joined(_))));
    }

    #[test]
    fn test_reject_allows_retry() {
        let mut cells = CellMap::default();
        let key = RelationKey::CategoryModels(Id64::new(1));
        let Lookup::Started(mut rx) = cells.lookup(key) else {
            panic!("expected start");
        };
        cells.reject(key, &VisibilityError::query("boom"));
        assert_eq!(rx.try_recv().unwrap(), Err(VisibilityError::query("boom")));
        assert!(matches!(cells.lookup(key), Lookup::Started(_)));
    }

    #[test]
    fn test_reject_keeps_ready_cells() {
        let mut cells = CellMap::default();
        let ready = RelationKey::CategoryModels(Id64::new(1));
        let pending = RelationKey::CategoryModels(Id64::new(2));
        let _ = cells.lookup(ready);
        cells.resolve(ready, RelationValue::Count(1));
        let _ = cells.lookup(pending);

        cells.reject_all(&VisibilityError::Disposed);
        assert_eq!(cells.ready_count(), 1);
        assert_eq!(cells.in_flight_count(), 0);
    }
}
