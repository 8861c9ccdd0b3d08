//! Id relationship cache.
//!
//! Answers "which models belong to this subject", "which categories does this
//! model contain", "how many elements of this category are in this model" and
//! similar questions. Lookups from anywhere in the tree are funnelled through
//! one bounded channel into a worker task that buffers them for a short window
//! and resolves the whole batch with a single query.
//!
//! Each relationship key resolves exactly once per cache lifetime: concurrent
//! callers for the same key share one in-flight request, and the value is
//! memoized until the cache is dropped. Failed lookups are not memoized.
//!
//! There is no invalidation API. When the underlying relationships may have
//! changed, dispose the cache and build a new one.

mod batch;
mod cell;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::Instrument;
use tree_visibility_core::logging::{span_names, targets};
use tree_visibility_core::{
    CancellationToken, Id64, IdSet, Result, VisibilityConfig, VisibilityError, perf_span,
};

use crate::query::{QueryExecutor, QueryOptions, collect_rows};

pub use batch::{RelationKey, RelationKind, RelationValue};
pub use batch::{COUNT_CATEGORIES_BINDING, COUNT_MODELS_BINDING};
use cell::{CellMap, Lookup};

/// Diagnostic counters of an [`IdsCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdsCacheStats {
    /// Batched queries executed.
    pub batches: u64,
    /// Keys resolved through batches.
    pub keys: u64,
    /// Batches that failed.
    pub failures: u64,
    /// Memoized keys.
    pub memoized: usize,
    /// Keys waiting for a batch.
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    batches: AtomicU64,
    keys: AtomicU64,
    failures: AtomicU64,
}

struct Shared {
    cells: Mutex<CellMap>,
    counters: Counters,
    cancel: CancellationToken,
}

/// Batching, memoizing cache of id relationships.
pub struct IdsCache {
    shared: Arc<Shared>,
    sender: mpsc::Sender<RelationKey>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IdsCache {
    /// Create a cache and spawn its worker on the current Tokio runtime.
    pub fn new(executor: Arc<dyn QueryExecutor>, config: &VisibilityConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| VisibilityError::NoRuntime)?;

        let shared = Arc::new(Shared {
            cells: Mutex::new(CellMap::default()),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
        });
        let (sender, receiver) = mpsc::channel(config.ids_request_queue_capacity);
        let worker = Worker {
            receiver,
            executor,
            shared: Arc::clone(&shared),
            window: config.ids_batch_window,
            max_batch_size: config.ids_max_batch_size,
        };
        let handle = runtime.spawn(worker.run());

        Ok(Self {
            shared,
            sender,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Number of elements of `category` in `model`.
    pub async fn category_elements_count(&self, model: Id64, category: Id64) -> Result<u64> {
        self.get(RelationKey::CategoryElementsCount { model, category })
            .await?
            .into_count()
    }

    /// Models under `subject` and all of its child subjects.
    pub async fn subject_models(&self, subject: Id64) -> Result<Arc<IdSet>> {
        self.get(RelationKey::SubjectModels(subject)).await?.into_ids()
    }

    /// Union of the models of several subjects.
    pub async fn subjects_models(&self, subjects: impl IntoIterator<Item = Id64>) -> Result<IdSet> {
        let sets = try_join_all(subjects.into_iter().map(|s| self.subject_models(s))).await?;
        Ok(sets.iter().flat_map(|set| set.iter().copied()).collect())
    }

    pub async fn model_categories(&self, model: Id64) -> Result<Arc<IdSet>> {
        self.get(RelationKey::ModelCategories(model)).await?.into_ids()
    }

    pub async fn category_models(&self, category: Id64) -> Result<Arc<IdSet>> {
        self.get(RelationKey::CategoryModels(category)).await?.into_ids()
    }

    pub async fn category_sub_categories(&self, category: Id64) -> Result<Arc<IdSet>> {
        self.get(RelationKey::CategorySubCategories(category))
            .await?
            .into_ids()
    }

    /// Categories under a classification table or classification, including
    /// its child classifications.
    pub async fn container_categories(&self, container: Id64) -> Result<Arc<IdSet>> {
        self.get(RelationKey::ContainerCategories(container))
            .await?
            .into_ids()
    }

    /// Resolve one key, joining an in-flight request if there is one.
    ///
    /// A new key only gets a cell once its channel slot is reserved, so a
    /// caller dropped while waiting for capacity leaves nothing behind.
    pub async fn get(&self, key: RelationKey) -> Result<RelationValue> {
        let joined = {
            let mut cells = self.shared.cells.lock();
            if self.shared.cancel.is_cancelled() {
                return Err(VisibilityError::Disposed);
            }
            cells.join(key)
        };

        let receiver = match joined {
            Some(Lookup::Ready(value)) => return Ok(value),
            Some(Lookup::Joined(receiver) | Lookup::Started(receiver)) => receiver,
            None => {
                let permit = self
                    .sender
                    .reserve()
                    .await
                    .map_err(|_| VisibilityError::Disposed)?;
                let mut cells = self.shared.cells.lock();
                if self.shared.cancel.is_cancelled() {
                    return Err(VisibilityError::Disposed);
                }
                match cells.lookup(key) {
                    Lookup::Ready(value) => return Ok(value),
                    Lookup::Joined(receiver) => receiver,
                    Lookup::Started(receiver) => {
                        permit.send(key);
                        receiver
                    }
                }
            }
        };
        receiver.await.unwrap_or(Err(VisibilityError::Disposed))
    }

    /// Snapshot of the diagnostic counters.
    pub fn stats(&self) -> IdsCacheStats {
        let cells = self.shared.cells.lock();
        let counters = &self.shared.counters;
        IdsCacheStats {
            batches: counters.batches.load(Ordering::Relaxed),
            keys: counters.keys.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            memoized: cells.ready_count(),
            in_flight: cells.in_flight_count(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Stop the worker and fail every pending lookup with `Disposed`.
    ///
    /// Later lookups fail with `Disposed` too. Calling it again has no effect.
    pub fn dispose(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.cells.lock().reject_all(&VisibilityError::Disposed);
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
        tracing::debug!(target: targets::IDS_CACHE, "ids cache disposed");
    }
}

impl Drop for IdsCache {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for IdsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdsCache")
            .field("stats", &self.stats())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

static_assertions::assert_impl_all!(IdsCache: Send, Sync);

struct Worker {
    receiver: mpsc::Receiver<RelationKey>,
    executor: Arc<dyn QueryExecutor>,
    shared: Arc<Shared>,
    window: std::time::Duration,
    max_batch_size: usize,
}

impl Worker {
    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        loop {
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.receiver.recv() => match key {
                    Some(key) => key,
                    None => break,
                },
            };

            let mut keys = vec![first];
            let deadline = Instant::now() + self.window;
            while keys.len() < self.max_batch_size {
                tokio::select! {
                    _ = sleep_until(deadline) => break,
                    key = self.receiver.recv() => match key {
                        Some(key) => keys.push(key),
                        None => break,
                    },
                }
            }
            keys.sort_unstable();
            keys.dedup();

            if cancel.is_cancelled() {
                break;
            }
            self.execute(keys, &cancel).await;
        }
        self.shared.cells.lock().reject_all(&VisibilityError::Disposed);
        tracing::trace!(target: targets::IDS_CACHE, "ids cache worker stopped");
    }

    async fn execute(&self, keys: Vec<RelationKey>, cancel: &CancellationToken) {
        let query = batch::compile(&keys);
        let counters = &self.shared.counters;
        counters.batches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            target: targets::IDS_CACHE,
            keys = keys.len(),
            ctes = query.ctes.len(),
            "executing id relationship batch"
        );

        let result = async {
            let rows = collect_rows(self.executor.as_ref(), &query, &QueryOptions::default(), cancel).await?;
            batch::resolve(&keys, &rows)
        }
        .instrument(perf_span(span_names::IDS_BATCH))
        .await;

        let mut cells = self.shared.cells.lock();
        match result {
            Ok(values) => {
                counters.keys.fetch_add(values.len() as u64, Ordering::Relaxed);
                for (key, value) in values {
                    cells.resolve(key, value);
                }
            }
            Err(error) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: targets::IDS_CACHE,
                    keys = keys.len(),
                    %error,
                    "id relationship batch failed"
                );
                let error = if cancel.is_cancelled() { VisibilityError::Disposed } else { error };
                for key in keys {
                    cells.reject(key, &error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryDefinition, QueryRow};
    use futures_util::StreamExt;
    use futures_util::stream::{self, BoxStream};
    use serde_json::{Value, json};

    /// Answers every ModelCategories key with category `key + 100`.
    #[derive(Default)]
    struct EchoExecutor {
        queries: AtomicU64,
    }

    impl QueryExecutor for EchoExecutor {
        fn create_query_reader(
            &self,
            query: &QueryDefinition,
            _options: &QueryOptions,
        ) -> BoxStream<'static, Result<QueryRow>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            let keys = match query.binding("model_categories_keys") {
                Some(crate::query::BindingValue::IdSet(ids)) => ids.clone(),
                _ => IdSet::new(),
            };
            let rows: Vec<Result<QueryRow>> = keys
                .into_iter()
                .map(|key| {
                    Ok(QueryRow::from_pairs([
                        ("Relation", json!("ModelCategories")),
                        ("KeyId", json!(key.to_string())),
                        ("SecondaryKeyId", Value::Null),
                        ("ValueId", json!(Id64::new(key.value() + 100).to_string())),
                        ("ValueCount", Value::Null),
                    ]))
                })
                .collect();
            stream::iter(rows).boxed()
        }
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = IdsCache::new(Arc::new(EchoExecutor::default()), &VisibilityConfig::default());
        assert!(matches!(result, Err(VisibilityError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_share_one_query() {
        let executor = Arc::new(EchoExecutor::default());
        let cache = IdsCache::new(executor.clone(), &VisibilityConfig::default()).unwrap();

        let (a, b, c) = tokio::join!(
            cache.model_categories(Id64::new(1)),
            cache.model_categories(Id64::new(2)),
            cache.model_categories(Id64::new(1)),
        );
        assert_eq!(*a.unwrap(), IdSet::from([Id64::new(101)]));
        assert_eq!(*b.unwrap(), IdSet::from([Id64::new(102)]));
        assert_eq!(*c.unwrap(), IdSet::from([Id64::new(101)]));
        assert_eq!(executor.queries.load(Ordering::SeqCst), 1);

        // Memoized: no new query.
        cache.model_categories(Id64::new(2)).await.unwrap();
        assert_eq!(executor.queries.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().memoized, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_rejects_lookups() {
        let cache = IdsCache::new(Arc::new(EchoExecutor::default()), &VisibilityConfig::default()).unwrap();
        cache.dispose();
        cache.dispose();
        assert_eq!(
            cache.model_categories(Id64::new(1)).await,
            Err(VisibilityError::Disposed)
        );
    }
}
