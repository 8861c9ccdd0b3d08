mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixture::*;
use common::{id, ids};
use futures_util::FutureExt;
use futures_util::future::join_all;
use tree_visibility::{IdsCache, VisibilityConfig, VisibilityError};

fn cache(imodel: &Arc<common::FakeIModel>, config: VisibilityConfig) -> IdsCache {
    IdsCache::new(imodel.clone(), &config).expect("ids cache")
}

#[tokio::test(start_paused = true)]
async fn test_mixed_lookups_share_one_query() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default());

    let (models, count, categories, sub_categories) = tokio::join!(
        cache.subject_models(S1),
        cache.category_elements_count(M1, C1),
        cache.container_categories(T),
        cache.category_sub_categories(C2),
    );
    assert_eq!(*models.unwrap(), ids(&[0x10, 0x11]));
    assert_eq!(count.unwrap(), 1);
    assert_eq!(*categories.unwrap(), ids(&[0x20, 0x21]));
    assert_eq!(*sub_categories.unwrap(), ids(&[0x31]));
    assert_eq!(imodel.query_count(), 1);

    // Memoized.
    assert_eq!(*cache.subject_models(S1).await.unwrap(), ids(&[0x10, 0x11]));
    assert_eq!(imodel.query_count(), 1);
    let stats = cache.stats();
    assert_eq!(stats.batches, 1);
    assert_eq!(stats.memoized, 4);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_keys_resolve_empty() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default());

    assert!(cache.subject_models(id(0x999)).await.unwrap().is_empty());
    assert_eq!(cache.category_elements_count(M2, C2).await.unwrap(), 0);
    assert!(cache.model_categories(id(0x998)).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_lookup_is_retried() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default());
    imodel.fail_next(1);

    let (first, second) = tokio::join!(cache.model_categories(M1), cache.category_models(C1));
    assert!(matches!(first, Err(VisibilityError::Query { .. })));
    assert!(matches!(second, Err(VisibilityError::Query { .. })));
    assert_eq!(cache.stats().failures, 1);
    assert_eq!(cache.stats().memoized, 0);

    assert_eq!(*cache.model_categories(M1).await.unwrap(), ids(&[0x20, 0x21]));
    assert_eq!(*cache.category_models(C1).await.unwrap(), ids(&[0x10, 0x11]));
    assert_eq!(imodel.query_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_batches_are_split_at_max_size() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default().with_ids_max_batch_size(2));

    let results = join_all([M1, M2, id(0x12), id(0x13), id(0x14)].map(|m| cache.model_categories(m))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(imodel.query_count(), 3);
    assert_eq!(cache.stats().keys, 5);
}

#[tokio::test(start_paused = true)]
async fn test_separate_windows_query_separately() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default());

    cache.model_categories(M1).await.unwrap();
    cache.model_categories(M2).await.unwrap();
    assert_eq!(imodel.query_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_dispose_fails_in_flight_lookups() {
    let imodel = Arc::new(common::fixture::standard());
    imodel.set_delay(Some(Duration::from_secs(1)));
    let cache = Arc::new(cache(&imodel, VisibilityConfig::default()));

    let pending = tokio::spawn({
        let cache = cache.clone();
        async move { cache.subject_models(S1).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(imodel.query_count(), 1);
    assert_eq!(cache.stats().in_flight, 1);

    cache.dispose();
    assert_eq!(pending.await.unwrap(), Err(VisibilityError::Disposed));
    assert_eq!(cache.subject_models(S1).await, Err(VisibilityError::Disposed));
    assert!(cache.is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_lookup_dropped_while_queue_full_leaves_no_cell() {
    let imodel = Arc::new(common::fixture::standard());
    let cache = cache(&imodel, VisibilityConfig::default().with_ids_request_queue_capacity(1));

    // Takes the only channel slot; the worker has not run yet.
    assert!(cache.model_categories(M1).now_or_never().is_none());
    // Parks on the full channel and is dropped.
    assert!(cache.category_models(C2).now_or_never().is_none());
    assert_eq!(cache.stats().in_flight, 1);

    let models = tokio::time::timeout(Duration::from_secs(5), cache.category_models(C2))
        .await
        .expect("lookup completes")
        .unwrap();
    assert_eq!(*models, ids(&[0x10]));
    assert_eq!(*cache.model_categories(M1).await.unwrap(), ids(&[0x20, 0x21]));
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_bulk_lookup_keeps_cache_usable() {
    let imodel = Arc::new(common::fixture::standard());
    imodel.set_delay(Some(Duration::from_millis(500)));
    let cache = cache(&imodel, VisibilityConfig::default().with_ids_request_queue_capacity(1));

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        cache.subjects_models([S1, S2, id(0x3)]),
    )
    .await;
    assert!(abandoned.is_err());

    imodel.set_delay(None);
    let models = tokio::time::timeout(Duration::from_secs(5), cache.subjects_models([S1, S2, id(0x3)]))
        .await
        .expect("lookup completes")
        .unwrap();
    assert_eq!(models, ids(&[0x10, 0x11]));
}
