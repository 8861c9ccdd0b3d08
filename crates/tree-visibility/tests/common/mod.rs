//! Shared fixtures: an in-memory iModel answering the engine's queries.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tree_visibility::drawn_info::ELEMENT_IDS_BINDING;
use tree_visibility::ids_cache::{COUNT_CATEGORIES_BINDING, COUNT_MODELS_BINDING};
use tree_visibility::{
    BindingValue, CategoryOverride, FilterPath, FilterPathsProvider, Id64, IdSet, InMemoryViewport, QueryDefinition,
    QueryExecutor, QueryOptions, QueryRow, Result, TreeVisibilityHandler, TreeVisibilityHandlerProps, Viewport,
    VisibilityConfig, VisibilityError,
};

/// Log to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn id(v: u64) -> Id64 {
    Id64::new(v)
}

pub fn ids(values: &[u64]) -> IdSet {
    values.iter().copied().map(Id64::new).collect()
}

/// Ids of the standard fixture.
pub mod fixture {
    use super::*;

    pub const S1: Id64 = Id64::new(0x1);
    pub const S2: Id64 = Id64::new(0x2);
    pub const M1: Id64 = Id64::new(0x10);
    pub const M2: Id64 = Id64::new(0x11);
    pub const C1: Id64 = Id64::new(0x20);
    pub const C2: Id64 = Id64::new(0x21);
    pub const SC1: Id64 = Id64::new(0x30);
    pub const SC2: Id64 = Id64::new(0x31);
    pub const T: Id64 = Id64::new(0x40);
    pub const K1: Id64 = Id64::new(0x41);
    pub const K2: Id64 = Id64::new(0x42);
    pub const E1: Id64 = Id64::new(0x100);
    pub const E2: Id64 = Id64::new(0x101);
    pub const E3: Id64 = Id64::new(0x102);

    /// ```text
    /// S1 ── M1 ── C1: E1
    ///  │     └─── C2: E2
    ///  └ S2 ── M2 ── C1: E3
    ///
    /// C1 ── SC1, C2 ── SC2
    /// T ── K1 (classifies E1) ── K2 (classifies E2)
    /// ```
    pub fn standard() -> FakeIModel {
        FakeIModel::default()
            .with_subject(S1, None)
            .with_subject(S2, Some(S1))
            .with_model(S1, M1)
            .with_model(S2, M2)
            .with_element(E1, M1, C1)
            .with_element(E2, M1, C2)
            .with_element(E3, M2, C1)
            .with_sub_category(C1, SC1)
            .with_sub_category(C2, SC2)
            .with_classification(K1, T)
            .with_classification(K2, K1)
            .with_classified_element(K1, E1)
            .with_classified_element(K2, E2)
    }
}

#[derive(Debug, Clone, Copy)]
struct ElementRow {
    model: Id64,
    category: Id64,
}

/// An in-memory iModel implementing [`QueryExecutor`].
///
/// Queries are answered by binding name, so the fake is independent of the
/// exact statement text.
#[derive(Default)]
pub struct FakeIModel {
    subject_parents: BTreeMap<Id64, Option<Id64>>,
    subject_models: Vec<(Id64, Id64)>,
    elements: BTreeMap<Id64, ElementRow>,
    sub_categories: Vec<(Id64, Id64)>,
    /// Classification -> parent classification or table.
    classification_parents: HashMap<Id64, Id64>,
    classified_elements: Vec<(Id64, Id64)>,
    queries: AtomicUsize,
    failures_to_inject: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    last_restart_token: Mutex<Option<String>>,
}

impl FakeIModel {
    pub fn with_subject(mut self, subject: Id64, parent: Option<Id64>) -> Self {
        self.subject_parents.insert(subject, parent);
        self
    }

    pub fn with_model(mut self, subject: Id64, model: Id64) -> Self {
        self.subject_models.push((subject, model));
        self
    }

    pub fn with_element(mut self, element: Id64, model: Id64, category: Id64) -> Self {
        self.elements.insert(element, ElementRow { model, category });
        self
    }

    pub fn with_sub_category(mut self, category: Id64, sub_category: Id64) -> Self {
        self.sub_categories.push((category, sub_category));
        self
    }

    pub fn with_classification(mut self, classification: Id64, parent: Id64) -> Self {
        self.classification_parents.insert(classification, parent);
        self
    }

    pub fn with_classified_element(mut self, classification: Id64, element: Id64) -> Self {
        self.classified_elements.push((classification, element));
        self
    }

    /// Number of queries started so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    /// Fail the next `count` queries.
    pub fn fail_next(&self, count: usize) {
        self.failures_to_inject.store(count, Ordering::SeqCst);
    }

    /// Hold every query's rows back for `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn last_restart_token(&self) -> Option<String> {
        self.last_restart_token.lock().clone()
    }

    fn subject_tree(&self, root: Id64) -> IdSet {
        let mut tree = IdSet::from([root]);
        loop {
            let before = tree.len();
            for (subject, parent) in &self.subject_parents {
                if parent.is_some_and(|p| tree.contains(&p)) {
                    tree.insert(*subject);
                }
            }
            if tree.len() == before {
                return tree;
            }
        }
    }

    fn is_under(&self, classification: Id64, container: Id64) -> bool {
        let mut current = Some(classification);
        while let Some(node) = current {
            if node == container {
                return true;
            }
            current = self.classification_parents.get(&node).copied();
        }
        false
    }

    fn rows(&self, query: &QueryDefinition) -> Vec<QueryRow> {
        let mut rows = Vec::new();
        let relation_row = |relation: &str, key: Id64, value: Id64| {
            QueryRow::from_pairs([
                ("Relation", json!(relation)),
                ("KeyId", json!(key.to_string())),
                ("SecondaryKeyId", Value::Null),
                ("ValueId", json!(value.to_string())),
                ("ValueCount", Value::Null),
            ])
        };

        if let Some(keys) = id_set(query, "subject_models_keys") {
            for key in keys {
                let tree = self.subject_tree(*key);
                for (subject, model) in &self.subject_models {
                    if tree.contains(subject) {
                        rows.push(relation_row("SubjectModels", *key, *model));
                    }
                }
            }
        }
        if let Some(keys) = id_set(query, "model_categories_keys") {
            let pairs: IdPairs = self
                .elements
                .values()
                .filter(|e| keys.contains(&e.model))
                .map(|e| (e.model, e.category))
                .collect();
            rows.extend(pairs.into_iter().map(|(m, c)| relation_row("ModelCategories", m, c)));
        }
        if let Some(keys) = id_set(query, "category_models_keys") {
            let pairs: IdPairs = self
                .elements
                .values()
                .filter(|e| keys.contains(&e.category))
                .map(|e| (e.category, e.model))
                .collect();
            rows.extend(pairs.into_iter().map(|(c, m)| relation_row("CategoryModels", c, m)));
        }
        if let Some(keys) = id_set(query, "category_sub_categories_keys") {
            for (category, sub) in &self.sub_categories {
                if keys.contains(category) {
                    rows.push(relation_row("CategorySubCategories", *category, *sub));
                }
            }
        }
        if let Some(keys) = id_set(query, "container_categories_keys") {
            for key in keys {
                let categories: IdSet = self
                    .classified_elements
                    .iter()
                    .filter(|(classification, _)| self.is_under(*classification, *key))
                    .filter_map(|(_, element)| self.elements.get(element).map(|e| e.category))
                    .collect();
                rows.extend(categories.into_iter().map(|c| relation_row("ContainerCategories", *key, c)));
            }
        }
        if let (Some(models), Some(categories)) =
            (id_set(query, COUNT_MODELS_BINDING), id_set(query, COUNT_CATEGORIES_BINDING))
        {
            let mut counts: BTreeMap<(Id64, Id64), u64> = BTreeMap::new();
            for e in self.elements.values() {
                if models.contains(&e.model) && categories.contains(&e.category) {
                    *counts.entry((e.model, e.category)).or_default() += 1;
                }
            }
            rows.extend(counts.into_iter().map(|((model, category), count)| {
                QueryRow::from_pairs([
                    ("Relation", json!("CategoryElementsCount")),
                    ("KeyId", json!(model.to_string())),
                    ("SecondaryKeyId", json!(category.to_string())),
                    ("ValueId", Value::Null),
                    ("ValueCount", json!(count)),
                ])
            }));
        }
        if let Some(keys) = id_set(query, ELEMENT_IDS_BINDING) {
            for key in keys {
                if let Some(e) = self.elements.get(key) {
                    rows.push(QueryRow::from_pairs([
                        ("ElementId", json!(key.to_string())),
                        ("ModelId", json!(e.model.to_string())),
                        ("CategoryId", json!(e.category.to_string())),
                    ]));
                }
            }
        }
        rows
    }
}

type IdPairs = std::collections::BTreeSet<(Id64, Id64)>;

fn id_set<'a>(query: &'a QueryDefinition, name: &str) -> Option<&'a IdSet> {
    match query.binding(name) {
        Some(BindingValue::IdSet(ids)) => Some(ids),
        _ => None,
    }
}

impl QueryExecutor for FakeIModel {
    fn create_query_reader(
        &self,
        query: &QueryDefinition,
        options: &QueryOptions,
    ) -> BoxStream<'static, Result<QueryRow>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if options.restart_token.is_some() {
            *self.last_restart_token.lock() = options.restart_token.clone();
        }

        let fail = self
            .failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let items: Vec<Result<QueryRow>> = if fail {
            vec![Err(VisibilityError::query("injected failure"))]
        } else {
            self.rows(query).into_iter().map(Ok).collect()
        };

        match *self.delay.lock() {
            Some(delay) => stream::once(tokio::time::sleep(delay))
                .flat_map(move |_| stream::iter(items.clone()))
                .boxed(),
            None => stream::iter(items).boxed(),
        }
    }
}

/// Filter paths keyed by filter text.
#[derive(Default)]
pub struct StaticFilterPaths {
    paths: HashMap<String, Vec<FilterPath>>,
}

impl StaticFilterPaths {
    pub fn with(mut self, filter: &str, paths: Vec<FilterPath>) -> Self {
        self.paths.insert(filter.to_string(), paths);
        self
    }
}

impl FilterPathsProvider for StaticFilterPaths {
    fn filter_paths(&self, filter: &str) -> BoxFuture<'static, Result<Vec<FilterPath>>> {
        let paths = self.paths.get(filter).cloned().unwrap_or_default();
        Box::pin(async move { Ok(paths) })
    }
}

pub struct Setup {
    pub imodel: Arc<FakeIModel>,
    pub viewport: Arc<InMemoryViewport>,
    pub handler: TreeVisibilityHandler,
    pub notifications: Arc<AtomicUsize>,
}

impl Setup {
    pub fn notification_count(&self) -> usize {
        self.notifications.load(Ordering::SeqCst)
    }
}

/// Standard fixture with the given viewport.
pub fn setup(viewport: InMemoryViewport) -> Setup {
    setup_with(fixture::standard(), viewport, None)
}

pub fn setup_with(
    imodel: FakeIModel,
    viewport: InMemoryViewport,
    filter_paths: Option<StaticFilterPaths>,
) -> Setup {
    init_tracing();
    let imodel = Arc::new(imodel);
    let viewport = Arc::new(viewport);
    for (category, sub) in &imodel.sub_categories {
        viewport.register_sub_categories(*category, [*sub]);
    }

    let mut props = TreeVisibilityHandlerProps::new(viewport.clone(), imodel.clone())
        .with_config(VisibilityConfig::default());
    if let Some(paths) = filter_paths {
        props = props.with_filter_paths_provider(Arc::new(paths));
    }
    let handler = TreeVisibilityHandler::new(props).expect("handler");

    let notifications = Arc::new(AtomicUsize::new(0));
    let counter = notifications.clone();
    handler.on_visibility_change().connect(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    Setup {
        imodel,
        viewport,
        handler,
        notifications,
    }
}

/// Let debounce timers and batch windows elapse.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Comparable snapshot of viewport state.
#[derive(Debug, PartialEq, Eq)]
pub struct ViewportSnapshot {
    pub models: IdSet,
    pub categories: IdSet,
    pub always: IdSet,
    pub never: IdSet,
    pub exclusive: bool,
    pub overrides: Vec<(Id64, Id64, CategoryOverride)>,
    pub hidden_sub_categories: IdSet,
}

pub fn snapshot(viewport: &InMemoryViewport) -> ViewportSnapshot {
    use fixture::*;
    let overrides = [M1, M2]
        .into_iter()
        .flat_map(|m| [C1, C2].into_iter().map(move |c| (m, c)))
        .map(|(m, c)| (m, c, viewport.per_model_category_override(m, c)))
        .collect();
    ViewportSnapshot {
        models: viewport.viewed_models(),
        categories: viewport.viewed_categories(),
        always: viewport.always_drawn().as_ref().clone(),
        never: viewport.never_drawn().as_ref().clone(),
        exclusive: viewport.is_always_drawn_exclusive(),
        overrides,
        hidden_sub_categories: [SC1, SC2]
            .into_iter()
            .filter(|s| !viewport.is_sub_category_displayed(*s))
            .collect(),
    }
}
