//! The query pipeline: filter, populate, sort, window, select.
//!
//! A [`Query`] is a reusable description; every call to [`Query::iter`] runs
//! the pipeline again against the live dataset. Unsorted queries stream: the
//! candidate ids are captured on the first pull and each later pull takes the
//! mutation gate just long enough to evaluate one entity. Sorted queries have
//! to see every match, so they materialize once on the first pull.

use crate::dataset::{CollectionState, Dataset};
use crate::entity::Entity;
use crate::error::Result;
use crate::filter::{matches, Filter, FilterContext};
use crate::populate::{populate, validate_spec, PopulateSpec};
use crate::schema::{CollectionSchema, Schema};
use crate::select::{project, Selection};
use crate::sort::{sort, SortSpec};
use crate::store::Store;
use serde::Deserialize;
use serde_json::Value;

/// Options accepted by every read operation
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct QueryOptions {
    #[serde(rename = "where")]
    pub filter: Option<Filter>,
    pub populate: Option<PopulateSpec>,
    pub sort: Option<SortSpec>,
    pub offset: Option<f64>,
    pub limit: Option<f64>,
    pub select: Option<Selection>,
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        QueryOptions::default()
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn populate(mut self, spec: PopulateSpec) -> Self {
        self.populate = Some(spec);
        self
    }

    pub fn sort(mut self, spec: SortSpec) -> Self {
        self.sort = Some(spec);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset as f64);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit as f64);
        self
    }

    pub fn select(mut self, selection: Selection) -> Self {
        self.select = Some(selection);
        self
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Offset clamped to >= 0 with fractions truncated.
    pub fn skip_count(&self) -> usize {
        self.offset.map(clamp_count).unwrap_or(0)
    }

    /// Limit clamped to >= 0 with fractions truncated, `None` when unbounded.
    pub fn take_count(&self) -> Option<usize> {
        self.limit.map(clamp_count)
    }

    fn sorted(&self) -> bool {
        self.sort.as_ref().map(|s| !s.is_empty()).unwrap_or(false)
    }

    fn admits(
        &self,
        entity: &Entity,
        collection: &CollectionSchema,
        ctx: &FilterContext<'_>,
    ) -> bool {
        if entity.is_deleted() && !self.include_deleted {
            return false;
        }
        match &self.filter {
            Some(filter) => matches(entity, filter, collection, ctx),
            None => true,
        }
    }

    fn expand(
        &self,
        entity: &Entity,
        collection: &CollectionSchema,
        ctx: &FilterContext<'_>,
    ) -> Entity {
        match &self.populate {
            Some(spec) => populate(entity, collection, spec, ctx),
            None => entity.clone(),
        }
    }

    fn shape(&self, entity: Entity) -> Entity {
        match &self.select {
            Some(selection) => project(&entity, selection),
            None => entity,
        }
    }
}

fn clamp_count(value: f64) -> usize {
    if value.is_nan() || value <= 0.0 {
        0
    } else {
        value.trunc() as usize
    }
}

// ── Candidate selection ────────────────────────────────────────

/// Ids to evaluate, in collection order. Top-level equalities that cover a
/// declared index narrow the set; the full filter still runs on each id.
fn candidate_ids(
    state: &CollectionState,
    collection: &CollectionSchema,
    options: &QueryOptions,
) -> Vec<String> {
    let narrowed = options.filter.as_ref().and_then(|filter| {
        let mut equalities = filter.required_equalities();
        equalities.retain(|path, _| collection.relationship(path).is_none());
        state.indexes().candidates(&equalities)
    });

    match narrowed {
        Some(ids) => state
            .iter()
            .filter_map(|e| e.id())
            .filter(|id| ids.contains(*id))
            .map(str::to_string)
            .collect(),
        None => state.ids(),
    }
}

/// Run the full pipeline over an explicit candidate list.
pub(crate) fn run_pipeline(
    candidates: Vec<Entity>,
    collection: &CollectionSchema,
    options: &QueryOptions,
    ctx: &FilterContext<'_>,
) -> Vec<Entity> {
    let matched: Vec<Entity> = candidates
        .into_iter()
        .filter(|e| options.admits(e, collection, ctx))
        .collect();

    let take = options.take_count().unwrap_or(usize::MAX);
    let window: Vec<Entity> = if options.sorted() {
        let mut expanded: Vec<Entity> = matched
            .iter()
            .map(|e| options.expand(e, collection, ctx))
            .collect();
        if let Some(spec) = &options.sort {
            sort(&mut expanded, spec);
        }
        expanded
            .into_iter()
            .skip(options.skip_count())
            .take(take)
            .collect()
    } else {
        matched
            .iter()
            .skip(options.skip_count())
            .take(take)
            .map(|e| options.expand(e, collection, ctx))
            .collect()
    };

    window.into_iter().map(|e| options.shape(e)).collect()
}

/// Materialize a query against a locked dataset.
pub(crate) fn execute(
    schema: &Schema,
    dataset: &Dataset,
    collection: &CollectionSchema,
    options: &QueryOptions,
) -> Result<Vec<Entity>> {
    if let Some(spec) = &options.populate {
        validate_spec(schema, collection, spec)?;
    }
    let state = dataset.collection(&collection.name)?;
    let candidates = candidate_ids(state, collection, options)
        .iter()
        .filter_map(|id| state.get(id).cloned())
        .collect();
    let ctx = FilterContext::new(schema, dataset);
    Ok(run_pipeline(candidates, collection, options, &ctx))
}

/// Look one entity up by id, applying the options' filter, populate and select.
pub(crate) fn lookup(
    schema: &Schema,
    dataset: &Dataset,
    collection: &CollectionSchema,
    id: &str,
    options: &QueryOptions,
) -> Result<Option<Entity>> {
    if let Some(spec) = &options.populate {
        validate_spec(schema, collection, spec)?;
    }
    let Some(entity) = dataset.collection(&collection.name)?.get(id) else {
        return Ok(None);
    };
    let ctx = FilterContext::new(schema, dataset);
    if !options.admits(entity, collection, &ctx) {
        return Ok(None);
    }
    Ok(Some(options.shape(options.expand(entity, collection, &ctx))))
}

/// Number of entities the query yields, without populating or projecting.
pub(crate) fn count(
    schema: &Schema,
    dataset: &Dataset,
    collection: &CollectionSchema,
    options: &QueryOptions,
) -> Result<usize> {
    let state = dataset.collection(&collection.name)?;
    let ctx = FilterContext::new(schema, dataset);
    let matched = candidate_ids(state, collection, options)
        .iter()
        .filter_map(|id| state.get(id))
        .filter(|e| options.admits(e, collection, &ctx))
        .count();
    let after_skip = matched.saturating_sub(options.skip_count());
    Ok(match options.take_count() {
        Some(take) => after_skip.min(take),
        None => after_skip,
    })
}

// ── Lazy query ─────────────────────────────────────────────────

/// A restartable query over one collection of a [`Store`].
pub struct Query<'s> {
    store: &'s Store,
    collection: &'s CollectionSchema,
    options: QueryOptions,
}

impl<'s> Query<'s> {
    pub(crate) fn new(
        store: &'s Store,
        collection: &'s CollectionSchema,
        options: QueryOptions,
    ) -> Result<Self> {
        if let Some(spec) = &options.populate {
            validate_spec(store.schema(), collection, spec)?;
        }
        Ok(Query {
            store,
            collection,
            options,
        })
    }

    /// Start a fresh run of the pipeline.
    pub fn iter(&self) -> QueryIter<'_, 's> {
        QueryIter {
            query: self,
            state: IterState::Pending,
            to_skip: self.options.skip_count(),
            remaining: self.options.take_count(),
        }
    }

    pub fn to_vec(&self) -> Vec<Entity> {
        self.iter().collect()
    }

    pub fn first(&self) -> Option<Entity> {
        self.iter().next()
    }

    pub fn count(&self) -> Result<usize> {
        let dataset = self.store.lock();
        count(self.store.schema(), &dataset, self.collection, &self.options)
    }

    fn start(&self) -> IterState {
        let dataset = self.store.lock();
        let Ok(state) = dataset.collection(&self.collection.name) else {
            return IterState::Done;
        };

        if self.options.sorted() {
            let ctx = FilterContext::new(self.store.schema(), &dataset);
            let mut rows: Vec<Entity> = candidate_ids(state, self.collection, &self.options)
                .iter()
                .filter_map(|id| state.get(id))
                .filter(|e| self.options.admits(e, self.collection, &ctx))
                .map(|e| self.options.expand(e, self.collection, &ctx))
                .collect();
            drop(dataset);
            if let Some(spec) = &self.options.sort {
                sort(&mut rows, spec);
            }
            log::debug!(
                "query on '{}' materialized {} sorted rows",
                self.collection.name,
                rows.len()
            );
            IterState::Materialized(rows.into_iter())
        } else {
            let ids = candidate_ids(state, self.collection, &self.options);
            log::debug!(
                "query on '{}' streaming over {} candidates",
                self.collection.name,
                ids.len()
            );
            IterState::Streaming { ids, pos: 0 }
        }
    }

    /// Pull the next admitted entity, holding the gate for one evaluation at a time.
    fn pull(&self, ids: &[String], pos: &mut usize, to_skip: &mut usize) -> Option<Entity> {
        while let Some(id) = ids.get(*pos) {
            *pos += 1;
            let dataset = self.store.lock();
            let ctx = FilterContext::new(self.store.schema(), &dataset);
            let Some(entity) = dataset.get(&self.collection.name, id) else {
                continue;
            };
            if !self.options.admits(entity, self.collection, &ctx) {
                continue;
            }
            if *to_skip > 0 {
                *to_skip -= 1;
                continue;
            }
            return Some(self.options.expand(entity, self.collection, &ctx));
        }
        None
    }
}

impl<'q, 's> IntoIterator for &'q Query<'s> {
    type Item = Entity;
    type IntoIter = QueryIter<'q, 's>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

enum IterState {
    Pending,
    Streaming { ids: Vec<String>, pos: usize },
    Materialized(std::vec::IntoIter<Entity>),
    Done,
}

/// One run of a [`Query`]. Holds no lock between pulls.
pub struct QueryIter<'q, 's> {
    query: &'q Query<'s>,
    state: IterState,
    to_skip: usize,
    remaining: Option<usize>,
}

impl Iterator for QueryIter<'_, '_> {
    type Item = Entity;

    fn next(&mut self) -> Option<Entity> {
        if self.remaining == Some(0) {
            return None;
        }
        if matches!(self.state, IterState::Pending) {
            self.state = self.query.start();
        }

        let entity = match &mut self.state {
            IterState::Streaming { ids, pos } => self.query.pull(ids, pos, &mut self.to_skip)?,
            IterState::Materialized(rows) => loop {
                let row = rows.next()?;
                if self.to_skip > 0 {
                    self.to_skip -= 1;
                    continue;
                }
                break row;
            },
            IterState::Pending | IterState::Done => return None,
        };

        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(self.query.options.shape(entity))
    }
}
