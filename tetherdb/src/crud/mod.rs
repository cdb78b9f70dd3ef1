//! Create, update, delete and upsert against a locked [`Dataset`].
//!
//! A [`Writer`] is short-lived: the store builds one while it holds the
//! mutation gate and drops it before releasing the gate. Every operation
//! either completes or leaves the dataset exactly as it found it.

mod patch;

pub use patch::{
    apply, apply_patch, resolve, ArrayPatch, BooleanPatch, ElementPredicate, FieldPatch,
    NumberPatch, Patch, PatchOp, StringPatch, TypedPatch,
};

use crate::dataset::Dataset;
use crate::entity::{
    is_missing, now_timestamp, values_equal, Entity, CREATED_AT, DELETED_AT, ID, UPDATED_AT,
};
use crate::error::{Result, TetherError};
use crate::filter::{matches, Filter, FilterContext};
use crate::schema::{
    AutoIdStrategy, CollectionSchema, Dependent, OnDeletePolicy, RelationshipKind, Schema,
};
use crate::unique::{self, BatchClaims};
use crate::validation::SchemaValidator;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};

// ── Operation shapes ───────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateManyOptions {
    pub skip_duplicates: bool,
}

impl CreateManyOptions {
    pub fn skip_duplicates() -> Self {
        CreateManyOptions { skip_duplicates: true }
    }
}

/// An input left out of a `create_many` batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedInput {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateManyResult {
    pub created: Vec<Entity>,
    pub skipped: Vec<SkippedInput>,
}

impl CreateManyResult {
    pub fn count(&self) -> usize {
        self.created.len()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpdateManyOptions {
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateManyResult {
    pub matched: usize,
    pub updated: Vec<Entity>,
}

impl UpdateManyResult {
    pub fn count(&self) -> usize {
        self.updated.len()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteOptions {
    /// `None` follows the collection's `soft_delete` declaration.
    pub soft: Option<bool>,
    pub return_deleted: bool,
    /// Dependent policy overrides keyed by inverse relationship name
    pub include: BTreeMap<String, OnDeletePolicy>,
    /// Only used by `delete_many`
    pub limit: Option<usize>,
}

impl DeleteOptions {
    pub fn soft() -> Self {
        DeleteOptions {
            soft: Some(true),
            ..Default::default()
        }
    }

    pub fn hard() -> Self {
        DeleteOptions {
            soft: Some(false),
            ..Default::default()
        }
    }

    pub fn returning(mut self) -> Self {
        self.return_deleted = true;
        self
    }

    pub fn include(mut self, relationship: impl Into<String>, policy: OnDeletePolicy) -> Self {
        self.include.insert(relationship.into(), policy);
        self
    }
}

/// Dependents affected in one collection by a delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CascadeEffect {
    pub deleted: Vec<String>,
    pub nullified: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteResult {
    /// Entities deleted directly (not counting cascades)
    pub count: usize,
    /// The deleted entities, when `return_deleted` was set
    pub deleted: Vec<Entity>,
    /// Cascaded effects keyed by collection
    pub cascade: BTreeMap<String, CascadeEffect>,
}

impl DeleteResult {
    pub fn cascaded(&self, collection: &str) -> usize {
        self.cascade.get(collection).map(|c| c.deleted.len()).unwrap_or(0)
    }
}

/// `{where, create, update}`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpsertInput {
    #[serde(rename = "where")]
    pub filter: Map<String, Value>,
    pub create: Value,
    pub update: Patch,
}

impl UpsertInput {
    pub fn new(filter: Value, create: Value, update: Patch) -> Result<Self> {
        match filter {
            Value::Object(filter) => Ok(UpsertInput { filter, create, update }),
            other => Err(TetherError::validation(
                "<upsert>",
                "where",
                format!("expected object, got {}", crate::entity::kind_name(&other)),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    Created(Entity),
    Updated(Entity),
}

impl UpsertOutcome {
    pub fn entity(&self) -> &Entity {
        match self {
            UpsertOutcome::Created(e) | UpsertOutcome::Updated(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStatus {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertManyResult {
    pub results: Vec<(UpsertStatus, Entity)>,
}

impl UpsertManyResult {
    fn tally(&self, status: UpsertStatus) -> usize {
        self.results.iter().filter(|(s, _)| *s == status).count()
    }

    pub fn created(&self) -> usize {
        self.tally(UpsertStatus::Created)
    }

    pub fn updated(&self) -> usize {
        self.tally(UpsertStatus::Updated)
    }

    pub fn unchanged(&self) -> usize {
        self.tally(UpsertStatus::Unchanged)
    }
}

// ── Writer ─────────────────────────────────────────────────────

pub(crate) struct Writer<'a> {
    schema: &'a Schema,
    dataset: &'a mut Dataset,
    validator: &'a dyn SchemaValidator,
    touched: BTreeSet<String>,
}

impl<'a> Writer<'a> {
    pub(crate) fn new(
        schema: &'a Schema,
        dataset: &'a mut Dataset,
        validator: &'a dyn SchemaValidator,
    ) -> Self {
        Writer {
            schema,
            dataset,
            validator,
            touched: BTreeSet::new(),
        }
    }

    fn collection_schema(&self, name: &str) -> Result<&'a CollectionSchema> {
        self.schema.collection(name)
    }

    fn dependents(&self, target: &str) -> &'a [Dependent] {
        self.schema.dependents_of(target)
    }

    /// Collections modified so far
    pub(crate) fn touched(&self) -> &BTreeSet<String> {
        &self.touched
    }

    pub(crate) fn dataset(&self) -> &Dataset {
        self.dataset
    }

    /// Run `f`, restoring the dataset if it fails.
    fn atomically<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let snapshot = self.dataset.clone();
        let touched = self.touched.clone();
        let out = f(self);
        if out.is_err() {
            *self.dataset = snapshot;
            self.touched = touched;
        }
        out
    }

    fn live(&self, collection: &str, id: &str) -> Result<&Entity> {
        self.dataset
            .get(collection, id)
            .filter(|e| !e.is_deleted())
            .ok_or_else(|| TetherError::not_found(collection, id))
    }

    fn matching_ids(
        &self,
        collection: &CollectionSchema,
        filter: &Filter,
        limit: Option<usize>,
    ) -> Result<Vec<String>> {
        let state = self.dataset.collection(&collection.name)?;
        let ctx = FilterContext::new(self.schema, self.dataset);
        Ok(state
            .iter()
            .filter(|e| !e.is_deleted() && matches(e, filter, collection, &ctx))
            .filter_map(|e| e.id().map(str::to_string))
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    // ── Create ─────────────────────────────────────────────────

    pub(crate) fn create(&mut self, collection: &str, input: Value) -> Result<Entity> {
        let schema = self.collection_schema(collection)?;
        let entity = self.prepare_create(schema, input, &BatchClaims::new(), &HashSet::new())?;
        self.dataset.collection_mut(collection)?.insert(entity.clone());
        self.touched.insert(collection.to_string());
        log::debug!("created {}/{}", collection, entity.id().unwrap_or_default());
        Ok(entity)
    }

    pub(crate) fn create_many(
        &mut self,
        collection: &str,
        inputs: Vec<Value>,
        options: &CreateManyOptions,
    ) -> Result<CreateManyResult> {
        let schema = self.collection_schema(collection)?;
        let mut claims = BatchClaims::new();
        let mut batch_ids = HashSet::new();
        let mut result = CreateManyResult::default();

        for (index, input) in inputs.into_iter().enumerate() {
            match self.prepare_create(schema, input, &claims, &batch_ids) {
                Ok(entity) => {
                    claims.claim(schema, &entity);
                    batch_ids.insert(entity.id().unwrap_or_default().to_string());
                    result.created.push(entity);
                }
                Err(e) if options.skip_duplicates && e.is_duplicate() => {
                    log::debug!("create_many on '{}' skipped input {}: {}", collection, index, e);
                    result.skipped.push(SkippedInput {
                        index,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let state = self.dataset.collection_mut(collection)?;
        for entity in &result.created {
            state.insert(entity.clone());
        }
        if !result.created.is_empty() {
            self.touched.insert(collection.to_string());
        }
        log::debug!(
            "create_many on '{}': {} created, {} skipped",
            collection,
            result.created.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Build and check a new entity without inserting it.
    fn prepare_create(
        &self,
        schema: &CollectionSchema,
        input: Value,
        claims: &BatchClaims,
        batch_ids: &HashSet<String>,
    ) -> Result<Entity> {
        let mut entity = Entity::from_value(&schema.name, input)?;

        for rel in schema.relationships.keys() {
            if entity.contains(rel) {
                return Err(TetherError::validation(
                    schema.name.as_str(),
                    rel.as_str(),
                    "relationships are derived; set the foreign key instead",
                ));
            }
        }

        let id = match entity.get(ID) {
            None | Some(Value::Null) => generate_id(schema.auto_id()),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(TetherError::validation(
                    schema.name.as_str(),
                    ID,
                    format!("id must be a non-empty string, got {other}"),
                ))
            }
        };
        if self.dataset.collection(&schema.name)?.contains(&id) || batch_ids.contains(&id) {
            return Err(TetherError::DuplicateKey {
                collection: schema.name.clone(),
                id,
            });
        }

        entity.insert(ID, Value::String(id));
        let now = Value::String(now_timestamp());
        entity.insert(CREATED_AT, now.clone());
        entity.insert(UPDATED_AT, now);
        entity.remove(DELETED_AT);

        let entity = self.validate(schema, entity)?;
        self.check_foreign_keys(schema, &entity, None, batch_ids)?;
        unique::check(schema, self.dataset.collection(&schema.name)?, &entity, None)?;
        claims.check(schema, &entity)?;
        Ok(entity)
    }

    fn validate(&self, schema: &CollectionSchema, entity: Entity) -> Result<Entity> {
        self.validator
            .validate(schema, entity)
            .map_err(|issues| TetherError::Validation {
                collection: schema.name.clone(),
                issues,
            })
    }

    /// Every non-null ref foreign key must name an existing entity. With
    /// `changed`, only those fields are checked.
    fn check_foreign_keys(
        &self,
        schema: &CollectionSchema,
        entity: &Entity,
        changed: Option<&HashSet<String>>,
        batch_ids: &HashSet<String>,
    ) -> Result<()> {
        for rel in schema.refs() {
            if changed.map(|c| !c.contains(&rel.foreign_key)).unwrap_or(false) {
                continue;
            }
            let value = entity.get(&rel.foreign_key);
            if is_missing(value) {
                continue;
            }
            let Some(fk) = value.and_then(Value::as_str) else {
                return Err(TetherError::validation(
                    schema.name.as_str(),
                    rel.foreign_key.as_str(),
                    "foreign key must be a string id",
                ));
            };
            let in_batch = rel.target == schema.name && batch_ids.contains(fk);
            if !in_batch && self.dataset.get(&rel.target, fk).is_none() {
                return Err(TetherError::ForeignKey {
                    collection: schema.name.clone(),
                    field: rel.foreign_key.clone(),
                    target: rel.target.clone(),
                    value: fk.to_string(),
                });
            }
        }
        Ok(())
    }

    // ── Update ─────────────────────────────────────────────────

    pub(crate) fn update(&mut self, collection: &str, id: &str, patch: &Patch) -> Result<Entity> {
        self.update_entity(collection, id, patch, false)
            .map(|(entity, _)| entity)
    }

    /// Apply a patch. With `skip_noop`, a patch that changes nothing writes
    /// nothing (and leaves `updatedAt` alone). Returns whether anything changed.
    fn update_entity(
        &mut self,
        collection: &str,
        id: &str,
        patch: &Patch,
        skip_noop: bool,
    ) -> Result<(Entity, bool)> {
        let schema = self.collection_schema(collection)?;
        let current = self.live(collection, id)?;
        let (next, changed) = apply_patch(schema, current, patch)?;

        if skip_noop && changed.is_empty() {
            return Ok((current.clone(), false));
        }

        let mut next = self.validate(schema, next)?;
        next.insert(UPDATED_AT, Value::String(now_timestamp()));
        self.check_foreign_keys(schema, &next, Some(&changed), &HashSet::new())?;
        unique::check(schema, self.dataset.collection(collection)?, &next, Some(&changed))?;

        self.dataset.collection_mut(collection)?.replace(next.clone());
        self.touched.insert(collection.to_string());
        log::debug!("updated {}/{} ({} fields changed)", collection, id, changed.len());
        Ok((next, !changed.is_empty()))
    }

    pub(crate) fn update_many(
        &mut self,
        collection: &str,
        filter: &Filter,
        patch: &Patch,
        options: &UpdateManyOptions,
    ) -> Result<UpdateManyResult> {
        let schema = self.collection_schema(collection)?;
        let ids = self.matching_ids(schema, filter, options.limit)?;

        self.atomically(|w| {
            let mut result = UpdateManyResult {
                matched: ids.len(),
                updated: Vec::with_capacity(ids.len()),
            };
            for id in &ids {
                result.updated.push(w.update(collection, id, patch)?);
            }
            Ok(result)
        })
    }

    // ── Delete ─────────────────────────────────────────────────

    pub(crate) fn delete(
        &mut self,
        collection: &str,
        id: &str,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        self.atomically(|w| {
            let mut result = DeleteResult::default();
            w.delete_root(collection, id, options, &mut result)?;
            Ok(result)
        })
    }

    pub(crate) fn delete_many(
        &mut self,
        collection: &str,
        filter: &Filter,
        options: &DeleteOptions,
    ) -> Result<DeleteResult> {
        let schema = self.collection_schema(collection)?;
        let ids = self.matching_ids(schema, filter, options.limit)?;

        self.atomically(|w| {
            let mut result = DeleteResult::default();
            for id in &ids {
                // an earlier cascade may already have removed it
                let gone = match w.dataset.get(collection, id) {
                    None => true,
                    Some(e) => e.is_deleted() && w.is_soft(schema, options)?,
                };
                if gone {
                    continue;
                }
                w.delete_root(collection, id, options, &mut result)?;
            }
            Ok(result)
        })
    }

    fn is_soft(&self, schema: &CollectionSchema, options: &DeleteOptions) -> Result<bool> {
        match options.soft {
            Some(true) if !schema.soft_delete() => Err(TetherError::Operation(format!(
                "collection '{}' does not support soft delete",
                schema.name
            ))),
            Some(soft) => Ok(soft),
            None => Ok(schema.soft_delete()),
        }
    }

    fn delete_root(
        &mut self,
        collection: &str,
        id: &str,
        options: &DeleteOptions,
        result: &mut DeleteResult,
    ) -> Result<()> {
        let schema = self.collection_schema(collection)?;
        for name in options.include.keys() {
            match schema.relationship(name) {
                Some(rel) if rel.kind == RelationshipKind::Inverse => {}
                _ => {
                    return Err(TetherError::validation(
                        collection,
                        format!("include.{name}"),
                        format!("'{name}' is not an inverse relationship of '{collection}'"),
                    ))
                }
            }
        }

        let soft = self.is_soft(schema, options)?;
        let mut visiting = HashSet::new();
        let removed =
            self.delete_entity(collection, id, soft, &options.include, &mut visiting, result)?;
        result.count += 1;
        if options.return_deleted {
            result.deleted.push(removed);
        }
        Ok(())
    }

    fn delete_entity(
        &mut self,
        collection: &str,
        id: &str,
        soft: bool,
        include: &BTreeMap<String, OnDeletePolicy>,
        visiting: &mut HashSet<(String, String)>,
        result: &mut DeleteResult,
    ) -> Result<Entity> {
        let current = self
            .dataset
            .get(collection, id)
            .ok_or_else(|| TetherError::not_found(collection, id))?;
        if soft && current.is_deleted() {
            return Err(TetherError::not_found(collection, id));
        }
        if !visiting.insert((collection.to_string(), id.to_string())) {
            return Ok(current.clone());
        }

        let schema = self.collection_schema(collection)?;
        for dependent in self.dependents(collection) {
            let inverse_name = schema
                .inverses()
                .find(|r| {
                    r.target == dependent.collection && r.foreign_key == dependent.foreign_key
                })
                .map(|r| r.name.as_str());
            let policy = inverse_name
                .and_then(|name| include.get(name).copied())
                .or(dependent.on_delete)
                .or(if soft { None } else { Some(OnDeletePolicy::Restrict) });
            let Some(policy) = policy else {
                continue;
            };

            let dependents: Vec<String> = self
                .dataset
                .collection(&dependent.collection)?
                .iter()
                .filter(|e| e.get(&dependent.foreign_key).and_then(Value::as_str) == Some(id))
                .filter_map(|e| e.id().map(str::to_string))
                .filter(|dep_id| {
                    !visiting.contains(&(dependent.collection.clone(), dep_id.clone()))
                })
                .collect();
            if dependents.is_empty() {
                continue;
            }

            match policy {
                OnDeletePolicy::Restrict => {
                    return Err(TetherError::Operation(format!(
                        "cannot delete {collection}/{id}: {} dependent(s) in '{}' via '{}'",
                        dependents.len(),
                        dependent.collection,
                        dependent.foreign_key
                    )));
                }
                OnDeletePolicy::SetNull => {
                    let now = Value::String(now_timestamp());
                    let state = self.dataset.collection_mut(&dependent.collection)?;
                    for dep_id in &dependents {
                        if let Some(mut dep) = state.get(dep_id).cloned() {
                            dep.insert(dependent.foreign_key.clone(), Value::Null);
                            dep.insert(UPDATED_AT, now.clone());
                            state.replace(dep);
                        }
                    }
                    self.touched.insert(dependent.collection.clone());
                    result
                        .cascade
                        .entry(dependent.collection.clone())
                        .or_default()
                        .nullified
                        .extend(dependents);
                }
                OnDeletePolicy::Cascade => {
                    let child_soft =
                        soft && self.collection_schema(&dependent.collection)?.soft_delete();
                    for dep_id in dependents {
                        if child_soft && self.live(&dependent.collection, &dep_id).is_err() {
                            continue;
                        }
                        self.delete_entity(
                            &dependent.collection,
                            &dep_id,
                            child_soft,
                            &BTreeMap::new(),
                            visiting,
                            result,
                        )?;
                        result
                            .cascade
                            .entry(dependent.collection.clone())
                            .or_default()
                            .deleted
                            .push(dep_id);
                    }
                }
            }
        }

        let state = self.dataset.collection_mut(collection)?;
        let removed = if soft {
            let mut tombstone = state
                .get(id)
                .cloned()
                .ok_or_else(|| TetherError::not_found(collection, id))?;
            let now = Value::String(now_timestamp());
            tombstone.insert(DELETED_AT, now.clone());
            tombstone.insert(UPDATED_AT, now);
            state.replace(tombstone.clone());
            tombstone
        } else {
            state
                .remove(id)
                .ok_or_else(|| TetherError::not_found(collection, id))?
        };
        self.touched.insert(collection.to_string());
        log::debug!("{} deleted {}/{}", if soft { "soft" } else { "hard" }, collection, id);
        Ok(removed)
    }

    // ── Upsert ─────────────────────────────────────────────────

    pub(crate) fn upsert(
        &mut self,
        collection: &str,
        input: &UpsertInput,
    ) -> Result<UpsertOutcome> {
        self.upsert_one(collection, input, false).map(|(status, entity)| match status {
            UpsertStatus::Created => UpsertOutcome::Created(entity),
            _ => UpsertOutcome::Updated(entity),
        })
    }

    pub(crate) fn upsert_many(
        &mut self,
        collection: &str,
        inputs: &[UpsertInput],
    ) -> Result<UpsertManyResult> {
        self.atomically(|w| {
            let mut result = UpsertManyResult::default();
            for input in inputs {
                result.results.push(w.upsert_one(collection, input, true)?);
            }
            Ok(result)
        })
    }

    fn upsert_one(
        &mut self,
        collection: &str,
        input: &UpsertInput,
        skip_noop: bool,
    ) -> Result<(UpsertStatus, Entity)> {
        let schema = self.collection_schema(collection)?;
        self.check_upsert_key(schema, &input.filter)?;

        let found: Vec<String> = self
            .dataset
            .collection(collection)?
            .iter()
            .filter(|e| !e.is_deleted())
            .filter(|e| {
                input
                    .filter
                    .iter()
                    .all(|(k, v)| e.get(k).map(|x| values_equal(x, v)).unwrap_or(false))
            })
            .filter_map(|e| e.id().map(str::to_string))
            .collect();

        match found.as_slice() {
            [] => {
                let mut data = match &input.create {
                    Value::Object(map) => map.clone(),
                    Value::Null => Map::new(),
                    other => {
                        return Err(TetherError::validation(
                            collection,
                            "create",
                            format!("expected object, got {}", crate::entity::kind_name(other)),
                        ))
                    }
                };
                for (k, v) in &input.filter {
                    data.insert(k.clone(), v.clone());
                }
                let entity = self.create(collection, Value::Object(data))?;
                Ok((UpsertStatus::Created, entity))
            }
            [id] => {
                let (entity, changed) =
                    self.update_entity(collection, id, &input.update, skip_noop)?;
                let status = if changed || !skip_noop {
                    UpsertStatus::Updated
                } else {
                    UpsertStatus::Unchanged
                };
                Ok((status, entity))
            }
            many => Err(TetherError::Operation(format!(
                "upsert on '{collection}' matched {} entities",
                many.len()
            ))),
        }
    }

    /// The where of an upsert must name the id or a whole unique constraint.
    fn check_upsert_key(
        &self,
        schema: &CollectionSchema,
        filter: &Map<String, Value>,
    ) -> Result<()> {
        let present = |field: &str| filter.get(field).map(|v| !v.is_null()).unwrap_or(false);
        if present(ID) || schema.unique.iter().any(|c| c.fields.iter().all(|f| present(f))) {
            return Ok(());
        }
        Err(TetherError::validation(
            schema.name.as_str(),
            "where",
            "upsert needs the id or every field of a unique constraint",
        ))
    }
}

fn generate_id(strategy: AutoIdStrategy) -> String {
    match strategy {
        AutoIdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
        AutoIdStrategy::Uuid => uuid::Uuid::new_v4().to_string(),
        AutoIdStrategy::Nanoid => nanoid::nanoid!(),
    }
}
