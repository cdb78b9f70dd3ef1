use crate::crud::{
    CreateManyOptions, CreateManyResult, DeleteOptions, DeleteResult, Patch, UpdateManyOptions,
    UpdateManyResult, UpsertInput, UpsertManyResult, UpsertOutcome, Writer,
};
use crate::dataset::{CollectionState, Dataset};
use crate::entity::Entity;
use crate::error::{Result, TetherError};
use crate::filter::Filter;
use crate::persistence::{JsonFilePersistence, Persistence};
use crate::query::{self, Query, QueryOptions};
use crate::schema::{parse_schema, parse_schema_str, CollectionSchema, Schema, SchemaDefinition};
use crate::validation::{DeclaredSchemaValidator, SchemaValidator};
use parking_lot::{Mutex, MutexGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The main entry point for TetherDB.
/// Owns the compiled schema and the dataset behind the mutation gate, and
/// provides collection handles for CRUD operations and queries.
pub struct Store {
    schema: Schema,
    dataset: Mutex<Dataset>,
    validator: Box<dyn SchemaValidator>,
    persistence: Option<Arc<dyn Persistence>>,
}

enum SchemaSource {
    Definition(SchemaDefinition),
    Yaml(String),
    Path(PathBuf),
}

/// Configures and builds a [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    source: Option<SchemaSource>,
    validator: Option<Box<dyn SchemaValidator>>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl StoreBuilder {
    pub fn schema(mut self, definition: SchemaDefinition) -> Self {
        self.source = Some(SchemaSource::Definition(definition));
        self
    }

    pub fn schema_yaml(mut self, yaml: &str) -> Self {
        self.source = Some(SchemaSource::Yaml(yaml.to_string()));
        self
    }

    pub fn schema_path(mut self, path: impl AsRef<Path>) -> Self {
        self.source = Some(SchemaSource::Path(path.as_ref().to_path_buf()));
        self
    }

    /// Replace the default [`DeclaredSchemaValidator`].
    pub fn validator(mut self, validator: impl SchemaValidator + 'static) -> Self {
        self.validator = Some(Box::new(validator));
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Compile the schema and seed persisted collections from the
    /// persistence collaborator.
    pub fn build(self) -> Result<Store> {
        let definition = match self.source {
            Some(SchemaSource::Definition(definition)) => definition,
            Some(SchemaSource::Yaml(yaml)) => parse_schema_str(&yaml)?,
            Some(SchemaSource::Path(path)) => parse_schema(&path)?,
            None => return Err(TetherError::Schema("no schema was provided".to_string())),
        };
        let schema = Schema::compile(definition)?;
        let mut dataset = Dataset::for_schema(&schema)?;

        if let Some(persistence) = &self.persistence {
            for name in schema.collection_names() {
                let collection = schema.collection(&name)?;
                if !collection.definition.persist {
                    continue;
                }
                let Some(rows) = persistence.load(&name)? else {
                    continue;
                };
                let entities = rows
                    .into_iter()
                    .map(|row| Entity::from_value(&name, row))
                    .collect::<Result<Vec<_>>>()?;
                let count = entities.len();
                let state = CollectionState::seed(&name, &collection.indexes, entities)?;
                dataset.set_collection(&name, state);
                log::info!("seeded {} entities into '{}'", count, name);
            }
        }

        log::info!("store ready with {} collections", schema.collection_names().len());
        Ok(Store {
            schema,
            dataset: Mutex::new(dataset),
            validator: self.validator.unwrap_or_else(|| Box::new(DeclaredSchemaValidator)),
            persistence: self.persistence,
        })
    }
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    /// An in-memory store with the default validator and no persistence.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Store::builder().schema_yaml(yaml).build()
    }

    /// Open a store rooted at a directory.
    /// Collections are declared in `schema.yaml`; persisted collections are
    /// kept as JSON files under `data/`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref();
        if !root.exists() {
            return Err(TetherError::Operation(format!(
                "Data directory does not exist: {}",
                root.display()
            )));
        }

        let schema_path = root.join("schema.yaml");
        if !schema_path.exists() {
            return Err(TetherError::Schema(format!(
                "schema.yaml not found in {}",
                root.display()
            )));
        }

        let persistence = JsonFilePersistence::open(root.join("data"))?;
        Store::builder()
            .schema_path(schema_path)
            .persistence(Arc::new(persistence))
            .build()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Get a handle for one collection.
    pub fn collection(&self, name: &str) -> Result<Collection<'_>> {
        Ok(Collection {
            store: self,
            schema: self.schema.collection(name)?,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Dataset> {
        self.dataset.lock()
    }

    pub(crate) fn validator(&self) -> &dyn SchemaValidator {
        self.validator.as_ref()
    }

    /// Run one mutating operation under the gate, then save what it touched.
    fn write<T>(&self, op: impl FnOnce(&mut Writer<'_>) -> Result<T>) -> Result<T> {
        let mut dataset = self.lock();
        let mut writer = Writer::new(&self.schema, &mut dataset, self.validator.as_ref());
        let value = op(&mut writer)?;
        let touched = writer.touched().clone();
        self.flush(&dataset, &touched);
        Ok(value)
    }

    /// Hand each touched, persisted collection to the persistence collaborator.
    /// Called with the gate held so saves arrive in commit order.
    pub(crate) fn flush(&self, dataset: &Dataset, touched: &BTreeSet<String>) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        for name in touched {
            let Ok(schema) = self.schema.collection(name) else {
                continue;
            };
            if !schema.definition.persist {
                continue;
            }
            let Ok(state) = dataset.collection(name) else {
                continue;
            };
            let encoded = state.iter().map(|e| self.validator.encode(schema, e)).collect();
            if let Err(e) = persistence.save(name, encoded) {
                log::warn!("failed to save collection '{}': {}", name, e);
            }
        }
    }

    // ── Dynamic API ────────────────────────────────────────────
    //
    // Plain JSON in and out, for callers that do not know the collection
    // types at compile time.

    pub fn create_dynamic(&self, collection: &str, data: Value) -> Result<Value> {
        Ok(self.collection(collection)?.create(data)?.into_value())
    }

    pub fn get_dynamic(&self, collection: &str, id: &str) -> Result<Value> {
        Ok(self.collection(collection)?.get(id)?.into_value())
    }

    /// `options` uses the [`QueryOptions`] JSON shape; `null` means defaults.
    pub fn query_dynamic(&self, collection: &str, options: &Value) -> Result<Value> {
        let options = parse_or_default::<QueryOptions>(options)?;
        let entities = self.collection(collection)?.find_many(options)?;
        Ok(Value::Array(entities.into_iter().map(Entity::into_value).collect()))
    }

    pub fn update_dynamic(&self, collection: &str, id: &str, patch: &Value) -> Result<Value> {
        let patch = Patch::from_json(patch)?;
        Ok(self.collection(collection)?.update(id, patch)?.into_value())
    }

    pub fn delete_dynamic(&self, collection: &str, id: &str, options: &Value) -> Result<Value> {
        let options = parse_or_default::<DeleteOptions>(options)?;
        let result = self.collection(collection)?.delete(id, options)?;
        let cascade: serde_json::Map<String, Value> = result
            .cascade
            .iter()
            .map(|(name, effect)| {
                (
                    name.clone(),
                    json!({ "deleted": effect.deleted, "nullified": effect.nullified }),
                )
            })
            .collect();
        Ok(json!({
            "count": result.count,
            "deleted": result.deleted.into_iter().map(Entity::into_value).collect::<Vec<_>>(),
            "cascade": cascade,
        }))
    }

    pub fn upsert_dynamic(&self, collection: &str, input: &Value) -> Result<Value> {
        let input: UpsertInput = serde_json::from_value(input.clone())?;
        let outcome = self.collection(collection)?.upsert(input)?;
        let status = if outcome.is_created() { "created" } else { "updated" };
        Ok(json!({ "status": status, "entity": outcome.entity().clone().into_value() }))
    }

    /// Entity counts per collection, live and soft-deleted.
    pub fn status(&self) -> Result<Value> {
        let dataset = self.lock();
        let mut collections = serde_json::Map::new();

        for name in self.schema.collection_names() {
            let schema = self.schema.collection(&name)?;
            let state = dataset.collection(&name)?;
            let deleted = state.iter().filter(|e| e.is_deleted()).count();
            collections.insert(
                name.clone(),
                json!({
                    "count": state.len() - deleted,
                    "deleted": deleted,
                    "persist": schema.definition.persist,
                }),
            );
        }

        Ok(json!({ "collections": collections }))
    }
}

fn parse_or_default<T: DeserializeOwned + Default>(value: &Value) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(value.clone())?)
}

/// A handle to one collection in a [`Store`].
#[derive(Clone, Copy)]
pub struct Collection<'s> {
    store: &'s Store,
    schema: &'s CollectionSchema,
}

impl<'s> Collection<'s> {
    pub fn name(&self) -> &'s str {
        &self.schema.name
    }

    pub fn schema(&self) -> &'s CollectionSchema {
        self.schema
    }

    pub fn create(&self, input: Value) -> Result<Entity> {
        self.store.write(|w| w.create(self.name(), input))
    }

    /// Create from any serializable value.
    pub fn create_typed<T: Serialize>(&self, data: &T) -> Result<Entity> {
        self.create(serde_json::to_value(data)?)
    }

    pub fn create_many(
        &self,
        inputs: Vec<Value>,
        options: CreateManyOptions,
    ) -> Result<CreateManyResult> {
        self.store.write(|w| w.create_many(self.name(), inputs, &options))
    }

    pub fn update(&self, id: &str, patch: Patch) -> Result<Entity> {
        self.store.write(|w| w.update(self.name(), id, &patch))
    }

    pub fn update_many(
        &self,
        filter: Filter,
        patch: Patch,
        options: UpdateManyOptions,
    ) -> Result<UpdateManyResult> {
        self.store
            .write(|w| w.update_many(self.name(), &filter, &patch, &options))
    }

    pub fn delete(&self, id: &str, options: DeleteOptions) -> Result<DeleteResult> {
        self.store.write(|w| w.delete(self.name(), id, &options))
    }

    pub fn delete_many(&self, filter: Filter, options: DeleteOptions) -> Result<DeleteResult> {
        self.store.write(|w| w.delete_many(self.name(), &filter, &options))
    }

    pub fn upsert(&self, input: UpsertInput) -> Result<UpsertOutcome> {
        self.store.write(|w| w.upsert(self.name(), &input))
    }

    pub fn upsert_many(&self, inputs: Vec<UpsertInput>) -> Result<UpsertManyResult> {
        self.store.write(|w| w.upsert_many(self.name(), &inputs))
    }

    /// A lazy, restartable query.
    pub fn query(&self, options: QueryOptions) -> Result<Query<'s>> {
        Query::new(self.store, self.schema, options)
    }

    pub fn find_many(&self, options: QueryOptions) -> Result<Vec<Entity>> {
        let dataset = self.store.lock();
        query::execute(self.store.schema(), &dataset, self.schema, &options)
    }

    pub fn find_first(&self, mut options: QueryOptions) -> Result<Option<Entity>> {
        let take = options.take_count().map_or(1, |t| t.min(1));
        options.limit = Some(take as f64);
        Ok(self.find_many(options)?.into_iter().next())
    }

    pub fn find_by_id(&self, id: &str, options: QueryOptions) -> Result<Option<Entity>> {
        let dataset = self.store.lock();
        query::lookup(self.store.schema(), &dataset, self.schema, id, &options)
    }

    /// A live entity by id, or `NotFound`.
    pub fn get(&self, id: &str) -> Result<Entity> {
        self.find_by_id(id, QueryOptions::new())?
            .ok_or_else(|| TetherError::not_found(self.name(), id))
    }

    pub fn count(&self, options: QueryOptions) -> Result<usize> {
        let dataset = self.store.lock();
        query::count(self.store.schema(), &dataset, self.schema, &options)
    }
}
