//! Multi-operation transactions.
//!
//! A transaction holds the store's mutation gate from start to finish and
//! keeps a snapshot of the dataset taken before the closure runs. The
//! snapshot is restored when the closure returns an error or panics.
//! Persistence saves for touched collections run once, after commit.

use crate::crud::{
    CreateManyOptions, CreateManyResult, DeleteOptions, DeleteResult, Patch, UpdateManyOptions,
    UpdateManyResult, UpsertInput, UpsertManyResult, UpsertOutcome, Writer,
};
use crate::dataset::Dataset;
use crate::entity::Entity;
use crate::error::Result;
use crate::filter::Filter;
use crate::query::{self, QueryOptions};
use crate::schema::Schema;
use crate::store::Store;
use parking_lot::MutexGuard;
use serde_json::Value;

/// Restores the snapshot on drop unless committed.
struct RollbackGuard<'s> {
    dataset: MutexGuard<'s, Dataset>,
    snapshot: Option<Dataset>,
}

impl RollbackGuard<'_> {
    fn commit(&mut self) {
        self.snapshot = None;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            *self.dataset = snapshot;
            log::debug!("transaction rolled back");
        }
    }
}

/// Handle passed to the closure given to [`Store::transact`]. Operations see
/// the effects of earlier operations in the same transaction.
pub struct Transaction<'t> {
    schema: &'t Schema,
    writer: Writer<'t>,
}

impl<'t> Transaction<'t> {
    pub fn create(&mut self, collection: &str, input: Value) -> Result<Entity> {
        self.writer.create(collection, input)
    }

    pub fn create_many(
        &mut self,
        collection: &str,
        inputs: Vec<Value>,
        options: CreateManyOptions,
    ) -> Result<CreateManyResult> {
        self.writer.create_many(collection, inputs, &options)
    }

    pub fn update(&mut self, collection: &str, id: &str, patch: Patch) -> Result<Entity> {
        self.writer.update(collection, id, &patch)
    }

    pub fn update_many(
        &mut self,
        collection: &str,
        filter: Filter,
        patch: Patch,
        options: UpdateManyOptions,
    ) -> Result<UpdateManyResult> {
        self.writer.update_many(collection, &filter, &patch, &options)
    }

    pub fn delete(
        &mut self,
        collection: &str,
        id: &str,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        self.writer.delete(collection, id, &options)
    }

    pub fn delete_many(
        &mut self,
        collection: &str,
        filter: Filter,
        options: DeleteOptions,
    ) -> Result<DeleteResult> {
        self.writer.delete_many(collection, &filter, &options)
    }

    pub fn upsert(&mut self, collection: &str, input: UpsertInput) -> Result<UpsertOutcome> {
        self.writer.upsert(collection, &input)
    }

    pub fn upsert_many(
        &mut self,
        collection: &str,
        inputs: Vec<UpsertInput>,
    ) -> Result<UpsertManyResult> {
        self.writer.upsert_many(collection, &inputs)
    }

    pub fn find_many(&self, collection: &str, options: QueryOptions) -> Result<Vec<Entity>> {
        let schema = self.schema.collection(collection)?;
        query::execute(self.schema, self.writer.dataset(), schema, &options)
    }

    pub fn find_by_id(&self, collection: &str, id: &str) -> Result<Option<Entity>> {
        let schema = self.schema.collection(collection)?;
        query::lookup(self.schema, self.writer.dataset(), schema, id, &QueryOptions::default())
    }

    pub fn count(&self, collection: &str, options: QueryOptions) -> Result<usize> {
        let schema = self.schema.collection(collection)?;
        query::count(self.schema, self.writer.dataset(), schema, &options)
    }
}

impl Store {
    /// Run `f` as one atomic unit.
    ///
    /// Other callers block until the transaction finishes, so `f` must use the
    /// [`Transaction`] handle rather than the store itself.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let dataset = self.lock();
        let snapshot = dataset.clone();
        let mut guard = RollbackGuard {
            dataset,
            snapshot: Some(snapshot),
        };

        let (outcome, touched) = {
            let mut tx = Transaction {
                schema: self.schema(),
                writer: Writer::new(self.schema(), &mut guard.dataset, self.validator()),
            };
            let outcome = f(&mut tx);
            (outcome, tx.writer.touched().clone())
        };

        match outcome {
            Ok(value) => {
                guard.commit();
                log::debug!("transaction committed ({} collections touched)", touched.len());
                self.flush(&guard.dataset, &touched);
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}
