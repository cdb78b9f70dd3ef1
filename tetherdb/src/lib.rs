//! TetherDB: an embedded, schema-validated, relationship-aware data store.
//!
//! Collections are declared in YAML (or built in code). Entities are JSON
//! objects with an id and timestamps. Queries filter, populate relationships,
//! sort, window and project; writes check uniqueness, foreign keys and
//! delete policies, and multi-step work can run in an atomic transaction.

pub mod crud;
pub mod dataset;
pub mod entity;
pub mod error;
pub mod filter;
pub mod index;
pub mod persistence;
pub mod populate;
pub mod query;
pub mod schema;
pub mod select;
pub mod sort;
pub mod store;
pub mod transaction;
pub mod unique;
pub mod validation;

pub use crud::{
    CreateManyOptions, CreateManyResult, DeleteOptions, DeleteResult, Patch, UpdateManyOptions,
    UpdateManyResult, UpsertInput, UpsertManyResult, UpsertOutcome, UpsertStatus,
};
pub use entity::{Document, Entity};
pub use error::{FieldIssue, Result, TetherError};
pub use filter::{Filter, Op};
pub use persistence::{JsonFilePersistence, MemoryPersistence, Persistence};
pub use populate::PopulateSpec;
pub use query::{Query, QueryIter, QueryOptions};
pub use schema::{OnDeletePolicy, SchemaDefinition};
pub use select::Selection;
pub use sort::{SortDirection, SortSpec};
pub use store::{Collection, Store, StoreBuilder};
pub use transaction::Transaction;
pub use validation::{DeclaredSchemaValidator, SchemaValidator};
