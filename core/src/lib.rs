//! Core building blocks for quarry: values and rows, the SQL AST and its
//! renderer, the condition builder, statement nodes and model metadata.
//!
//! Nothing in this crate performs I/O.

pub mod condition;
#[cfg(feature = "postgres")]
pub mod conversions;
pub mod error;
pub mod model;
pub mod placeholder;
pub mod row;
pub mod sql;
pub mod statement;
pub mod value;

// Re-export key types and traits
pub use condition::{BASE_ALIAS, Condition, ConditionBuilder, Filters, Lookup, RELATED_ALIAS};
pub use error::{DriverError, QuarryError, Result, UNIQUE_VIOLATION};
pub use model::{Model, ModelMeta, ModelSet, Relation, register};
pub use placeholder::{Placeholder, Placeholders};
pub use row::Row;
pub use sql::{BuiltSql, NamedSql, Param, Sql, SqlChunk, Token, validate_ident};
pub use statement::{
    Assignment, Count, DELETED_COUNT, Delete, Insert, Join, NEW_ID, OnConflict, Order, OrderTerm,
    Select, Statement, UPDATED_COUNT, Update,
};
pub use value::{FromValue, Value, ValueKey, decode_model};
