//! # quarry
//!
//! A lazy, Django-style query layer over PostgreSQL with READ/WRITE routing.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quarry::prelude::*;
//!
//! #[derive(Debug)]
//! struct User {
//!     id: Option<i64>,
//!     name: String,
//! }
//!
//! impl Model for User {
//!     const NAME: &'static str = "User";
//!     const TABLE: &'static str = "users";
//!     const PRIMARY_KEY: &'static str = "id";
//!     const FIELDS: &'static [&'static str] = &["id", "name"];
//!     const AUTO_GENERATED: &'static [&'static str] = &["id"];
//!
//!     fn from_row(mut row: Row) -> quarry::Result<Self> {
//!         Ok(Self {
//!             id: row.take_as("id")?,
//!             name: row.take_as("name")?,
//!         })
//!     }
//!
//!     fn to_row(&self) -> Row {
//!         row! { "id" => self.id, "name" => self.name.as_str() }
//!     }
//! }
//!
//! # async fn run() -> quarry::Result<()> {
//! let config = RouterConfig::new()
//!     .database("primary", ConnectionConfig::new(Role::Write, "app", "app"))
//!     .database("replica", ConnectionConfig::new(Role::Read, "app", "app").host("replica", 5432));
//! let router = ConnectionRouter::new(config)?;
//! router.connect().await?;
//!
//! let alice = User::objects(&router)?
//!     .get(filters! { "name" => "Alice" })?
//!     .await?
//!     .into_one();
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! | Crate             | Contents                                                 |
//! |-------------------|----------------------------------------------------------|
//! | `quarry-core`     | values, rows, conditions, statements, model metadata     |
//! | `quarry-postgres` | router, executor, prefetch, raw queries, pagination      |

#[macro_use]
mod macros;

/// Result type for quarry operations
pub use quarry_core::Result;

/// Error types
pub mod error {
    pub use quarry_core::error::{DriverError, QuarryError, UNIQUE_VIOLATION};
}

/// Building blocks that perform no I/O.
pub mod core {
    /// Values, rows and decoding
    pub use quarry_core::{FromValue, Row, Value, ValueKey, decode_model};

    /// Condition building
    pub use quarry_core::{BASE_ALIAS, Condition, ConditionBuilder, Filters, Lookup, RELATED_ALIAS};

    /// SQL fragments and statement nodes
    pub use quarry_core::{
        Assignment, BuiltSql, Count, Delete, Insert, Join, NamedSql, OnConflict, Order, OrderTerm,
        Select, Sql, Statement, Update,
    };

    /// Model metadata
    pub use quarry_core::{Model, ModelMeta, ModelSet, Relation, register};
}

/// PostgreSQL routing and execution.
pub mod postgres {
    pub use quarry_postgres::*;
}

/// Everything needed to declare models and run queries.
pub mod prelude {
    pub use crate::{filters, row};
    pub use quarry_core::{
        Condition, Filters, Model, OnConflict, QuarryError, Relation, Row, Value,
    };
    pub use quarry_postgres::{
        AsRecord, AsRow, BulkOptions, ConnectionConfig, ConnectionRouter, ModelExt, Paginator,
        Prefetch, QueryExecutor, QueryOutput, RawPaginator, RawQuery, Role, RouterConfig,
        Transaction,
    };
}
