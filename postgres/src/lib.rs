//! PostgreSQL execution for quarry.
//!
//! [`ConnectionRouter`] owns the named READ/WRITE connections,
//! [`QueryExecutor`] turns the filter vocabulary into statements and shapes
//! their rows, and [`ModelExt`] adds `objects()`, `save()` and `delete()` to
//! every [`quarry_core::Model`].

pub mod config;
pub mod driver;
pub mod executor;
pub mod model;
pub mod paginator;
pub mod pg;
pub mod prefetch;
pub mod raw;
pub mod router;
pub mod tracing;

pub use config::{ConnectionConfig, PoolConfig, QueryLogConfig, RetryPolicy, Role, RouterConfig};
pub use driver::{Backend, BackendTransaction, Connector, DriverResult};
pub use executor::{AsRecord, AsRow, BulkOptions, QueryExecutor, QueryOutput, Shape};
pub use model::ModelExt;
pub use paginator::{PageInfo, PageResponse, Paginator, RawPaginator};
pub use pg::{PgBackend, PgConnector, PgTransaction};
pub use prefetch::Prefetch;
pub use raw::RawQuery;
pub use router::{Connection, ConnectionRouter, Transaction};
pub use self::tracing::QueryLog;
