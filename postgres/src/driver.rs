//! The seam between the router and a concrete client.
//!
//! [`Backend`] is a pooled connection handle, [`BackendTransaction`] a
//! checked-out client inside `BEGIN`, and [`Connector`] opens backends from
//! configuration. The PostgreSQL implementation lives in [`crate::pg`];
//! tests plug in scripted ones.

use std::sync::Arc;

use async_trait::async_trait;
use quarry_core::{BuiltSql, DriverError, Row};

use crate::config::{ConnectionConfig, PoolConfig};

/// Result type at the driver seam; errors are classified by the router.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A pooled connection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Runs one statement and returns every row it produced.
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>>;

    /// Checks out a client and opens a transaction on it.
    async fn begin(&self) -> DriverResult<Box<dyn BackendTransaction>>;

    /// Releases all pooled clients.
    async fn close(&self);
}

/// An open transaction holding one client.
#[async_trait]
pub trait BackendTransaction: Send + Sync {
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>>;

    async fn commit(self: Box<Self>) -> DriverResult<()>;

    async fn rollback(self: Box<Self>) -> DriverResult<()>;
}

/// Opens a [`Backend`] for one configured connection.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
        pool: &PoolConfig,
        timezone: &str,
    ) -> DriverResult<Arc<dyn Backend>>;
}
