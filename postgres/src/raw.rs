//! Hand-written SQL with `:name` placeholders.
//!
//! ```no_run
//! # async fn run(router: &quarry_postgres::ConnectionRouter) -> quarry_core::Result<()> {
//! use quarry_core::Row;
//! use quarry_postgres::RawQuery;
//!
//! let rows = RawQuery::new(router, "SELECT id, created::date FROM users WHERE age > :age")
//!     .fetch(&Row::new().with("age", 30))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use quarry_core::{BuiltSql, Result, Row};

use crate::router::{ConnectionRouter, Transaction};

/// One raw statement. Reads go to a random READ connection, writes to the
/// WRITE connection.
#[derive(Debug, Clone)]
pub struct RawQuery<'r> {
    router: &'r ConnectionRouter,
    text: String,
    tx: Option<&'r Transaction>,
}

impl<'r> RawQuery<'r> {
    pub fn new(router: &'r ConnectionRouter, text: impl Into<String>) -> Self {
        Self {
            router,
            text: text.into(),
            tx: None,
        }
    }

    /// Runs inside `tx`; the caller commits or rolls back.
    pub fn in_transaction(mut self, tx: &'r Transaction) -> Self {
        self.tx = Some(tx);
        self
    }

    #[inline]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Returns every row as a field mapping.
    ///
    /// # Errors
    ///
    /// [`quarry_core::QuarryError::InvalidFilterValue`] for a placeholder
    /// missing from `params`, before any I/O.
    pub async fn fetch(&self, params: &Row) -> Result<Vec<Row>> {
        let sql = BuiltSql::from_named(&self.text, params)?;
        self.router.read()?.fetch_all(&sql, self.tx).await
    }

    /// Runs a write in its own transaction unless one was supplied.
    pub async fn execute(&self, params: &Row) -> Result<Vec<Row>> {
        let sql = BuiltSql::from_named(&self.text, params)?;
        self.router.write()?.execute(&sql, None, self.tx).await
    }

    /// Runs the statement once per parameter set, all in one transaction.
    pub async fn execute_many(&self, batches: &[Row]) -> Result<Vec<Vec<Row>>> {
        let batch = batches
            .iter()
            .map(|params| BuiltSql::from_named(&self.text, params))
            .collect::<Result<Vec<_>>>()?;
        self.router.write()?.execute_many(&batch, None, self.tx).await
    }
}
