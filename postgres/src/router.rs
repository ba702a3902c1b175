//! Named connections with READ/WRITE roles, connect-with-retry and
//! transaction wrapping.
//!
//! ```no_run
//! # async fn run() -> quarry_core::Result<()> {
//! use quarry_postgres::{ConnectionRouter, RouterConfig};
//!
//! let config = RouterConfig::from_toml_str(&std::fs::read_to_string("db.toml").unwrap())?;
//! let router = ConnectionRouter::new(config)?;
//! router.connect().await?;
//!
//! let tx = router.transaction().await?;
//! // ... pass &tx to executors with `in_transaction`
//! tx.commit().await?;
//!
//! router.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use compact_str::CompactString;
use hashbrown::HashMap;
use quarry_core::{BuiltSql, QuarryError, Result, Row, Value};
use rand::seq::IndexedRandom;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{ConnectionConfig, RouterConfig, Role};
use crate::driver::{Backend, BackendTransaction, Connector, DriverResult};
use crate::pg::PgConnector;
use crate::tracing::QueryLog;
use crate::{quarry_trace_query, quarry_trace_tx};

// ==================== Connection ====================

/// A connected, named backend. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    name: CompactString,
    role: Role,
    backend: Arc<dyn Backend>,
    log: Arc<QueryLog>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl Connection {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    async fn timed<F>(&self, sql: &BuiltSql, run: F) -> DriverResult<Vec<Row>>
    where
        F: Future<Output = DriverResult<Vec<Row>>>,
    {
        quarry_trace_query!(self.name, sql.sql, sql.params.len());
        let started = Instant::now();
        let result = run.await;
        self.log
            .record(&self.name, self.role, started.elapsed(), &sql.sql);
        result
    }

    /// Runs a read. Inside `tx` when one is given, otherwise on a pooled client.
    ///
    /// # Errors
    ///
    /// Driver failures classified by [`QuarryError::from_driver`], without a table.
    pub async fn fetch_all(&self, sql: &BuiltSql, tx: Option<&Transaction>) -> Result<Vec<Row>> {
        if let Some(tx) = tx {
            return tx.fetch_all(sql, None).await;
        }
        self.timed(sql, self.backend.fetch_all(sql))
            .await
            .map_err(|e| QuarryError::from_driver(e, None))
    }

    /// Runs a write.
    ///
    /// With `tx`, the statement joins it and the caller owns commit and
    /// rollback. Without, it runs in its own transaction that is rolled back
    /// before any error is returned.
    pub async fn execute(
        &self,
        sql: &BuiltSql,
        table: Option<&str>,
        tx: Option<&Transaction>,
    ) -> Result<Vec<Row>> {
        if let Some(tx) = tx {
            return tx.fetch_all(sql, table).await;
        }
        let tx = self.begin().await?;
        match tx.fetch_all(sql, table).await {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(err) => Err(tx.abort(err).await),
        }
    }

    /// Runs a batch of writes in one transaction, with the same ownership
    /// rules as [`Connection::execute`].
    pub async fn execute_many(
        &self,
        batch: &[BuiltSql],
        table: Option<&str>,
        tx: Option<&Transaction>,
    ) -> Result<Vec<Vec<Row>>> {
        if let Some(tx) = tx {
            return tx.fetch_batch(batch, table).await;
        }
        let tx = self.begin().await?;
        match tx.fetch_batch(batch, table).await {
            Ok(rows) => {
                tx.commit().await?;
                Ok(rows)
            }
            Err(err) => Err(tx.abort(err).await),
        }
    }

    /// Opens a transaction on this connection.
    pub async fn begin(&self) -> Result<Transaction> {
        let tx = self
            .backend
            .begin()
            .await
            .map_err(|e| QuarryError::from_driver(e, None))?;
        quarry_trace_tx!("begin", self.name);
        Ok(Transaction {
            inner: Arc::new(TxState {
                conn: self.clone(),
                tx: Mutex::new(Some(tx)),
            }),
        })
    }
}

// ==================== Transaction ====================

/// An open transaction. Clones share it.
///
/// Dropping the last clone while unfinished schedules a rollback on the
/// current runtime.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxState>,
}

struct TxState {
    conn: Connection,
    tx: Mutex<Option<Box<dyn BackendTransaction>>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("conn", &self.inner.conn.name)
            .finish_non_exhaustive()
    }
}

impl Drop for TxState {
    fn drop(&mut self) {
        let Some(tx) = self.tx.get_mut().take() else {
            return;
        };
        let name = self.conn.name.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(target: "quarry::transaction", conn = %name, "transaction dropped unfinished, rolling back");
                handle.spawn(async move {
                    if let Err(err) = tx.rollback().await {
                        tracing::warn!(target: "quarry::transaction", conn = %name, error = %err, "rollback after drop failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(target: "quarry::transaction", conn = %name, "transaction dropped outside a runtime");
            }
        }
    }
}

impl Transaction {
    /// The connection this transaction runs on.
    #[inline]
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// True until committed or rolled back.
    pub async fn is_active(&self) -> bool {
        self.inner.tx.lock().await.is_some()
    }

    async fn fetch_all(&self, sql: &BuiltSql, table: Option<&str>) -> Result<Vec<Row>> {
        let guard = self.inner.tx.lock().await;
        let tx = guard.as_ref().ok_or(QuarryError::TransactionClosed)?;
        self.inner
            .conn
            .timed(sql, tx.fetch_all(sql))
            .await
            .map_err(|e| QuarryError::from_driver(e, table))
    }

    async fn fetch_batch(&self, batch: &[BuiltSql], table: Option<&str>) -> Result<Vec<Vec<Row>>> {
        let guard = self.inner.tx.lock().await;
        let tx = guard.as_ref().ok_or(QuarryError::TransactionClosed)?;
        let mut out = Vec::with_capacity(batch.len());
        for sql in batch {
            let rows = self
                .inner
                .conn
                .timed(sql, tx.fetch_all(sql))
                .await
                .map_err(|e| QuarryError::from_driver(e, table))?;
            out.push(rows);
        }
        Ok(out)
    }

    async fn take(&self) -> Result<Box<dyn BackendTransaction>> {
        self.inner
            .tx
            .lock()
            .await
            .take()
            .ok_or(QuarryError::TransactionClosed)
    }

    /// # Errors
    ///
    /// [`QuarryError::TransactionClosed`] when already finished.
    pub async fn commit(&self) -> Result<()> {
        self.take()
            .await?
            .commit()
            .await
            .map_err(|e| QuarryError::from_driver(e, None))?;
        quarry_trace_tx!("commit", self.inner.conn.name);
        Ok(())
    }

    /// # Errors
    ///
    /// [`QuarryError::TransactionClosed`] when already finished.
    pub async fn rollback(&self) -> Result<()> {
        self.take()
            .await?
            .rollback()
            .await
            .map_err(|e| QuarryError::from_driver(e, None))?;
        quarry_trace_tx!("rollback", self.inner.conn.name);
        Ok(())
    }

    /// Rolls back and hands `err` back; a failed rollback is only logged.
    async fn abort(&self, err: QuarryError) -> QuarryError {
        if let Err(rollback) = self.rollback().await {
            tracing::warn!(
                target: "quarry::transaction",
                conn = %self.inner.conn.name,
                error = %rollback,
                "rollback failed"
            );
        }
        err
    }
}

// ==================== ConnectionRouter ====================

struct RouterInner {
    config: RouterConfig,
    tz: Tz,
    connector: Arc<dyn Connector>,
    log: Arc<QueryLog>,
    read_names: Vec<CompactString>,
    write_name: Option<CompactString>,
    connections: RwLock<HashMap<CompactString, Connection>>,
}

/// One WRITE and one or more READ connections. Cheap to clone; clones
/// share the same connections.
#[derive(Clone)]
pub struct ConnectionRouter {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for ConnectionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRouter")
            .field("read", &self.inner.read_names)
            .field("write", &self.inner.write_name)
            .field("timezone", &self.inner.tz)
            .finish_non_exhaustive()
    }
}

impl ConnectionRouter {
    /// Router over PostgreSQL pools.
    ///
    /// # Errors
    ///
    /// [`QuarryError::MultipleWriteConnections`] or
    /// [`QuarryError::ReadConnectionNotAvailable`].
    pub fn new(config: RouterConfig) -> Result<Self> {
        Self::with_connector(config, PgConnector)
    }

    /// Router over a custom [`Connector`].
    pub fn with_connector(config: RouterConfig, connector: impl Connector + 'static) -> Result<Self> {
        config.validate()?;
        let read_names = config.names_with(Role::Read).map(CompactString::from).collect();
        let write_name = config.names_with(Role::Write).next().map(CompactString::from);
        let tz = config.tz();
        let log = Arc::new(QueryLog::new(config.query_logger.clone()));
        Ok(Self {
            inner: Arc::new(RouterInner {
                config,
                tz,
                connector: Arc::new(connector),
                log,
                read_names,
                write_name,
                connections: RwLock::new(HashMap::new()),
            }),
        })
    }

    #[inline]
    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Opens every configured connection that is not open yet, retrying
    /// each with a fixed delay.
    ///
    /// # Errors
    ///
    /// [`QuarryError::ConnectionFailed`] once a connection exhausts its attempts.
    pub async fn connect(&self) -> Result<()> {
        for (name, config) in &self.inner.config.databases {
            if self.lookup(name).is_some() {
                continue;
            }
            let backend = self.connect_one(name, config).await?;
            let connection = Connection {
                name: name.as_str().into(),
                role: config.role,
                backend,
                log: Arc::clone(&self.inner.log),
            };
            self.inner
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.as_str().into(), connection);
        }
        Ok(())
    }

    async fn connect_one(&self, name: &str, config: &ConnectionConfig) -> Result<Arc<dyn Backend>> {
        let retry = self.inner.config.retry;
        let attempts = retry.attempts();
        // Resolved zone: an unknown name has already fallen back to UTC.
        let timezone = self.inner.tz.name();
        let mut attempt = 1;
        loop {
            match self
                .inner
                .connector
                .connect(name, config, &self.inner.config.pool, timezone)
                .await
            {
                Ok(backend) => {
                    tracing::info!(conn = name, role = %config.role, host = %config.host, db = %config.db, "connected");
                    return Ok(backend);
                }
                Err(source) if attempt >= attempts => {
                    tracing::error!(conn = name, attempts, error = %source, "giving up on connection");
                    return Err(QuarryError::ConnectionFailed {
                        name: name.to_string(),
                        attempts,
                        source,
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        conn = name,
                        attempt,
                        of = attempts,
                        error = %err,
                        "connection failed, retrying in {}s",
                        retry.retry_delay_secs
                    );
                    tokio::time::sleep(retry.delay()).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Closes every open connection. Connections never opened are skipped.
    pub async fn close(&self) {
        let connections: Vec<Connection> = self
            .inner
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            conn.backend.close().await;
            tracing::info!(conn = %conn.name, "closed");
        }
    }

    fn lookup(&self, name: &str) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn connected(&self, name: &str) -> Result<Connection> {
        self.lookup(name).ok_or_else(|| {
            QuarryError::Config(format!("connection \"{name}\" is not connected"))
        })
    }

    /// A uniformly random READ connection.
    pub fn read(&self) -> Result<Connection> {
        let name = self
            .inner
            .read_names
            .choose(&mut rand::rng())
            .ok_or(QuarryError::ReadConnectionNotAvailable)?;
        self.connected(name)
    }

    /// The WRITE connection.
    pub fn write(&self) -> Result<Connection> {
        let name = self
            .inner
            .write_name
            .as_deref()
            .ok_or_else(|| QuarryError::Config("no WRITE connection is configured".into()))?;
        self.connected(name)
    }

    /// A connection by configured name.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidConnectionName`] for a name not in the configuration.
    pub fn using(&self, name: &str) -> Result<Connection> {
        if !self.inner.config.databases.contains_key(name) {
            return Err(QuarryError::InvalidConnectionName(name.to_string()));
        }
        self.connected(name)
    }

    /// Opens a transaction on the WRITE connection.
    pub async fn transaction(&self) -> Result<Transaction> {
        self.write()?.begin().await
    }

    #[inline]
    pub fn timezone(&self) -> Tz {
        self.inner.tz
    }

    /// Current time in the configured zone.
    pub fn now(&self) -> DateTime<Tz> {
        Utc::now().with_timezone(&self.inner.tz)
    }

    /// [`ConnectionRouter::now`] as a bindable value.
    pub fn now_value(&self) -> Value {
        Value::TimestampTz(self.now().fixed_offset())
    }
}
