//! PostgreSQL backend over a `deadpool-postgres` pool of `tokio-postgres` clients.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime};
use deadpool_postgres::{
    Config, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime,
};
use quarry_core::{BuiltSql, DriverError, Row, Value};
use rust_decimal::Decimal;
use tokio_postgres::NoTls;
use tokio_postgres::types::{ToSql, Type};
use uuid::Uuid;

use crate::config::{ConnectionConfig, PoolConfig};
use crate::driver::{Backend, BackendTransaction, Connector, DriverResult};

// ==================== errors ====================

/// Readable name for the SQLSTATEs callers branch on most.
fn sqlstate_name(code: &str) -> &'static str {
    match code {
        "23505" => "UniqueViolation",
        "23503" => "ForeignKeyViolation",
        "23502" => "NotNullViolation",
        "23514" => "CheckViolation",
        "40001" => "SerializationFailure",
        "40P01" => "DeadlockDetected",
        "42601" => "SyntaxError",
        "42703" => "UndefinedColumn",
        "42P01" => "UndefinedTable",
        "57014" => "QueryCanceled",
        _ => "DatabaseError",
    }
}

/// Maps a client error; server errors keep their SQLSTATE.
pub fn driver_error(err: tokio_postgres::Error) -> DriverError {
    match err.as_db_error() {
        Some(db) => {
            let code = db.code().code();
            DriverError::new(sqlstate_name(code), db.message()).with_sqlstate(code)
        }
        None if err.is_closed() => DriverError::new("ConnectionClosed", err.to_string()),
        None => DriverError::new("ClientError", err.to_string()),
    }
}

fn pool_error(err: PoolError) -> DriverError {
    match err {
        PoolError::Backend(err) => driver_error(err),
        other => DriverError::new("PoolError", other.to_string()),
    }
}

// ==================== decoding ====================

macro_rules! get_value {
    ($row:expr, $idx:expr, $ty:ty, $map:expr) => {
        $row.try_get::<_, Option<$ty>>($idx)
            .map(|value| value.map($map).unwrap_or(Value::Null))
            .map_err(|e| DriverError::new("DecodeError", e.to_string()))
    };
}

fn list<T: Into<Value>>(items: Vec<Option<T>>) -> Value {
    Value::List(items.into_iter().map(Value::from).collect())
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> DriverResult<Value> {
    match *ty {
        Type::BOOL => get_value!(row, idx, bool, Value::Bool),
        Type::INT2 => get_value!(row, idx, i16, |v| Value::Int(v.into())),
        Type::INT4 => get_value!(row, idx, i32, |v| Value::Int(v.into())),
        Type::INT8 => get_value!(row, idx, i64, Value::Int),
        Type::OID => get_value!(row, idx, u32, |v| Value::Int(v.into())),
        Type::FLOAT4 => get_value!(row, idx, f32, |v| Value::Float(v.into())),
        Type::FLOAT8 => get_value!(row, idx, f64, Value::Float),
        // Decimal text keeps the exact value.
        Type::NUMERIC => get_value!(row, idx, Decimal, |v| Value::Text(v.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get_value!(row, idx, String, Value::Text)
        }
        Type::JSON | Type::JSONB => get_value!(row, idx, serde_json::Value, Value::Json),
        Type::TIMESTAMP => get_value!(row, idx, NaiveDateTime, Value::Timestamp),
        Type::TIMESTAMPTZ => get_value!(row, idx, DateTime<FixedOffset>, Value::TimestampTz),
        Type::DATE => get_value!(row, idx, NaiveDate, Value::Date),
        Type::UUID => get_value!(row, idx, Uuid, Value::Uuid),
        Type::BOOL_ARRAY => get_value!(row, idx, Vec<Option<bool>>, list),
        Type::INT2_ARRAY => get_value!(row, idx, Vec<Option<i16>>, list),
        Type::INT4_ARRAY => get_value!(row, idx, Vec<Option<i32>>, list),
        Type::INT8_ARRAY => get_value!(row, idx, Vec<Option<i64>>, list),
        Type::FLOAT8_ARRAY => get_value!(row, idx, Vec<Option<f64>>, list),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get_value!(row, idx, Vec<Option<String>>, list),
        Type::UUID_ARRAY => get_value!(row, idx, Vec<Option<Uuid>>, list),
        _ => get_value!(row, idx, String, Value::Text).map_err(|_| {
            DriverError::new(
                "DecodeError",
                format!("unsupported type {ty} for column {}", row.columns()[idx].name()),
            )
        }),
    }
}

/// Converts a driver row into a field mapping, column by column.
pub fn decode_row(row: &tokio_postgres::Row) -> DriverResult<Row> {
    let mut out = Row::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        out.insert(column.name(), decode_value(row, idx, column.type_())?);
    }
    Ok(out)
}

async fn query(client: &Object, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
    let params: Vec<&(dyn ToSql + Sync)> = sql
        .params
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect();
    let rows = client
        .query(sql.sql.as_str(), &params[..])
        .await
        .map_err(driver_error)?;
    rows.iter().map(decode_row).collect()
}

// ==================== backend ====================

/// A pool for one configured connection.
pub struct PgBackend {
    pool: Pool,
}

impl std::fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBackend")
            .field("status", &self.pool.status())
            .finish()
    }
}

impl PgBackend {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn client(&self) -> DriverResult<Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl Backend for PgBackend {
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
        let client = self.client().await?;
        query(&client, sql).await
    }

    async fn begin(&self) -> DriverResult<Box<dyn BackendTransaction>> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await.map_err(driver_error)?;
        Ok(Box::new(PgTransaction { client }))
    }

    async fn close(&self) {
        self.pool.close();
    }
}

/// A pooled client inside `BEGIN`.
pub struct PgTransaction {
    client: Object,
}

#[async_trait]
impl BackendTransaction for PgTransaction {
    async fn fetch_all(&self, sql: &BuiltSql) -> DriverResult<Vec<Row>> {
        query(&self.client, sql).await
    }

    async fn commit(self: Box<Self>) -> DriverResult<()> {
        self.client.batch_execute("COMMIT").await.map_err(driver_error)
    }

    async fn rollback(self: Box<Self>) -> DriverResult<()> {
        self.client.batch_execute("ROLLBACK").await.map_err(driver_error)
    }
}

/// Builds a [`PgBackend`] per connection and checks it with one checkout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(
        &self,
        _name: &str,
        config: &ConnectionConfig,
        pool: &PoolConfig,
        timezone: &str,
    ) -> DriverResult<Arc<dyn Backend>> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url());
        cfg.options = Some(format!("-c TimeZone={timezone}"));
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(pool.max_size));

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DriverError::new("CreatePoolError", e.to_string()))?;
        // Surfaces bad credentials or an unreachable host inside the retry loop.
        drop(pool.get().await.map_err(pool_error)?);
        Ok(Arc::new(PgBackend::new(pool)))
    }
}
