//! Tracing macros and per-statement duration logging.

use std::time::Duration;

use crate::config::{QueryLogConfig, Role};

/// Emit a debug-level tracing event with the SQL text and parameter count.
///
/// ```ignore
/// quarry_trace_query!("replica", &built.sql, built.params.len());
/// ```
#[macro_export]
macro_rules! quarry_trace_query {
    ($conn:expr, $sql:expr, $param_count:expr) => {
        tracing::debug!(
            target: "quarry::query",
            conn = %$conn,
            sql = %$sql,
            params = $param_count,
            "quarry.query"
        );
    };
}

/// Emit an info-level tracing event for transaction lifecycle (begin, commit, rollback).
///
/// ```ignore
/// quarry_trace_tx!("begin", "primary");
/// ```
#[macro_export]
macro_rules! quarry_trace_tx {
    ($event:literal, $conn:expr) => {
        tracing::info!(
            target: "quarry::transaction",
            event = $event,
            conn = %$conn,
            "quarry.transaction"
        );
    };
}

/// Duration bucket suffix, in whole seconds.
pub fn bucket(elapsed: Duration) -> &'static str {
    let secs = elapsed.as_secs_f64();
    if secs < 1.0 {
        "QUERY_LT_1_SEC"
    } else if secs < 5.0 {
        "QUERY_1_5_SEC"
    } else if secs < 10.0 {
        "QUERY_5_10_SEC"
    } else {
        "QUERY_GT_10_SEC"
    }
}

/// Logs each statement's duration under a `{title}_QUERY_*` label when enabled.
#[derive(Debug, Clone, Default)]
pub struct QueryLog {
    config: QueryLogConfig,
}

impl QueryLog {
    pub fn new(config: QueryLogConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn enabled(&self) -> bool {
        self.config.log_queries
    }

    /// `{title}_{bucket}`
    pub fn label(&self, elapsed: Duration) -> String {
        format!("{}_{}", self.config.title, bucket(elapsed))
    }

    pub fn record(&self, conn: &str, role: Role, elapsed: Duration, sql: &str) {
        if !self.enabled() {
            return;
        }
        tracing::info!(
            target: "quarry::query",
            label = %self.label(elapsed),
            conn,
            role = %role,
            "[{conn} {role} took {:.4}s]: {sql}",
            elapsed.as_secs_f64()
        );
    }
}
