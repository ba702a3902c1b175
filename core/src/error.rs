use thiserror::Error;

/// SQLSTATE reported by PostgreSQL for a unique-constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

/// A failure reported by the underlying database driver.
///
/// `sqlstate` is `None` for failures that never reached the server (I/O,
/// pool exhaustion, type conversion on the client side).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct DriverError {
    pub name: String,
    pub sqlstate: Option<String>,
    pub message: String,
}

impl DriverError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sqlstate: None,
            message: message.into(),
        }
    }

    /// Attaches a SQLSTATE code.
    pub fn with_sqlstate(mut self, code: impl Into<String>) -> Self {
        self.sqlstate = Some(code.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum QuarryError {
    // ==================== configuration ====================
    /// More than one connection was configured with the WRITE role
    #[error("Only one WRITE connection may be configured")]
    MultipleWriteConnections,

    /// No connection was configured with the READ role
    #[error("At least one READ connection must be configured")]
    ReadConnectionNotAvailable,

    /// A connection name that the router does not know about
    #[error("Invalid connection name: \"{0}\"")]
    InvalidConnectionName(String),

    /// Model metadata is missing a table name or primary key
    #[error("Model \"{0}\" has malformed metadata: a table name and primary key are required")]
    MalformedMeta(String),

    /// `select_related` named a relation the model does not declare
    #[error("Invalid related field \"{field}\" for model \"{model}\". Options are: {}", valid.join(", "))]
    InvalidRelatedField {
        model: String,
        field: String,
        valid: Vec<String>,
    },

    /// `prefetch_related` named a model that has no relation back to the base model
    #[error("Model \"{secondary}\" declares no relation to \"{model}\" and cannot be prefetched")]
    InvalidPrefetch { model: String, secondary: String },

    /// Invalid configuration document
    #[error("Configuration error: {0}")]
    Config(String),

    // ==================== query construction ====================
    /// A lookup or update suffix outside the supported grammar
    #[error("{0}")]
    UnsupportedOperator(String),

    /// A lookup value of the wrong shape (e.g. an empty `__in` list)
    #[error("{0}")]
    InvalidFilterValue(String),

    /// A field or table name that is not a plain SQL identifier
    #[error("Invalid identifier: \"{0}\"")]
    InvalidIdentifier(String),

    /// `update()` without any WHERE condition
    #[error("Update without a WHERE condition is not allowed; filter first")]
    UnrestrictedUpdate,

    /// `delete()` without any WHERE condition
    #[error("Delete without a WHERE condition is not allowed; filter first")]
    UnrestrictedDelete,

    /// `bulk_create` with an empty batch
    #[error("Nothing to create: the batch is empty")]
    NothingToCreate,

    /// The executor is in a state that cannot be resolved
    #[error("Malformed queryset for model \"{model}\": {reason}")]
    MalformedQueryset { model: String, reason: String },

    /// Paginator page below 1
    #[error("Invalid page {0}: pages start at 1")]
    InvalidPage(i64),

    // ==================== execution ====================
    /// `get` matched no rows
    #[error("{model} matching query does not exist. Query: {query}")]
    NotFound { model: String, query: String },

    /// `get` matched more than one row
    #[error("Multiple {model} records found. Query: {query}")]
    MultipleResultsFound { model: String, query: String },

    /// A unique-constraint violation. `table` is known for model writes and
    /// absent for raw SQL.
    #[error(
        "Duplicate key{} [{sqlstate}]: {message}",
        table.as_deref().map(|t| format!(" on table \"{t}\"")).unwrap_or_default()
    )]
    DuplicateKey {
        table: Option<String>,
        sqlstate: String,
        message: String,
    },

    /// Any other server-side failure carrying a SQLSTATE
    #[error("{name} [{sqlstate}]: {message}")]
    Database {
        name: String,
        sqlstate: String,
        message: String,
    },

    /// A driver failure without a SQLSTATE, passed through unchanged
    #[error(transparent)]
    Driver(DriverError),

    /// Connection establishment gave up after the configured attempts
    #[error("Failed to connect \"{name}\" after {attempts} attempts: {source}")]
    ConnectionFailed {
        name: String,
        attempts: u32,
        #[source]
        source: DriverError,
    },

    /// A value could not be converted to the requested type
    #[error("Decode error: {0}")]
    Decode(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction already finished")]
    TransactionClosed,
}

impl QuarryError {
    /// Classifies a driver failure.
    ///
    /// A unique violation is always [`QuarryError::DuplicateKey`]; `table`
    /// names the model table when the statement came from one.
    pub fn from_driver(err: DriverError, table: Option<&str>) -> Self {
        match err.sqlstate {
            Some(code) if code == UNIQUE_VIOLATION => QuarryError::DuplicateKey {
                table: table.map(str::to_string),
                sqlstate: code,
                message: err.message,
            },
            Some(code) => QuarryError::Database {
                name: err.name,
                sqlstate: code,
                message: err.message,
            },
            None => QuarryError::Driver(DriverError {
                name: err.name,
                sqlstate: None,
                message: err.message,
            }),
        }
    }

    pub fn malformed(model: &str, reason: impl Into<String>) -> Self {
        QuarryError::MalformedQueryset {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true for the unique-violation variant.
    #[inline]
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, QuarryError::DuplicateKey { .. })
    }

    /// Returns true when `get` matched nothing.
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, QuarryError::NotFound { .. })
    }
}

/// Result type for quarry operations
pub type Result<T> = std::result::Result<T, QuarryError>;
