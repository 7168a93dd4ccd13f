//! Error types for sqlcore.
//!
//! Every failure surfaced by the pool, executor, registry and SQL generator is a
//! [`DbError`]. Callers branch on [`DbError::kind`] rather than on variants when
//! all they need is the category.
//!
//! Low-level driver failures arrive as [`DriverError`] and are turned into typed
//! errors by [`translate`], which classifies them by SQLSTATE prefix.

use std::fmt;
use thiserror::Error;

/// Error categories callers can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad caller input
    InvalidArgument,
    /// Missing, duplicate or unresolvable configuration
    Config,
    /// Operation on a closed or uninitialised resource
    State,
    /// Provider could not create or validate a resource
    Connection,
    /// Borrow wait exceeded
    Timeout,
    /// Driver signalled a statement timeout
    SqlTimeout,
    /// SQLSTATE class 23
    SqlConstraint,
    /// SQLSTATE class 42
    SqlSyntax,
    /// SQLSTATE class 08
    SqlConnection,
    /// Any other driver failure
    Sql,
    /// Invalid mapping descriptor
    Meta,
}

impl ErrorKind {
    /// Whether failures of this kind are safe to retry.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::SqlConnection | Self::SqlTimeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::Config => "CONFIG_ERROR",
            Self::State => "STATE_ERROR",
            Self::Connection => "CONNECTION_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::SqlTimeout => "SQL_TIMEOUT",
            Self::SqlConstraint => "SQL_CONSTRAINT",
            Self::SqlSyntax => "SQL_SYNTAX",
            Self::SqlConnection => "SQL_CONNECTION",
            Self::Sql => "SQL_ERROR",
            Self::Meta => "META_ERROR",
        };
        f.write_str(name)
    }
}

/// Classified category of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlErrorKind {
    Timeout,
    Constraint,
    Syntax,
    Connection,
    Other,
}

impl SqlErrorKind {
    fn error_kind(self) -> ErrorKind {
        match self {
            Self::Timeout => ErrorKind::SqlTimeout,
            Self::Constraint => ErrorKind::SqlConstraint,
            Self::Syntax => ErrorKind::SqlSyntax,
            Self::Connection => ErrorKind::SqlConnection,
            Self::Other => ErrorKind::Sql,
        }
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Illegal state: {message}")]
    State { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("{kind:?} error: {message} (SQLSTATE: {}, vendor code: {vendor_code})", sql_state.as_deref().unwrap_or("-"))]
    Sql {
        kind: SqlErrorKind,
        message: String,
        sql: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        vendor_code: i64,
    },

    #[error("Mapping error: {message} (object: {object})")]
    Meta { message: String, object: String },
}

impl DbError {
    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a state error.
    pub fn state(message: impl Into<String>) -> Self {
        Self::State {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create a mapping error.
    pub fn meta(message: impl Into<String>, object: impl Into<String>) -> Self {
        Self::Meta {
            message: message.into(),
            object: object.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Config { .. } => ErrorKind::Config,
            Self::State { .. } => ErrorKind::State,
            Self::Connection { .. } => ErrorKind::Connection,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Sql { kind, .. } => kind.error_kind(),
            Self::Meta { .. } => ErrorKind::Meta,
        }
    }

    /// The offending SQL text, for classified driver failures.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Sql { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// The raw SQLSTATE, for classified driver failures.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Sql { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Sql {
                kind: SqlErrorKind::Syntax,
                ..
            } => Some("Check the SQL syntax and referenced objects"),
            Self::Sql {
                kind: SqlErrorKind::Constraint,
                ..
            } => Some("The statement violates a constraint; retrying will not help"),
            _ => None,
        }
    }

    /// Check if the executor may retry after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_transient()
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// A failure reported by a driver, before classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverError {
    pub message: String,
    pub sql_state: Option<String>,
    pub vendor_code: i64,
    /// Set when the driver (or the statement timer) reports a timeout.
    pub timeout: bool,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn with_vendor_code(mut self, vendor_code: i64) -> Self {
        self.vendor_code = vendor_code;
        self
    }

    pub fn timed_out(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timeout: true,
            ..Default::default()
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(state) = &self.sql_state {
            write!(f, " [{}]", state)?;
        }
        Ok(())
    }
}

impl std::error::Error for DriverError {}

/// Classify a driver failure for the statement `sql`.
///
/// Timeouts win over any SQLSTATE; otherwise the two-character class decides.
pub fn translate(sql: &str, err: DriverError) -> DbError {
    let kind = if err.timeout {
        SqlErrorKind::Timeout
    } else {
        match err.sql_state.as_deref().map(|s| s.get(..2).unwrap_or(s)) {
            Some("23") => SqlErrorKind::Constraint,
            Some("08") => SqlErrorKind::Connection,
            Some("42") => SqlErrorKind::Syntax,
            _ => SqlErrorKind::Other,
        }
    };

    DbError::Sql {
        kind,
        message: err.message,
        sql: sql.to_string(),
        sql_state: err.sql_state,
        vendor_code: err.vendor_code,
    }
}

/// Best-effort SQLSTATE for a SQLite failure.
fn sqlite_state(kind: sqlx::error::ErrorKind, message: &str) -> Option<String> {
    use sqlx::error::ErrorKind as Kind;

    let state = match kind {
        Kind::UniqueViolation
        | Kind::ForeignKeyViolation
        | Kind::NotNullViolation
        | Kind::CheckViolation => "23000",
        _ if message.contains("syntax error") => "42000",
        _ if message.starts_with("no such table") => "42S02",
        _ if message.starts_with("no such column") => "42S22",
        _ => return None,
    };
    Some(state.to_string())
}

/// Convert sqlx errors to DriverError.
impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                let message = db_err.message().to_string();
                match code {
                    // SQLite reports numeric result codes instead of SQLSTATE
                    Some(code) if code.len() != 5 => DriverError {
                        sql_state: sqlite_state(db_err.kind(), &message),
                        vendor_code: code.parse().unwrap_or_default(),
                        message,
                        timeout: false,
                    },
                    state => {
                        // MySQL reports its numeric error code separately from SQLSTATE.
                        let vendor_code = db_err
                            .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                            .map(|e| i64::from(e.number()))
                            .unwrap_or_default();
                        DriverError {
                            message,
                            sql_state: state,
                            vendor_code,
                            timeout: false,
                        }
                    }
                }
            }
            sqlx::Error::PoolTimedOut => DriverError::timed_out("driver pool acquire timed out"),
            sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
                DriverError::timed_out(format!("I/O timeout: {}", io_err))
            }
            sqlx::Error::Io(io_err) => {
                DriverError::new(format!("I/O error: {}", io_err)).with_state("08006")
            }
            sqlx::Error::Tls(tls_err) => {
                DriverError::new(format!("TLS error: {}", tls_err)).with_state("08001")
            }
            sqlx::Error::Protocol(msg) => {
                DriverError::new(format!("Protocol error: {}", msg)).with_state("08P01")
            }
            sqlx::Error::PoolClosed => {
                DriverError::new("Driver pool is closed").with_state("08003")
            }
            sqlx::Error::Configuration(msg) => {
                DriverError::new(format!("Configuration error: {}", msg)).with_state("08001")
            }
            sqlx::Error::ColumnNotFound(col) => {
                DriverError::new(format!("Column not found: {}", col)).with_state("42703")
            }
            other => DriverError::new(format!("Driver error: {}", other)),
        }
    }
}
