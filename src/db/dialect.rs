//! SQL dialects.
//!
//! A dialect is a stateless per-vendor strategy; its main job is pagination
//! syntax. Each data source resolves its own dialect once, from the explicit
//! `dialect` setting or, failing that, from the connection string.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

/// Supported database vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Vendor {
    /// Includes MariaDB
    MySql,
    PostgreSql,
    Oracle,
    SqlServer,
    Db2,
    Sqlite,
}

impl Vendor {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Some(Self::MySql),
            "postgresql" | "postgres" | "pgsql" => Some(Self::PostgreSql),
            "oracle" => Some(Self::Oracle),
            "sqlserver" | "mssql" => Some(Self::SqlServer),
            "db2" => Some(Self::Db2),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Infer the vendor from a connection string.
    ///
    /// Matches the leading scheme (`mysql://...`, `sqlite::memory:`) or the
    /// `scheme:vendor:` form (`jdbc:oracle:thin:@...`), case-insensitively.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let mut segments = connection_string.trim().split(':');
        let first = segments.next()?;
        if let Some(vendor) = Self::from_tag(first) {
            return Some(vendor);
        }
        segments.next().and_then(Self::from_tag)
    }

    /// Get the display name for this vendor.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::MySql => "MySQL",
            Self::PostgreSql => "PostgreSQL",
            Self::Oracle => "Oracle",
            Self::SqlServer => "SQL Server",
            Self::Db2 => "DB2",
            Self::Sqlite => "SQLite",
        }
    }
}

impl FromStr for Vendor {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_tag(s).ok_or_else(|| DbError::config(format!("unknown dialect '{}'", s)))
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Vendor-specific SQL rendering.
pub trait Dialect: Send + Sync + std::fmt::Debug {
    fn vendor(&self) -> Vendor;

    /// Append the pagination fragment. Emits nothing when both are `None`.
    ///
    /// Fails with `INVALID_ARGUMENT` unless `limit > 0` and `offset >= 0`.
    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()>;

    /// Whether OFFSET/FETCH is only legal after an ORDER BY clause.
    fn requires_order_by_for_offset(&self) -> bool {
        false
    }
}

fn check_bounds(limit: Option<i64>, offset: Option<i64>) -> DbResult<()> {
    if let Some(l) = limit {
        if l <= 0 {
            return Err(DbError::invalid_argument(format!(
                "limit must be greater than 0, got {}",
                l
            )));
        }
    }
    if let Some(o) = offset {
        if o < 0 {
            return Err(DbError::invalid_argument(format!(
                "offset must not be negative, got {}",
                o
            )));
        }
    }
    Ok(())
}

fn separate(buf: &mut String) {
    if !buf.is_empty() && !buf.ends_with(' ') {
        buf.push(' ');
    }
}

/// MySQL / MariaDB: `LIMIT n [OFFSET m]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn vendor(&self) -> Vendor {
        Vendor::MySql
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        check_bounds(limit, offset)?;
        match (limit, offset) {
            (None, None) => return Ok(()),
            (Some(l), None) => {
                separate(buf);
                let _ = write!(buf, "LIMIT {}", l);
            }
            (Some(l), Some(o)) => {
                separate(buf);
                let _ = write!(buf, "LIMIT {} OFFSET {}", l, o);
            }
            // MySQL has no bare OFFSET
            (None, Some(o)) => {
                separate(buf);
                let _ = write!(buf, "LIMIT 18446744073709551615 OFFSET {}", o);
            }
        }
        Ok(())
    }
}

/// PostgreSQL: `LIMIT n OFFSET m`, each part optional.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn vendor(&self) -> Vendor {
        Vendor::PostgreSql
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        check_bounds(limit, offset)?;
        if let Some(l) = limit {
            separate(buf);
            let _ = write!(buf, "LIMIT {}", l);
        }
        if let Some(o) = offset {
            separate(buf);
            let _ = write!(buf, "OFFSET {}", o);
        }
        Ok(())
    }
}

/// SQLite: `LIMIT n [OFFSET m]`; `LIMIT -1` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn vendor(&self) -> Vendor {
        Vendor::Sqlite
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        check_bounds(limit, offset)?;
        if limit.is_none() && offset.is_none() {
            return Ok(());
        }
        separate(buf);
        let _ = write!(buf, "LIMIT {}", limit.unwrap_or(-1));
        if let Some(o) = offset {
            let _ = write!(buf, " OFFSET {}", o);
        }
        Ok(())
    }
}

/// Shared OFFSET ... ROWS FETCH ... ROWS ONLY rendering.
fn append_offset_fetch(
    buf: &mut String,
    limit: Option<i64>,
    offset: Option<i64>,
    fetch_keyword: &str,
    always_offset: bool,
) -> DbResult<()> {
    check_bounds(limit, offset)?;
    if limit.is_none() && offset.is_none() {
        return Ok(());
    }
    separate(buf);
    match (offset, always_offset) {
        (Some(o), _) => {
            let _ = write!(buf, "OFFSET {} ROWS", o);
        }
        (None, true) => buf.push_str("OFFSET 0 ROWS"),
        (None, false) => {}
    }
    if let Some(l) = limit {
        separate(buf);
        let keyword = if offset.is_some() || always_offset {
            fetch_keyword
        } else {
            "FIRST"
        };
        let _ = write!(buf, "FETCH {} {} ROWS ONLY", keyword, l);
    }
    Ok(())
}

/// Oracle 12c+: `OFFSET m ROWS FETCH NEXT n ROWS ONLY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct OracleDialect;

impl Dialect for OracleDialect {
    fn vendor(&self) -> Vendor {
        Vendor::Oracle
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        append_offset_fetch(buf, limit, offset, "NEXT", false)
    }
}

/// DB2: `OFFSET m ROWS FETCH FIRST n ROWS ONLY`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Db2Dialect;

impl Dialect for Db2Dialect {
    fn vendor(&self) -> Vendor {
        Vendor::Db2
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        append_offset_fetch(buf, limit, offset, "FIRST", false)
    }
}

/// SQL Server 2012+: `OFFSET m ROWS FETCH NEXT n ROWS ONLY`, ORDER BY required.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlServerDialect;

impl Dialect for SqlServerDialect {
    fn vendor(&self) -> Vendor {
        Vendor::SqlServer
    }

    fn append_limit_offset(
        &self,
        buf: &mut String,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> DbResult<()> {
        // FETCH without OFFSET is a syntax error here
        append_offset_fetch(buf, limit, offset, "NEXT", true)
    }

    fn requires_order_by_for_offset(&self) -> bool {
        true
    }
}

/// Get the dialect for a vendor.
pub fn dialect_for(vendor: Vendor) -> Arc<dyn Dialect> {
    match vendor {
        Vendor::MySql => Arc::new(MySqlDialect),
        Vendor::PostgreSql => Arc::new(PostgresDialect),
        Vendor::Oracle => Arc::new(OracleDialect),
        Vendor::SqlServer => Arc::new(SqlServerDialect),
        Vendor::Db2 => Arc::new(Db2Dialect),
        Vendor::Sqlite => Arc::new(SqliteDialect),
    }
}

/// Resolve a dialect: explicit tag wins, then the connection string, then MySQL.
pub fn resolve_dialect(explicit: Option<&str>, connection_string: &str) -> DbResult<Arc<dyn Dialect>> {
    let vendor = match explicit.map(str::trim).filter(|s| !s.is_empty()) {
        Some(tag) => tag.parse()?,
        None => Vendor::from_connection_string(connection_string).unwrap_or(Vendor::MySql),
    };
    Ok(dialect_for(vendor))
}
