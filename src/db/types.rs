//! Decoding driver rows into [`SqlValue`]s.
//!
//! Decoding is two-phase:
//! 1. [`categorize_type`] classifies the column's type name
//! 2. a vendor-specific decoder tries the Rust types for that category, then
//!    falls back to text, integer, float and bytes in that order
//!
//! A column that matches nothing decodes as NULL rather than failing the row.

use crate::db::dialect::Vendor;
use crate::models::{Row, SqlValue};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row as SqlxRow, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Temporal,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, vendor: Vendor) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // checked first: "numeric" would otherwise fall through to the float checks
    if lower.contains("decimal") || lower.contains("numeric") {
        if vendor == Vendor::Sqlite {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    if lower.contains("timestamp") || lower.contains("date") || lower.starts_with("time") {
        return TypeCategory::Temporal;
    }

    if lower.contains("char") || lower.contains("text") || lower == "name" {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

/// Raw DECIMAL/NUMERIC text, preserving the database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

fn text<T: ToString>(value: T) -> SqlValue {
    SqlValue::String(value.to_string())
}

pub(crate) fn unsigned(value: u64) -> SqlValue {
    i64::try_from(value)
        .map(SqlValue::Int)
        .unwrap_or_else(|_| SqlValue::String(value.to_string()))
}

/// Try each `Type => mapper` in turn; return on the first compatible decode.
/// NULL returns immediately whatever the declared type.
macro_rules! try_decode {
    ($row:expr, $idx:expr, $($ty:ty => $map:expr),+ $(,)?) => {{
        $(
            match $row.try_get::<Option<$ty>, _>($idx) {
                Ok(Some(v)) => return ($map)(v),
                Ok(None) => return SqlValue::Null,
                Err(_) => {}
            }
        )+
    }};
}

/// Convert a driver row into an ordered [`Row`].
pub trait RowToValues {
    fn to_row(&self) -> Row;
}

macro_rules! impl_row_to_values {
    ($row:ty, $vendor:expr, $decode:path) => {
        impl RowToValues for $row {
            fn to_row(&self) -> Row {
                let columns = self
                    .columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let category = categorize_type(col.type_info().name(), $vendor);
                        (col.name().to_string(), $decode(self, idx, category))
                    })
                    .collect();
                Row::new(columns)
            }
        }
    };
}

impl_row_to_values!(MySqlRow, Vendor::MySql, mysql::decode_column);
impl_row_to_values!(PgRow, Vendor::PostgreSql, postgres::decode_column);
impl_row_to_values!(SqliteRow, Vendor::Sqlite, sqlite::decode_column);

// Each module below has the same shape adapted to its database's type system.

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> SqlValue {
        match category {
            TypeCategory::Decimal => try_decode!(row, idx, RawDecimal => |d: RawDecimal| SqlValue::String(d.0)),
            TypeCategory::Integer => try_decode!(row, idx, i64 => SqlValue::Int, u64 => unsigned),
            TypeCategory::Boolean => try_decode!(row, idx, bool => SqlValue::Bool),
            TypeCategory::Float => try_decode!(
                row, idx,
                f64 => SqlValue::Float,
                f32 => |v: f32| SqlValue::Float(f64::from(v)),
            ),
            TypeCategory::Binary => try_decode!(row, idx, Vec<u8> => SqlValue::Bytes),
            TypeCategory::Json => try_decode!(row, idx, serde_json::Value => text),
            TypeCategory::Temporal => try_decode!(
                row, idx,
                NaiveDateTime => text,
                DateTime<Utc> => text,
                NaiveDate => text,
                NaiveTime => text,
            ),
            TypeCategory::Text | TypeCategory::Unknown => {}
        }
        try_decode!(
            row, idx,
            String => SqlValue::String,
            i64 => SqlValue::Int,
            f64 => SqlValue::Float,
            Vec<u8> => SqlValue::Bytes,
        );
        SqlValue::Null
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> SqlValue {
        match category {
            TypeCategory::Decimal => try_decode!(row, idx, RawDecimal => |d: RawDecimal| SqlValue::String(d.0)),
            // Postgres integer types only decode into their exact width
            TypeCategory::Integer => try_decode!(
                row, idx,
                i64 => SqlValue::Int,
                i32 => |v: i32| SqlValue::Int(i64::from(v)),
                i16 => |v: i16| SqlValue::Int(i64::from(v)),
            ),
            TypeCategory::Boolean => try_decode!(row, idx, bool => SqlValue::Bool),
            TypeCategory::Float => try_decode!(
                row, idx,
                f64 => SqlValue::Float,
                f32 => |v: f32| SqlValue::Float(f64::from(v)),
            ),
            TypeCategory::Binary => try_decode!(row, idx, Vec<u8> => SqlValue::Bytes),
            TypeCategory::Json => try_decode!(row, idx, serde_json::Value => text),
            TypeCategory::Temporal => try_decode!(
                row, idx,
                NaiveDateTime => text,
                DateTime<Utc> => text,
                NaiveDate => text,
                NaiveTime => text,
            ),
            TypeCategory::Text | TypeCategory::Unknown => {}
        }
        try_decode!(
            row, idx,
            String => SqlValue::String,
            i64 => SqlValue::Int,
            f64 => SqlValue::Float,
            Vec<u8> => SqlValue::Bytes,
        );
        SqlValue::Null
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> SqlValue {
        match category {
            TypeCategory::Integer => try_decode!(row, idx, i64 => SqlValue::Int),
            TypeCategory::Boolean => try_decode!(row, idx, bool => SqlValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => try_decode!(row, idx, f64 => SqlValue::Float),
            TypeCategory::Binary => try_decode!(row, idx, Vec<u8> => SqlValue::Bytes),
            TypeCategory::Temporal => try_decode!(row, idx, NaiveDateTime => text),
            TypeCategory::Json | TypeCategory::Text | TypeCategory::Unknown => {}
        }
        // SQLite is dynamically typed; expression columns carry the value's own type
        try_decode!(
            row, idx,
            String => SqlValue::String,
            i64 => SqlValue::Int,
            f64 => SqlValue::Float,
            Vec<u8> => SqlValue::Bytes,
        );
        SqlValue::Null
    }
}
