//! Declarative macros for reducing code duplication.
//!
//! - [`impl_db_dispatch!`] expands one match arm per sqlx connection variant
//! - [`impl_entity!`] generates an [`Entity`](crate::models::Entity) impl from a
//!   field list

/// Macro for generating database dispatch match arms.
///
/// This macro generates match arms for `DbConnection` variants, reducing the
/// need to manually write repetitive match statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(&mut self.conn, {
///     MySql(c) => mysql::query(c, sql, params).await,
///     Postgres(c) => postgres::query(c, sql, params).await,
///     SQLite(c) => sqlite::query(c, sql, params).await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::provider::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

/// Implement [`Entity`](crate::models::Entity) for a struct.
///
/// Each field is listed with its type; optional `FieldMapping` directives
/// follow `=>`, chained with `.`. Field types must convert into and out of
/// `SqlValue`.
///
/// # Example
///
/// ```ignore
/// impl_entity!(Order, "orders", {
///     id: i64 => primary_key(true),
///     customer_name: String => column("customer"),
///     note: Option<String> => encrypted(Some("k1")),
///     cached_total: f64 => ignore(),
/// });
/// ```
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty, $table:expr, {
        $($field:ident : $fty:ty $(=> $($directive:ident ( $($arg:expr),* )).+)?),+ $(,)?
    }) => {
        impl $crate::models::Entity for $ty {
            fn mapping() -> $crate::models::EntityMapping<Self> {
                $crate::models::EntityMapping::new($table)
                $(
                    .field(
                        $crate::models::FieldMapping::new(
                            stringify!($field),
                            |e: &Self| $crate::models::SqlValue::from(e.$field.clone()),
                            |e: &mut Self, v| {
                                e.$field = <$fty as $crate::models::FromSqlValue>::from_sql_value(v)?;
                                Ok(())
                            },
                        )
                        $($(.$directive($($arg),*))+)?
                    )
                )+
            }
        }
    };
}
