//! SQL generation from entity metadata and the query model.
//!
//! Statements use `?` placeholders and carry their parameters in text order.
//! Providers whose drivers expect numbered placeholders rewrite them at bind
//! time. Pagination is delegated to the data source's [`Dialect`] and always
//! rendered last.

use crate::db::dialect::Dialect;
use crate::error::{DbError, DbResult};
use crate::models::{
    Condition, ConditionGroup, EntityMeta, Operator, Query, SqlValue,
};
use std::fmt::Write as _;

/// Rendered SQL plus its positional parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Column whose generated value should be written back after an INSERT.
    pub generated_key: Option<String>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
            generated_key: None,
        }
    }
}

/// Reject anything that is not a plain (optionally qualified) identifier.
pub fn validate_identifier(name: &str) -> DbResult<&str> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    if valid {
        Ok(name)
    } else {
        Err(DbError::invalid_argument(format!(
            "'{}' is not a valid identifier",
            name
        )))
    }
}

pub struct SqlGenerator<'a> {
    dialect: &'a dyn Dialect,
}

impl<'a> SqlGenerator<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Map a field name through the entity, or pass a validated identifier through.
    fn column<'m, E>(&self, meta: &'m EntityMeta<E>, name: &'m str) -> DbResult<&'m str> {
        match meta.column_for(name) {
            Some(column) => Ok(column),
            None => validate_identifier(name),
        }
    }

    pub fn select<E>(&self, meta: &EntityMeta<E>, query: &Query) -> DbResult<Statement> {
        let mut sql = String::from("SELECT ");
        let mut params = Vec::new();

        if query.aggregates().is_empty() {
            if meta.fields().is_empty() {
                sql.push('*');
            } else {
                let columns: Vec<&str> = meta.fields().iter().map(|f| f.column_name()).collect();
                sql.push_str(&columns.join(", "));
            }
        } else {
            let mut items = Vec::new();
            for field in query.group_by() {
                items.push(self.column(meta, field)?.to_string());
            }
            for agg in query.aggregates() {
                let target = match &agg.field {
                    Some(field) => self.column(meta, field)?.to_string(),
                    None => "*".to_string(),
                };
                items.push(format!(
                    "{}({}) AS {}",
                    agg.kind.function(),
                    target,
                    validate_identifier(&agg.alias)?
                ));
            }
            sql.push_str(&items.join(", "));
        }

        let _ = write!(sql, " FROM {}", meta.table_name());
        self.append_where(meta, query.groups(), &mut sql, &mut params)?;

        if !query.group_by().is_empty() {
            let columns = query
                .group_by()
                .iter()
                .map(|f| self.column(meta, f))
                .collect::<DbResult<Vec<_>>>()?;
            let _ = write!(sql, " GROUP BY {}", columns.join(", "));
        }

        if !query.having().is_empty() {
            sql.push_str(" HAVING ");
            self.append_groups(meta, query.having(), &mut sql, &mut params)?;
        }

        self.append_order_by(meta, query, &mut sql)?;
        self.dialect
            .append_limit_offset(&mut sql, query.limit(), query.offset())?;

        Ok(Statement::new(sql, params))
    }

    /// `SELECT COUNT(*)` over the query's WHERE clause; ordering and paging are ignored.
    pub fn count<E>(&self, meta: &EntityMeta<E>, query: &Query) -> DbResult<Statement> {
        let mut sql = format!("SELECT COUNT(*) FROM {}", meta.table_name());
        let mut params = Vec::new();
        self.append_where(meta, query.groups(), &mut sql, &mut params)?;
        Ok(Statement::new(sql, params))
    }

    pub fn find_by_id<E>(&self, meta: &EntityMeta<E>, id: SqlValue) -> DbResult<Statement> {
        let pk = primary_key_column(meta)?;
        let columns: Vec<&str> = meta.fields().iter().map(|f| f.column_name()).collect();
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?",
            columns.join(", "),
            meta.table_name(),
            pk
        );
        Ok(Statement::new(sql, vec![id]))
    }

    /// INSERT of every non-generated field; asks for the generated key when the
    /// primary key is auto-generated.
    pub fn insert<E>(&self, meta: &EntityMeta<E>, entity: &E) -> DbResult<Statement> {
        let fields: Vec<_> = meta.insertable_fields().collect();
        if fields.is_empty() {
            return Err(DbError::meta("no insertable fields", meta.table_name()));
        }
        let columns: Vec<&str> = fields.iter().map(|f| f.column_name()).collect();
        let placeholders = vec!["?"; fields.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            meta.table_name(),
            columns.join(", "),
            placeholders
        );
        let params = fields.iter().map(|f| f.get(entity)).collect();
        let mut statement = Statement::new(sql, params);
        statement.generated_key = meta
            .primary_key()
            .filter(|pk| pk.is_auto_generated())
            .map(|pk| pk.column_name().to_string());
        Ok(statement)
    }

    pub fn update_by_id<E>(&self, meta: &EntityMeta<E>, entity: &E) -> DbResult<Statement> {
        let pk = meta
            .primary_key()
            .ok_or_else(|| DbError::meta("entity has no primary key", meta.table_name()))?;
        let fields: Vec<_> = meta.fields().iter().filter(|f| !f.is_primary_key()).collect();
        if fields.is_empty() {
            return Err(DbError::meta("no updatable fields", meta.table_name()));
        }
        let assignments: Vec<String> = fields
            .iter()
            .map(|f| format!("{} = ?", f.column_name()))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            meta.table_name(),
            assignments.join(", "),
            pk.column_name()
        );
        let mut params: Vec<SqlValue> = fields.iter().map(|f| f.get(entity)).collect();
        params.push(pk.get(entity));
        Ok(Statement::new(sql, params))
    }

    pub fn delete_by_id<E>(&self, meta: &EntityMeta<E>, id: SqlValue) -> DbResult<Statement> {
        let pk = primary_key_column(meta)?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", meta.table_name(), pk);
        Ok(Statement::new(sql, vec![id]))
    }

    fn append_where<E>(
        &self,
        meta: &EntityMeta<E>,
        groups: &[ConditionGroup],
        sql: &mut String,
        params: &mut Vec<SqlValue>,
    ) -> DbResult<()> {
        if groups.iter().all(ConditionGroup::is_empty) {
            return Ok(());
        }
        sql.push_str(" WHERE ");
        self.append_groups(meta, groups, sql, params)
    }

    /// Groups are ANDed; conditions inside a group use the group's logic.
    fn append_groups<E>(
        &self,
        meta: &EntityMeta<E>,
        groups: &[ConditionGroup],
        sql: &mut String,
        params: &mut Vec<SqlValue>,
    ) -> DbResult<()> {
        let mut first_group = true;
        for group in groups.iter().filter(|g| !g.is_empty()) {
            if !first_group {
                sql.push_str(" AND ");
            }
            first_group = false;

            let wrap = group.conditions.len() > 1;
            if wrap {
                sql.push('(');
            }
            for (i, condition) in group.conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(group.logic.keyword());
                }
                self.append_condition(meta, condition, sql, params)?;
            }
            if wrap {
                sql.push(')');
            }
        }
        Ok(())
    }

    fn append_condition<E>(
        &self,
        meta: &EntityMeta<E>,
        condition: &Condition,
        sql: &mut String,
        params: &mut Vec<SqlValue>,
    ) -> DbResult<()> {
        match condition {
            Condition::Compare { field, op, values } => {
                let column = self.column(meta, field)?;
                render_compare(column, *op, values, sql, params)
            }
            Condition::Raw { expr, values } => {
                let _ = write!(sql, "({})", expr);
                params.extend(values.iter().cloned());
                Ok(())
            }
            Condition::SubQuery { field, op, query } => {
                match (op, field) {
                    (Operator::In | Operator::NotIn, Some(field)) => {
                        let column = self.column(meta, field)?;
                        let keyword = if *op == Operator::In { "IN" } else { "NOT IN" };
                        let _ = write!(sql, "{} {} ({})", column, keyword, query.sql);
                    }
                    (Operator::Exists, _) => {
                        let _ = write!(sql, "EXISTS ({})", query.sql);
                    }
                    (Operator::NotExists, _) => {
                        let _ = write!(sql, "NOT EXISTS ({})", query.sql);
                    }
                    _ => {
                        return Err(DbError::invalid_argument(format!(
                            "operator {:?} cannot take a subquery",
                            op
                        )));
                    }
                }
                params.extend(query.params.iter().cloned());
                Ok(())
            }
        }
    }

    fn append_order_by<E>(
        &self,
        meta: &EntityMeta<E>,
        query: &Query,
        sql: &mut String,
    ) -> DbResult<()> {
        if query.orders().is_empty() {
            let paginated = query.limit().is_some() || query.offset().is_some();
            if paginated && self.dialect.requires_order_by_for_offset() {
                sql.push_str(" ORDER BY (SELECT NULL)");
            }
            return Ok(());
        }
        let items = query
            .orders()
            .iter()
            .map(|o| {
                let direction = if o.ascending { "ASC" } else { "DESC" };
                self.column(meta, &o.field)
                    .map(|c| format!("{} {}", c, direction))
            })
            .collect::<DbResult<Vec<_>>>()?;
        let _ = write!(sql, " ORDER BY {}", items.join(", "));
        Ok(())
    }
}

fn primary_key_column<E>(meta: &EntityMeta<E>) -> DbResult<&str> {
    meta.primary_key()
        .map(|pk| pk.column_name())
        .ok_or_else(|| DbError::meta("entity has no primary key", meta.table_name()))
}

fn expect_values(op: Operator, values: &[SqlValue], expected: usize) -> DbResult<()> {
    if values.len() == expected {
        Ok(())
    } else {
        Err(DbError::invalid_argument(format!(
            "{:?} expects {} value(s), got {}",
            op,
            expected,
            values.len()
        )))
    }
}

fn render_compare(
    column: &str,
    op: Operator,
    values: &[SqlValue],
    sql: &mut String,
    params: &mut Vec<SqlValue>,
) -> DbResult<()> {
    let symbol = match op {
        Operator::Eq => "=",
        Operator::Ne => "<>",
        Operator::Gt => ">",
        Operator::Ge => ">=",
        Operator::Lt => "<",
        Operator::Le => "<=",
        Operator::Like => "LIKE",
        Operator::In | Operator::NotIn => {
            if values.is_empty() {
                // nothing is IN an empty set; everything is NOT IN it
                sql.push_str(if op == Operator::In { "1 = 0" } else { "1 = 1" });
                return Ok(());
            }
            let keyword = if op == Operator::In { "IN" } else { "NOT IN" };
            let placeholders = vec!["?"; values.len()].join(", ");
            let _ = write!(sql, "{} {} ({})", column, keyword, placeholders);
            params.extend(values.iter().cloned());
            return Ok(());
        }
        Operator::Between => {
            expect_values(op, values, 2)?;
            let _ = write!(sql, "{} BETWEEN ? AND ?", column);
            params.extend(values.iter().cloned());
            return Ok(());
        }
        Operator::IsNull => {
            let _ = write!(sql, "{} IS NULL", column);
            return Ok(());
        }
        Operator::IsNotNull => {
            let _ = write!(sql, "{} IS NOT NULL", column);
            return Ok(());
        }
        Operator::Exists | Operator::NotExists => {
            return Err(DbError::invalid_argument(
                "EXISTS / NOT EXISTS require a subquery",
            ));
        }
    };

    expect_values(op, values, 1)?;
    let _ = write!(sql, "{} {} ?", column, symbol);
    params.push(values[0].clone());
    Ok(())
}
