//! Composable, vendor-agnostic query model.
//!
//! A [`Query`] describes WHERE groups, GROUP BY, HAVING, aggregates, ordering and
//! pagination. It never renders SQL itself; see [`crate::db::sql::SqlGenerator`].
//! Queries are assembled with [`QueryBuilder`] and are immutable once built.
//!
//! ```ignore
//! let query = Query::builder()
//!     .eq("status", "active")
//!     .or_group(|g| g.gt("age", 30).is_null("deleted_at"))
//!     .order_desc("created_at")
//!     .limit(10)
//!     .build();
//! ```

use crate::models::value::SqlValue;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    In,
    NotIn,
    Between,
    Exists,
    NotExists,
    IsNull,
    IsNotNull,
}

/// How conditions inside one group are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl Logic {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// Pre-rendered subquery text with its own parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl SubQuery {
    pub fn new(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `field op values`
    Compare {
        field: String,
        op: Operator,
        values: Vec<SqlValue>,
    },
    /// Raw expression spliced as-is, with its own placeholders' values.
    Raw { expr: String, values: Vec<SqlValue> },
    /// `field IN (sub)`, `field NOT IN (sub)`, `EXISTS (sub)`, `NOT EXISTS (sub)`.
    /// `field` is `None` for the EXISTS forms.
    SubQuery {
        field: Option<String>,
        op: Operator,
        query: SubQuery,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionGroup {
    pub logic: Logic,
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn new(logic: Logic) -> Self {
        Self {
            logic,
            conditions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn push(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    fn compare(self, field: &str, op: Operator, values: Vec<SqlValue>) -> Self {
        self.push(Condition::Compare {
            field: field.to_string(),
            op,
            values,
        })
    }

    pub fn eq(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Eq, vec![value.into()])
    }

    pub fn ne(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Ne, vec![value.into()])
    }

    pub fn gt(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Gt, vec![value.into()])
    }

    pub fn ge(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Ge, vec![value.into()])
    }

    pub fn lt(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Lt, vec![value.into()])
    }

    pub fn le(self, field: &str, value: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Le, vec![value.into()])
    }

    pub fn like(self, field: &str, pattern: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Like, vec![pattern.into()])
    }

    pub fn in_list<V: Into<SqlValue>>(self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.compare(field, Operator::In, values)
    }

    pub fn not_in_list<V: Into<SqlValue>>(
        self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.compare(field, Operator::NotIn, values)
    }

    pub fn between(self, field: &str, low: impl Into<SqlValue>, high: impl Into<SqlValue>) -> Self {
        self.compare(field, Operator::Between, vec![low.into(), high.into()])
    }

    pub fn is_null(self, field: &str) -> Self {
        self.compare(field, Operator::IsNull, Vec::new())
    }

    pub fn is_not_null(self, field: &str) -> Self {
        self.compare(field, Operator::IsNotNull, Vec::new())
    }

    pub fn raw(self, expr: impl Into<String>, values: Vec<SqlValue>) -> Self {
        self.push(Condition::Raw {
            expr: expr.into(),
            values,
        })
    }

    pub fn in_subquery(self, field: &str, query: SubQuery) -> Self {
        self.push(Condition::SubQuery {
            field: Some(field.to_string()),
            op: Operator::In,
            query,
        })
    }

    pub fn not_in_subquery(self, field: &str, query: SubQuery) -> Self {
        self.push(Condition::SubQuery {
            field: Some(field.to_string()),
            op: Operator::NotIn,
            query,
        })
    }

    pub fn exists(self, query: SubQuery) -> Self {
        self.push(Condition::SubQuery {
            field: None,
            op: Operator::Exists,
            query,
        })
    }

    pub fn not_exists(self, query: SubQuery) -> Self {
        self.push(Condition::SubQuery {
            field: None,
            op: Operator::NotExists,
            query,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateType {
    pub fn function(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub kind: AggregateType,
    /// `None` only for `COUNT(*)`.
    pub field: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub ascending: bool,
}

/// An immutable query description. Build one with [`Query::builder`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    groups: Vec<ConditionGroup>,
    orders: Vec<OrderBy>,
    group_by: Vec<String>,
    having: Vec<ConditionGroup>,
    aggregates: Vec<Aggregate>,
    limit: Option<i64>,
    offset: Option<i64>,
}

impl Query {
    pub fn builder() -> QueryBuilder {
        QueryBuilder::default()
    }

    /// A query with no conditions, ordering or pagination.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn groups(&self) -> &[ConditionGroup] {
        &self.groups
    }

    pub fn orders(&self) -> &[OrderBy] {
        &self.orders
    }

    pub fn group_by(&self) -> &[String] {
        &self.group_by
    }

    pub fn having(&self) -> &[ConditionGroup] {
        &self.having
    }

    pub fn aggregates(&self) -> &[Aggregate] {
        &self.aggregates
    }

    pub fn limit(&self) -> Option<i64> {
        self.limit
    }

    pub fn offset(&self) -> Option<i64> {
        self.offset
    }
}

/// Fluent builder for [`Query`].
///
/// Top-level condition methods (`eq`, `gt`, ...) append to an implicit AND group.
/// Explicit groups are added with [`and_group`](Self::and_group) and
/// [`or_group`](Self::or_group); all groups are ANDed together.
#[derive(Debug, Default)]
pub struct QueryBuilder {
    current: ConditionGroup,
    query: Query,
}

macro_rules! delegate_condition {
    ($($name:ident($($arg:ident: $ty:ty),*)),+ $(,)?) => {
        $(pub fn $name(mut self, $($arg: $ty),*) -> Self {
            self.current = self.current.$name($($arg),*);
            self
        })+
    };
}

impl QueryBuilder {
    delegate_condition!(
        eq(field: &str, value: impl Into<SqlValue>),
        ne(field: &str, value: impl Into<SqlValue>),
        gt(field: &str, value: impl Into<SqlValue>),
        ge(field: &str, value: impl Into<SqlValue>),
        lt(field: &str, value: impl Into<SqlValue>),
        le(field: &str, value: impl Into<SqlValue>),
        like(field: &str, pattern: impl Into<SqlValue>),
        between(field: &str, low: impl Into<SqlValue>, high: impl Into<SqlValue>),
        is_null(field: &str),
        is_not_null(field: &str),
        raw(expr: impl Into<String>, values: Vec<SqlValue>),
        in_subquery(field: &str, query: SubQuery),
        not_in_subquery(field: &str, query: SubQuery),
        exists(query: SubQuery),
        not_exists(query: SubQuery),
    );

    pub fn in_list<V: Into<SqlValue>>(mut self, field: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.current = self.current.in_list(field, values);
        self
    }

    pub fn not_in_list<V: Into<SqlValue>>(
        mut self,
        field: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        self.current = self.current.not_in_list(field, values);
        self
    }

    fn flush_current(&mut self) {
        if !self.current.is_empty() {
            let group = std::mem::take(&mut self.current);
            self.query.groups.push(group);
        }
    }

    fn group(mut self, logic: Logic, f: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        self.flush_current();
        let group = f(ConditionGroup::new(logic));
        if !group.is_empty() {
            self.query.groups.push(group);
        }
        self
    }

    pub fn and_group(self, f: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        self.group(Logic::And, f)
    }

    pub fn or_group(self, f: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        self.group(Logic::Or, f)
    }

    pub fn having(mut self, logic: Logic, f: impl FnOnce(ConditionGroup) -> ConditionGroup) -> Self {
        let group = f(ConditionGroup::new(logic));
        if !group.is_empty() {
            self.query.having.push(group);
        }
        self
    }

    pub fn order_asc(mut self, field: &str) -> Self {
        self.query.orders.push(OrderBy {
            field: field.to_string(),
            ascending: true,
        });
        self
    }

    pub fn order_desc(mut self, field: &str) -> Self {
        self.query.orders.push(OrderBy {
            field: field.to_string(),
            ascending: false,
        });
        self
    }

    pub fn group_by(mut self, field: &str) -> Self {
        self.query.group_by.push(field.to_string());
        self
    }

    fn aggregate(mut self, kind: AggregateType, field: Option<&str>, alias: &str) -> Self {
        self.query.aggregates.push(Aggregate {
            kind,
            field: field.map(String::from),
            alias: alias.to_string(),
        });
        self
    }

    pub fn count_all(self, alias: &str) -> Self {
        self.aggregate(AggregateType::Count, None, alias)
    }

    pub fn count(self, field: &str, alias: &str) -> Self {
        self.aggregate(AggregateType::Count, Some(field), alias)
    }

    pub fn sum(self, field: &str, alias: &str) -> Self {
        self.aggregate(AggregateType::Sum, Some(field), alias)
    }

    pub fn avg(self, field: &str, alias: &str) -> Self {
        self.aggregate(AggregateType::Avg, Some(field), alias)
    }

    pub fn min(self, field: &str, alias: &str) -> Self {
        self.aggregate(AggregateType::Min, Some(field), alias)
    }

    pub fn max(self, field: &str, alias: &str) -> Self {
        self.aggregate(AggregateType::Max, Some(field), alias)
    }

    /// Validated by the dialect at render time.
    pub fn limit(mut self, limit: i64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: i64) -> Self {
        self.query.offset = Some(offset);
        self
    }

    /// 1-based page of `size` rows.
    pub fn page(mut self, page: i64, size: i64) -> Self {
        self.query.limit = Some(size);
        self.query.offset = Some((page.max(1) - 1).saturating_mul(size));
        self
    }

    pub fn build(mut self) -> Query {
        self.flush_current();
        self.query
    }
}
