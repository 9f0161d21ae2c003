//! Builds parameterized SELECT, INSERT, UPDATE, DELETE against a compiled table.
//!
//! Clauses are kept as fragments numbered locally from `$1`; placeholders are shifted to
//! their final position when the statement is rendered.

use super::compiler::{ColumnDefinition, SqlType, TableDefinition};
use super::filter::{FilterOperator, QueryFilter, QueryPagination, QuerySort, SortDirection};
use super::ident::quoted;
use super::params::PgBindValue;
use crate::error::QueryError;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: PgBindValue) -> usize {
        self.params.push(v);
        self.params.len()
    }

    /// Append a fragment's parameters and return its SQL renumbered after those already bound.
    fn push_fragment(&mut self, f: &Fragment) -> String {
        let sql = shift_placeholders(&f.sql, self.params.len());
        self.params.extend(f.params.iter().cloned());
        sql
    }
}

/// SQL with its own parameters, placeholders numbered `$1..$k`.
#[derive(Clone, Debug, PartialEq)]
struct Fragment {
    sql: String,
    params: Vec<PgBindValue>,
}

impl Fragment {
    fn plain(sql: String) -> Self {
        Fragment { sql, params: Vec::new() }
    }

    /// Combine fragments with a connective, renumbering each one after the previous.
    fn join(parts: Vec<Fragment>, sep: &str) -> Fragment {
        let mut buf = QueryBuf::new();
        let rendered: Vec<String> = parts.iter().map(|p| buf.push_fragment(p)).collect();
        Fragment {
            sql: rendered.join(sep),
            params: buf.params,
        }
    }
}

/// Walk `sql` and call `f` for each `$n` outside single-quoted literals.
fn map_placeholders(sql: &str, mut f: impl FnMut(usize) -> usize) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut in_literal = false;
    while let Some(c) = chars.next() {
        if c == '\'' {
            in_literal = !in_literal;
            out.push(c);
            continue;
        }
        if c == '$' && !in_literal && chars.peek().map(|d| d.is_ascii_digit()).unwrap_or(false) {
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let n: usize = digits.parse().unwrap_or(0);
            out.push('$');
            out.push_str(&f(n).to_string());
            continue;
        }
        out.push(c);
    }
    out
}

fn shift_placeholders(sql: &str, offset: usize) -> String {
    if offset == 0 {
        return sql.to_string();
    }
    map_placeholders(sql, |n| n + offset)
}

/// Distinct `$n` referenced by `sql`, ascending.
fn placeholders_used(sql: &str) -> BTreeSet<usize> {
    let mut used = BTreeSet::new();
    map_placeholders(sql, |n| {
        used.insert(n);
        n
    });
    used
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Bind a JSON value for a column; JSONB columns always take the JSON itself.
fn bind_for(col: &ColumnDefinition, v: &Value) -> PgBindValue {
    match (col.sql_type, v) {
        (_, Value::Null) => PgBindValue::Null,
        (SqlType::Jsonb, v) => PgBindValue::Json(v.clone()),
        (_, v) => PgBindValue::from_json(v),
    }
}

fn placeholder(n: usize, col: &ColumnDefinition) -> String {
    format!("${}::{}", n, col.sql_type.cast())
}

/// Aggregate for a HAVING comparison.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl Aggregate {
    fn as_sql(&self) -> &'static str {
        match self {
            Aggregate::Count => "COUNT",
            Aggregate::Sum => "SUM",
            Aggregate::Avg => "AVG",
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
        }
    }
}

/// One statement against one table. Reusable after `reset()`.
pub struct QueryBuilder<'t> {
    table: &'t TableDefinition,
    predicates: Vec<Fragment>,
    group_by: Vec<String>,
    having: Vec<Fragment>,
    order: Vec<String>,
    pagination: QueryPagination,
    projection: Option<Vec<String>>,
    with_deleted: bool,
}

impl<'t> QueryBuilder<'t> {
    pub fn new(table: &'t TableDefinition) -> Self {
        QueryBuilder {
            table,
            predicates: Vec::new(),
            group_by: Vec::new(),
            having: Vec::new(),
            order: Vec::new(),
            pagination: QueryPagination::default(),
            projection: None,
            with_deleted: false,
        }
    }

    pub fn table(&self) -> &'t TableDefinition {
        self.table
    }

    pub fn reset(&mut self) -> &mut Self {
        *self = QueryBuilder::new(self.table);
        self
    }

    fn column(&self, key: &str) -> Result<&'t ColumnDefinition, QueryError> {
        self.table.resolve_column(key).ok_or_else(|| QueryError::UnknownField {
            table: self.table.name.clone(),
            field: key.to_string(),
        })
    }

    fn predicate(&self, filter: &QueryFilter) -> Result<Fragment, QueryError> {
        let col = self.column(&filter.field)?;
        let name = quoted(&col.name);
        let invalid = |expected: &'static str| QueryError::InvalidFilterValue {
            field: filter.field.clone(),
            operator: filter.operator.as_str(),
            expected,
        };
        let text_col = if col.sql_type.is_textual() { name.clone() } else { format!("{}::text", name) };
        let pattern = |wrap: fn(&str) -> String| -> Result<Fragment, QueryError> {
            let s = filter.value.as_str().ok_or_else(|| invalid("a string"))?;
            Ok(Fragment {
                sql: format!("{} {} $1::text", text_col, if filter.operator == FilterOperator::Contains { "ILIKE" } else { "LIKE" }),
                params: vec![PgBindValue::String(wrap(&escape_like(s)))],
            })
        };
        let compare = |op: &str| Fragment {
            sql: format!("{} {} {}", name, op, placeholder(1, col)),
            params: vec![bind_for(col, &filter.value)],
        };

        Ok(match filter.operator {
            FilterOperator::Eq if filter.value.is_null() => Fragment::plain(format!("{} IS NULL", name)),
            FilterOperator::Neq if filter.value.is_null() => Fragment::plain(format!("{} IS NOT NULL", name)),
            FilterOperator::Eq => compare("="),
            FilterOperator::Neq => compare("<>"),
            FilterOperator::Gt => compare(">"),
            FilterOperator::Gte => compare(">="),
            FilterOperator::Lt => compare("<"),
            FilterOperator::Lte => compare("<="),
            FilterOperator::In | FilterOperator::Nin => {
                let items = filter.value.as_array().ok_or_else(|| invalid("an array"))?;
                let form = if filter.operator == FilterOperator::In { "= ANY" } else { "<> ALL" };
                Fragment {
                    sql: format!("{} {}($1::{}[])", name, form, col.sql_type.cast()),
                    params: vec![PgBindValue::text_array(items)],
                }
            }
            FilterOperator::Like | FilterOperator::Ilike => {
                let s = filter.value.as_str().ok_or_else(|| invalid("a string"))?;
                let op = if filter.operator == FilterOperator::Like { "LIKE" } else { "ILIKE" };
                Fragment {
                    sql: format!("{} {} $1::text", text_col, op),
                    params: vec![PgBindValue::String(s.to_string())],
                }
            }
            FilterOperator::Contains => pattern(|s| format!("%{}%", s))?,
            FilterOperator::StartsWith => pattern(|s| format!("{}%", s))?,
            FilterOperator::EndsWith => pattern(|s| format!("%{}", s))?,
            FilterOperator::IsNull => Fragment::plain(format!("{} IS NULL", name)),
            FilterOperator::IsNotNull => Fragment::plain(format!("{} IS NOT NULL", name)),
            FilterOperator::Between => match filter.value.as_array().map(Vec::as_slice) {
                Some([low, high]) => Fragment {
                    sql: format!("{} BETWEEN {} AND {}", name, placeholder(1, col), placeholder(2, col)),
                    params: vec![bind_for(col, low), bind_for(col, high)],
                },
                _ => return Err(invalid("a two-element array")),
            },
            FilterOperator::JsonContains => Fragment {
                sql: format!("{} @> $1::jsonb", name),
                params: vec![PgBindValue::Json(filter.value.clone())],
            },
        })
    }

    /// AND a filter onto the WHERE clause.
    pub fn filter(&mut self, filter: &QueryFilter) -> Result<&mut Self, QueryError> {
        let p = self.predicate(filter)?;
        self.predicates.push(p);
        Ok(self)
    }

    pub fn filters(&mut self, filters: &[QueryFilter]) -> Result<&mut Self, QueryError> {
        for f in filters {
            self.filter(f)?;
        }
        Ok(self)
    }

    /// AND a parenthesized OR group.
    pub fn filter_any(&mut self, filters: &[QueryFilter]) -> Result<&mut Self, QueryError> {
        if filters.is_empty() {
            return Ok(self);
        }
        let parts = filters.iter().map(|f| self.predicate(f)).collect::<Result<Vec<_>, _>>()?;
        let mut group = Fragment::join(parts, " OR ");
        group.sql = format!("({})", group.sql);
        self.predicates.push(group);
        Ok(self)
    }

    /// AND a raw predicate. Its placeholders are numbered from `$1` regardless of what
    /// was added before it.
    pub fn where_raw(&mut self, sql: &str, params: Vec<PgBindValue>) -> Result<&mut Self, QueryError> {
        let used = placeholders_used(sql);
        let contiguous = used.iter().copied().eq(1..=params.len());
        if !contiguous {
            return Err(QueryError::RawPlaceholderMismatch {
                placeholders: used.last().copied().unwrap_or(0),
                params: params.len(),
            });
        }
        self.predicates.push(Fragment {
            sql: format!("({})", sql),
            params,
        });
        Ok(self)
    }

    pub fn group_by(&mut self, fields: &[&str]) -> Result<&mut Self, QueryError> {
        for f in fields {
            let col = self.column(f)?;
            self.group_by.push(quoted(&col.name));
        }
        Ok(self)
    }

    /// `HAVING agg(field) <op> value`; `field` None means `COUNT(*)`.
    pub fn having(
        &mut self,
        aggregate: Aggregate,
        field: Option<&str>,
        operator: FilterOperator,
        value: &Value,
    ) -> Result<&mut Self, QueryError> {
        let target = match field {
            Some(f) => quoted(&self.column(f)?.name),
            None => "*".to_string(),
        };
        let op = match operator {
            FilterOperator::Eq => "=",
            FilterOperator::Neq => "<>",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            other => {
                return Err(QueryError::InvalidFilterValue {
                    field: field.unwrap_or("*").to_string(),
                    operator: other.as_str(),
                    expected: "a comparison operator",
                })
            }
        };
        self.having.push(Fragment {
            sql: format!("{}({}) {} $1::numeric", aggregate.as_sql(), target, op),
            params: vec![PgBindValue::from_json(value)],
        });
        Ok(self)
    }

    pub fn order_by(&mut self, sort: &QuerySort) -> Result<&mut Self, QueryError> {
        let col = self.column(&sort.field)?;
        let dir = match sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        self.order.push(format!("{} {}", quoted(&col.name), dir));
        Ok(self)
    }

    pub fn paginate(&mut self, pagination: QueryPagination) -> &mut Self {
        self.pagination = pagination;
        self
    }

    /// Restrict the SELECT list. RETURNING clauses always carry every column.
    pub fn columns(&mut self, fields: &[&str]) -> Result<&mut Self, QueryError> {
        let mut list = Vec::with_capacity(fields.len());
        for f in fields {
            list.push(self.column(f)?.projection());
        }
        self.projection = Some(list);
        Ok(self)
    }

    /// Include soft-deleted rows.
    pub fn with_deleted(&mut self) -> &mut Self {
        self.with_deleted = true;
        self
    }

    fn hides_deleted(&self) -> bool {
        self.table.is_soft_delete() && !self.with_deleted
    }

    fn render_where(&self, q: &mut QueryBuf, implicit: Option<&str>) -> String {
        let mut parts: Vec<String> = self.predicates.iter().map(|p| q.push_fragment(p)).collect();
        if let Some(extra) = implicit {
            parts.push(extra.to_string());
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", parts.join(" AND "))
        }
    }

    fn live_rows(&self) -> Option<&'static str> {
        if self.hides_deleted() {
            Some("\"deleted_at\" IS NULL")
        } else {
            None
        }
    }

    fn returning(&self) -> String {
        format!(" RETURNING {}", self.table.projection())
    }

    pub fn build_select(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let projection = match &self.projection {
            Some(cols) => cols.join(", "),
            None => self.table.projection(),
        };
        let where_clause = self.render_where(&mut q, self.live_rows());
        let mut sql = format!("SELECT {} FROM {}{}", projection, self.table.qualified_name(), where_clause);
        if !self.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", self.group_by.join(", ")));
        }
        if !self.having.is_empty() {
            let parts: Vec<String> = self.having.iter().map(|h| q.push_fragment(h)).collect();
            sql.push_str(&format!(" HAVING {}", parts.join(" AND ")));
        }
        if !self.order.is_empty() {
            sql.push_str(&format!(" ORDER BY {}", self.order.join(", ")));
        } else if self.group_by.is_empty() {
            sql.push_str(" ORDER BY \"id\" ASC");
        }
        let (limit, offset) = self.pagination.resolve();
        if let Some(n) = limit {
            sql.push_str(&format!(" LIMIT {}", n));
        }
        if let Some(n) = offset {
            sql.push_str(&format!(" OFFSET {}", n));
        }
        q.sql = sql;
        q
    }

    pub fn build_count(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let where_clause = self.render_where(&mut q, self.live_rows());
        q.sql = format!(
            "SELECT COUNT(*)::bigint AS \"count\" FROM {}{}",
            self.table.qualified_name(),
            where_clause
        );
        q
    }

    pub fn build_exists(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let where_clause = self.render_where(&mut q, self.live_rows());
        q.sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {}{}) AS \"exists\"",
            self.table.qualified_name(),
            where_clause
        );
        q
    }

    /// Resolve record keys to columns, keeping table column order.
    fn write_columns<'r>(
        &self,
        record: &'r Map<String, Value>,
    ) -> Result<Vec<(&'t ColumnDefinition, &'r Value)>, QueryError> {
        let mut out: Vec<(&'t ColumnDefinition, &'r Value)> = Vec::with_capacity(record.len());
        for (key, value) in record {
            let col = self.column(key)?;
            if !out.iter().any(|(c, _)| c.name == col.name) {
                out.push((col, value));
            }
        }
        out.sort_by_key(|(c, _)| self.table.columns.iter().position(|t| t.name == c.name));
        Ok(out)
    }

    pub fn build_insert(&self, record: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
        let mut q = QueryBuf::new();
        let cols = self.write_columns(record)?;
        if cols.is_empty() {
            q.sql = format!("INSERT INTO {} DEFAULT VALUES{}", self.table.qualified_name(), self.returning());
            return Ok(q);
        }
        let names: Vec<String> = cols.iter().map(|(c, _)| quoted(&c.name)).collect();
        let values: Vec<String> = cols
            .iter()
            .map(|(c, v)| {
                let n = q.push_param(bind_for(c, v));
                placeholder(n, c)
            })
            .collect();
        q.sql = format!(
            "INSERT INTO {} ({}) VALUES ({}){}",
            self.table.qualified_name(),
            names.join(", "),
            values.join(", "),
            self.returning()
        );
        Ok(q)
    }

    /// One multi-row INSERT. Columns are the union of all record keys; a record lacking
    /// one gets `DEFAULT`.
    pub fn build_bulk_insert(&self, records: &[Map<String, Value>]) -> Result<QueryBuf, QueryError> {
        if records.is_empty() {
            return Err(QueryError::EmptyWrite(format!("bulk insert into {}", self.table.name)));
        }
        let mut used: Vec<&'t ColumnDefinition> = Vec::new();
        for r in records {
            for (c, _) in self.write_columns(r)? {
                if !used.iter().any(|u| u.name == c.name) {
                    used.push(c);
                }
            }
        }
        if used.is_empty() {
            return Err(QueryError::EmptyWrite(format!("bulk insert into {} with no columns", self.table.name)));
        }
        used.sort_by_key(|c| self.table.columns.iter().position(|t| t.name == c.name));

        let mut q = QueryBuf::new();
        let mut rows = Vec::with_capacity(records.len());
        for r in records {
            let cols = self.write_columns(r)?;
            let cells: Vec<String> = used
                .iter()
                .map(|u| match cols.iter().find(|(c, _)| c.name == u.name) {
                    Some((c, v)) => {
                        let n = q.push_param(bind_for(c, v));
                        placeholder(n, c)
                    }
                    None => "DEFAULT".to_string(),
                })
                .collect();
            rows.push(format!("({})", cells.join(", ")));
        }
        let names: Vec<String> = used.iter().map(|c| quoted(&c.name)).collect();
        q.sql = format!(
            "INSERT INTO {} ({}) VALUES {}{}",
            self.table.qualified_name(),
            names.join(", "),
            rows.join(", "),
            self.returning()
        );
        Ok(q)
    }

    /// INSERT ... ON CONFLICT (`conflict_field`) DO UPDATE with the supplied columns.
    pub fn build_upsert(&self, record: &Map<String, Value>, conflict_field: &str) -> Result<QueryBuf, QueryError> {
        let target = self.column(conflict_field)?;
        let mut q = self.build_insert(record)?;
        let mut sets: Vec<String> = self
            .write_columns(record)?
            .iter()
            .filter(|(c, _)| c.name != target.name && c.name != "id")
            .map(|(c, _)| format!("{} = EXCLUDED.{}", quoted(&c.name), quoted(&c.name)))
            .collect();
        if self.table.updated_at {
            sets.push("\"updated_at\" = NOW()".to_string());
        }
        if sets.is_empty() {
            // DO NOTHING would return no row.
            sets.push(format!("{} = EXCLUDED.{}", quoted(&target.name), quoted(&target.name)));
        }
        let returning = self.returning();
        let insert = q.sql.strip_suffix(&returning).unwrap_or(&q.sql).to_string();
        q.sql = format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {}{}",
            insert,
            quoted(&target.name),
            sets.join(", "),
            returning
        );
        Ok(q)
    }

    /// UPDATE with SET parameters numbered before WHERE parameters.
    pub fn build_update(&self, changes: &Map<String, Value>) -> Result<QueryBuf, QueryError> {
        let mut q = QueryBuf::new();
        let mut sets: Vec<String> = Vec::new();
        for (c, v) in self.write_columns(changes)? {
            if c.name == "id" || c.name == "updated_at" {
                continue;
            }
            let n = q.push_param(bind_for(c, v));
            sets.push(format!("{} = {}", quoted(&c.name), placeholder(n, c)));
        }
        if sets.is_empty() {
            return Err(QueryError::EmptyWrite(format!("update of {}", self.table.name)));
        }
        if self.table.updated_at {
            sets.push("\"updated_at\" = NOW()".to_string());
        }
        let where_clause = self.render_where(&mut q, self.live_rows());
        q.sql = format!(
            "UPDATE {} SET {}{}{}",
            self.table.qualified_name(),
            sets.join(", "),
            where_clause,
            self.returning()
        );
        Ok(q)
    }

    /// Physical DELETE; ignores the soft-delete predicate.
    pub fn build_delete(&self) -> QueryBuf {
        let mut q = QueryBuf::new();
        let where_clause = self.render_where(&mut q, None);
        q.sql = format!("DELETE FROM {}{}{}", self.table.qualified_name(), where_clause, self.returning());
        q
    }

    pub fn build_soft_delete(&self) -> Result<QueryBuf, QueryError> {
        self.stamp_deleted("NOW()", "\"deleted_at\" IS NULL")
    }

    pub fn build_restore(&self) -> Result<QueryBuf, QueryError> {
        self.stamp_deleted("NULL", "\"deleted_at\" IS NOT NULL")
    }

    fn stamp_deleted(&self, value: &str, guard: &str) -> Result<QueryBuf, QueryError> {
        if !self.table.deleted_at {
            return Err(QueryError::SoftDeleteUnsupported(self.table.name.clone()));
        }
        let mut q = QueryBuf::new();
        let where_clause = self.render_where(&mut q, Some(guard));
        let mut sets = vec![format!("\"deleted_at\" = {}", value)];
        if self.table.updated_at {
            sets.push("\"updated_at\" = NOW()".to_string());
        }
        q.sql = format!(
            "UPDATE {} SET {}{}{}",
            self.table.qualified_name(),
            sets.join(", "),
            where_clause,
            self.returning()
        );
        Ok(q)
    }
}
