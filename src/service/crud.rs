//! Generic CRUD execution over registered entities.

use super::validation::WriteMode;
use crate::computed::ComputedFieldsEngine;
use crate::connection::SqlExecutor;
use crate::error::{DbError, ValidationErrors};
use crate::model::DeleteMode;
use crate::registry::{EntityRegistry, RegisteredEntity};
use crate::relations::{attach, RelationResolver};
use crate::sql::{FindOptions, QueryBuf, QueryBuilder, QueryFilter, QueryPagination};
use serde_json::{json, Value};

pub struct CrudService;

impl CrudService {
    /// Validate and insert one record. Returns the stored row.
    pub async fn create(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        data: &Value,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        let record = e.validator.validate(&e.definition, data, WriteMode::Create)?;
        let q = QueryBuilder::new(&e.table).build_insert(&record)?;
        let row = Self::returning_one(exec, &e, &q)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("{} insert returned no row", e.definition.name)))?;
        tracing::debug!(entity = %e.definition.name, "record created");
        Ok(row)
    }

    /// Validate every record, then insert them with one multi-row INSERT.
    pub async fn create_many(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        data: &[Value],
    ) -> Result<Vec<Value>, DbError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let e = registry.get(entity)?;
        let mut errors = ValidationErrors::new();
        let mut records = Vec::with_capacity(data.len());
        for (i, item) in data.iter().enumerate() {
            match e.validator.validate(&e.definition, item, WriteMode::Create) {
                Ok(r) => records.push(r),
                Err(DbError::Validation(v)) => {
                    for fe in v.errors {
                        errors.push(format!("[{}].{}", i, fe.field), fe.message);
                    }
                }
                Err(other) => return Err(other),
            }
        }
        errors.into_result()?;
        let q = QueryBuilder::new(&e.table).build_bulk_insert(&records)?;
        Self::returning_many(exec, &e, &q).await
    }

    /// Filtered, sorted, paginated read. Each `include` costs a bounded number of extra queries.
    pub async fn find_many(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        options: &FindOptions,
    ) -> Result<Vec<Value>, DbError> {
        let e = registry.get(entity)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(&options.filters)?;
        for s in &options.sort {
            qb.order_by(s)?;
        }
        qb.paginate(options.pagination);
        if options.with_deleted {
            qb.with_deleted();
        }
        let q = qb.build_select();
        let mut rows = Self::returning_many(exec, &e, &q).await?;

        if !options.include.is_empty() && !rows.is_empty() {
            let resolver = RelationResolver::new(registry);
            let ids: Vec<String> = rows
                .iter()
                .filter_map(|r| r.get("id").and_then(Value::as_str).map(String::from))
                .collect();
            for name in &options.include {
                let relation = resolver.find_relation(&e.definition.id, name)?;
                let grouped = resolver.batch_for(exec, &relation, &ids).await?;
                attach(&relation, &mut rows, grouped);
            }
        }
        Ok(rows)
    }

    /// Fetch by id, soft-deleted rows included. A malformed id is simply not found.
    pub async fn find_by_id(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        id: &str,
    ) -> Result<Option<Value>, DbError> {
        let e = registry.get(entity)?;
        if uuid::Uuid::parse_str(id).is_err() {
            return Ok(None);
        }
        let mut qb = QueryBuilder::new(&e.table);
        qb.filter(&QueryFilter::eq("id", json!(id)))?.with_deleted();
        Self::returning_one(exec, &e, &qb.build_select()).await
    }

    pub async fn find_one(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        filters: &[QueryFilter],
    ) -> Result<Option<Value>, DbError> {
        let e = registry.get(entity)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(filters)?.paginate(QueryPagination::limit(1));
        Self::returning_one(exec, &e, &qb.build_select()).await
    }

    pub async fn count(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        filters: &[QueryFilter],
    ) -> Result<u64, DbError> {
        let e = registry.get(entity)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(filters)?;
        let q = qb.build_count();
        let row = exec.query_one(&q.sql, &q.params).await?;
        Ok(row
            .and_then(|r| r.get("count").and_then(Value::as_i64))
            .map(|n| n.max(0) as u64)
            .unwrap_or(0))
    }

    pub async fn exists(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        filters: &[QueryFilter],
    ) -> Result<bool, DbError> {
        let e = registry.get(entity)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(filters)?;
        let q = qb.build_exists();
        let row = exec.query_one(&q.sql, &q.params).await?;
        Ok(row.and_then(|r| r.get("exists").and_then(Value::as_bool)).unwrap_or(false))
    }

    /// Partial update of one live row. NotFound when no such row.
    pub async fn update(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        id: &str,
        data: &Value,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        let changes = e.validator.validate(&e.definition, data, WriteMode::Update)?;
        Self::require_id(&e, id)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filter(&QueryFilter::eq("id", json!(id)))?;
        let q = qb.build_update(&changes)?;
        Self::returning_one(exec, &e, &q)
            .await?
            .ok_or_else(|| not_found(&e, id))
    }

    /// Apply the same changes to every live row matching `filters`.
    pub async fn update_many(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        filters: &[QueryFilter],
        data: &Value,
    ) -> Result<Vec<Value>, DbError> {
        let e = registry.get(entity)?;
        let changes = e.validator.validate(&e.definition, data, WriteMode::Update)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(filters)?;
        let q = qb.build_update(&changes)?;
        Self::returning_many(exec, &e, &q).await
    }

    /// Insert, or update on conflict. The conflict target is `conflict_field` when given,
    /// else `id` when supplied, else the first unique field present in the record.
    pub async fn upsert(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        data: &Value,
        conflict_field: Option<&str>,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        let record = e.validator.validate(&e.definition, data, WriteMode::Create)?;
        let target = match conflict_field {
            Some(f) => {
                let col = e.table.resolve_column(f).ok_or_else(|| {
                    DbError::Validation(ValidationErrors::single(f, "unknown conflict field"))
                })?;
                if !(col.unique || col.primary_key) {
                    return Err(DbError::Validation(ValidationErrors::single(
                        f,
                        "conflict field must be unique",
                    )));
                }
                col.name.clone()
            }
            None if record.contains_key("id") => "id".to_string(),
            None => e
                .table
                .columns
                .iter()
                .find(|c| c.unique && record.contains_key(&c.name))
                .map(|c| c.name.clone())
                .ok_or_else(|| {
                    DbError::Validation(ValidationErrors::single(
                        "record",
                        "upsert needs an id or a unique field to match on",
                    ))
                })?,
        };
        let q = QueryBuilder::new(&e.table).build_upsert(&record, &target)?;
        Self::returning_one(exec, &e, &q)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("{} upsert returned no row", e.definition.name)))
    }

    /// Delete according to the table's delete mode. Returns the affected row.
    pub async fn delete(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        id: &str,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        Self::require_id(&e, id)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filter(&QueryFilter::eq("id", json!(id)))?;
        let q = match e.table.delete_mode {
            DeleteMode::Soft => qb.build_soft_delete()?,
            DeleteMode::Hard => qb.build_delete(),
        };
        Self::returning_one(exec, &e, &q)
            .await?
            .ok_or_else(|| not_found(&e, id))
    }

    /// Physical delete regardless of delete mode.
    pub async fn hard_delete(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        id: &str,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        Self::require_id(&e, id)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filter(&QueryFilter::eq("id", json!(id)))?;
        Self::returning_one(exec, &e, &qb.build_delete())
            .await?
            .ok_or_else(|| not_found(&e, id))
    }

    /// Delete every row matching `filters`. Refuses an empty filter list.
    pub async fn delete_many(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        filters: &[QueryFilter],
    ) -> Result<u64, DbError> {
        if filters.is_empty() {
            return Err(DbError::Validation(ValidationErrors::single(
                "filters",
                "delete_many requires at least one filter",
            )));
        }
        let e = registry.get(entity)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filters(filters)?;
        let q = match e.table.delete_mode {
            DeleteMode::Soft => qb.build_soft_delete()?,
            DeleteMode::Hard => qb.build_delete(),
        };
        let n = exec.query(&q.sql, &q.params).await?.len() as u64;
        tracing::debug!(entity = %e.definition.name, deleted = n, "bulk delete");
        Ok(n)
    }

    /// Clear `deleted_at` on a soft-deleted row.
    pub async fn restore(
        exec: &dyn SqlExecutor,
        registry: &EntityRegistry,
        entity: &str,
        id: &str,
    ) -> Result<Value, DbError> {
        let e = registry.get(entity)?;
        Self::require_id(&e, id)?;
        let mut qb = QueryBuilder::new(&e.table);
        qb.filter(&QueryFilter::eq("id", json!(id)))?;
        let q = qb.build_restore()?;
        Self::returning_one(exec, &e, &q)
            .await?
            .ok_or_else(|| not_found(&e, id))
    }

    fn require_id(e: &RegisteredEntity, id: &str) -> Result<(), DbError> {
        uuid::Uuid::parse_str(id).map(drop).map_err(|_| not_found(e, id))
    }

    async fn returning_one(exec: &dyn SqlExecutor, e: &RegisteredEntity, q: &QueryBuf) -> Result<Option<Value>, DbError> {
        let mut row = exec.query_one(&q.sql, &q.params).await?;
        if let Some(r) = row.as_mut() {
            ComputedFieldsEngine::apply(&e.definition, &e.computed, r);
        }
        Ok(row)
    }

    async fn returning_many(exec: &dyn SqlExecutor, e: &RegisteredEntity, q: &QueryBuf) -> Result<Vec<Value>, DbError> {
        let mut rows = exec.query(&q.sql, &q.params).await?;
        ComputedFieldsEngine::apply_all(&e.definition, &e.computed, &mut rows);
        Ok(rows)
    }
}

fn not_found(e: &RegisteredEntity, id: &str) -> DbError {
    DbError::NotFound(format!("{} '{}'", e.definition.name, id))
}
