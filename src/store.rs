//! `_neo_*` bookkeeping tables: the migration log and the entity snapshots sync diffs against.

use crate::connection::SqlExecutor;
use crate::error::DbError;
use crate::model::EntityDefinition;
use crate::settings::DEFAULT_SCHEMA;
use crate::sql::{qualified_table, quoted, PgBindValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::ConnectOptions;
use std::collections::HashMap;
use std::str::FromStr;

pub const MIGRATIONS_TABLE: &str = "_neo_migrations";
pub const ENTITIES_TABLE: &str = "_neo_entities";

/// One row of the append-only migration log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub applied_at: Option<String>,
    pub checksum: String,
    #[serde(default)]
    pub execution_time_ms: i64,
}

/// Create the schema (unless public) and both bookkeeping tables.
pub async fn ensure_bookkeeping_tables(exec: &dyn SqlExecutor, schema: &str) -> Result<(), DbError> {
    if schema != DEFAULT_SCHEMA {
        exec.execute(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)), &[])
            .await?;
    }

    let migrations_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            version TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            checksum TEXT NOT NULL,
            execution_time_ms BIGINT NOT NULL DEFAULT 0
        )
        "#,
        qualified_table(schema, MIGRATIONS_TABLE)
    );
    exec.execute(&migrations_ddl, &[]).await?;

    let entities_ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            table_name TEXT NOT NULL,
            schema_json JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        qualified_table(schema, ENTITIES_TABLE)
    );
    exec.execute(&entities_ddl, &[]).await?;
    Ok(())
}

/// Every stored snapshot. Rows that no longer deserialize are skipped with a warning.
pub async fn load_snapshots(exec: &dyn SqlExecutor, schema: &str) -> Result<Vec<EntityDefinition>, DbError> {
    let sql = format!(
        "SELECT id, schema_json FROM {} ORDER BY created_at, id",
        qualified_table(schema, ENTITIES_TABLE)
    );
    let rows = exec.query(&sql, &[]).await?;
    Ok(rows.into_iter().filter_map(parse_snapshot).collect())
}

pub async fn load_snapshot(exec: &dyn SqlExecutor, schema: &str, id: &str) -> Result<Option<EntityDefinition>, DbError> {
    let sql = format!(
        "SELECT id, schema_json FROM {} WHERE id = $1::text",
        qualified_table(schema, ENTITIES_TABLE)
    );
    let row = exec.query_one(&sql, &[PgBindValue::from(id)]).await?;
    Ok(row.and_then(parse_snapshot))
}

fn parse_snapshot(row: Value) -> Option<EntityDefinition> {
    let id = row.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
    let json = row.get("schema_json").cloned().unwrap_or(Value::Null);
    match serde_json::from_value(json) {
        Ok(def) => Some(def),
        Err(e) => {
            tracing::warn!(entity = %id, error = %e, "unreadable entity snapshot skipped");
            None
        }
    }
}

pub async fn upsert_snapshot(exec: &dyn SqlExecutor, schema: &str, entity: &EntityDefinition) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO {} (id, name, table_name, schema_json) VALUES ($1::text, $2::text, $3::text, $4::jsonb) \
         ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, table_name = EXCLUDED.table_name, \
         schema_json = EXCLUDED.schema_json, updated_at = NOW()",
        qualified_table(schema, ENTITIES_TABLE)
    );
    let params = [
        PgBindValue::from(entity.id.as_str()),
        PgBindValue::from(entity.name.as_str()),
        PgBindValue::from(entity.table_name()),
        PgBindValue::Json(serde_json::to_value(entity)?),
    ];
    exec.execute(&sql, &params).await?;
    Ok(())
}

pub async fn delete_snapshot(exec: &dyn SqlExecutor, schema: &str, id: &str) -> Result<(), DbError> {
    let sql = format!("DELETE FROM {} WHERE id = $1::text", qualified_table(schema, ENTITIES_TABLE));
    exec.execute(&sql, &[PgBindValue::from(id)]).await?;
    Ok(())
}

pub async fn record_migration(exec: &dyn SqlExecutor, schema: &str, record: &MigrationRecord) -> Result<(), DbError> {
    let sql = format!(
        "INSERT INTO {} (version, name, checksum, execution_time_ms) VALUES ($1::text, $2::text, $3::text, $4::bigint)",
        qualified_table(schema, MIGRATIONS_TABLE)
    );
    let params = [
        PgBindValue::from(record.version.as_str()),
        PgBindValue::from(record.name.as_str()),
        PgBindValue::from(record.checksum.as_str()),
        PgBindValue::I64(record.execution_time_ms),
    ];
    exec.execute(&sql, &params).await?;
    Ok(())
}

/// The log, oldest first.
pub async fn applied_migrations(exec: &dyn SqlExecutor, schema: &str) -> Result<Vec<MigrationRecord>, DbError> {
    let sql = format!(
        "SELECT version, name, applied_at, checksum, execution_time_ms FROM {} ORDER BY applied_at, version",
        qualified_table(schema, MIGRATIONS_TABLE)
    );
    let rows = exec.query(&sql, &[]).await?;
    rows.into_iter()
        .map(|r| serde_json::from_value(snake_to_record(r)).map_err(DbError::from))
        .collect()
}

/// Log columns are snake_case; the record type serializes camelCase.
fn snake_to_record(row: Value) -> Value {
    let get = |k: &str| row.get(k).cloned().unwrap_or(Value::Null);
    serde_json::json!({
        "version": get("version"),
        "name": get("name"),
        "appliedAt": get("applied_at"),
        "checksum": get("checksum"),
        "executionTimeMs": get("execution_time_ms"),
    })
}

/// Logged version -> checksum.
pub async fn applied_checksums(exec: &dyn SqlExecutor, schema: &str) -> Result<HashMap<String, String>, DbError> {
    let sql = format!("SELECT version, checksum FROM {}", qualified_table(schema, MIGRATIONS_TABLE));
    let rows = exec.query(&sql, &[]).await?;
    Ok(rows
        .iter()
        .filter_map(|r| {
            let version = r.get("version").and_then(Value::as_str)?;
            let checksum = r.get("checksum").and_then(Value::as_str).unwrap_or_default();
            Some((version.to_string(), checksum.to_string()))
        })
        .collect())
}

pub async fn table_exists(exec: &dyn SqlExecutor, schema: &str, table: &str) -> Result<bool, DbError> {
    let sql = "SELECT EXISTS(SELECT 1 FROM information_schema.tables WHERE table_schema = $1::text AND table_name = $2::text) AS \"exists\"";
    let row = exec.query_one(sql, &[PgBindValue::from(schema), PgBindValue::from(table)]).await?;
    Ok(row.and_then(|r| r.get("exists").and_then(Value::as_bool)).unwrap_or(false))
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), DbError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| DbError::Config(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        sqlx::query(&format!("CREATE DATABASE {}", quoted(&db_name)))
            .execute(&mut conn)
            .await?;
        tracing::info!(database = %db_name, "database created");
    }
    Ok(())
}

fn parse_db_name_from_url(url: &str) -> Result<(String, String), DbError> {
    let path_start = url
        .rfind('/')
        .ok_or_else(|| DbError::Config("DATABASE_URL: no path".into()))?
        + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let db_name = path_and_query.split('?').next().unwrap_or("").trim();
    let base = url.get(..path_start).unwrap_or(url);
    let admin_url = format!("{}postgres", base);
    Ok((admin_url, db_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn admin_url_swaps_database() {
        let (admin, db) = parse_db_name_from_url("postgres://u:p@localhost:5432/neo_app?sslmode=disable").unwrap();
        assert_eq!(admin, "postgres://u:p@localhost:5432/postgres");
        assert_eq!(db, "neo_app");
    }

    #[test]
    fn log_rows_map_to_records() {
        let row = json!({
            "version": "20240101000000_001",
            "name": "create_clients",
            "applied_at": "2024-01-01T00:00:00+00:00",
            "checksum": "abc",
            "execution_time_ms": 12
        });
        let rec: MigrationRecord = serde_json::from_value(snake_to_record(row)).unwrap();
        assert_eq!(rec.version, "20240101000000_001");
        assert_eq!(rec.execution_time_ms, 12);
    }

    #[test]
    fn broken_snapshot_is_skipped() {
        assert!(parse_snapshot(json!({"id": "x", "schema_json": {"nope": true}})).is_none());
        let ok = parse_snapshot(json!({"id": "c", "schema_json": {"id": "c", "name": "Client"}})).unwrap();
        assert_eq!(ok.table_name(), "clients");
    }
}
