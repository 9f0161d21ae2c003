//! Pooled PostgreSQL access: the executor seam, transactions and the schema lock.

use crate::error::DbError;
use crate::settings::DatabaseSettings;
use crate::sql::PgBindValue;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Anything that can run a statement: the pool or an open transaction.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Run a statement and decode every returned row into a JSON object keyed by column.
    async fn query(&self, sql: &str, params: &[PgBindValue]) -> Result<Vec<Value>, DbError>;

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str, params: &[PgBindValue]) -> Result<u64, DbError>;

    async fn query_one(&self, sql: &str, params: &[PgBindValue]) -> Result<Option<Value>, DbError> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }
}

fn bind_all<'q>(sql: &'q str, params: &[PgBindValue]) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(sql);
    for p in params {
        query = query.bind(p.clone());
    }
    query
}

async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, DbError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(DbError::from),
        Err(_) => Err(DbError::Timeout(limit)),
    }
}

pub type TxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DbError>> + Send + 'a>>;

/// Pool snapshot for status reporting.
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub size: u32,
    pub idle: usize,
    pub closed: bool,
}

#[derive(Clone, Debug)]
pub struct Connection {
    pool: PgPool,
    statement_timeout: Duration,
}

impl Connection {
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self, DbError> {
        settings.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect(&settings.database_url)
            .await?;
        tracing::info!(
            max_connections = settings.max_connections,
            schema = %settings.schema,
            "database pool ready"
        );
        Ok(Self::from_pool(pool, settings.statement_timeout))
    }

    pub fn from_pool(pool: PgPool, statement_timeout: Duration) -> Self {
        Connection { pool, statement_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub async fn begin_transaction(&self) -> Result<Transaction, DbError> {
        let tx = with_timeout(self.statement_timeout, self.pool.begin()).await?;
        Ok(Transaction {
            inner: tokio::sync::Mutex::new(Some(tx)),
            statement_timeout: self.statement_timeout,
        })
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Transaction) -> TxFuture<'a, T>,
    {
        let tx = self.begin_transaction().await?;
        match f(&tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        with_timeout(self.statement_timeout, sqlx::query("SELECT 1").execute(&self.pool)).await?;
        Ok(())
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            closed: self.pool.is_closed(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        tracing::info!("database pool closed");
    }

    /// Take a session-level advisory lock on a dedicated connection. Waits for other holders.
    pub async fn lock(&self, key: i64) -> Result<SchemaLock, DbError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await?;
        tracing::debug!(key, "advisory lock acquired");
        Ok(SchemaLock { conn: Some(conn), key })
    }
}

#[async_trait]
impl SqlExecutor for Connection {
    async fn query(&self, sql: &str, params: &[PgBindValue]) -> Result<Vec<Value>, DbError> {
        tracing::debug!(sql = %sql, params = ?params, "query");
        let rows = with_timeout(self.statement_timeout, bind_all(sql, params).fetch_all(&self.pool)).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&self, sql: &str, params: &[PgBindValue]) -> Result<u64, DbError> {
        tracing::debug!(sql = %sql, params = ?params, "execute");
        let done = with_timeout(self.statement_timeout, bind_all(sql, params).execute(&self.pool)).await?;
        Ok(done.rows_affected())
    }
}

/// An open transaction. Dropping it without `commit` rolls back.
pub struct Transaction {
    inner: tokio::sync::Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
    statement_timeout: Duration,
}

impl Transaction {
    pub async fn commit(self) -> Result<(), DbError> {
        match self.inner.into_inner() {
            Some(tx) => with_timeout(self.statement_timeout, tx.commit()).await,
            None => Err(finished()),
        }
    }

    pub async fn rollback(self) -> Result<(), DbError> {
        match self.inner.into_inner() {
            Some(tx) => with_timeout(self.statement_timeout, tx.rollback()).await,
            None => Err(finished()),
        }
    }
}

fn finished() -> DbError {
    DbError::Connection("transaction already finished".into())
}

#[async_trait]
impl SqlExecutor for Transaction {
    async fn query(&self, sql: &str, params: &[PgBindValue]) -> Result<Vec<Value>, DbError> {
        tracing::debug!(sql = %sql, params = ?params, "query (tx)");
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let rows = with_timeout(self.statement_timeout, bind_all(sql, params).fetch_all(&mut **tx)).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&self, sql: &str, params: &[PgBindValue]) -> Result<u64, DbError> {
        tracing::debug!(sql = %sql, params = ?params, "execute (tx)");
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(finished)?;
        let done = with_timeout(self.statement_timeout, bind_all(sql, params).execute(&mut **tx)).await?;
        Ok(done.rows_affected())
    }
}

/// Held advisory lock. `release` unlocks; dropping it instead closes the session, which
/// frees the lock server side.
pub struct SchemaLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

impl SchemaLock {
    pub async fn release(mut self) -> Result<(), DbError> {
        if let Some(mut conn) = self.conn.take() {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(self.key)
                .execute(&mut *conn)
                .await?;
            tracing::debug!(key = self.key, "advisory lock released");
        }
        Ok(())
    }
}

impl Drop for SchemaLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

/// Decode a row into a JSON object keyed by column name.
pub fn row_to_json(row: &PgRow) -> Value {
    use sqlx::Column;
    use sqlx::Row;
    let mut map = serde_json::Map::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    Value::Object(map)
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(t)) = row.try_get::<Option<chrono::NaiveTime>, _>(name) {
        return Value::String(t.format("%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<Value>, _>(name) {
        return j;
    }
    Value::Null
}
