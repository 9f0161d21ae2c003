//! `DatabaseService`: one handle over the pool, the entity registry, CRUD, relations and
//! schema management.

use crate::connection::{Connection, PoolStatus, SqlExecutor, Transaction, TxFuture};
use crate::error::DbError;
use crate::migration::{ApplyOptions, MigrationPlan, SchemaManager, SchemaMigration, SyncReport};
use crate::model::EntityDefinition;
use crate::registry::EntityRegistry;
use crate::relations::RelationResolver;
use crate::service::CrudService;
use crate::settings::DatabaseSettings;
use crate::sql::{FindOptions, PgBindValue, QueryFilter};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub connected: bool,
    pub pool: PoolStatus,
    pub entities: usize,
    pub schema: String,
}

pub struct DatabaseService {
    settings: DatabaseSettings,
    conn: Connection,
    registry: Arc<EntityRegistry>,
    schema: SchemaManager,
}

impl DatabaseService {
    pub async fn connect(settings: DatabaseSettings) -> Result<Self, DbError> {
        let conn = Connection::connect(&settings).await?;
        Ok(Self::with_connection(settings, conn))
    }

    /// Wrap an existing pool (tests, or callers that build their own `PgPool`).
    pub fn with_connection(settings: DatabaseSettings, conn: Connection) -> Self {
        let registry = Arc::new(EntityRegistry::new(settings.schema.clone()));
        let schema = SchemaManager::new(conn.clone(), settings.schema.clone());
        DatabaseService {
            settings,
            conn,
            registry,
            schema,
        }
    }

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Shared registry, for running `CrudService` or `RelationResolver` against a transaction.
    pub fn registry(&self) -> Arc<EntityRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn schema_manager(&self) -> &SchemaManager {
        &self.schema
    }

    pub fn register_entities(&self, entities: &[EntityDefinition]) -> Result<(), DbError> {
        self.registry.register(entities)?;
        tracing::info!(count = entities.len(), total = self.registry.len(), "entities registered");
        Ok(())
    }

    pub async fn initialize(&self) -> Result<(), DbError> {
        self.schema.initialize().await
    }

    /// Sync every registered entity.
    pub async fn sync_schema(&self) -> Result<SyncReport, DbError> {
        self.schema.sync_schema(&self.registry.definitions()).await
    }

    /// Plan from the stored snapshots to the registered entities.
    pub async fn plan_migrations(&self) -> Result<MigrationPlan, DbError> {
        self.schema.plan_from_store(&self.registry.definitions()).await
    }

    pub async fn apply_migrations(
        &self,
        migrations: &[SchemaMigration],
        options: ApplyOptions,
    ) -> Result<Vec<SchemaMigration>, DbError> {
        self.schema.apply_migrations(migrations, options).await
    }

    pub async fn create(&self, entity: &str, data: &Value) -> Result<Value, DbError> {
        CrudService::create(&self.conn, &self.registry, entity, data).await
    }

    pub async fn create_many(&self, entity: &str, data: &[Value]) -> Result<Vec<Value>, DbError> {
        CrudService::create_many(&self.conn, &self.registry, entity, data).await
    }

    pub async fn find_many(&self, entity: &str, options: &FindOptions) -> Result<Vec<Value>, DbError> {
        CrudService::find_many(&self.conn, &self.registry, entity, options).await
    }

    pub async fn find_by_id(&self, entity: &str, id: &str) -> Result<Option<Value>, DbError> {
        CrudService::find_by_id(&self.conn, &self.registry, entity, id).await
    }

    pub async fn find_one(&self, entity: &str, filters: &[QueryFilter]) -> Result<Option<Value>, DbError> {
        CrudService::find_one(&self.conn, &self.registry, entity, filters).await
    }

    pub async fn count(&self, entity: &str, filters: &[QueryFilter]) -> Result<u64, DbError> {
        CrudService::count(&self.conn, &self.registry, entity, filters).await
    }

    pub async fn exists(&self, entity: &str, filters: &[QueryFilter]) -> Result<bool, DbError> {
        CrudService::exists(&self.conn, &self.registry, entity, filters).await
    }

    pub async fn update(&self, entity: &str, id: &str, data: &Value) -> Result<Value, DbError> {
        CrudService::update(&self.conn, &self.registry, entity, id, data).await
    }

    pub async fn update_many(&self, entity: &str, filters: &[QueryFilter], data: &Value) -> Result<Vec<Value>, DbError> {
        CrudService::update_many(&self.conn, &self.registry, entity, filters, data).await
    }

    pub async fn upsert(&self, entity: &str, data: &Value, conflict_field: Option<&str>) -> Result<Value, DbError> {
        CrudService::upsert(&self.conn, &self.registry, entity, data, conflict_field).await
    }

    pub async fn delete(&self, entity: &str, id: &str) -> Result<Value, DbError> {
        CrudService::delete(&self.conn, &self.registry, entity, id).await
    }

    pub async fn hard_delete(&self, entity: &str, id: &str) -> Result<Value, DbError> {
        CrudService::hard_delete(&self.conn, &self.registry, entity, id).await
    }

    pub async fn delete_many(&self, entity: &str, filters: &[QueryFilter]) -> Result<u64, DbError> {
        CrudService::delete_many(&self.conn, &self.registry, entity, filters).await
    }

    pub async fn restore(&self, entity: &str, id: &str) -> Result<Value, DbError> {
        CrudService::restore(&self.conn, &self.registry, entity, id).await
    }

    pub async fn create_relation(&self, entity: &str, source_id: &str, relation: &str, target_id: &str) -> Result<(), DbError> {
        RelationResolver::new(&self.registry)
            .create_relation(&self.conn, entity, source_id, relation, target_id)
            .await
    }

    pub async fn remove_relation(&self, entity: &str, source_id: &str, relation: &str, target_id: &str) -> Result<(), DbError> {
        RelationResolver::new(&self.registry)
            .remove_relation(&self.conn, entity, source_id, relation, target_id)
            .await
    }

    /// Related records of one record: an object or null for single relations, an array otherwise.
    pub async fn get_related(&self, entity: &str, id: &str, relation: &str) -> Result<Value, DbError> {
        let record = self
            .find_by_id(entity, id)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("{} record {}", entity, id)))?;
        RelationResolver::new(&self.registry)
            .resolve_relation(&self.conn, entity, &record, relation)
            .await
    }

    /// Run `f` in a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a Transaction) -> TxFuture<'a, T>,
    {
        self.conn.transaction(f).await
    }

    pub async fn begin_transaction(&self) -> Result<Transaction, DbError> {
        self.conn.begin_transaction().await
    }

    pub async fn raw_query(&self, sql: &str, params: &[PgBindValue]) -> Result<Vec<Value>, DbError> {
        self.conn.query(sql, params).await
    }

    pub async fn raw_execute(&self, sql: &str, params: &[PgBindValue]) -> Result<u64, DbError> {
        self.conn.execute(sql, params).await
    }

    pub async fn get_status(&self) -> ServiceStatus {
        let connected = match self.conn.ping().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "database ping failed");
                false
            }
        };
        ServiceStatus {
            connected,
            pool: self.conn.status(),
            entities: self.registry.len(),
            schema: self.settings.schema.clone(),
        }
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}
