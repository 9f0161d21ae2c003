//! neo-db: schema-driven PostgreSQL engine. Entity definitions become tables, typed queries,
//! relation lookups, computed fields and versioned migrations.

pub mod case;
pub mod computed;
pub mod connection;
pub mod database;
pub mod error;
pub mod migration;
pub mod model;
pub mod registry;
pub mod relations;
pub mod service;
pub mod settings;
pub mod sql;
pub mod store;

pub use computed::ComputedFieldsEngine;
pub use connection::{Connection, PoolStatus, SqlExecutor, Transaction};
pub use database::{DatabaseService, ServiceStatus};
pub use error::{ConstraintKind, DbError, FieldError, QueryError, ValidationErrors};
pub use migration::{
    ApplyOptions, MigrationAction, MigrationPlan, MigrationStatus, SchemaManager, SchemaMigration, SyncReport,
};
pub use model::{DeleteMode, EntityDefinition, FieldDefinition, FieldType, RelationDefinition, RelationKind};
pub use registry::EntityRegistry;
pub use relations::{RelationResolver, ResolvedRelation};
pub use service::CrudService;
pub use settings::DatabaseSettings;
pub use sql::{FilterOperator, FindOptions, QueryBuilder, QueryFilter, QueryPagination, QuerySort};
pub use store::ensure_database_exists;
