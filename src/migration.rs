//! Schema lifecycle: in-place sync against stored snapshots, and versioned migration plans
//! with an append-only log.

use crate::connection::{Connection, SqlExecutor, Transaction};
use crate::error::DbError;
use crate::model::EntityDefinition;
use crate::sql::{
    generate_junction_table_sql, generate_migration_sql, is_destructive_statement, is_many_to_many,
    junction_definition, CompileContext, MigrationSql,
};
use crate::store::{self, MigrationRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Session advisory lock key shared by every process syncing the same database.
pub const ADVISORY_KEY: i64 = 0x6e65_6f5f_6462;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub entity: String,
    pub message: String,
}

/// Outcome of `sync_schema`, by entity id (junctions by table name).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub created: Vec<String>,
    pub updated: Vec<String>,
    pub unchanged: Vec<String>,
    pub junctions: Vec<String>,
    pub errors: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    Create,
    CreateJunction,
    Modify,
    Drop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Pending,
    Applied,
    Failed,
}

/// One versioned schema change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMigration {
    pub version: String,
    pub name: String,
    pub action: MigrationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub up: Vec<String>,
    pub down: Vec<String>,
    pub checksum: String,
    pub destructive: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Definition to store once applied (the new one; absent for junctions and drops).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<EntityDefinition>,
    /// Definition to restore on revert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<EntityDefinition>,
    pub status: MigrationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Step {
    name: String,
    action: MigrationAction,
    entity_id: Option<String>,
    sql: MigrationSql,
    snapshot: Option<EntityDefinition>,
    previous: Option<EntityDefinition>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MigrationPlan {
    pub migrations: Vec<SchemaMigration>,
}

impl MigrationPlan {
    /// Diff two entity sets. Versions are `YYYYMMDDHHMMSS_NNN` from `now`.
    pub fn build(old: &[EntityDefinition], new: &[EntityDefinition], schema: &str, now: DateTime<Utc>) -> Self {
        Self::build_avoiding(old, new, schema, now, &HashSet::new())
    }

    /// Like `build`, but the sequence number skips every version in `taken`, so a plan made
    /// in the same second as a logged one never reuses its version.
    pub fn build_avoiding(
        old: &[EntityDefinition],
        new: &[EntityDefinition],
        schema: &str,
        now: DateTime<Utc>,
        taken: &HashSet<String>,
    ) -> Self {
        let stamp = now.format("%Y%m%d%H%M%S").to_string();
        let old_ctx = CompileContext::new(schema).with_entities(old);
        let new_ctx = CompileContext::new(schema).with_entities(new);
        let old_by_id: HashMap<&str, &EntityDefinition> = old.iter().map(|e| (e.id.as_str(), e)).collect();
        let new_ids: HashSet<&str> = new.iter().map(|e| e.id.as_str()).collect();
        let mut steps: Vec<Step> = Vec::new();

        for entity in dependency_order(new) {
            if !old_by_id.contains_key(entity.id.as_str()) {
                let sql = generate_migration_sql(None, Some(entity), &new_ctx);
                steps.push(Step {
                    name: format!("create_{}", entity.table_name()),
                    action: MigrationAction::Create,
                    entity_id: Some(entity.id.clone()),
                    sql,
                    snapshot: Some(entity.clone()),
                    previous: None,
                });
            }
        }

        let existing_junctions: HashSet<String> = junction_pairs(old)
            .into_iter()
            .map(|(a, b)| junction_definition(a, b, schema).name)
            .collect();
        for (a, b) in junction_pairs(new) {
            let junction = junction_definition(a, b, schema);
            if existing_junctions.contains(&junction.name) {
                continue;
            }
            steps.push(Step {
                name: format!("create_{}", junction.name),
                action: MigrationAction::CreateJunction,
                entity_id: None,
                sql: MigrationSql {
                    up: generate_junction_table_sql(a, b, schema),
                    down: vec![format!("DROP TABLE IF EXISTS {} CASCADE", junction.qualified_name())],
                },
                snapshot: None,
                previous: None,
            });
        }

        for entity in new {
            let Some(prev) = old_by_id.get(entity.id.as_str()) else { continue };
            if *prev == entity {
                continue;
            }
            steps.push(Step {
                name: format!("update_{}", entity.table_name()),
                action: MigrationAction::Modify,
                entity_id: Some(entity.id.clone()),
                sql: generate_migration_sql(Some(*prev), Some(entity), &new_ctx),
                snapshot: Some(entity.clone()),
                previous: Some((*prev).clone()),
            });
        }

        let mut dropped: Vec<&EntityDefinition> = dependency_order(old)
            .into_iter()
            .filter(|e| !new_ids.contains(e.id.as_str()))
            .collect();
        dropped.reverse();
        for entity in dropped {
            steps.push(Step {
                name: format!("drop_{}", entity.table_name()),
                action: MigrationAction::Drop,
                entity_id: Some(entity.id.clone()),
                sql: generate_migration_sql(Some(entity), None, &old_ctx),
                snapshot: None,
                previous: Some(entity.clone()),
            });
        }

        let mut seq = 0usize;
        let mut next_version = || loop {
            seq += 1;
            let version = format!("{}_{:03}", stamp, seq);
            if !taken.contains(&version) {
                break version;
            }
        };
        let migrations = steps
            .into_iter()
            .map(|step| {
                let warnings: Vec<String> = step
                    .sql
                    .up
                    .iter()
                    .filter(|s| is_destructive_statement(s))
                    .map(|s| format!("{} discards data: {}", step.name, s))
                    .collect();
                SchemaMigration {
                    version: next_version(),
                    checksum: checksum(&step.sql.up),
                    destructive: !warnings.is_empty(),
                    name: step.name,
                    action: step.action,
                    entity_id: step.entity_id,
                    up: step.sql.up,
                    down: step.sql.down,
                    warnings,
                    snapshot: step.snapshot,
                    previous: step.previous,
                    status: MigrationStatus::Pending,
                    error: None,
                }
            })
            .collect();
        MigrationPlan { migrations }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn is_destructive(&self) -> bool {
        self.migrations.iter().any(|m| m.destructive)
    }

    pub fn warnings(&self) -> Vec<&str> {
        self.migrations
            .iter()
            .flat_map(|m| m.warnings.iter().map(String::as_str))
            .collect()
    }
}

/// SHA-256 over the statements, hex encoded.
pub fn checksum(statements: &[String]) -> String {
    let mut hasher = Sha256::new();
    for s in statements {
        hasher.update(s.as_bytes());
        hasher.update(b";\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Referenced entities before referrers; input order otherwise. Cycles fall back to input order.
fn dependency_order(entities: &[EntityDefinition]) -> Vec<&EntityDefinition> {
    let index_of = |key: &str| entities.iter().position(|e| e.matches(key));
    let deps: Vec<HashSet<usize>> = entities
        .iter()
        .enumerate()
        .map(|(i, e)| {
            e.column_fields()
                .filter_map(|f| f.reference.as_ref())
                .filter_map(|r| index_of(&r.target_entity))
                .filter(|&j| j != i)
                .collect()
        })
        .collect();

    let mut placed = vec![false; entities.len()];
    let mut out = Vec::with_capacity(entities.len());
    while out.len() < entities.len() {
        let ready = (0..entities.len()).find(|&i| !placed[i] && deps[i].iter().all(|&d| placed[d]));
        let next = match ready {
            Some(i) => i,
            None => match (0..entities.len()).find(|&i| !placed[i]) {
                Some(i) => i,
                None => break,
            },
        };
        placed[next] = true;
        out.push(&entities[next]);
    }
    out
}

/// Distinct entity pairs linked by a many_to_many reference field.
fn junction_pairs(entities: &[EntityDefinition]) -> Vec<(&EntityDefinition, &EntityDefinition)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entity in entities {
        for field in entity.stored_fields().filter(|f| is_many_to_many(f)) {
            let Some(target) = field
                .reference
                .as_ref()
                .and_then(|r| entities.iter().find(|e| e.matches(&r.target_entity)))
            else {
                continue;
            };
            let name = junction_definition(entity, target, "").name;
            if seen.insert(name) {
                out.push((entity, target));
            }
        }
    }
    out
}

async fn run_tolerant(exec: &dyn SqlExecutor, sql: &str) -> Result<(), DbError> {
    match exec.execute(sql, &[]).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => {
            tracing::warn!(error = %e, sql = %sql, "object already exists, continuing");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyOptions {
    pub allow_destructive: bool,
}

enum EntitySync {
    Created,
    Updated,
    Unchanged,
}

/// Owns schema changes for one database schema. Sync and apply are serialized in process
/// by a mutex and across processes by a Postgres advisory lock.
pub struct SchemaManager {
    conn: Connection,
    schema: String,
    serial: tokio::sync::Mutex<()>,
}

impl SchemaManager {
    pub fn new(conn: Connection, schema: impl Into<String>) -> Self {
        SchemaManager {
            conn,
            schema: schema.into(),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn initialize(&self) -> Result<(), DbError> {
        store::ensure_bookkeeping_tables(&self.conn, &self.schema).await?;
        tracing::info!(schema = %self.schema, "bookkeeping tables ready");
        Ok(())
    }

    /// Bring the database in line with `entities` directly, without a migration log entry.
    pub async fn sync_schema(&self, entities: &[EntityDefinition]) -> Result<SyncReport, DbError> {
        let _serial = self.serial.lock().await;
        let lock = self.conn.lock(ADVISORY_KEY).await?;
        self.initialize().await?;

        let snapshots: HashMap<String, EntityDefinition> = store::load_snapshots(&self.conn, &self.schema)
            .await?
            .into_iter()
            .map(|e| (e.id.clone(), e))
            .collect();
        let ctx = CompileContext::new(self.schema.as_str()).with_entities(entities);
        let mut report = SyncReport::default();

        for entity in dependency_order(entities) {
            match self.sync_entity(entity, snapshots.get(&entity.id), &ctx).await {
                Ok(EntitySync::Created) => report.created.push(entity.id.clone()),
                Ok(EntitySync::Updated) => report.updated.push(entity.id.clone()),
                Ok(EntitySync::Unchanged) => report.unchanged.push(entity.id.clone()),
                Err(e) => {
                    tracing::warn!(entity = %entity.id, error = %e, "entity sync failed");
                    report.errors.push(SyncFailure {
                        entity: entity.id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        for (a, b) in junction_pairs(entities) {
            let name = junction_definition(a, b, &self.schema).name;
            let mut result = Ok(());
            for sql in generate_junction_table_sql(a, b, &self.schema) {
                result = run_tolerant(&self.conn, &sql).await;
                if result.is_err() {
                    break;
                }
            }
            match result {
                Ok(()) => report.junctions.push(name),
                Err(e) => report.errors.push(SyncFailure {
                    entity: name,
                    message: e.to_string(),
                }),
            }
        }

        lock.release().await?;
        tracing::info!(
            created = report.created.len(),
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            junctions = report.junctions.len(),
            errors = report.errors.len(),
            "schema sync finished"
        );
        Ok(report)
    }

    async fn sync_entity(
        &self,
        entity: &EntityDefinition,
        snapshot: Option<&EntityDefinition>,
        ctx: &CompileContext,
    ) -> Result<EntitySync, DbError> {
        let previous = match snapshot {
            Some(old) if store::table_exists(&self.conn, &self.schema, &old.table_name()).await? => Some(old),
            Some(old) => {
                tracing::warn!(entity = %entity.id, table = %old.table_name(), "table missing, recreating");
                None
            }
            None => None,
        };
        let outcome = match previous {
            Some(old) if old == entity => EntitySync::Unchanged,
            Some(_) => EntitySync::Updated,
            None => EntitySync::Created,
        };
        if !matches!(outcome, EntitySync::Unchanged) {
            let sql = generate_migration_sql(previous, Some(entity), ctx);
            for statement in &sql.up {
                run_tolerant(&self.conn, statement).await?;
            }
        }
        store::upsert_snapshot(&self.conn, &self.schema, entity).await?;
        Ok(outcome)
    }

    pub fn generate_migration_plan(&self, old: &[EntityDefinition], new: &[EntityDefinition]) -> MigrationPlan {
        MigrationPlan::build(old, new, &self.schema, Utc::now())
    }

    /// Plan from the stored snapshots to `entities`.
    pub async fn plan_from_store(&self, entities: &[EntityDefinition]) -> Result<MigrationPlan, DbError> {
        self.initialize().await?;
        let stored = store::load_snapshots(&self.conn, &self.schema).await?;
        let taken: HashSet<String> = store::applied_checksums(&self.conn, &self.schema)
            .await?
            .into_keys()
            .collect();
        Ok(MigrationPlan::build_avoiding(&stored, entities, &self.schema, Utc::now(), &taken))
    }

    /// Apply in order, each in its own transaction. Returns every migration with its status;
    /// after the first failure the rest stay `Pending`.
    pub async fn apply_migrations(
        &self,
        migrations: &[SchemaMigration],
        options: ApplyOptions,
    ) -> Result<Vec<SchemaMigration>, DbError> {
        if !options.allow_destructive {
            if let Some(m) = migrations.iter().find(|m| m.destructive) {
                return Err(DbError::Migration {
                    migration: m.version.clone(),
                    message: format!("destructive migration {} needs allow_destructive", m.name),
                });
            }
        }

        let _serial = self.serial.lock().await;
        let lock = self.conn.lock(ADVISORY_KEY).await?;
        self.initialize().await?;
        let applied = store::applied_checksums(&self.conn, &self.schema).await?;
        if let Some(conflict) = checksum_conflict(migrations, &applied) {
            lock.release().await?;
            return Err(conflict);
        }

        let mut out: Vec<SchemaMigration> = migrations.to_vec();
        let mut failed = false;
        for m in out.iter_mut() {
            m.status = MigrationStatus::Pending;
            m.error = None;
            if failed {
                continue;
            }
            if applied.contains_key(&m.version) {
                tracing::info!(version = %m.version, "already applied, skipping");
                m.status = MigrationStatus::Applied;
                continue;
            }
            match self.apply_one(m).await {
                Ok(elapsed) => {
                    tracing::info!(version = %m.version, name = %m.name, elapsed_ms = elapsed, "migration applied");
                    m.status = MigrationStatus::Applied;
                }
                Err(e) => {
                    tracing::warn!(version = %m.version, name = %m.name, error = %e, "migration failed");
                    m.status = MigrationStatus::Failed;
                    m.error = Some(e.to_string());
                    failed = true;
                }
            }
        }

        lock.release().await?;
        Ok(out)
    }

    async fn apply_one(&self, m: &SchemaMigration) -> Result<i64, DbError> {
        let started = Instant::now();
        let tx = self.conn.begin_transaction().await?;
        let result = async {
            for statement in &m.up {
                tx.execute(statement, &[]).await?;
            }
            match (m.action, &m.snapshot, &m.entity_id) {
                (_, Some(snapshot), _) => store::upsert_snapshot(&tx, &self.schema, snapshot).await?,
                (MigrationAction::Drop, None, Some(id)) => store::delete_snapshot(&tx, &self.schema, id).await?,
                _ => {}
            }
            let elapsed = started.elapsed().as_millis() as i64;
            let record = MigrationRecord {
                version: m.version.clone(),
                name: m.name.clone(),
                applied_at: None,
                checksum: m.checksum.clone(),
                execution_time_ms: elapsed,
            };
            store::record_migration(&tx, &self.schema, &record).await?;
            Ok::<i64, DbError>(elapsed)
        }
        .await;
        finish(tx, &m.version, result).await
    }

    /// Run `down` in a transaction, restore the previous snapshot and log `<version>_revert`.
    pub async fn revert_migration(&self, m: &SchemaMigration) -> Result<(), DbError> {
        let _serial = self.serial.lock().await;
        let lock = self.conn.lock(ADVISORY_KEY).await?;
        self.initialize().await?;

        let started = Instant::now();
        let tx = self.conn.begin_transaction().await?;
        let result = async {
            for statement in &m.down {
                tx.execute(statement, &[]).await?;
            }
            match (&m.previous, &m.entity_id) {
                (Some(previous), _) => store::upsert_snapshot(&tx, &self.schema, previous).await?,
                (None, Some(id)) => store::delete_snapshot(&tx, &self.schema, id).await?,
                (None, None) => {}
            }
            let record = MigrationRecord {
                version: format!("{}_revert", m.version),
                name: format!("revert_{}", m.name),
                applied_at: None,
                checksum: checksum(&m.down),
                execution_time_ms: started.elapsed().as_millis() as i64,
            };
            store::record_migration(&tx, &self.schema, &record).await?;
            Ok::<(), DbError>(())
        }
        .await;
        finish(tx, &m.version, result).await?;
        lock.release().await?;
        tracing::info!(version = %m.version, name = %m.name, "migration reverted");
        Ok(())
    }

    pub async fn applied_migrations(&self) -> Result<Vec<MigrationRecord>, DbError> {
        store::applied_migrations(&self.conn, &self.schema).await
    }

    pub async fn stored_entities(&self) -> Result<Vec<EntityDefinition>, DbError> {
        store::load_snapshots(&self.conn, &self.schema).await
    }
}

/// A migration whose version is logged with different statements was planned separately
/// from the logged one; skipping it would silently drop its changes.
fn checksum_conflict(migrations: &[SchemaMigration], applied: &HashMap<String, String>) -> Option<DbError> {
    migrations.iter().find_map(|m| match applied.get(&m.version) {
        Some(logged) if *logged != m.checksum => Some(DbError::Migration {
            migration: m.version.clone(),
            message: format!(
                "{} was already applied with a different checksum ({} != {}); replan against the log",
                m.version, logged, m.checksum
            ),
        }),
        _ => None,
    })
}

/// Commit on success; otherwise roll back and wrap the cause as a migration error.
async fn finish<T>(tx: Transaction, version: &str, result: Result<T, DbError>) -> Result<T, DbError> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(DbError::Migration {
                migration: version.to_string(),
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDefinition, FieldType, RelationKind};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn client() -> EntityDefinition {
        EntityDefinition::new("client", "Client").field(FieldDefinition::new("c1", "name", FieldType::String).required())
    }

    fn invoice() -> EntityDefinition {
        EntityDefinition::new("invoice", "Invoice")
            .field(FieldDefinition::new("i1", "total", FieldType::Decimal))
            .field(FieldDefinition::new("i2", "clientId", FieldType::Reference).references("client", RelationKind::ManyToOne))
    }

    fn tag() -> EntityDefinition {
        EntityDefinition::new("tag", "Tag").field(FieldDefinition::new("t1", "label", FieldType::String))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn referenced_entities_come_first() {
        let entities = vec![invoice(), client()];
        let order: Vec<&str> = dependency_order(&entities).iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["client", "invoice"]);
    }

    #[test]
    fn cycles_do_not_stall() {
        let a = EntityDefinition::new("a", "A")
            .field(FieldDefinition::new("a1", "bId", FieldType::Reference).references("b", RelationKind::ManyToOne));
        let b = EntityDefinition::new("b", "B")
            .field(FieldDefinition::new("b1", "aId", FieldType::Reference).references("a", RelationKind::ManyToOne));
        let entities = vec![a, b];
        assert_eq!(dependency_order(&entities).len(), 2);
    }

    #[test]
    fn plan_orders_creates_junctions_modifies_drops() {
        let old = vec![client(), tag()];
        let renamed = EntityDefinition::new("client", "Client")
            .field(FieldDefinition::new("c1", "name", FieldType::String).required())
            .field(FieldDefinition::new("c2", "tagIds", FieldType::Reference).references("tag2", RelationKind::ManyToMany));
        let tag2 = EntityDefinition::new("tag2", "Label");
        let new = vec![invoice(), renamed, tag2];

        let plan = MigrationPlan::build(&old, &new, "public", now());
        let summary: Vec<(&str, &str, MigrationAction)> = plan
            .migrations
            .iter()
            .map(|m| (m.version.as_str(), m.name.as_str(), m.action))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("20240309140507_001", "create_invoices", MigrationAction::Create),
                ("20240309140507_002", "create_labels", MigrationAction::Create),
                ("20240309140507_003", "create_client_label", MigrationAction::CreateJunction),
                ("20240309140507_004", "update_clients", MigrationAction::Modify),
                ("20240309140507_005", "drop_tags", MigrationAction::Drop),
            ]
        );
        assert!(plan.is_destructive());
        assert!(plan.migrations[4].destructive);
        assert!(!plan.migrations[0].destructive);
        assert_eq!(plan.warnings().len(), 1);
        assert_eq!(plan.migrations[3].previous.as_ref().map(|e| e.fields.len()), Some(1));
    }

    #[test]
    fn identical_sets_plan_nothing() {
        let set = vec![client(), invoice()];
        assert!(MigrationPlan::build(&set, &set, "public", now()).is_empty());
    }

    #[test]
    fn checksum_tracks_statements() {
        let a = checksum(&["SELECT 1".to_string()]);
        assert_eq!(a.len(), 64);
        assert_eq!(a, checksum(&["SELECT 1".to_string()]));
        assert_ne!(a, checksum(&["SELECT 2".to_string()]));
    }

    #[test]
    fn junction_pairs_are_deduplicated() {
        let a = EntityDefinition::new("a", "Student")
            .field(FieldDefinition::new("a1", "courseIds", FieldType::Reference).references("b", RelationKind::ManyToMany));
        let b = EntityDefinition::new("b", "Course")
            .field(FieldDefinition::new("b1", "studentIds", FieldType::Reference).references("a", RelationKind::ManyToMany));
        let entities = vec![a, b];
        assert_eq!(junction_pairs(&entities).len(), 1);
    }

    #[test]
    fn versions_skip_logged_ones() {
        let taken: HashSet<String> = ["20240309140507_001", "20240309140507_003"]
            .into_iter()
            .map(String::from)
            .collect();
        let plan = MigrationPlan::build_avoiding(&[], &[client(), invoice()], "public", now(), &taken);
        let versions: Vec<&str> = plan.migrations.iter().map(|m| m.version.as_str()).collect();
        assert_eq!(versions, vec!["20240309140507_002", "20240309140507_004"]);
    }

    #[test]
    fn same_version_with_other_statements_conflicts() {
        let plan = MigrationPlan::build(&[], &[client()], "public", now());
        let mut applied = HashMap::new();
        applied.insert(plan.migrations[0].version.clone(), plan.migrations[0].checksum.clone());
        assert!(checksum_conflict(&plan.migrations, &applied).is_none());

        let other = MigrationPlan::build(&[], &[tag()], "public", now());
        match checksum_conflict(&other.migrations, &applied) {
            Some(DbError::Migration { migration, message }) => {
                assert_eq!(migration, "20240309140507_001");
                assert!(message.contains("different checksum"));
            }
            other => panic!("expected a migration error, got {:?}", other),
        }
    }

    #[test]
    fn many_to_many_set_plans_a_junction_and_no_column() {
        let student = EntityDefinition::new("student", "Student")
            .field(FieldDefinition::new("s1", "name", FieldType::String))
            .field(FieldDefinition::new("s2", "courseIds", FieldType::Reference).references("course", RelationKind::ManyToMany));
        let course = EntityDefinition::new("course", "Course").field(FieldDefinition::new("k1", "title", FieldType::String));
        let plan = MigrationPlan::build(&[], &[student, course], "public", now());

        let actions: Vec<MigrationAction> = plan.migrations.iter().map(|m| m.action).collect();
        assert_eq!(
            actions,
            vec![MigrationAction::Create, MigrationAction::Create, MigrationAction::CreateJunction]
        );
        let create_students = plan.migrations.iter().find(|m| m.name == "create_students").unwrap();
        assert!(create_students.up.iter().all(|s| !s.contains("course_id")));
        let junction = &plan.migrations[2];
        assert_eq!(junction.name, "create_course_student");
        assert!(junction.up.iter().any(|s| s.contains("REFERENCES")));
    }
}
