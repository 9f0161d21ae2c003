//! Relation discovery and resolution over the entity registry.

use crate::case::{strip_id_suffix, to_camel_case, to_snake_case};
use crate::computed::ComputedFieldsEngine;
use crate::connection::SqlExecutor;
use crate::error::DbError;
use crate::model::{FieldDefinition, RelationDefinition, RelationKind};
use crate::registry::{EntityRegistry, RegisteredEntity};
use crate::sql::{
    junction_definition, qualified_table, quoted, FilterOperator, PgBindValue, QueryBuilder, QueryFilter,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Where the key linking two entities lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "via", rename_all = "snake_case")]
pub enum RelationPath {
    /// Column on the source row holding the target id.
    SourceKey { column: String },
    /// Column on target rows holding the source id.
    TargetKey { column: String },
    Junction {
        table: String,
        source_column: String,
        target_column: String,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRelation {
    pub name: String,
    pub kind: RelationKind,
    pub source_entity: String,
    pub target_entity: String,
    pub path: RelationPath,
}

impl ResolvedRelation {
    /// True when the relation yields at most one record per source row.
    pub fn is_single(&self) -> bool {
        match &self.path {
            RelationPath::SourceKey { .. } => true,
            RelationPath::TargetKey { .. } => self.kind == RelationKind::OneToOne,
            RelationPath::Junction { .. } => false,
        }
    }
}

const SOURCE_ALIAS: &str = "__source_id";

pub struct RelationResolver<'r> {
    registry: &'r EntityRegistry,
}

impl<'r> RelationResolver<'r> {
    pub fn new(registry: &'r EntityRegistry) -> Self {
        RelationResolver { registry }
    }

    /// Explicit relationships first, then this entity's reference fields, then reference
    /// fields elsewhere that point here. The first relation under a name wins.
    pub fn get_relations(&self, entity: &str) -> Result<Vec<ResolvedRelation>, DbError> {
        let this = self.registry.get(entity)?;
        let all = self.registry.all();
        let mut out: Vec<ResolvedRelation> = Vec::new();
        let mut push = |r: ResolvedRelation| {
            if !out.iter().any(|o| o.name == r.name) {
                out.push(r);
            }
        };

        for owner in &all {
            for rel in &owner.definition.relationships {
                if this.definition.matches(&rel.source_entity) {
                    push(self.explicit(&this, rel)?);
                }
            }
        }

        for field in this.definition.stored_fields() {
            let Some(reference) = &field.reference else { continue };
            let target = self.registry.get(&reference.target_entity)?;
            push(ResolvedRelation {
                name: strip_id_suffix(&field.name),
                kind: reference.relationship,
                source_entity: this.definition.id.clone(),
                target_entity: target.definition.id.clone(),
                path: match reference.relationship {
                    RelationKind::ManyToMany => self.junction_path(&this, &target),
                    _ => RelationPath::SourceKey {
                        column: field.column_name(),
                    },
                },
            });
        }

        for other in &all {
            for field in other.definition.stored_fields() {
                let Some(reference) = &field.reference else { continue };
                if !this.definition.matches(&reference.target_entity) {
                    continue;
                }
                push(self.inverse(&this, other, field, reference.relationship));
            }
        }

        Ok(out)
    }

    fn explicit(&self, this: &RegisteredEntity, rel: &RelationDefinition) -> Result<ResolvedRelation, DbError> {
        let target = self.registry.get(&rel.target_entity)?;
        let path = match rel.kind {
            RelationKind::ManyToOne | RelationKind::OneToOne => RelationPath::SourceKey {
                column: rel
                    .foreign_key
                    .as_deref()
                    .map(to_snake_case)
                    .unwrap_or_else(|| format!("{}_id", target.definition.singular_name())),
            },
            RelationKind::OneToMany => RelationPath::TargetKey {
                column: rel
                    .back_reference
                    .as_deref()
                    .or(rel.foreign_key.as_deref())
                    .map(to_snake_case)
                    .unwrap_or_else(|| format!("{}_id", this.definition.singular_name())),
            },
            RelationKind::ManyToMany => self.junction_path(this, &target),
        };
        Ok(ResolvedRelation {
            name: rel.name.clone(),
            kind: rel.kind,
            source_entity: this.definition.id.clone(),
            target_entity: target.definition.id.clone(),
            path,
        })
    }

    fn inverse(
        &self,
        this: &RegisteredEntity,
        referrer: &RegisteredEntity,
        field: &FieldDefinition,
        kind: RelationKind,
    ) -> ResolvedRelation {
        let plural = to_camel_case(&to_snake_case(&referrer.definition.plural_or_default()));
        let (name, kind, path) = match kind {
            RelationKind::OneToOne => (
                to_camel_case(&referrer.definition.singular_name()),
                RelationKind::OneToOne,
                RelationPath::TargetKey {
                    column: field.column_name(),
                },
            ),
            RelationKind::ManyToMany => (plural, RelationKind::ManyToMany, self.junction_path(this, referrer)),
            RelationKind::ManyToOne | RelationKind::OneToMany => (
                plural,
                RelationKind::OneToMany,
                RelationPath::TargetKey {
                    column: field.column_name(),
                },
            ),
        };
        ResolvedRelation {
            name,
            kind,
            source_entity: this.definition.id.clone(),
            target_entity: referrer.definition.id.clone(),
            path,
        }
    }

    fn junction_path(&self, this: &RegisteredEntity, other: &RegisteredEntity) -> RelationPath {
        let j = junction_definition(&this.definition, &other.definition, self.registry.schema());
        let (source_column, target_column) = j.columns_for(&this.definition);
        RelationPath::Junction {
            table: j.name.clone(),
            source_column: source_column.to_string(),
            target_column: target_column.to_string(),
        }
    }

    pub fn find_relation(&self, entity: &str, name: &str) -> Result<ResolvedRelation, DbError> {
        self.get_relations(entity)?
            .into_iter()
            .find(|r| r.name == name || r.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| DbError::NotFound(format!("relation '{}' on entity '{}'", name, entity)))
    }

    /// Resolve one relation for one record: an object (or null) for single relations,
    /// an array otherwise.
    pub async fn resolve_relation(
        &self,
        exec: &dyn SqlExecutor,
        entity: &str,
        record: &Value,
        name: &str,
    ) -> Result<Value, DbError> {
        let relation = self.find_relation(entity, name)?;
        if let RelationPath::SourceKey { column } = &relation.path {
            let target = self.registry.get(&relation.target_entity)?;
            let Some(fk) = record.get(column).and_then(Value::as_str).and_then(parse_uuid) else {
                return Ok(Value::Null);
            };
            let rows = self.fetch_by(exec, &target, "id", &[fk.to_string()]).await?;
            return Ok(rows.into_iter().next().unwrap_or(Value::Null));
        }
        let Some(id) = record.get("id").and_then(Value::as_str) else {
            return Ok(if relation.is_single() { Value::Null } else { json!([]) });
        };
        let mut grouped = self.batch_for(exec, &relation, &[id.to_string()]).await?;
        let related = grouped.remove(id).unwrap_or_default();
        Ok(shape(&relation, related))
    }

    /// Resolve a relation for many source ids in a bounded number of queries. Every requested
    /// id gets an entry, empty when nothing is related.
    pub async fn batch_resolve_relation(
        &self,
        exec: &dyn SqlExecutor,
        entity: &str,
        record_ids: &[String],
        name: &str,
    ) -> Result<HashMap<String, Vec<Value>>, DbError> {
        let relation = self.find_relation(entity, name)?;
        self.batch_for(exec, &relation, record_ids).await
    }

    pub(crate) async fn batch_for(
        &self,
        exec: &dyn SqlExecutor,
        relation: &ResolvedRelation,
        record_ids: &[String],
    ) -> Result<HashMap<String, Vec<Value>>, DbError> {
        let mut out: HashMap<String, Vec<Value>> = record_ids.iter().map(|id| (id.clone(), Vec::new())).collect();
        // Rows come back with canonical (lowercase) ids; remember how the caller spelled each.
        let mut spelled: HashMap<String, Vec<String>> = HashMap::new();
        let mut ids: Vec<String> = Vec::new();
        for id in record_ids {
            let Some(canonical) = parse_uuid(id).map(|u| u.to_string()) else { continue };
            let spellings = spelled.entry(canonical.clone()).or_default();
            if spellings.is_empty() {
                ids.push(canonical);
            }
            if !spellings.contains(id) {
                spellings.push(id.clone());
            }
        }
        if ids.is_empty() {
            return Ok(out);
        }
        let source = self.registry.get(&relation.source_entity)?;
        let target = self.registry.get(&relation.target_entity)?;

        match &relation.path {
            RelationPath::SourceKey { column } => {
                let mut qb = QueryBuilder::new(&source.table);
                qb.columns(&["id", column.as_str()])?
                    .filter(&QueryFilter::new("id", FilterOperator::In, json!(ids)))?
                    .with_deleted();
                let q = qb.build_select();
                let links = exec.query(&q.sql, &q.params).await?;
                let fks: Vec<String> = links
                    .iter()
                    .filter_map(|r| r.get(column).and_then(Value::as_str).map(String::from))
                    .collect();
                if fks.is_empty() {
                    return Ok(out);
                }
                let targets = self.fetch_by(exec, &target, "id", &fks).await?;
                let by_id: HashMap<&str, &Value> = targets
                    .iter()
                    .filter_map(|t| t.get("id").and_then(Value::as_str).map(|id| (id, t)))
                    .collect();
                for link in &links {
                    let (Some(src), Some(fk)) = (
                        link.get("id").and_then(Value::as_str),
                        link.get(column).and_then(Value::as_str),
                    ) else {
                        continue;
                    };
                    if let Some(row) = by_id.get(fk) {
                        deliver(&mut out, &spelled, src, row);
                    }
                }
            }
            RelationPath::TargetKey { column } => {
                for row in self.fetch_by(exec, &target, column, &ids).await? {
                    if let Some(key) = row.get(column).and_then(Value::as_str) {
                        deliver(&mut out, &spelled, key, &row);
                    }
                }
            }
            RelationPath::Junction {
                table,
                source_column,
                target_column,
            } => {
                let mut sql = format!(
                    "SELECT j.{} AS {}, {} FROM {} j JOIN {} t ON t.\"id\" = j.{} WHERE j.{} = ANY($1::uuid[])",
                    quoted(source_column),
                    quoted(SOURCE_ALIAS),
                    target.table.projection_as("t"),
                    qualified_table(self.registry.schema(), table),
                    target.table.qualified_name(),
                    quoted(target_column),
                    quoted(source_column)
                );
                if target.table.is_soft_delete() {
                    sql.push_str(" AND t.\"deleted_at\" IS NULL");
                }
                sql.push_str(" ORDER BY t.\"id\"");
                let rows = exec.query(&sql, &[PgBindValue::TextArray(ids)]).await?;
                for mut row in rows {
                    let src = match row.as_object_mut().and_then(|m| m.remove(SOURCE_ALIAS)) {
                        Some(Value::String(s)) => s,
                        _ => continue,
                    };
                    ComputedFieldsEngine::apply(&target.definition, &target.computed, &mut row);
                    deliver(&mut out, &spelled, &src, &row);
                }
            }
        }
        Ok(out)
    }

    /// Live target rows whose `column` is one of `values`, computed fields applied.
    async fn fetch_by(
        &self,
        exec: &dyn SqlExecutor,
        target: &Arc<RegisteredEntity>,
        column: &str,
        values: &[String],
    ) -> Result<Vec<Value>, DbError> {
        let mut qb = QueryBuilder::new(&target.table);
        qb.filter(&QueryFilter::new(column, FilterOperator::In, json!(values)))?;
        let q = qb.build_select();
        let mut rows = exec.query(&q.sql, &q.params).await?;
        ComputedFieldsEngine::apply_all(&target.definition, &target.computed, &mut rows);
        Ok(rows)
    }

    /// Link `source_id` to `target_id` through the named relation.
    pub async fn create_relation(
        &self,
        exec: &dyn SqlExecutor,
        entity: &str,
        source_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<(), DbError> {
        let relation = self.find_relation(entity, name)?;
        match &relation.path {
            RelationPath::SourceKey { column } => {
                let source = self.registry.get(&relation.source_entity)?;
                self.set_key(exec, &source, source_id, column, json!(target_id), None).await
            }
            RelationPath::TargetKey { column } => {
                let target = self.registry.get(&relation.target_entity)?;
                self.set_key(exec, &target, target_id, column, json!(source_id), None).await
            }
            RelationPath::Junction {
                table,
                source_column,
                target_column,
            } => {
                let sql = format!(
                    "INSERT INTO {} ({}, {}) VALUES ($1::uuid, $2::uuid) ON CONFLICT DO NOTHING",
                    qualified_table(self.registry.schema(), table),
                    quoted(source_column),
                    quoted(target_column)
                );
                exec.execute(&sql, &[PgBindValue::from(source_id), PgBindValue::from(target_id)]).await?;
                Ok(())
            }
        }
    }

    /// Unlink; a link that does not exist is NotFound for key relations and a no-op for junctions.
    pub async fn remove_relation(
        &self,
        exec: &dyn SqlExecutor,
        entity: &str,
        source_id: &str,
        name: &str,
        target_id: &str,
    ) -> Result<(), DbError> {
        let relation = self.find_relation(entity, name)?;
        match &relation.path {
            RelationPath::SourceKey { column } => {
                let source = self.registry.get(&relation.source_entity)?;
                self.set_key(exec, &source, source_id, column, Value::Null, Some(target_id)).await
            }
            RelationPath::TargetKey { column } => {
                let target = self.registry.get(&relation.target_entity)?;
                self.set_key(exec, &target, target_id, column, Value::Null, Some(source_id)).await
            }
            RelationPath::Junction {
                table,
                source_column,
                target_column,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = $1::uuid AND {} = $2::uuid",
                    qualified_table(self.registry.schema(), table),
                    quoted(source_column),
                    quoted(target_column)
                );
                exec.execute(&sql, &[PgBindValue::from(source_id), PgBindValue::from(target_id)]).await?;
                Ok(())
            }
        }
    }

    /// `UPDATE owner SET column = value WHERE id = row_id [AND column = expected]`.
    async fn set_key(
        &self,
        exec: &dyn SqlExecutor,
        owner: &RegisteredEntity,
        row_id: &str,
        column: &str,
        value: Value,
        expected: Option<&str>,
    ) -> Result<(), DbError> {
        let mut qb = QueryBuilder::new(&owner.table);
        qb.filter(&QueryFilter::eq("id", json!(row_id)))?;
        if let Some(expected) = expected {
            qb.filter(&QueryFilter::eq(column, json!(expected)))?;
        }
        let mut changes = Map::new();
        changes.insert(column.to_string(), value);
        let q = qb.build_update(&changes)?;
        if exec.query(&q.sql, &q.params).await?.is_empty() {
            return Err(DbError::NotFound(format!("{} '{}'", owner.definition.name, row_id)));
        }
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Option<uuid::Uuid> {
    uuid::Uuid::parse_str(s).ok()
}

/// Push `row` under every spelling of the canonical source id `key`.
fn deliver(out: &mut HashMap<String, Vec<Value>>, spelled: &HashMap<String, Vec<String>>, key: &str, row: &Value) {
    let Some(spellings) = spelled.get(key) else { return };
    for id in spellings {
        if let Some(entry) = out.get_mut(id) {
            entry.push(row.clone());
        }
    }
}

fn shape(relation: &ResolvedRelation, mut related: Vec<Value>) -> Value {
    if relation.is_single() {
        if related.is_empty() {
            Value::Null
        } else {
            related.swap_remove(0)
        }
    } else {
        Value::Array(related)
    }
}

/// Attach a resolved batch to rows under `name`.
pub(crate) fn attach(relation: &ResolvedRelation, rows: &mut [Value], mut grouped: HashMap<String, Vec<Value>>) {
    for row in rows.iter_mut() {
        let id = row.get("id").and_then(Value::as_str).map(String::from);
        let related = id.and_then(|id| grouped.remove(&id)).unwrap_or_default();
        if let Value::Object(map) = row {
            map.insert(relation.name.clone(), shape(relation, related));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityDefinition, FieldDefinition, FieldType};
    use pretty_assertions::assert_eq;

    fn registry() -> EntityRegistry {
        let reg = EntityRegistry::new("public");
        reg.register(&[
            EntityDefinition::new("client", "Client"),
            EntityDefinition::new("profile", "Profile").field(
                FieldDefinition::new("p1", "clientId", FieldType::Reference).references("client", RelationKind::OneToOne),
            ),
            EntityDefinition::new("invoice", "Invoice").field(
                FieldDefinition::new("i1", "clientId", FieldType::Reference).references("client", RelationKind::ManyToOne),
            ),
            EntityDefinition::new("tag", "Tag").field(
                FieldDefinition::new("t1", "clientIds", FieldType::Reference).references("client", RelationKind::ManyToMany),
            ),
        ])
        .unwrap();
        reg
    }

    #[test]
    fn inverse_relations_are_named_after_the_referrer() {
        let reg = registry();
        let rels = RelationResolver::new(&reg).get_relations("client").unwrap();
        let summary: Vec<(&str, RelationKind)> = rels.iter().map(|r| (r.name.as_str(), r.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("profile", RelationKind::OneToOne),
                ("invoices", RelationKind::OneToMany),
                ("tags", RelationKind::ManyToMany),
            ]
        );
        assert!(rels[0].is_single());
        assert_eq!(
            rels[2].path,
            RelationPath::Junction {
                table: "client_tag".into(),
                source_column: "client_id".into(),
                target_column: "tag_id".into(),
            }
        );
    }

    #[test]
    fn implicit_relation_drops_id_suffix() {
        let reg = registry();
        let rel = RelationResolver::new(&reg).find_relation("invoice", "client").unwrap();
        assert_eq!(rel.path, RelationPath::SourceKey { column: "client_id".into() });
        assert!(rel.is_single());
    }

    #[test]
    fn junction_columns_flip_for_the_other_side() {
        let reg = registry();
        let rel = RelationResolver::new(&reg).find_relation("tag", "clients").unwrap();
        assert_eq!(
            rel.path,
            RelationPath::Junction {
                table: "client_tag".into(),
                source_column: "tag_id".into(),
                target_column: "client_id".into(),
            }
        );
    }

    #[test]
    fn explicit_relationship_wins_and_unknown_is_not_found() {
        let reg = registry();
        reg.register(&[EntityDefinition::new("client", "Client").relationship(RelationDefinition {
            name: "invoices".into(),
            kind: RelationKind::OneToMany,
            source_entity: "client".into(),
            target_entity: "invoice".into(),
            foreign_key: Some("billedClientId".into()),
            back_reference: None,
        })])
        .unwrap();
        let resolver = RelationResolver::new(&reg);
        let rel = resolver.find_relation("client", "invoices").unwrap();
        assert_eq!(rel.path, RelationPath::TargetKey { column: "billed_client_id".into() });
        assert!(matches!(resolver.find_relation("client", "payments"), Err(DbError::NotFound(_))));
    }
}
