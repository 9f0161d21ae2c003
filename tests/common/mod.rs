#![allow(dead_code)]

use async_trait::async_trait;
use neo_db::model::{EntityDefinition, FieldDefinition, FieldType, RelationKind};
use neo_db::sql::PgBindValue;
use neo_db::{DbError, EntityRegistry, SqlExecutor};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

pub const C1: &str = "0b6f4a5e-65a4-4f7c-9a8c-5d0e7b0c2a11";
pub const C2: &str = "7c1d2e3f-1111-4a2b-8c3d-9e8f7a6b5c4d";
pub const I1: &str = "11111111-2222-4333-8444-555555555551";
pub const I2: &str = "11111111-2222-4333-8444-555555555552";
pub const I3: &str = "11111111-2222-4333-8444-555555555553";

#[derive(Clone, Debug)]
pub struct Call {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

/// Records every statement and answers from a queue of canned row sets (empty when drained).
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<Call>>,
    responses: Mutex<VecDeque<Vec<Value>>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, rows: Vec<Value>) -> &Self {
        self.responses.lock().unwrap().push_back(rows);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, sql: &str, params: &[PgBindValue]) -> Vec<Value> {
        self.calls.lock().unwrap().push(Call {
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        self.responses.lock().unwrap().pop_front().unwrap_or_default()
    }
}

#[async_trait]
impl SqlExecutor for RecordingExecutor {
    async fn query(&self, sql: &str, params: &[PgBindValue]) -> Result<Vec<Value>, DbError> {
        Ok(self.record(sql, params))
    }

    async fn execute(&self, sql: &str, params: &[PgBindValue]) -> Result<u64, DbError> {
        Ok(self.record(sql, params).len() as u64)
    }
}

pub fn client() -> EntityDefinition {
    EntityDefinition::new("client", "Client")
        .field(FieldDefinition::new("c-name", "name", FieldType::String).required())
        .field(FieldDefinition::new("c-email", "email", FieldType::Email).unique())
}

pub fn invoice() -> EntityDefinition {
    EntityDefinition::new("invoice", "Invoice")
        .field(FieldDefinition::new("i-total", "total", FieldType::Decimal).required())
        .field(FieldDefinition::new("i-client", "clientId", FieldType::Reference).references("client", RelationKind::ManyToOne))
        .field(FieldDefinition::new("i-taxed", "taxed", FieldType::Decimal).computed("total * 2", ["total"]))
        .soft_delete()
}

pub fn billing_registry() -> EntityRegistry {
    let registry = EntityRegistry::new("public");
    registry.register(&[client(), invoice()]).unwrap();
    registry
}

pub const S1: &str = "5e1a2b3c-4d5e-4f60-8a71-b2c3d4e5f601";
pub const K1: &str = "6f2b3c4d-5e6f-4071-9b82-c3d4e5f60712";

/// Registered before its target so ordering cannot lean on input order.
pub fn student() -> EntityDefinition {
    EntityDefinition::new("student", "Student")
        .field(FieldDefinition::new("s-name", "name", FieldType::String).required())
        .field(FieldDefinition::new("s-courses", "courseIds", FieldType::Reference).references("course", RelationKind::ManyToMany))
}

pub fn course() -> EntityDefinition {
    EntityDefinition::new("course", "Course").field(FieldDefinition::new("k-title", "title", FieldType::String).required())
}

pub fn school_registry() -> EntityRegistry {
    let registry = EntityRegistry::new("public");
    registry.register(&[student(), course()]).unwrap();
    registry
}
