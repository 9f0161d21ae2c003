//! In-memory registry of entity definitions and their compiled artifacts.

use crate::computed::{ComputedField, ComputedFieldsEngine};
use crate::error::DbError;
use crate::model::{validate_entities, EntityDefinition};
use crate::service::RecordValidator;
use crate::sql::{compile_entity, CompileContext, TableDefinition};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A definition together with its compiled table, parsed computed fields and validator.
#[derive(Debug)]
pub struct RegisteredEntity {
    pub definition: EntityDefinition,
    pub table: TableDefinition,
    pub computed: Vec<ComputedField>,
    pub validator: RecordValidator,
}

#[derive(Default)]
struct Inner {
    entities: HashMap<String, Arc<RegisteredEntity>>,
    /// Lower-cased name and table name -> entity id.
    aliases: HashMap<String, String>,
    /// Registration order of entity ids.
    order: Vec<String>,
}

/// Entity lookup by id, lower-cased name or table name. Safe to share; registration takes
/// a write lock and replaces the compiled set.
pub struct EntityRegistry {
    schema: String,
    inner: RwLock<Inner>,
}

impl EntityRegistry {
    pub fn new(schema: impl Into<String>) -> Self {
        EntityRegistry {
            schema: schema.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, DbError> {
        self.inner
            .read()
            .map_err(|_| DbError::Config("entity registry lock poisoned".into()))
    }

    /// Validate and register (or replace) a batch. Every table is recompiled so references
    /// pick up renamed targets.
    pub fn register(&self, batch: &[EntityDefinition]) -> Result<(), DbError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| DbError::Config("entity registry lock poisoned".into()))?;

        validate_entities(batch, |key| {
            inner.entities.contains_key(key) || inner.aliases.contains_key(&key.to_lowercase())
        })?;

        let mut definitions: Vec<EntityDefinition> = inner
            .order
            .iter()
            .filter(|id| !batch.iter().any(|b| &b.id == *id))
            .filter_map(|id| inner.entities.get(id).map(|e| e.definition.clone()))
            .collect();
        definitions.extend(batch.iter().cloned());

        let ctx = CompileContext::new(self.schema.clone()).with_entities(&definitions);
        let mut next = Inner::default();
        for def in definitions {
            let computed = ComputedFieldsEngine::compile(&def)?;
            let validator = RecordValidator::for_entity(&def)?;
            let table = compile_entity(&def, &ctx);
            next.aliases.insert(def.name.to_lowercase(), def.id.clone());
            next.aliases.insert(table.name.clone(), def.id.clone());
            next.order.push(def.id.clone());
            next.entities.insert(
                def.id.clone(),
                Arc::new(RegisteredEntity {
                    definition: def,
                    table,
                    computed,
                    validator,
                }),
            );
        }
        *inner = next;
        tracing::debug!(registered = batch.len(), total = inner.order.len(), "entities registered");
        Ok(())
    }

    pub fn find(&self, key: &str) -> Option<Arc<RegisteredEntity>> {
        let inner = self.read().ok()?;
        if let Some(e) = inner.entities.get(key) {
            return Some(Arc::clone(e));
        }
        inner
            .aliases
            .get(&key.to_lowercase())
            .and_then(|id| inner.entities.get(id))
            .map(Arc::clone)
    }

    /// Like `find`, NotFound when absent.
    pub fn get(&self, key: &str) -> Result<Arc<RegisteredEntity>, DbError> {
        self.find(key)
            .ok_or_else(|| DbError::NotFound(format!("entity '{}'", key)))
    }

    /// All entities in registration order.
    pub fn all(&self) -> Vec<Arc<RegisteredEntity>> {
        match self.read() {
            Ok(inner) => inner
                .order
                .iter()
                .filter_map(|id| inner.entities.get(id).map(Arc::clone))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn definitions(&self) -> Vec<EntityDefinition> {
        self.all().iter().map(|e| e.definition.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().map(|i| i.order.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
