//! Entity definition validation: identity, field shape and referential integrity.

use crate::computed::Expr;
use crate::error::{DbError, ValidationErrors};
use crate::model::{EntityDefinition, FieldType};
use std::collections::HashSet;

/// Validate a batch of definitions. `is_known` answers whether an entity outside the batch
/// (already registered) exists under a given id or name.
pub fn validate_entities<F>(entities: &[EntityDefinition], is_known: F) -> Result<(), DbError>
where
    F: Fn(&str) -> bool,
{
    let mut errors = ValidationErrors::new();
    let mut entity_ids = HashSet::new();

    for e in entities {
        if e.id.trim().is_empty() {
            errors.push(format!("entity '{}'", e.name), "id must not be empty");
        }
        if e.name.trim().is_empty() {
            errors.push(format!("entity '{}'", e.id), "name must not be empty");
        }
        if !entity_ids.insert(e.id.as_str()) {
            errors.push(format!("entity '{}'", e.id), "duplicate entity id");
        }

        let mut field_ids = HashSet::new();
        let mut columns = HashSet::new();
        for f in &e.fields {
            let path = format!("{}.{}", e.name, f.name);
            if f.id.trim().is_empty() || f.name.trim().is_empty() {
                errors.push(&path, "field id and name must not be empty");
                continue;
            }
            if !field_ids.insert(f.id.as_str()) {
                errors.push(&path, format!("duplicate field id '{}'", f.id));
            }
            let column = f.column_name();
            if matches!(column.as_str(), "id" | "created_at" | "updated_at" | "deleted_at") {
                errors.push(&path, format!("'{}' is reserved for the implicit column", column));
            }
            if !columns.insert(column) {
                errors.push(&path, "duplicate field name");
            }
            if f.field_type == FieldType::Enum && f.is_stored() && f.enum_options.is_empty() {
                errors.push(&path, "enum field needs at least one option");
            }
            if f.field_type == FieldType::Reference && f.reference.is_none() {
                errors.push(&path, "reference field needs a reference block");
            }
            if let Some(r) = &f.reference {
                let target = r.target_entity.as_str();
                let in_batch = entities.iter().any(|other| other.matches(target));
                if !in_batch && !is_known(target) {
                    errors.push(&path, format!("references unknown entity '{}'", target));
                }
            }
            if let Some(c) = &f.computed {
                if let Err(msg) = Expr::parse(&c.expression) {
                    errors.push(&path, format!("invalid expression: {}", msg));
                }
            }
            if let Some(pattern) = f.validation.as_ref().and_then(|v| v.pattern.as_deref()) {
                if regex::Regex::new(pattern).is_err() {
                    errors.push(&path, "invalid validation pattern");
                }
            }
        }

        for rel in &e.relationships {
            let path = format!("{}.{}", e.name, rel.name);
            for target in [rel.source_entity.as_str(), rel.target_entity.as_str()] {
                let in_batch = entities.iter().any(|other| other.matches(target));
                if !in_batch && !is_known(target) {
                    errors.push(&path, format!("relationship names unknown entity '{}'", target));
                }
            }
        }
    }

    errors.into_result()
}
