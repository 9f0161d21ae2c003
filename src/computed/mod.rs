//! Computed (virtual) fields: never stored, evaluated over a materialized row.

mod expr;

pub use expr::{BinaryOp, EvalError, Expr, Function, UnaryOp};

use crate::case::to_snake_case;
use crate::error::QueryError;
use crate::model::EntityDefinition;
use serde_json::Value;

/// A computed field with its expression parsed.
#[derive(Clone, Debug)]
pub struct ComputedField {
    pub field_id: String,
    pub name: String,
    /// Key the value is written under in returned records.
    pub output_key: String,
    pub expr: Expr,
    pub dependencies: Vec<String>,
}

pub struct ComputedFieldsEngine;

impl ComputedFieldsEngine {
    /// Parse every computed expression of the entity, in field order.
    pub fn compile(entity: &EntityDefinition) -> Result<Vec<ComputedField>, QueryError> {
        let mut out = Vec::new();
        for f in entity.computed_fields() {
            let Some(cfg) = f.computed.as_ref() else { continue };
            let expr = Expr::parse(&cfg.expression)
                .map_err(|e| QueryError::Expression(format!("{}.{}: {}", entity.name, f.name, e)))?;
            out.push(ComputedField {
                field_id: f.id.clone(),
                name: f.name.clone(),
                output_key: f.column_name(),
                expr,
                dependencies: cfg.dependencies.clone(),
            });
        }
        Ok(out)
    }

    /// Evaluate computed fields into `record` (a JSON object). A missing or null dependency
    /// or an evaluation fault yields null; this never fails the read.
    pub fn apply(entity: &EntityDefinition, fields: &[ComputedField], record: &mut Value) {
        if fields.is_empty() {
            return;
        }
        let Value::Object(map) = record else { return };
        for cf in fields {
            let value = {
                let lookup = |name: &str| -> Option<Value> {
                    if let Some(v) = map.get(name) {
                        return Some(v.clone());
                    }
                    let snake = to_snake_case(name);
                    if let Some(v) = map.get(&snake) {
                        return Some(v.clone());
                    }
                    entity
                        .find_field(name)
                        .and_then(|f| map.get(&f.column_name()))
                        .cloned()
                };
                let absent = |d: &String| matches!(lookup(d.as_str()), None | Some(Value::Null));
                match cf.dependencies.iter().find(|d| absent(d)) {
                    Some(missing) => {
                        tracing::debug!(field = %cf.name, dependency = %missing, "computed dependency missing");
                        Value::Null
                    }
                    None => match cf.expr.eval(&lookup) {
                        Ok(v) => v,
                        Err(e) => {
                            tracing::warn!(entity = %entity.name, field = %cf.name, error = %e, "computed field evaluation failed");
                            Value::Null
                        }
                    },
                }
            };
            map.insert(cf.output_key.clone(), value);
        }
    }

    /// Apply to every row of a result set.
    pub fn apply_all(entity: &EntityDefinition, fields: &[ComputedField], rows: &mut [Value]) {
        for row in rows.iter_mut() {
            Self::apply(entity, fields, row);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldDefinition, FieldType};
    use serde_json::json;

    fn line_item() -> EntityDefinition {
        EntityDefinition::new("line_item", "LineItem")
            .field(FieldDefinition::new("f1", "unitPrice", FieldType::Currency))
            .field(FieldDefinition::new("f2", "quantity", FieldType::Integer))
            .field(
                FieldDefinition::new("f3", "lineTotal", FieldType::Currency)
                    .computed("unitPrice * quantity", ["unitPrice", "quantity"]),
            )
            .field(
                FieldDefinition::new("f4", "label", FieldType::String)
                    .computed("lineTotal > 100 ? 'large' : 'small'", ["lineTotal"]),
            )
    }

    #[test]
    fn evaluates_in_field_order_with_column_keys() {
        let entity = line_item();
        let fields = ComputedFieldsEngine::compile(&entity).unwrap();
        let mut row = json!({"id": "1", "unit_price": 40, "quantity": 3});
        ComputedFieldsEngine::apply(&entity, &fields, &mut row);
        assert_eq!(row["line_total"], json!(120));
        assert_eq!(row["label"], json!("large"));
    }

    #[test]
    fn missing_dependency_yields_null() {
        let entity = line_item();
        let fields = ComputedFieldsEngine::compile(&entity).unwrap();
        let mut row = json!({"id": "1", "unit_price": 40});
        ComputedFieldsEngine::apply(&entity, &fields, &mut row);
        assert_eq!(row["line_total"], Value::Null);
        assert_eq!(row["label"], Value::Null);
    }

    #[test]
    fn null_column_counts_as_missing() {
        let entity = line_item();
        let fields = ComputedFieldsEngine::compile(&entity).unwrap();
        let mut row = json!({"id": "1", "unit_price": 40, "quantity": null, "line_total": null});
        ComputedFieldsEngine::apply(&entity, &fields, &mut row);
        assert_eq!(row["line_total"], Value::Null);
        assert_eq!(row["label"], Value::Null);
    }

    #[test]
    fn evaluation_fault_yields_null() {
        let entity = EntityDefinition::new("e", "Ratio")
            .field(FieldDefinition::new("a", "a", FieldType::Number))
            .field(FieldDefinition::new("b", "b", FieldType::Number))
            .field(FieldDefinition::new("r", "ratio", FieldType::Decimal).computed("a / b", ["a", "b"]));
        let fields = ComputedFieldsEngine::compile(&entity).unwrap();
        let mut row = json!({"a": 1, "b": 0});
        ComputedFieldsEngine::apply(&entity, &fields, &mut row);
        assert_eq!(row["ratio"], Value::Null);
    }

    #[test]
    fn bad_expression_is_rejected_at_compile() {
        let entity = EntityDefinition::new("e", "Broken")
            .field(FieldDefinition::new("x", "x", FieldType::Number).computed("1 +", Vec::<String>::new()));
        let err = ComputedFieldsEngine::compile(&entity).unwrap_err();
        assert!(matches!(err, QueryError::Expression(_)));
    }
}
