//! Record validation from field definitions. Runs before any SQL is built.

use crate::error::{DbError, ValidationErrors};
use crate::model::{EntityDefinition, FieldDefinition, FieldType};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Whether missing required fields are an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

/// Columns the engine manages itself; supplied values are ignored.
const MANAGED_COLUMNS: &[&str] = &["created_at", "updated_at", "deleted_at"];

/// Per-entity validator. Field patterns are compiled once, at registration.
#[derive(Clone, Debug, Default)]
pub struct RecordValidator {
    /// Field id -> compiled `validation.pattern`.
    patterns: HashMap<String, Regex>,
}

impl RecordValidator {
    pub fn for_entity(entity: &EntityDefinition) -> Result<Self, DbError> {
        let mut patterns = HashMap::new();
        for field in entity.column_fields() {
            let Some(pattern) = field.validation.as_ref().and_then(|v| v.pattern.as_deref()) else { continue };
            let re = Regex::new(pattern).map_err(|_| {
                DbError::Validation(ValidationErrors::single(
                    format!("{}.{}", entity.name, field.name),
                    "invalid validation pattern",
                ))
            })?;
            patterns.insert(field.id.clone(), re);
        }
        Ok(RecordValidator { patterns })
    }

    /// Validate `record` and return it keyed by column name. Keys may be field names or
    /// column names; computed, many-to-many and managed keys are dropped, unknown keys are errors.
    pub fn validate(
        &self,
        entity: &EntityDefinition,
        record: &Value,
        mode: WriteMode,
    ) -> Result<Map<String, Value>, DbError> {
        let Value::Object(input) = record else {
            return Err(DbError::Validation(ValidationErrors::single("record", "must be a JSON object")));
        };
        let mut errors = ValidationErrors::new();
        let mut out = Map::new();

        for (key, value) in input {
            if key == "id" {
                match mode {
                    WriteMode::Create if !value.is_null() => {
                        if value.as_str().and_then(|s| uuid::Uuid::parse_str(s).ok()).is_none() {
                            errors.push("id", "must be a valid UUID");
                        } else {
                            out.insert("id".into(), value.clone());
                        }
                    }
                    _ => {}
                }
                continue;
            }
            let Some(field) = entity.find_field(key) else {
                if !MANAGED_COLUMNS.contains(&key.as_str()) {
                    errors.push(key.as_str(), "unknown field");
                }
                continue;
            };
            if !field.has_column() {
                continue;
            }
            if value.is_null() {
                if field.required {
                    errors.push(&field.name, "must not be null");
                } else {
                    out.insert(field.column_name(), Value::Null);
                }
                continue;
            }
            match validate_field(field, self.patterns.get(&field.id), value) {
                Ok(()) => {
                    out.insert(field.column_name(), value.clone());
                }
                Err(message) => errors.push(&field.name, message),
            }
        }

        if mode == WriteMode::Create {
            for field in entity.column_fields().filter(|f| f.required && f.default_value.is_none()) {
                let present = out.contains_key(&field.column_name());
                let reported = errors.errors.iter().any(|e| e.field == field.name);
                if !present && !reported {
                    errors.push(&field.name, "is required");
                }
            }
        }

        errors.into_result()?;
        Ok(out)
    }
}

fn validate_field(field: &FieldDefinition, pattern: Option<&Regex>, v: &Value) -> Result<(), String> {
    check_type(field, v)?;
    if let Some(rule) = &field.validation {
        let (measure, unit) = match v {
            Value::Number(n) => (n.as_f64(), ""),
            Value::String(s) => (Some(s.chars().count() as f64), " characters"),
            _ => (None, ""),
        };
        if let Some(m) = measure {
            if let Some(min) = rule.min {
                if m < min {
                    return Err(format!("must be at least {}{}", min, unit));
                }
            }
            if let Some(max) = rule.max {
                if m > max {
                    return Err(format!("must be at most {}{}", max, unit));
                }
            }
        }
    }
    if let (Some(re), Some(s)) = (pattern, v.as_str()) {
        if !re.is_match(s) {
            return Err("does not match required pattern".into());
        }
    }
    Ok(())
}

fn check_type(field: &FieldDefinition, v: &Value) -> Result<(), String> {
    let as_str = || v.as_str().ok_or_else(|| "must be a string".to_string());
    match field.field_type {
        FieldType::String
        | FieldType::Text
        | FieldType::Richtext
        | FieldType::Phone
        | FieldType::Image
        | FieldType::File
        | FieldType::Color
        | FieldType::Barcode
        | FieldType::Signature => as_str().map(drop),
        FieldType::Rating | FieldType::Duration | FieldType::Unknown => match v {
            Value::Object(_) | Value::Array(_) => Err("must be a scalar".into()),
            _ => Ok(()),
        },
        FieldType::Email => {
            if is_email(as_str()?) {
                Ok(())
            } else {
                Err("must be a valid email".into())
            }
        }
        FieldType::Url => {
            if is_url(as_str()?) {
                Ok(())
            } else {
                Err("must be a valid URL".into())
            }
        }
        FieldType::Number | FieldType::Integer => {
            let integral = v.as_i64().is_some() || v.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false);
            if integral {
                Ok(())
            } else {
                Err("must be an integer".into())
            }
        }
        FieldType::Currency | FieldType::Decimal | FieldType::Percentage => {
            if v.is_number() {
                Ok(())
            } else {
                Err("must be a number".into())
            }
        }
        FieldType::Boolean => {
            if v.is_boolean() {
                Ok(())
            } else {
                Err("must be a boolean".into())
            }
        }
        FieldType::Date => {
            let s = as_str()?;
            if chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() || is_datetime(s) {
                Ok(())
            } else {
                Err("must be a date (YYYY-MM-DD)".into())
            }
        }
        FieldType::Datetime => {
            let s = as_str()?;
            if is_datetime(s) || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok() {
                Ok(())
            } else {
                Err("must be an ISO 8601 date-time".into())
            }
        }
        FieldType::Time => {
            let s = as_str()?;
            let ok = ["%H:%M:%S%.f", "%H:%M"]
                .iter()
                .any(|fmt| chrono::NaiveTime::parse_from_str(s, fmt).is_ok());
            if ok {
                Ok(())
            } else {
                Err("must be a time (HH:MM[:SS])".into())
            }
        }
        FieldType::Reference => {
            if uuid::Uuid::parse_str(as_str()?).is_ok() {
                Ok(())
            } else {
                Err("must be a valid UUID".into())
            }
        }
        FieldType::Enum => {
            let s = as_str()?;
            let options = field.enum_values();
            if options.contains(&s) {
                Ok(())
            } else {
                Err(format!("must be one of: {}", options.join(", ")))
            }
        }
        FieldType::Json | FieldType::Address | FieldType::Geolocation => Ok(()),
    }
}

fn is_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else { return false };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

fn is_url(s: &str) -> bool {
    let rest = s.strip_prefix("https://").or_else(|| s.strip_prefix("http://"));
    match rest {
        Some(r) => {
            let host = r.split(['/', '?', '#']).next().unwrap_or("");
            !host.is_empty() && !r.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

fn is_datetime(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelationKind;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn contact() -> EntityDefinition {
        EntityDefinition::new("contact", "Contact")
            .field(FieldDefinition::new("f1", "fullName", FieldType::String).required().range(Some(2.0), Some(40.0)))
            .field(FieldDefinition::new("f2", "email", FieldType::Email))
            .field(FieldDefinition::new("f3", "age", FieldType::Integer).range(Some(0.0), Some(150.0)))
            .field(FieldDefinition::new("f4", "tier", FieldType::Enum).options(["free", "pro"]))
            .field(FieldDefinition::new("f5", "companyId", FieldType::Reference).references("company", RelationKind::ManyToOne))
            .field(FieldDefinition::new("f6", "zip", FieldType::String).pattern(r"^\d{5}$"))
            .field(FieldDefinition::new("f7", "label", FieldType::String).computed("upper(fullName)", ["fullName"]))
    }

    fn check(entity: &EntityDefinition, record: &Value, mode: WriteMode) -> Result<Map<String, Value>, DbError> {
        RecordValidator::for_entity(entity).unwrap().validate(entity, record, mode)
    }

    fn messages(err: DbError) -> Vec<(String, String)> {
        match err {
            DbError::Validation(v) => v.errors.into_iter().map(|e| (e.field, e.message)).collect(),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn normalizes_keys_and_drops_computed() {
        let out = check(
            &contact(),
            &json!({"fullName": "Ada", "company_id": "0b6f4a5e-65a4-4f7c-9a8c-5d0e7b0c2a11", "label": "x", "updated_at": "now"}),
            WriteMode::Create,
        )
        .unwrap();
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["company_id", "full_name"]);
    }

    #[test]
    fn collects_every_problem() {
        let err = check(
            &contact(),
            &json!({"email": "nope", "age": 3.5, "tier": "gold", "companyId": "c1", "zip": "12", "shoe": 9}),
            WriteMode::Create,
        )
        .unwrap_err();
        let mut got = messages(err);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("age".to_string(), "must be an integer".to_string()),
                ("companyId".to_string(), "must be a valid UUID".to_string()),
                ("email".to_string(), "must be a valid email".to_string()),
                ("fullName".to_string(), "is required".to_string()),
                ("shoe".to_string(), "unknown field".to_string()),
                ("tier".to_string(), "must be one of: free, pro".to_string()),
                ("zip".to_string(), "does not match required pattern".to_string()),
            ]
        );
    }

    #[test]
    fn update_skips_required_but_rejects_null() {
        assert!(check(&contact(), &json!({"age": 30}), WriteMode::Update).is_ok());
        let err = check(&contact(), &json!({"fullName": null}), WriteMode::Update).unwrap_err();
        assert_eq!(messages(err), vec![("fullName".to_string(), "must not be null".to_string())]);
    }

    #[test]
    fn length_and_range_bounds() {
        let err = check(&contact(), &json!({"fullName": "A", "age": 200}), WriteMode::Update).unwrap_err();
        let mut got = messages(err);
        got.sort();
        assert_eq!(
            got,
            vec![
                ("age".to_string(), "must be at most 150".to_string()),
                ("fullName".to_string(), "must be at least 2 characters".to_string()),
            ]
        );
    }

    #[test]
    fn many_to_many_keys_are_not_columns() {
        let student = EntityDefinition::new("student", "Student")
            .field(FieldDefinition::new("s1", "name", FieldType::String).required())
            .field(
                FieldDefinition::new("s2", "courseIds", FieldType::Reference)
                    .references("course", RelationKind::ManyToMany)
                    .required(),
            );
        let out = check(
            &student,
            &json!({"name": "Ada", "courseIds": ["0b6f4a5e-65a4-4f7c-9a8c-5d0e7b0c2a11"]}),
            WriteMode::Create,
        )
        .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["name"]);
    }

    #[test]
    fn durations_and_ratings_accept_scalars() {
        let task = EntityDefinition::new("task", "Task")
            .field(FieldDefinition::new("t1", "estimate", FieldType::Duration))
            .field(FieldDefinition::new("t2", "stars", FieldType::Rating));
        let out = check(&task, &json!({"estimate": "PT1H", "stars": 4}), WriteMode::Create).unwrap();
        assert_eq!(out["estimate"], json!("PT1H"));
        let err = check(&task, &json!({"estimate": {"h": 1}}), WriteMode::Create).unwrap_err();
        assert_eq!(messages(err), vec![("estimate".to_string(), "must be a scalar".to_string())]);
    }

    #[test]
    fn bad_pattern_fails_at_construction() {
        let e = EntityDefinition::new("e", "Code").field(FieldDefinition::new("c1", "value", FieldType::String).pattern("(["));
        assert!(matches!(RecordValidator::for_entity(&e), Err(DbError::Validation(_))));
    }

    #[test]
    fn formats() {
        assert!(is_email("ada@example.com"));
        assert!(!is_email("ada@@example.com"));
        assert!(is_url("https://example.com/a?b"));
        assert!(!is_url("ftp://example.com"));
        assert!(is_datetime("2024-05-01T10:00:00Z"));
    }
}
