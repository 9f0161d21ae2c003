//! Entity definitions as handed over by the generator (camelCase JSON).

use crate::case::to_snake_case;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    /// Stable across renames; the snapshot and registry key.
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plural_name: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDefinition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relationships: Vec<RelationDefinition>,
    #[serde(default)]
    pub timestamps: TimestampPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_mode: Option<DeleteMode>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimestampPolicy {
    #[serde(default = "default_true")]
    pub created_at: bool,
    #[serde(default = "default_true")]
    pub updated_at: bool,
    #[serde(default)]
    pub deleted_at: bool,
}

impl Default for TimestampPolicy {
    fn default() -> Self {
        TimestampPolicy {
            created_at: true,
            updated_at: true,
            deleted_at: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// What `delete` does to a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// `DELETE FROM`.
    Hard,
    /// Stamp `deleted_at`; the row stays and is hidden from default reads.
    Soft,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Richtext,
    Number,
    Integer,
    Currency,
    Decimal,
    Percentage,
    Boolean,
    Date,
    Datetime,
    Time,
    Email,
    Phone,
    Url,
    Image,
    File,
    Reference,
    Enum,
    Json,
    Address,
    Geolocation,
    Rating,
    Color,
    Barcode,
    Signature,
    Duration,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    #[serde(alias = "oneToOne")]
    OneToOne,
    #[serde(alias = "oneToMany")]
    OneToMany,
    #[serde(alias = "manyToOne")]
    ManyToOne,
    #[serde(alias = "manyToMany")]
    ManyToMany,
}

impl Default for RelationKind {
    fn default() -> Self {
        RelationKind::ManyToOne
    }
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::OneToOne => "one_to_one",
            RelationKind::OneToMany => "one_to_many",
            RelationKind::ManyToOne => "many_to_one",
            RelationKind::ManyToMany => "many_to_many",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnumOption {
    Plain(String),
    Labeled {
        value: String,
        #[serde(default)]
        label: Option<String>,
    },
}

impl EnumOption {
    pub fn value(&self) -> &str {
        match self {
            EnumOption::Plain(v) => v,
            EnumOption::Labeled { value, .. } => value,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldValidation {
    /// Numeric lower bound; minimum length for text-like fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Numeric upper bound; maximum length for text-like fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceConfig {
    /// Id or name of the referenced entity.
    pub target_entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_field: Option<String>,
    #[serde(default)]
    pub relationship: RelationKind,
    #[serde(default)]
    pub cascade_delete: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComputedConfig {
    pub expression: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<FieldValidation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_options: Vec<EnumOption>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computed: Option<ComputedConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RelationKind,
    pub source_entity: String,
    pub target_entity: String,
    /// Column holding the key. Lives on the source for *-to-one kinds, on the target for one_to_many.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_reference: Option<String>,
}

impl EntityDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        EntityDefinition {
            id: id.into(),
            name: name.into(),
            plural_name: None,
            fields: Vec::new(),
            relationships: Vec::new(),
            timestamps: TimestampPolicy::default(),
            delete_mode: None,
        }
    }

    pub fn plural(mut self, plural: impl Into<String>) -> Self {
        self.plural_name = Some(plural.into());
        self
    }

    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relationship(mut self, relation: RelationDefinition) -> Self {
        self.relationships.push(relation);
        self
    }

    pub fn timestamps(mut self, timestamps: TimestampPolicy) -> Self {
        self.timestamps = timestamps;
        self
    }

    pub fn soft_delete(mut self) -> Self {
        self.timestamps.deleted_at = true;
        self.delete_mode = Some(DeleteMode::Soft);
        self
    }

    /// Plural name as given, or the name with an `s` appended.
    pub fn plural_or_default(&self) -> String {
        match &self.plural_name {
            Some(p) if !p.trim().is_empty() => p.clone(),
            _ => format!("{}s", self.name),
        }
    }

    pub fn table_name(&self) -> String {
        to_snake_case(&self.plural_or_default())
    }

    pub fn singular_name(&self) -> String {
        to_snake_case(&self.name)
    }

    /// The effective delete mode: explicit `deleteMode`, else soft when `deletedAt` is on.
    pub fn effective_delete_mode(&self) -> DeleteMode {
        match self.delete_mode {
            Some(mode) => mode,
            None if self.timestamps.deleted_at => DeleteMode::Soft,
            None => DeleteMode::Hard,
        }
    }

    pub fn has_deleted_at(&self) -> bool {
        self.timestamps.deleted_at || self.delete_mode == Some(DeleteMode::Soft)
    }

    /// Look up a field by id, name or column name.
    pub fn find_field(&self, key: &str) -> Option<&FieldDefinition> {
        self.fields
            .iter()
            .find(|f| f.id == key || f.name == key)
            .or_else(|| self.fields.iter().find(|f| f.column_name() == key))
    }

    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_stored())
    }

    /// Fields backed by a column on this entity's table. Many-to-many links live in a junction.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.has_column())
    }

    pub fn computed_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.is_computed())
    }

    /// True when `key` names this entity by id or (case-insensitive) name.
    pub fn matches(&self, key: &str) -> bool {
        self.id == key || self.name.eq_ignore_ascii_case(key)
    }
}

impl FieldDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, field_type: FieldType) -> Self {
        FieldDefinition {
            id: id.into(),
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            indexed: false,
            default_value: None,
            validation: None,
            enum_options: Vec::new(),
            reference: None,
            computed: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        let v = self.validation.get_or_insert_with(FieldValidation::default);
        v.min = min;
        v.max = max;
        self
    }

    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.validation.get_or_insert_with(FieldValidation::default).pattern = Some(pattern.into());
        self
    }

    pub fn options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_options = options.into_iter().map(|o| EnumOption::Plain(o.into())).collect();
        self
    }

    pub fn references(mut self, target: impl Into<String>, kind: RelationKind) -> Self {
        self.reference = Some(ReferenceConfig {
            target_entity: target.into(),
            display_field: None,
            relationship: kind,
            cascade_delete: false,
        });
        self
    }

    pub fn cascade(mut self) -> Self {
        if let Some(r) = self.reference.as_mut() {
            r.cascade_delete = true;
        }
        self
    }

    pub fn computed<I, S>(mut self, expression: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.computed = Some(ComputedConfig {
            expression: expression.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn column_name(&self) -> String {
        to_snake_case(&self.name)
    }

    pub fn is_computed(&self) -> bool {
        self.computed
            .as_ref()
            .map(|c| !c.expression.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn is_stored(&self) -> bool {
        !self.is_computed()
    }

    pub fn is_many_to_many(&self) -> bool {
        self.reference
            .as_ref()
            .map(|r| r.relationship == RelationKind::ManyToMany)
            .unwrap_or(false)
    }

    pub fn has_column(&self) -> bool {
        self.is_stored() && !self.is_many_to_many()
    }

    pub fn enum_values(&self) -> Vec<&str> {
        self.enum_options.iter().map(EnumOption::value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_generator_json() {
        let raw = json!({
            "id": "ent_invoice",
            "name": "Invoice",
            "pluralName": "Invoices",
            "fields": [
                {"id": "f1", "name": "clientId", "type": "reference",
                 "reference": {"targetEntity": "client", "relationship": "many_to_one", "cascadeDelete": true}},
                {"id": "f2", "name": "status", "type": "enum",
                 "enumOptions": ["draft", {"value": "sent", "label": "Sent"}]},
                {"id": "f3", "name": "signatureBlob", "type": "hologram"},
                {"id": "f4", "name": "total", "type": "currency",
                 "computed": {"expression": "subtotal * 1.2", "dependencies": ["subtotal"]}}
            ],
            "timestamps": {"deletedAt": true}
        });
        let e: EntityDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(e.table_name(), "invoices");
        assert_eq!(e.fields[0].column_name(), "client_id");
        assert!(e.fields[0].reference.as_ref().unwrap().cascade_delete);
        assert_eq!(e.fields[1].enum_values(), vec!["draft", "sent"]);
        assert_eq!(e.fields[2].field_type, FieldType::Unknown);
        assert!(e.fields[3].is_computed());
        assert!(e.timestamps.created_at && e.timestamps.updated_at && e.timestamps.deleted_at);
        assert_eq!(e.effective_delete_mode(), DeleteMode::Soft);
    }

    #[test]
    fn explicit_delete_mode_wins() {
        let mut e = EntityDefinition::new("e", "Note");
        e.timestamps.deleted_at = true;
        e.delete_mode = Some(DeleteMode::Hard);
        assert_eq!(e.effective_delete_mode(), DeleteMode::Hard);
        assert!(e.has_deleted_at());
    }

    #[test]
    fn plural_fallback() {
        let e = EntityDefinition::new("e", "LineItem");
        assert_eq!(e.table_name(), "line_items");
        assert_eq!(e.singular_name(), "line_item");
    }

    #[test]
    fn many_to_many_fields_have_no_column() {
        let e = EntityDefinition::new("student", "Student")
            .field(FieldDefinition::new("s1", "name", FieldType::String))
            .field(FieldDefinition::new("s2", "courseIds", FieldType::Reference).references("course", RelationKind::ManyToMany))
            .field(FieldDefinition::new("s3", "mentorId", FieldType::Reference).references("mentor", RelationKind::ManyToOne));
        let columns: Vec<&str> = e.column_fields().map(|f| f.name.as_str()).collect();
        assert_eq!(columns, vec!["name", "mentorId"]);
        assert_eq!(e.stored_fields().count(), 3);
    }

    #[test]
    fn find_field_by_any_key() {
        let e = EntityDefinition::new("e", "Invoice")
            .field(FieldDefinition::new("f1", "unitPrice", FieldType::Currency));
        assert!(e.find_field("f1").is_some());
        assert!(e.find_field("unitPrice").is_some());
        assert!(e.find_field("unit_price").is_some());
        assert!(e.find_field("price").is_none());
    }
}
