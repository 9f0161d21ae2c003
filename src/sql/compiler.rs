//! Compile entity definitions into table definitions and DDL.

use super::ident::{literal, qualified_table, quoted};
use crate::case::to_snake_case;
use crate::model::{DeleteMode, EntityDefinition, FieldDefinition, FieldType};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Physical column types the compiler emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SqlType {
    Uuid,
    Text,
    Varchar,
    Integer,
    Decimal,
    Boolean,
    Date,
    Timestamptz,
    Jsonb,
}

impl SqlType {
    pub fn for_field(field_type: FieldType) -> SqlType {
        match field_type {
            FieldType::String | FieldType::Text | FieldType::Richtext => SqlType::Text,
            FieldType::Number | FieldType::Integer => SqlType::Integer,
            FieldType::Currency | FieldType::Decimal | FieldType::Percentage => SqlType::Decimal,
            FieldType::Boolean => SqlType::Boolean,
            FieldType::Date => SqlType::Date,
            FieldType::Datetime => SqlType::Timestamptz,
            FieldType::Reference => SqlType::Uuid,
            FieldType::Enum => SqlType::Varchar,
            FieldType::Json | FieldType::Address | FieldType::Geolocation => SqlType::Jsonb,
            FieldType::Email
            | FieldType::Phone
            | FieldType::Url
            | FieldType::Image
            | FieldType::File
            | FieldType::Color
            | FieldType::Barcode
            | FieldType::Signature
            | FieldType::Time
            | FieldType::Rating
            | FieldType::Duration
            | FieldType::Unknown => SqlType::Text,
        }
    }

    /// Type as written in DDL.
    pub fn ddl(&self) -> &'static str {
        match self {
            SqlType::Uuid => "UUID",
            SqlType::Text => "TEXT",
            SqlType::Varchar => "VARCHAR(255)",
            SqlType::Integer => "INTEGER",
            SqlType::Decimal => "DECIMAL",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Timestamptz => "TIMESTAMPTZ",
            SqlType::Jsonb => "JSONB",
        }
    }

    /// Type name used in `$n::type` placeholder casts.
    pub fn cast(&self) -> &'static str {
        match self {
            SqlType::Uuid => "uuid",
            SqlType::Text => "text",
            SqlType::Varchar => "varchar",
            SqlType::Integer => "integer",
            SqlType::Decimal => "numeric",
            SqlType::Boolean => "boolean",
            SqlType::Date => "date",
            SqlType::Timestamptz => "timestamptz",
            SqlType::Jsonb => "jsonb",
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(self, SqlType::Text | SqlType::Varchar)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum OnDelete {
    Cascade,
    SetNull,
}

impl OnDelete {
    fn as_sql(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "CASCADE",
            OnDelete::SetNull => "SET NULL",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForeignKey {
    pub schema: String,
    pub table: String,
    pub on_delete: OnDelete,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConstraintDefinition {
    pub name: String,
    /// Boolean expression of a CHECK constraint.
    pub check: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ColumnDefinition {
    pub name: String,
    /// Field id and name for columns backed by a field; None for implicit columns.
    pub field_id: Option<String>,
    pub field_name: Option<String>,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    /// Rendered SQL default expression.
    pub default: Option<String>,
    pub references: Option<ForeignKey>,
    pub checks: Vec<ConstraintDefinition>,
}

impl ColumnDefinition {
    fn implicit(name: &str, sql_type: SqlType, nullable: bool, default: Option<&str>) -> Self {
        ColumnDefinition {
            name: name.to_string(),
            field_id: None,
            field_name: None,
            sql_type,
            nullable,
            primary_key: false,
            unique: false,
            default: default.map(str::to_string),
            references: None,
            checks: Vec::new(),
        }
    }

    /// Expression used in a SELECT / RETURNING list. DECIMAL is read back as float8.
    pub fn projection(&self) -> String {
        let q = quoted(&self.name);
        match self.sql_type {
            SqlType::Decimal => format!("{}::float8 AS {}", q, q),
            _ => q,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexDefinition {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub where_clause: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TableDefinition {
    pub entity_id: String,
    pub schema: String,
    pub name: String,
    pub columns: Vec<ColumnDefinition>,
    pub indexes: Vec<IndexDefinition>,
    pub delete_mode: DeleteMode,
    pub created_at: bool,
    pub updated_at: bool,
    pub deleted_at: bool,
}

impl TableDefinition {
    pub fn qualified_name(&self) -> String {
        qualified_table(&self.schema, &self.name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Resolve a caller-supplied key (column name, field name or field id) to its column.
    pub fn resolve_column(&self, key: &str) -> Option<&ColumnDefinition> {
        self.column(key)
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.field_name.as_deref() == Some(key) || c.field_id.as_deref() == Some(key))
            })
            .or_else(|| self.column(&to_snake_case(key)))
    }

    pub fn constraints(&self) -> impl Iterator<Item = &ConstraintDefinition> {
        self.columns.iter().flat_map(|c| c.checks.iter())
    }

    /// SELECT / RETURNING list over every column.
    pub fn projection(&self) -> String {
        self.columns
            .iter()
            .map(ColumnDefinition::projection)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Projection with every column qualified by a table alias, for joins.
    pub fn projection_as(&self, alias: &str) -> String {
        let a = quoted(alias);
        self.columns
            .iter()
            .map(|c| {
                let q = quoted(&c.name);
                match c.sql_type {
                    SqlType::Decimal => format!("{}.{}::float8 AS {}", a, q, q),
                    _ => format!("{}.{} AS {}", a, q, q),
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn is_soft_delete(&self) -> bool {
        self.delete_mode == DeleteMode::Soft && self.deleted_at
    }
}

/// Names the compiler needs from outside the entity being compiled.
#[derive(Clone, Debug, Default)]
pub struct CompileContext {
    pub schema: String,
    tables: HashMap<String, String>,
}

impl CompileContext {
    pub fn new(schema: impl Into<String>) -> Self {
        CompileContext {
            schema: schema.into(),
            tables: HashMap::new(),
        }
    }

    pub fn with_entities<'a>(mut self, entities: impl IntoIterator<Item = &'a EntityDefinition>) -> Self {
        for e in entities {
            self.add(e);
        }
        self
    }

    pub fn add(&mut self, entity: &EntityDefinition) {
        let table = entity.table_name();
        self.tables.insert(entity.id.clone(), table.clone());
        self.tables.insert(entity.name.to_lowercase(), table);
    }

    /// Table of a referenced entity; unknown targets fall back to the pluralized snake name.
    pub fn target_table(&self, target: &str) -> String {
        self.tables
            .get(target)
            .or_else(|| self.tables.get(&target.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| format!("{}s", to_snake_case(target)))
    }
}

/// Compile an entity into its table definition. Computed and many-to-many fields produce
/// no column.
pub fn compile_entity(entity: &EntityDefinition, ctx: &CompileContext) -> TableDefinition {
    let table = entity.table_name();
    let mut columns = Vec::with_capacity(entity.fields.len() + 4);
    let mut indexes = Vec::new();

    let mut id = ColumnDefinition::implicit("id", SqlType::Uuid, false, Some("gen_random_uuid()"));
    id.primary_key = true;
    columns.push(id);

    for field in entity.column_fields() {
        let col = compile_field(field, &table, ctx);
        // A UNIQUE constraint already carries its own index.
        if !col.unique && (field.indexed || col.references.is_some()) {
            indexes.push(IndexDefinition {
                name: format!("idx_{}_{}", table, col.name),
                columns: vec![col.name.clone()],
                unique: false,
                where_clause: None,
            });
        }
        columns.push(col);
    }

    let deleted_at = entity.has_deleted_at();
    if entity.timestamps.created_at {
        columns.push(ColumnDefinition::implicit("created_at", SqlType::Timestamptz, false, Some("NOW()")));
    }
    if entity.timestamps.updated_at {
        columns.push(ColumnDefinition::implicit("updated_at", SqlType::Timestamptz, false, Some("NOW()")));
    }
    if deleted_at {
        columns.push(ColumnDefinition::implicit("deleted_at", SqlType::Timestamptz, true, None));
        indexes.push(soft_delete_index(&table));
    }

    TableDefinition {
        entity_id: entity.id.clone(),
        schema: ctx.schema.clone(),
        name: table,
        columns,
        indexes,
        delete_mode: if deleted_at { entity.effective_delete_mode() } else { DeleteMode::Hard },
        created_at: entity.timestamps.created_at,
        updated_at: entity.timestamps.updated_at,
        deleted_at,
    }
}

fn soft_delete_index(table: &str) -> IndexDefinition {
    IndexDefinition {
        name: format!("idx_{}_deleted_at", table),
        columns: vec!["deleted_at".to_string()],
        unique: false,
        where_clause: Some("\"deleted_at\" IS NULL".to_string()),
    }
}

fn compile_field(field: &FieldDefinition, table: &str, ctx: &CompileContext) -> ColumnDefinition {
    let name = field.column_name();
    let sql_type = SqlType::for_field(field.field_type);
    let mut checks = Vec::new();

    if field.field_type == FieldType::Enum && !field.enum_options.is_empty() {
        let options = field
            .enum_values()
            .into_iter()
            .map(literal)
            .collect::<Vec<_>>()
            .join(", ");
        checks.push(ConstraintDefinition {
            name: format!("chk_{}_{}_enum", table, name),
            check: format!("{} IN ({})", quoted(&name), options),
        });
    }
    if matches!(sql_type, SqlType::Integer | SqlType::Decimal) {
        if let Some(v) = &field.validation {
            let mut bounds = Vec::new();
            if let Some(min) = v.min {
                bounds.push(format!("{} >= {}", quoted(&name), min));
            }
            if let Some(max) = v.max {
                bounds.push(format!("{} <= {}", quoted(&name), max));
            }
            if !bounds.is_empty() {
                checks.push(ConstraintDefinition {
                    name: format!("chk_{}_{}_range", table, name),
                    check: bounds.join(" AND "),
                });
            }
        }
    }

    let references = field.reference.as_ref().map(|r| ForeignKey {
        schema: ctx.schema.clone(),
        table: ctx.target_table(&r.target_entity),
        on_delete: if r.cascade_delete { OnDelete::Cascade } else { OnDelete::SetNull },
    });

    ColumnDefinition {
        default: field.default_value.as_ref().and_then(|v| default_literal(v, field.field_type, sql_type)),
        name,
        field_id: Some(field.id.clone()),
        field_name: Some(field.name.clone()),
        sql_type,
        nullable: !field.required,
        primary_key: false,
        unique: field.unique,
        references,
        checks,
    }
}

/// Render a JSON default as a SQL literal for the column type.
fn default_literal(v: &Value, field_type: FieldType, sql_type: SqlType) -> Option<String> {
    if sql_type == SqlType::Jsonb {
        return match v {
            Value::Null => None,
            other => Some(format!("{}::jsonb", literal(&other.to_string()))),
        };
    }
    match v {
        Value::Null => None,
        Value::Bool(true) => Some("TRUE".to_string()),
        Value::Bool(false) => Some("FALSE".to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if s.eq_ignore_ascii_case("now") => match field_type {
            FieldType::Date => Some("CURRENT_DATE".to_string()),
            FieldType::Datetime => Some("NOW()".to_string()),
            FieldType::Time => Some("LOCALTIME(0)::text".to_string()),
            _ => Some(literal(s)),
        },
        Value::String(s) => Some(literal(s)),
        other => Some(literal(&other.to_string())),
    }
}

fn foreign_key_clause(fk: &ForeignKey) -> String {
    format!(
        "REFERENCES {}(\"id\") ON DELETE {}",
        qualified_table(&fk.schema, &fk.table),
        fk.on_delete.as_sql()
    )
}

fn fk_constraint_name(table: &str, column: &str) -> String {
    format!("fk_{}_{}", table, column)
}

fn unique_constraint_name(table: &str, column: &str) -> String {
    format!("uq_{}_{}", table, column)
}

/// Full column definition as used in CREATE TABLE and ADD COLUMN.
fn column_ddl(table: &str, col: &ColumnDefinition) -> String {
    let mut parts = vec![quoted(&col.name), col.sql_type.ddl().to_string()];
    if col.primary_key {
        parts.push("PRIMARY KEY".to_string());
    } else if !col.nullable {
        parts.push("NOT NULL".to_string());
    }
    if let Some(d) = &col.default {
        parts.push(format!("DEFAULT {}", d));
    }
    if col.unique {
        parts.push(format!("CONSTRAINT {} UNIQUE", quoted(&unique_constraint_name(table, &col.name))));
    }
    if let Some(fk) = &col.references {
        parts.push(format!(
            "CONSTRAINT {} {}",
            quoted(&fk_constraint_name(table, &col.name)),
            foreign_key_clause(fk)
        ));
    }
    for c in &col.checks {
        parts.push(format!("CONSTRAINT {} CHECK ({})", quoted(&c.name), c.check));
    }
    parts.join(" ")
}

fn create_index_sql(table: &TableDefinition, index: &IndexDefinition) -> String {
    let cols = index.columns.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ");
    let mut sql = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quoted(&index.name),
        table.qualified_name(),
        cols
    );
    if let Some(w) = &index.where_clause {
        sql.push_str(" WHERE ");
        sql.push_str(w);
    }
    sql
}

fn drop_index_sql(schema: &str, index: &IndexDefinition) -> String {
    format!("DROP INDEX IF EXISTS {}", qualified_table(schema, &index.name))
}

pub const TOUCH_FUNCTION: &str = "neo_touch_updated_at";

fn touch_function_sql(schema: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION {}() RETURNS TRIGGER AS $$
BEGIN
  NEW."updated_at" = NOW();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql"#,
        qualified_table(schema, TOUCH_FUNCTION)
    )
}

fn trigger_name(table: &str) -> String {
    format!("trg_{}_updated_at", table)
}

fn drop_trigger_sql(table: &TableDefinition) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}",
        quoted(&trigger_name(&table.name)),
        table.qualified_name()
    )
}

fn touch_trigger_sql(table: &TableDefinition) -> Vec<String> {
    vec![
        touch_function_sql(&table.schema),
        drop_trigger_sql(table),
        format!(
            "CREATE TRIGGER {} BEFORE UPDATE ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            quoted(&trigger_name(&table.name)),
            table.qualified_name(),
            qualified_table(&table.schema, TOUCH_FUNCTION)
        ),
    ]
}

fn create_schema_sql(schema: &str) -> Option<String> {
    if schema == crate::settings::DEFAULT_SCHEMA {
        None
    } else {
        Some(format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(schema)))
    }
}

/// Statements creating the table, its indexes and the updated_at trigger.
pub fn generate_create_table_sql(table: &TableDefinition) -> Vec<String> {
    let mut out = Vec::new();
    out.extend(create_schema_sql(&table.schema));
    let col_defs: Vec<String> = table.columns.iter().map(|c| column_ddl(&table.name, c)).collect();
    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
        table.qualified_name(),
        col_defs.join(",\n  ")
    ));
    for index in &table.indexes {
        out.push(create_index_sql(table, index));
    }
    if table.updated_at {
        out.extend(touch_trigger_sql(table));
    }
    out
}

pub fn generate_drop_table_sql(table: &TableDefinition) -> Vec<String> {
    vec![format!("DROP TABLE IF EXISTS {} CASCADE", table.qualified_name())]
}

/// Paired forward and rollback statements for one schema change.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MigrationSql {
    pub up: Vec<String>,
    pub down: Vec<String>,
}

impl MigrationSql {
    pub fn is_empty(&self) -> bool {
        self.up.is_empty()
    }

    /// Whether `up` discards data.
    pub fn is_destructive(&self) -> bool {
        self.up.iter().any(|s| is_destructive_statement(s))
    }
}

pub fn is_destructive_statement(sql: &str) -> bool {
    let upper = sql.to_ascii_uppercase();
    upper.contains("DROP COLUMN") || upper.contains("DROP TABLE")
}

/// Collects forward statements and their inverses; `down` runs the inverses newest first.
struct Diff {
    up: Vec<String>,
    down: Vec<String>,
}

impl Diff {
    fn step(&mut self, up: impl Into<String>, down: impl Into<String>) {
        self.up.push(up.into());
        self.down.push(down.into());
    }

    fn steps(&mut self, up: Vec<String>, down: Vec<String>) {
        self.up.extend(up);
        self.down.extend(down.into_iter().rev());
    }

    fn finish(mut self) -> MigrationSql {
        self.down.reverse();
        MigrationSql { up: self.up, down: self.down }
    }
}

/// Statements turning `old` into `new`. Either side may be absent (create / drop).
pub fn generate_migration_sql(
    old: Option<&EntityDefinition>,
    new: Option<&EntityDefinition>,
    ctx: &CompileContext,
) -> MigrationSql {
    match (old, new) {
        (None, None) => MigrationSql::default(),
        (None, Some(n)) => {
            let table = compile_entity(n, ctx);
            MigrationSql {
                up: generate_create_table_sql(&table),
                down: generate_drop_table_sql(&table),
            }
        }
        (Some(o), None) => {
            let table = compile_entity(o, ctx);
            MigrationSql {
                up: generate_drop_table_sql(&table),
                down: generate_create_table_sql(&table),
            }
        }
        (Some(o), Some(n)) => diff_tables(&compile_entity(o, ctx), &compile_entity(n, ctx)),
    }
}

fn diff_tables(old: &TableDefinition, new: &TableDefinition) -> MigrationSql {
    let mut diff = Diff { up: Vec::new(), down: Vec::new() };
    let q_new = new.qualified_name();

    if old.name != new.name {
        diff.step(
            format!("ALTER TABLE {} RENAME TO {}", old.qualified_name(), quoted(&new.name)),
            format!("ALTER TABLE {} RENAME TO {}", q_new, quoted(&old.name)),
        );
    }

    let old_by_field: HashMap<&str, &ColumnDefinition> = old
        .columns
        .iter()
        .filter_map(|c| c.field_id.as_deref().map(|id| (id, c)))
        .collect();
    let new_field_ids: Vec<&str> = new.columns.iter().filter_map(|c| c.field_id.as_deref()).collect();

    for col in &new.columns {
        let Some(field_id) = col.field_id.as_deref() else { continue };
        match old_by_field.get(field_id) {
            None => add_column(&mut diff, new, col),
            Some(prev) => alter_column(&mut diff, old, new, prev, col),
        }
    }

    for col in &old.columns {
        let Some(field_id) = col.field_id.as_deref() else { continue };
        if !new_field_ids.contains(&field_id) {
            let indexes: Vec<&IndexDefinition> = old.indexes.iter().filter(|i| i.columns == [col.name.clone()]).collect();
            let mut down = vec![format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
                q_new,
                column_ddl(&new.name, col)
            )];
            down.extend(indexes.iter().map(|i| create_index_sql(new, i)));
            diff.steps(
                vec![format!("ALTER TABLE {} DROP COLUMN IF EXISTS {}", q_new, quoted(&col.name))],
                down,
            );
        }
    }

    for name in ["created_at", "updated_at"] {
        match (old.column(name), new.column(name)) {
            (None, Some(col)) => add_column(&mut diff, new, col),
            (Some(col), None) => drop_implicit_column(&mut diff, new, col),
            _ => {}
        }
    }
    match (old.updated_at, new.updated_at) {
        (false, true) => diff.steps(touch_trigger_sql(new), vec![drop_trigger_sql(new)]),
        (true, false) => diff.steps(vec![drop_trigger_sql(new)], touch_trigger_sql(new)),
        _ => {}
    }
    match (old.deleted_at, new.deleted_at) {
        (false, true) => {
            let col = ColumnDefinition::implicit("deleted_at", SqlType::Timestamptz, true, None);
            add_column(&mut diff, new, &col);
            let index = soft_delete_index(&new.name);
            diff.step(create_index_sql(new, &index), drop_index_sql(&new.schema, &index));
        }
        (true, false) => {
            let col = ColumnDefinition::implicit("deleted_at", SqlType::Timestamptz, true, None);
            let index = soft_delete_index(&new.name);
            diff.steps(
                vec![format!("ALTER TABLE {} DROP COLUMN IF EXISTS \"deleted_at\"", q_new)],
                vec![
                    format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}", q_new, column_ddl(&new.name, &col)),
                    create_index_sql(new, &index),
                ],
            );
        }
        _ => {}
    }

    diff.finish()
}

fn add_column(diff: &mut Diff, table: &TableDefinition, col: &ColumnDefinition) {
    let q = table.qualified_name();
    diff.step(
        format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}", q, column_ddl(&table.name, col)),
        format!("ALTER TABLE {} DROP COLUMN IF EXISTS {}", q, quoted(&col.name)),
    );
    for index in table.indexes.iter().filter(|i| i.columns == [col.name.clone()]) {
        diff.step(create_index_sql(table, index), drop_index_sql(&table.schema, index));
    }
}

fn drop_implicit_column(diff: &mut Diff, table: &TableDefinition, col: &ColumnDefinition) {
    let q = table.qualified_name();
    diff.step(
        format!("ALTER TABLE {} DROP COLUMN IF EXISTS {}", q, quoted(&col.name)),
        format!("ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}", q, column_ddl(&table.name, col)),
    );
}

fn alter_column(
    diff: &mut Diff,
    old_table: &TableDefinition,
    table: &TableDefinition,
    prev: &ColumnDefinition,
    col: &ColumnDefinition,
) {
    let q = table.qualified_name();
    let name = quoted(&col.name);

    if prev.name != col.name {
        diff.step(
            format!("ALTER TABLE {} RENAME COLUMN {} TO {}", q, quoted(&prev.name), name),
            format!("ALTER TABLE {} RENAME COLUMN {} TO {}", q, name, quoted(&prev.name)),
        );
    }

    // Checks reference the column by name, so they go before a type change and return after it.
    let checks_changed = prev.checks.iter().map(|c| &c.check).ne(col.checks.iter().map(|c| &c.check));
    if checks_changed {
        for c in &prev.checks {
            diff.step(
                format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", q, quoted(&c.name)),
                format!("ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})", q, quoted(&c.name), renamed_check(c, prev, col)),
            );
        }
    }

    if prev.sql_type != col.sql_type {
        diff.step(
            format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                q,
                name,
                col.sql_type.ddl(),
                name,
                col.sql_type.cast()
            ),
            format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                q,
                name,
                prev.sql_type.ddl(),
                name,
                prev.sql_type.cast()
            ),
        );
    }

    if checks_changed {
        for c in &col.checks {
            diff.step(
                format!("ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})", q, quoted(&c.name), c.check),
                format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", q, quoted(&c.name)),
            );
        }
    }

    if prev.nullable != col.nullable {
        let (up, down) = if col.nullable { ("DROP", "SET") } else { ("SET", "DROP") };
        diff.step(
            format!("ALTER TABLE {} ALTER COLUMN {} {} NOT NULL", q, name, up),
            format!("ALTER TABLE {} ALTER COLUMN {} {} NOT NULL", q, name, down),
        );
    }

    if prev.default != col.default {
        let set = |d: &Option<String>| match d {
            Some(d) => format!("ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}", q, name, d),
            None => format!("ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT", q, name),
        };
        diff.step(set(&col.default), set(&prev.default));
    }

    if prev.unique != col.unique {
        let old_uq = quoted(&unique_constraint_name(&old_table.name, &prev.name));
        let new_uq = quoted(&unique_constraint_name(&table.name, &col.name));
        let add = |c: &str| format!("ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})", q, c, name);
        let drop = |c: &str| format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", q, c);
        if col.unique {
            diff.step(add(&new_uq), drop(&new_uq));
        } else {
            diff.step(drop(&old_uq), add(&old_uq));
        }
    }

    if prev.references != col.references {
        let old_fk = quoted(&fk_constraint_name(&old_table.name, &prev.name));
        let new_fk = quoted(&fk_constraint_name(&table.name, &col.name));
        let add = |c: &str, fk: &ForeignKey| {
            format!("ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) {}", q, c, name, foreign_key_clause(fk))
        };
        let drop = |c: &str| format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", q, c);
        let mut up = Vec::new();
        let mut down = Vec::new();
        if let Some(fk) = &prev.references {
            up.push(drop(&old_fk));
            down.push(add(&old_fk, fk));
        }
        if let Some(fk) = &col.references {
            up.push(add(&new_fk, fk));
            down.push(drop(&new_fk));
        }
        diff.steps(up, down);
    }

    let old_indexes: Vec<&IndexDefinition> = old_table.indexes.iter().filter(|i| i.columns == [prev.name.clone()]).collect();
    let new_indexes: Vec<&IndexDefinition> = table.indexes.iter().filter(|i| i.columns == [col.name.clone()]).collect();
    let same_indexes = old_indexes.len() == new_indexes.len()
        && old_indexes.iter().zip(&new_indexes).all(|(a, b)| a.name == b.name && a.unique == b.unique);
    if !same_indexes {
        for index in &old_indexes {
            diff.step(drop_index_sql(&table.schema, index), create_index_sql(table, index));
        }
        for index in &new_indexes {
            diff.step(create_index_sql(table, index), drop_index_sql(&table.schema, index));
        }
    }
}

/// Old check re-added after a rename must name the column as it is called at that point.
fn renamed_check(c: &ConstraintDefinition, prev: &ColumnDefinition, col: &ColumnDefinition) -> String {
    if prev.name == col.name {
        c.check.clone()
    } else {
        c.check.replace(&quoted(&prev.name), &quoted(&col.name))
    }
}

/// Physical shape of a many-to-many junction table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JunctionTable {
    pub schema: String,
    pub name: String,
    pub left_table: String,
    pub left_column: String,
    pub right_table: String,
    pub right_column: String,
}

impl JunctionTable {
    pub fn qualified_name(&self) -> String {
        qualified_table(&self.schema, &self.name)
    }

    /// Columns as (pointing at `entity`, pointing at the other side). For a self pair the
    /// left column is the source.
    pub fn columns_for(&self, entity: &EntityDefinition) -> (&str, &str) {
        if self.left_table != self.right_table && entity.table_name() == self.right_table {
            (&self.right_column, &self.left_column)
        } else {
            (&self.left_column, &self.right_column)
        }
    }
}

/// Junction name: both entity names in snake_case, sorted, joined with `_`.
pub fn junction_table_name(a: &str, b: &str) -> String {
    let mut pair = [to_snake_case(a), to_snake_case(b)];
    pair.sort();
    format!("{}_{}", pair[0], pair[1])
}

pub fn junction_definition(a: &EntityDefinition, b: &EntityDefinition, schema: &str) -> JunctionTable {
    let (first, second) = if a.singular_name() <= b.singular_name() { (a, b) } else { (b, a) };
    let left = first.singular_name();
    let right = second.singular_name();
    let right_column = if left == right {
        format!("related_{}_id", right)
    } else {
        format!("{}_id", right)
    };
    JunctionTable {
        schema: schema.to_string(),
        name: junction_table_name(&a.name, &b.name),
        left_table: first.table_name(),
        left_column: format!("{}_id", left),
        right_table: second.table_name(),
        right_column,
    }
}

pub fn generate_junction_table_sql(a: &EntityDefinition, b: &EntityDefinition, schema: &str) -> Vec<String> {
    let j = junction_definition(a, b, schema);
    let q = j.qualified_name();
    let fk = |column: &str, table: &str| {
        format!(
            "{} UUID NOT NULL REFERENCES {}(\"id\") ON DELETE CASCADE",
            quoted(column),
            qualified_table(schema, table)
        )
    };
    let mut out = Vec::new();
    out.extend(create_schema_sql(schema));
    out.push(format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {},\n  {},\n  \"created_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n  PRIMARY KEY ({}, {})\n)",
        q,
        fk(&j.left_column, &j.left_table),
        fk(&j.right_column, &j.right_table),
        quoted(&j.left_column),
        quoted(&j.right_column)
    ));
    for column in [&j.left_column, &j.right_column] {
        out.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
            quoted(&format!("idx_{}_{}", j.name, column)),
            q,
            quoted(column)
        ));
    }
    out
}

/// True when the reference field declares a many-to-many link.
pub fn is_many_to_many(field: &FieldDefinition) -> bool {
    field.is_many_to_many()
}
