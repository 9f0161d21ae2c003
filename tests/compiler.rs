mod common;

use common::{client, invoice};
use neo_db::model::{EntityDefinition, FieldDefinition, FieldType, RelationKind};
use neo_db::sql::{
    compile_entity, generate_create_table_sql, generate_junction_table_sql, generate_migration_sql,
    junction_table_name, CompileContext, SqlType,
};
use pretty_assertions::assert_eq;

#[test]
fn column_count_is_id_plus_stored_fields_plus_timestamps() {
    let entity = invoice();
    let table = compile_entity(&entity, &CompileContext::new("public").with_entities([&client(), &entity]));
    let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
    // two stored fields, one computed, soft delete adds deleted_at
    assert_eq!(names, vec!["id", "total", "client_id", "created_at", "updated_at", "deleted_at"]);
    assert!(table.column("taxed").is_none());

    let plain = client();
    let table = compile_entity(&plain, &CompileContext::new("public"));
    assert_eq!(table.columns.len(), 1 + plain.fields.len() + 2);
}

#[test]
fn client_compiles_to_expected_columns() {
    let table = compile_entity(&client(), &CompileContext::new("public"));
    let shape: Vec<(&str, SqlType, bool, bool, bool)> = table
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.sql_type, c.primary_key, c.nullable, c.unique))
        .collect();
    assert_eq!(
        shape,
        vec![
            ("id", SqlType::Uuid, true, false, false),
            ("name", SqlType::Text, false, false, false),
            ("email", SqlType::Text, false, true, true),
            ("created_at", SqlType::Timestamptz, false, false, false),
            ("updated_at", SqlType::Timestamptz, false, false, false),
        ]
    );

    let sql = generate_create_table_sql(&table);
    let create = sql.iter().find(|s| s.starts_with("CREATE TABLE")).unwrap();
    assert!(create.contains("CREATE TABLE IF NOT EXISTS \"public\".\"clients\""));
    assert!(create.contains("\"id\" UUID PRIMARY KEY DEFAULT gen_random_uuid()"));
    assert!(create.contains("\"name\" TEXT NOT NULL"));
    assert!(create.contains("\"email\" TEXT CONSTRAINT \"uq_clients_email\" UNIQUE"));
    assert!(!sql.iter().any(|s| s.starts_with("CREATE SCHEMA")));
}

#[test]
fn create_and_drop_are_inverse() {
    let ctx = CompileContext::new("public").with_entities([&client()]);
    let created = generate_migration_sql(None, Some(&client()), &ctx);
    let dropped = generate_migration_sql(Some(&client()), None, &ctx);
    assert_eq!(created.up, dropped.down);
    assert_eq!(created.down, dropped.up);
    assert!(!created.is_destructive());
    assert!(dropped.is_destructive());
}

#[test]
fn modify_down_undoes_up_in_reverse() {
    let before = client();
    let after = EntityDefinition::new("client", "Client")
        .field(FieldDefinition::new("c-name", "fullName", FieldType::String).required())
        .field(FieldDefinition::new("c-phone", "phone", FieldType::Phone));
    let ctx = CompileContext::new("public");
    let forward = generate_migration_sql(Some(&before), Some(&after), &ctx);
    let backward = generate_migration_sql(Some(&after), Some(&before), &ctx);

    assert!(forward.up.iter().any(|s| s.contains("RENAME COLUMN \"name\" TO \"full_name\"")));
    assert!(forward.up.iter().any(|s| s.contains("ADD COLUMN IF NOT EXISTS \"phone\" TEXT")));
    assert!(forward.up.iter().any(|s| s.contains("DROP COLUMN IF EXISTS \"email\"")));
    assert!(forward.is_destructive());
    assert!(forward.down.iter().any(|s| s.contains("RENAME COLUMN \"full_name\" TO \"name\"")));
    assert!(backward.up.iter().any(|s| s.contains("DROP COLUMN IF EXISTS \"phone\"")));
}

#[test]
fn unchanged_entity_needs_no_statements() {
    let ctx = CompileContext::new("public");
    assert!(generate_migration_sql(Some(&client()), Some(&client()), &ctx).is_empty());
}

#[test]
fn junction_name_is_symmetric() {
    assert_eq!(junction_table_name("Student", "Course"), junction_table_name("Course", "Student"));
    assert_eq!(junction_table_name("Student", "Course"), "course_student");

    let student = EntityDefinition::new("student", "Student")
        .field(FieldDefinition::new("s1", "courseIds", FieldType::Reference).references("course", RelationKind::ManyToMany));
    let course = EntityDefinition::new("course", "Course");
    let ab = generate_junction_table_sql(&student, &course, "public");
    let ba = generate_junction_table_sql(&course, &student, "public");
    assert_eq!(ab, ba);
    assert!(ab[0].contains("PRIMARY KEY (\"course_id\", \"student_id\")"));
}

#[test]
fn custom_schema_is_created_first() {
    let table = compile_entity(&client(), &CompileContext::new("crm"));
    let sql = generate_create_table_sql(&table);
    assert_eq!(sql[0], "CREATE SCHEMA IF NOT EXISTS \"crm\"");
    assert!(sql[1].contains("\"crm\".\"clients\""));
}
