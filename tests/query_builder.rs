use neo_db::model::{EntityDefinition, FieldDefinition, FieldType};
use neo_db::sql::{
    compile_entity, CompileContext, FilterOperator, PgBindValue, QueryBuilder, QueryFilter, QueryPagination,
    QuerySort, TableDefinition,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn people() -> TableDefinition {
    let entity = EntityDefinition::new("person", "Person")
        .plural("People")
        .field(FieldDefinition::new("p1", "name", FieldType::String))
        .field(FieldDefinition::new("p2", "age", FieldType::Integer));
    compile_entity(&entity, &CompileContext::new("public"))
}

#[test]
fn greater_than_binds_one_parameter() {
    let table = people();
    let mut qb = QueryBuilder::new(&table);
    qb.filter(&QueryFilter::new("age", FilterOperator::Gt, json!(5))).unwrap();
    let q = qb.build_select();
    assert!(q.sql.contains("\"age\" > $1"));
    assert_eq!(q.params, vec![PgBindValue::I64(5)]);
}

#[test]
fn raw_fragment_after_filters_is_renumbered() {
    let table = people();
    let mut qb = QueryBuilder::new(&table);
    qb.filter(&QueryFilter::eq("name", json!("Ada")))
        .unwrap()
        .where_raw("\"age\" BETWEEN $1 AND $2", vec![PgBindValue::I64(18), PgBindValue::I64(65)])
        .unwrap();
    let q = qb.build_select();
    assert!(q.sql.contains("WHERE \"name\" = $1::text AND (\"age\" BETWEEN $2 AND $3)"));
    assert_eq!(
        q.params,
        vec![PgBindValue::String("Ada".into()), PgBindValue::I64(18), PgBindValue::I64(65)]
    );
}

#[test]
fn raw_fragment_before_filters_keeps_its_numbers() {
    let table = people();
    let mut qb = QueryBuilder::new(&table);
    qb.where_raw("lower(\"name\") = $1", vec![PgBindValue::from("ada")])
        .unwrap()
        .filter(&QueryFilter::new("age", FilterOperator::Gte, json!(21)))
        .unwrap();
    let q = qb.build_select();
    assert!(q.sql.contains("WHERE (lower(\"name\") = $1) AND \"age\" >= $2::integer"));
    assert_eq!(q.params, vec![PgBindValue::String("ada".into()), PgBindValue::I64(21)]);
}

#[test]
fn sort_and_page() {
    let table = people();
    let mut qb = QueryBuilder::new(&table);
    qb.order_by(&QuerySort::desc("age"))
        .unwrap()
        .paginate(QueryPagination::page(3, 10));
    let q = qb.build_select();
    assert!(q.sql.ends_with("ORDER BY \"age\" DESC LIMIT 10 OFFSET 20"));
}

#[test]
fn null_equality_becomes_is_null() {
    let table = people();
    let mut qb = QueryBuilder::new(&table);
    qb.filter(&QueryFilter::eq("name", serde_json::Value::Null)).unwrap();
    let q = qb.build_count();
    assert!(q.sql.contains("WHERE \"name\" IS NULL"));
    assert!(q.params.is_empty());
}
