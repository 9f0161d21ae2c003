mod common;

use common::{billing_registry, RecordingExecutor, C1, C2, I1};
use neo_db::sql::{FindOptions, QueryFilter};
use neo_db::{CrudService, DbError};
use pretty_assertions::assert_eq;
use serde_json::json;

fn field_errors(err: DbError) -> Vec<(String, String)> {
    match err {
        DbError::Validation(v) => v.errors.into_iter().map(|e| (e.field, e.message)).collect(),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn create_inserts_validated_columns() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": C1, "name": "Acme", "email": "ops@acme.io"})]);

    let row = CrudService::create(&exec, &registry, "client", &json!({"name": "Acme", "email": "ops@acme.io"}))
        .await
        .unwrap();
    assert_eq!(row["id"], json!(C1));

    let call = &exec.calls()[0];
    assert!(call.sql.starts_with("INSERT INTO \"public\".\"clients\" ("));
    assert!(call.sql.contains("RETURNING \"id\""));
    assert_eq!(call.params.len(), 2);
}

#[tokio::test]
async fn invalid_input_never_reaches_the_database() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let err = CrudService::create(&exec, &registry, "client", &json!({"email": "nope"}))
        .await
        .unwrap_err();
    let mut got = field_errors(err);
    got.sort();
    assert_eq!(
        got,
        vec![
            ("email".to_string(), "must be a valid email".to_string()),
            ("name".to_string(), "is required".to_string()),
        ]
    );
    assert!(exec.calls().is_empty());
}

#[tokio::test]
async fn bulk_create_reports_record_positions() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let err = CrudService::create_many(&exec, &registry, "client", &[json!({"name": "A"}), json!({})])
        .await
        .unwrap_err();
    assert_eq!(field_errors(err), vec![("[1].name".to_string(), "is required".to_string())]);
}

#[tokio::test]
async fn find_many_attaches_includes_in_one_extra_query() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": C1, "name": "Acme"}), json!({"id": C2, "name": "Globex"})])
        .respond(vec![json!({"id": I1, "total": 4, "client_id": C1})]);

    let options = FindOptions::default().include("invoices");
    let rows = CrudService::find_many(&exec, &registry, "client", &options).await.unwrap();

    assert_eq!(rows[0]["invoices"].as_array().map(Vec::len), Some(1));
    assert_eq!(rows[0]["invoices"][0]["taxed"], json!(8));
    assert_eq!(rows[1]["invoices"], json!([]));
    assert_eq!(exec.calls().len(), 2);
}

#[tokio::test]
async fn soft_delete_stamps_and_hard_delete_removes() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": I1})]).respond(vec![json!({"id": C1})]);

    CrudService::delete(&exec, &registry, "invoice", I1).await.unwrap();
    CrudService::delete(&exec, &registry, "client", C1).await.unwrap();

    let calls = exec.calls();
    assert!(calls[0].sql.starts_with("UPDATE \"public\".\"invoices\" SET \"deleted_at\" = NOW()"));
    assert!(calls[0].sql.contains("\"deleted_at\" IS NULL"));
    assert!(calls[1].sql.starts_with("DELETE FROM \"public\".\"clients\""));
}

#[tokio::test]
async fn missing_rows_are_not_found() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let err = CrudService::update(&exec, &registry, "client", C1, &json!({"name": "New"}))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::NotFound(_)));

    assert!(CrudService::find_by_id(&exec, &registry, "client", "42").await.unwrap().is_none());
    assert_eq!(exec.calls().len(), 1);
}

#[tokio::test]
async fn delete_many_requires_filters() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let err = CrudService::delete_many(&exec, &registry, "client", &[]).await.unwrap_err();
    assert_eq!(err.code(), "validation_error");
    assert!(exec.calls().is_empty());
}

#[tokio::test]
async fn upsert_picks_a_unique_conflict_target() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": C1})]);

    CrudService::upsert(&exec, &registry, "client", &json!({"name": "Acme", "email": "ops@acme.io"}), None)
        .await
        .unwrap();
    assert!(exec.calls()[0].sql.contains("ON CONFLICT (\"email\") DO UPDATE"));

    let err = CrudService::upsert(&exec, &registry, "client", &json!({"name": "Acme"}), Some("name"))
        .await
        .unwrap_err();
    assert_eq!(field_errors(err), vec![("name".to_string(), "conflict field must be unique".to_string())]);
}

#[tokio::test]
async fn count_and_exists_read_single_values() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"count": 3})]).respond(vec![json!({"exists": true})]);

    let filters = [QueryFilter::eq("clientId", json!(C1))];
    assert_eq!(CrudService::count(&exec, &registry, "invoice", &filters).await.unwrap(), 3);
    assert!(CrudService::exists(&exec, &registry, "invoice", &filters).await.unwrap());
    assert!(exec.calls()[0].sql.contains("\"client_id\" = $1::uuid"));
}

#[tokio::test]
async fn unknown_entity_is_not_found() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let err = CrudService::count(&exec, &registry, "payment", &[]).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
}
