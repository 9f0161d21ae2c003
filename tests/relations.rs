mod common;

use common::{billing_registry, school_registry, RecordingExecutor, C1, C2, I1, I2, I3, K1, S1};
use neo_db::relations::RelationPath;
use neo_db::sql::PgBindValue;
use neo_db::RelationResolver;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn three_invoices_group_under_their_client() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![
        json!({"id": I1, "total": 10.0, "client_id": C1}),
        json!({"id": I2, "total": 20.0, "client_id": C1}),
        json!({"id": I3, "total": 30.0, "client_id": C1}),
    ]);

    let grouped = RelationResolver::new(&registry)
        .batch_resolve_relation(&exec, "client", &[C1.to_string()], "invoices")
        .await
        .unwrap();

    let invoices = &grouped[C1];
    assert_eq!(invoices.len(), 3);
    assert_eq!(invoices[0]["taxed"], json!(20));

    let calls = exec.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].sql.contains("\"client_id\" = ANY($1::uuid[])"));
    assert!(calls[0].sql.contains("\"deleted_at\" IS NULL"));
    assert_eq!(calls[0].params, vec![PgBindValue::TextArray(vec![C1.to_string()])]);
}

#[tokio::test]
async fn every_requested_id_gets_an_entry() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": I1, "total": 5.0, "client_id": C1})]);

    let ids = vec![C1.to_string(), C2.to_string(), "not-a-uuid".to_string()];
    let grouped = RelationResolver::new(&registry)
        .batch_resolve_relation(&exec, "client", &ids, "invoices")
        .await
        .unwrap();

    assert_eq!(grouped.len(), 3);
    assert_eq!(grouped[C1].len(), 1);
    assert!(grouped[C2].is_empty());
    assert!(grouped["not-a-uuid"].is_empty());
    // malformed ids never reach the database
    assert_eq!(exec.calls()[0].params, vec![PgBindValue::TextArray(vec![C1.to_string(), C2.to_string()])]);
}

#[tokio::test]
async fn source_key_batches_in_two_queries() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![
        json!({"id": I1, "client_id": C1}),
        json!({"id": I2, "client_id": null}),
    ])
    .respond(vec![json!({"id": C1, "name": "Acme"})]);

    let grouped = RelationResolver::new(&registry)
        .batch_resolve_relation(&exec, "invoice", &[I1.to_string(), I2.to_string()], "client")
        .await
        .unwrap();

    assert_eq!(grouped[I1], vec![json!({"id": C1, "name": "Acme"})]);
    assert!(grouped[I2].is_empty());
    assert_eq!(exec.calls().len(), 2);
}

#[tokio::test]
async fn empty_request_issues_no_query() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    let grouped = RelationResolver::new(&registry)
        .batch_resolve_relation(&exec, "client", &[], "invoices")
        .await
        .unwrap();
    assert!(grouped.is_empty());
    assert!(exec.calls().is_empty());
}

#[tokio::test]
async fn single_record_resolution_reads_the_key_column() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": C1, "name": "Acme"})]);
    let invoice = json!({"id": I1, "client_id": C1});

    let client = RelationResolver::new(&registry)
        .resolve_relation(&exec, "invoice", &invoice, "client")
        .await
        .unwrap();
    assert_eq!(client["name"], json!("Acme"));

    let orphan = json!({"id": I2, "client_id": null});
    let none = RelationResolver::new(&registry)
        .resolve_relation(&exec, "invoice", &orphan, "client")
        .await
        .unwrap();
    assert!(none.is_null());
    assert_eq!(exec.calls().len(), 1);
}

#[tokio::test]
async fn linking_sets_the_foreign_key() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": I1})]);

    RelationResolver::new(&registry)
        .create_relation(&exec, "client", C1, "invoices", I1)
        .await
        .unwrap();

    let call = &exec.calls()[0];
    assert!(call.sql.starts_with("UPDATE \"public\".\"invoices\" SET \"client_id\" = $1::uuid"));
    assert_eq!(call.params[0], PgBindValue::Uuid(C1.parse().unwrap()));

    // nothing matched: the link did not exist
    let err = RelationResolver::new(&registry)
        .remove_relation(&exec, "client", C1, "invoices", I2)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "not_found");
}

#[test]
fn relation_paths_are_discovered_from_reference_fields() {
    let registry = billing_registry();
    let resolver = RelationResolver::new(&registry);
    let invoices = resolver.find_relation("client", "invoices").unwrap();
    assert_eq!(invoices.path, RelationPath::TargetKey { column: "client_id".into() });
    assert!(!invoices.is_single());
    let client = resolver.find_relation("invoice", "client").unwrap();
    assert_eq!(client.path, RelationPath::SourceKey { column: "client_id".into() });
    assert!(client.is_single());
}

#[tokio::test]
async fn junction_links_insert_idempotently_and_delete() {
    let registry = school_registry();
    let exec = RecordingExecutor::new();
    let resolver = RelationResolver::new(&registry);

    resolver.create_relation(&exec, "student", S1, "courses", K1).await.unwrap();
    resolver.create_relation(&exec, "student", S1, "courses", K1).await.unwrap();
    resolver.remove_relation(&exec, "student", S1, "courses", K1).await.unwrap();

    let calls = exec.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0].sql, calls[1].sql);
    assert_eq!(
        calls[0].sql,
        "INSERT INTO \"public\".\"course_student\" (\"student_id\", \"course_id\") VALUES ($1::uuid, $2::uuid) ON CONFLICT DO NOTHING"
    );
    assert!(calls[2].sql.starts_with("DELETE FROM \"public\".\"course_student\""));
    assert_eq!(calls[2].params, vec![PgBindValue::from(S1), PgBindValue::from(K1)]);
}

#[test]
fn many_to_many_is_named_from_both_sides() {
    let registry = school_registry();
    let resolver = RelationResolver::new(&registry);
    let courses = resolver.find_relation("student", "courses").unwrap();
    assert!(matches!(courses.path, RelationPath::Junction { .. }));
    let students = resolver.find_relation("course", "students").unwrap();
    assert_eq!(
        students.path,
        RelationPath::Junction {
            table: "course_student".into(),
            source_column: "course_id".into(),
            target_column: "student_id".into(),
        }
    );
}

#[tokio::test]
async fn uppercase_ids_are_queried_lowercase_and_keyed_as_given() {
    let registry = billing_registry();
    let exec = RecordingExecutor::new();
    exec.respond(vec![json!({"id": I1, "total": 5.0, "client_id": C1})]);

    let upper = C1.to_uppercase();
    let grouped = RelationResolver::new(&registry)
        .batch_resolve_relation(&exec, "client", &[upper.clone(), C1.to_string()], "invoices")
        .await
        .unwrap();

    assert_eq!(exec.calls()[0].params, vec![PgBindValue::TextArray(vec![C1.to_string()])]);
    assert_eq!(grouped[&upper].len(), 1);
    assert_eq!(grouped[C1].len(), 1);
}
