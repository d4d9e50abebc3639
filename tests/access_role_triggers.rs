use warehouse_acl::Warehouse;
use warehouse_acl::catalog::DdlOperation;
use warehouse_acl::catalog::types::{Row, Value};
use warehouse_acl::changes::{
    ASSEMBLY_UPLOADER, CASCADIA, CONSENSUS_GENOME, GENOMIC_SEQUENCE, MANIFEST_PROCESSOR, SAMPLE,
    SEQUENCE_READ_SET, warehouse_plan,
};
use warehouse_acl::error::{AclError, AclErrorCode};

fn deployed() -> Warehouse {
    let db = Warehouse::default();
    db.deploy_all(&warehouse_plan().expect("plan"))
        .expect("deploy");
    db.apply_ddl_batch(vec![
        DdlOperation::create_login("uploader"),
        DdlOperation::grant_role(ASSEMBLY_UPLOADER, "uploader"),
        DdlOperation::create_login("manifests"),
        DdlOperation::grant_role(MANIFEST_PROCESSOR, "manifests"),
    ])
    .expect("logins");
    db
}

fn sample(id: i64, origin: Option<&str>, access_role: Option<&str>) -> Row {
    let details = origin
        .map(|o| Value::json(&serde_json::json!({ "sample_origin": o, "site": "clinic" })))
        .unwrap_or(Value::Null);
    Row::from_values(vec![
        Value::Integer(id),
        Value::text(format!("sample-{id}")),
        Value::Timestamp(1_590_000_000_000_000),
        details,
        Value::opt_text(access_role),
    ])
}

fn genome(id: i64, sample: i64, access_role: Option<&str>) -> Row {
    Row::from_values(vec![
        Value::Integer(id),
        Value::Integer(sample),
        Value::Null,
        Value::Null,
        Value::opt_text(access_role),
    ])
}

fn sequence(id: i64, genome: i64, access_role: Option<&str>) -> Row {
    Row::from_values(vec![
        Value::Integer(id),
        Value::text(format!("seq-{id}")),
        Value::Integer(genome),
        Value::text("ACGT"),
        Value::opt_text(access_role),
    ])
}

fn read_set(id: i64, sample: i64, access_role: Option<&str>) -> Row {
    Row::from_values(vec![
        Value::Integer(id),
        Value::Integer(sample),
        Value::Null,
        Value::opt_text(access_role),
    ])
}

fn with_samples() -> Warehouse {
    let db = deployed();
    db.load_rows(
        SAMPLE,
        vec![
            sample(1, None, None),
            sample(2, Some("cascadia"), Some(CASCADIA)),
        ],
    )
    .expect("samples");
    db
}

#[test]
fn mismatched_children_are_rejected_down_the_chain() {
    let db = with_samples();

    let err = db
        .insert("uploader", CONSENSUS_GENOME, genome(1, 2, None))
        .expect_err("parent is cascadia");
    assert!(err.is_access_role_mismatch());
    assert_eq!(err.code(), AclErrorCode::AccessRoleMismatch);

    let err = db
        .insert("uploader", CONSENSUS_GENOME, genome(1, 1, Some(CASCADIA)))
        .expect_err("parent is untagged");
    assert!(matches!(
        err,
        AclError::AccessRoleMismatch { ref child, parent: None, .. } if child.as_deref() == Some(CASCADIA)
    ));

    db.insert("uploader", CONSENSUS_GENOME, genome(1, 1, None))
        .expect("both null");
    db.insert("uploader", CONSENSUS_GENOME, genome(2, 2, Some(CASCADIA)))
        .expect("both cascadia");

    let err = db
        .insert("uploader", GENOMIC_SEQUENCE, sequence(1, 2, None))
        .expect_err("genome 2 is cascadia");
    assert!(err.is_access_role_mismatch());
    db.insert("uploader", GENOMIC_SEQUENCE, sequence(1, 2, Some(CASCADIA)))
        .expect("matches genome 2");
    db.insert("uploader", GENOMIC_SEQUENCE, sequence(2, 1, None))
        .expect("matches genome 1");

    let err = db
        .insert("uploader", SEQUENCE_READ_SET, read_set(1, 1, Some(CASCADIA)))
        .expect_err("sample 1 is untagged");
    assert!(err.is_access_role_mismatch());
    db.insert("uploader", SEQUENCE_READ_SET, read_set(1, 1, None))
        .expect("matches sample 1");
}

#[test]
fn rejected_writes_store_nothing() {
    let db = with_samples();
    let err = db
        .load_rows(
            CONSENSUS_GENOME,
            vec![genome(1, 1, None), genome(2, 2, None)],
        )
        .expect_err("second row mismatches");
    assert!(err.is_access_role_mismatch());
    assert!(db.select("uploader", CONSENSUS_GENOME).expect("select").is_empty());
}

#[test]
fn missing_parent_row_is_not_found() {
    let db = with_samples();
    let err = db
        .insert("uploader", CONSENSUS_GENOME, genome(1, 99, None))
        .expect_err("no sample 99");
    assert!(err.is_not_found());
    assert!(!err.is_access_role_mismatch());
}

#[test]
fn cascadia_origin_and_access_role_go_together() {
    let db = deployed();
    let err = db
        .insert("manifests", SAMPLE, sample(1, Some("cascadia"), None))
        .expect_err("cascadia sample without tag");
    assert!(matches!(err, AclError::CheckConstraintFailed { .. }));

    let err = db
        .insert("manifests", SAMPLE, sample(2, Some("scan"), Some(CASCADIA)))
        .expect_err("tag without cascadia origin");
    assert!(matches!(err, AclError::CheckConstraintFailed { .. }));

    db.insert("manifests", SAMPLE, sample(3, Some("Cascadia"), Some(CASCADIA)))
        .expect("origin compared without case");
    db.insert("manifests", SAMPLE, sample(4, Some("scan"), None))
        .expect("other origins stay untagged");

    let err = db
        .update(
            "manifests",
            SAMPLE,
            &Value::Integer(4),
            &[("access_role".to_string(), Value::text(CASCADIA))],
        )
        .expect_err("retagging alone breaks the invariant");
    assert!(matches!(err, AclError::CheckConstraintFailed { .. }));

    let details = Value::json(&serde_json::json!({ "sample_origin": "cascadia" }));
    let updated = db
        .update(
            "manifests",
            SAMPLE,
            &Value::Integer(4),
            &[
                ("details".to_string(), details),
                ("access_role".to_string(), Value::text(CASCADIA)),
            ],
        )
        .expect("origin and tag together")
        .expect("visible to a cascadia member");
    assert_eq!(updated.values[4], Value::text(CASCADIA));
}

#[test]
fn speculative_writers_can_skip_mismatches_only() {
    let db = with_samples();
    let mut stored = 0;
    for row in [genome(1, 1, None), genome(2, 2, None), genome(3, 2, Some(CASCADIA))] {
        match db.insert("uploader", CONSENSUS_GENOME, row) {
            Ok(_) => stored += 1,
            Err(e) if e.is_access_role_mismatch() => continue,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(stored, 2);
}
