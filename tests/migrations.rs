use tempfile::tempdir;
use warehouse_acl::catalog::DdlOperation;
use warehouse_acl::catalog::types::{Row, Value};
use warehouse_acl::changes::{
    OWNER, RECEIVING_PRESENCE_ABSENCE, REPORTER, SAMPLE, TEST_QUOTA_CONSUMER, warehouse_plan,
};
use warehouse_acl::config::AclConfig;
use warehouse_acl::error::{AclError, AclErrorCode};
use warehouse_acl::migration::{Change, Plan, VerifyCheck};
use warehouse_acl::permission::{Action, Privileges};
use warehouse_acl::quota::{TestQuota, TimeSpan};
use warehouse_acl::{Warehouse, WarehouseSnapshot};

#[test]
fn every_builtin_change_round_trips() {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    let ordered: Vec<String> = plan
        .ordered()
        .expect("order")
        .into_iter()
        .map(|c| c.id.clone())
        .collect();

    for id in &ordered {
        assert!(db.deploy(&plan, id).expect("deploy"), "{id} deployed");
        assert!(db.verify(&plan, id).expect("verify"), "{id} verifies after deploy");
    }
    for id in ordered.iter().rev() {
        db.revert(&plan, id).expect("revert");
        assert!(!db.verify(&plan, id).expect("verify"), "{id} still verifies after revert");
    }
    assert!(db.deployed_changes().is_empty());
    assert_eq!(db.catalog_snapshot().tables().count(), 0);
    assert!(db.catalog_snapshot().roles.is_empty());
}

#[test]
fn deploy_all_is_idempotent() {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    let first = db.deploy_all(&plan).expect("first");
    assert_eq!(first.applied.len(), plan.changes().len());
    assert!(first.skipped.is_empty());
    let second = db.deploy_all(&plan).expect("second");
    assert!(second.applied.is_empty());
    assert_eq!(second.skipped.len(), plan.changes().len());

    let seqs: Vec<u64> = db.deployed_changes().iter().map(|r| r.deployed_seq).collect();
    assert_eq!(seqs, (1..=plan.changes().len() as u64).collect::<Vec<_>>());
    assert!(db.deployed_changes().iter().all(|r| r.checksum_hex.len() == 64));

    let reverted = db.revert_all(&plan).expect("revert all");
    assert_eq!(reverted.len(), plan.changes().len());
    assert_eq!(reverted.last().map(String::as_str), Some("schema/warehouse"));
}

#[test]
fn deploy_requires_deployed_dependencies() {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    let before = db.catalog_snapshot();
    let err = db
        .deploy(&plan, "roles/reporter")
        .expect_err("schema not deployed");
    assert!(matches!(err, AclError::Validation(_)));
    assert_eq!(db.catalog_snapshot(), before);
    assert!(!db.is_deployed("roles/reporter"));
}

#[test]
fn failed_deploy_leaves_state_untouched() {
    let db = Warehouse::default();
    let plan = Plan::new(vec![
        Change::new("roles/analyst", "analyst role")
            .deploy(vec![
                DdlOperation::create_role("analyst"),
                DdlOperation::grant("warehouse.missing", Privileges::All, "analyst"),
            ])
            .revert(vec![DdlOperation::drop_role("analyst")]),
    ])
    .expect("plan");
    let err = db.deploy(&plan, "roles/analyst").expect_err("missing table");
    assert!(err.is_not_found());
    assert!(!db.is_deployed("roles/analyst"));
    assert!(db.is_member("analyst", "analyst").is_err());
}

#[test]
fn edited_changes_are_detected() {
    let db = Warehouse::default();
    let plan = Plan::new(vec![
        Change::new("roles/analyst", "analyst role")
            .deploy(vec![DdlOperation::create_role("analyst")])
            .revert(vec![DdlOperation::drop_role("analyst")])
            .verify(vec![VerifyCheck::RoleExists("analyst".into())]),
    ])
    .expect("plan");
    assert!(db.deploy(&plan, "roles/analyst").expect("deploy"));
    assert!(!db.deploy(&plan, "roles/analyst").expect("same change"));

    let edited = Plan::new(vec![
        Change::new("roles/analyst", "analyst login")
            .deploy(vec![DdlOperation::create_login("analyst")])
            .revert(vec![DdlOperation::drop_role("analyst")]),
    ])
    .expect("edited plan");
    let err = db.deploy(&edited, "roles/analyst").expect_err("checksum");
    assert_eq!(err.code(), AclErrorCode::IntegrityError);
    let status = db.status(&edited).expect("status");
    assert!(status[0].drifted);
    assert!(!db.status(&plan).expect("status")[0].drifted);
}

#[test]
fn revert_is_refused_while_dependents_are_deployed() {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    db.deploy(&plan, "schema/warehouse").expect("schema");
    db.deploy(&plan, "roles/reporter").expect("reporter");
    let err = db
        .revert(&plan, "schema/warehouse")
        .expect_err("reporter depends on it");
    assert!(matches!(err, AclError::Validation(_)));
    assert!(db.verify(&plan, "schema/warehouse").expect("still there"));

    let err = db
        .revert(&plan, "roles/cascadia")
        .expect_err("never deployed");
    assert_eq!(err.code(), AclErrorCode::ChangeNotFound);
}

#[test]
fn grant_replay_matches_the_reporter_column_list() {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    db.deploy_all(&plan).expect("deploy");
    let catalog = db.catalog_snapshot();
    let replayed = catalog.permission_log().replay();
    assert_eq!(&replayed, catalog.permissions());
    assert_eq!(
        db.column_set(REPORTER, RECEIVING_PRESENCE_ABSENCE, Action::Select)
            .expect("columns"),
        vec!["document".to_string()]
    );
    assert_eq!(
        db.column_set(TEST_QUOTA_CONSUMER, warehouse_acl::quota::QUOTA_TABLE, Action::Update)
            .expect("columns"),
        vec!["used".to_string()]
    );
}

#[test]
fn snapshots_round_trip_through_a_file() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("warehouse.json");
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    db.deploy_all(&plan).expect("deploy");
    db.load_rows(
        SAMPLE,
        vec![Row::from_values(vec![
            Value::Integer(1),
            Value::text("sample-1"),
            Value::Null,
            Value::Null,
            Value::Null,
        ])],
    )
    .expect("sample");
    db.create_quota(
        OWNER,
        TestQuota::new("a", TimeSpan::new(0, 10).expect("span"), 3),
    )
    .expect("quota");
    db.save_snapshot(&path).expect("save");

    let restored = Warehouse::load_snapshot(AclConfig::default(), &path).expect("load");
    assert_eq!(restored.catalog_snapshot(), db.catalog_snapshot());
    assert_eq!(restored.deployed_changes(), db.deployed_changes());
    assert_eq!(restored.select(OWNER, SAMPLE).expect("rows").len(), 1);
    assert_eq!(restored.quotas(OWNER, "a").expect("quotas")[0].max, 3);
    assert!(!restored.deploy(&plan, "schema/warehouse").expect("already deployed"));

    let bytes = std::fs::read(&path).expect("read");
    let snapshot: WarehouseSnapshot = serde_json::from_slice(&bytes).expect("json");
    assert_eq!(snapshot.changes.len(), plan.changes().len());
}
