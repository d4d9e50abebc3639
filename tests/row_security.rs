use warehouse_acl::Warehouse;
use warehouse_acl::catalog::DdlOperation;
use warehouse_acl::catalog::types::{Row, Value};
use warehouse_acl::changes::{
    CASCADIA, CONSENSUS_GENOME, HCOV19_LINEAGE, HCOV19_VISIBILITY, ORGANISM, PRESENCE_ABSENCE,
    PRESENCE_ABSENCE_PROCESSOR, RECEIVING_PRESENCE_ABSENCE, REPORTER, REPORTER_CASCADIA, SAMPLE,
    TARGET, warehouse_plan,
};
use warehouse_acl::config::AclConfig;
use warehouse_acl::error::AclError;
use warehouse_acl::permission::Action;

fn deployed() -> Warehouse {
    let db = Warehouse::default();
    let plan = warehouse_plan().expect("plan");
    db.deploy_all(&plan).expect("deploy");
    db.apply_ddl_batch(vec![
        DdlOperation::create_login("alice"),
        DdlOperation::grant_role(REPORTER, "alice"),
        DdlOperation::create_login("bob"),
        DdlOperation::grant_role(REPORTER, "bob"),
        DdlOperation::grant_role(HCOV19_VISIBILITY, "bob"),
        DdlOperation::create_login("cora"),
        DdlOperation::grant_role(REPORTER_CASCADIA, "cora"),
    ])
    .expect("logins");
    db
}

fn sample(id: i64, access_role: Option<&str>) -> Row {
    let details = match access_role {
        Some(_) => Value::json(&serde_json::json!({ "sample_origin": "cascadia" })),
        None => Value::Null,
    };
    Row::from_values(vec![
        Value::Integer(id),
        Value::text(format!("sample-{id}")),
        Value::Null,
        details,
        Value::opt_text(access_role),
    ])
}

fn load_results(db: &Warehouse) {
    db.load_rows(
        ORGANISM,
        vec![
            Row::from_values(vec![Value::Integer(1), Value::lineage(HCOV19_LINEAGE)]),
            Row::from_values(vec![Value::Integer(2), Value::lineage("Influenza.A")]),
        ],
    )
    .expect("organisms");
    db.load_rows(
        TARGET,
        vec![
            Row::from_values(vec![Value::Integer(1), Value::text("COVID-19"), Value::Integer(1)]),
            Row::from_values(vec![Value::Integer(2), Value::text("Flu_A"), Value::Integer(2)]),
            Row::from_values(vec![Value::Integer(3), Value::text("RNP"), Value::Null]),
        ],
    )
    .expect("targets");
    db.load_rows(SAMPLE, vec![sample(1, None)]).expect("sample");
    let results = (1..=3)
        .map(|target| {
            Row::from_values(vec![
                Value::Integer(target),
                Value::Integer(1),
                Value::Integer(target),
                Value::Boolean(true),
                Value::Null,
            ])
        })
        .collect();
    db.load_rows(PRESENCE_ABSENCE, results).expect("results");
}

fn ids(rows: &[Row]) -> Vec<Value> {
    rows.iter().map(|r| r.values[0].clone()).collect()
}

#[test]
fn hcov19_results_need_hcov19_visibility() {
    let db = deployed();
    load_results(&db);

    let alice = db.select("alice", PRESENCE_ABSENCE).expect("alice");
    assert_eq!(ids(&alice), vec![Value::Integer(2), Value::Integer(3)]);

    let bob = db.select("bob", PRESENCE_ABSENCE).expect("bob");
    assert_eq!(
        ids(&bob),
        vec![Value::Integer(1), Value::Integer(2), Value::Integer(3)]
    );

    db.apply_ddl(DdlOperation::revoke_role(HCOV19_VISIBILITY, "bob"))
        .expect("revoke");
    assert_eq!(db.select("bob", PRESENCE_ABSENCE).expect("bob").len(), 2);
}

#[test]
fn hcov19_lineage_descendants_are_hidden_too() {
    let db = deployed();
    load_results(&db);
    db.load_rows(
        ORGANISM,
        vec![Row::from_values(vec![
            Value::Integer(3),
            Value::lineage(format!("{HCOV19_LINEAGE}.B117")),
        ])],
    )
    .expect("sub-lineage");
    let row = Row::from_values(vec![
        Value::Integer(4),
        Value::text("B.1.1.7"),
        Value::Integer(3),
    ]);
    db.load_rows(TARGET, vec![row]).expect("target");
    let result = Row::from_values(vec![
        Value::Integer(4),
        Value::Integer(1),
        Value::Integer(4),
        Value::Boolean(false),
        Value::Null,
    ]);
    assert!(!db.visible("alice", PRESENCE_ABSENCE, &result).expect("alice"));
    assert!(db.visible("bob", PRESENCE_ABSENCE, &result).expect("bob"));
}

fn result(id: i64, target: i64) -> Row {
    Row::from_values(vec![
        Value::Integer(id),
        Value::Integer(1),
        Value::Integer(target),
        Value::Null,
        Value::Null,
    ])
}

#[test]
fn processor_writes_results_but_reads_hcov19_only_with_visibility() {
    let db = deployed();
    load_results(&db);
    db.apply_ddl_batch(vec![
        DdlOperation::create_login("etl"),
        DdlOperation::grant_role(PRESENCE_ABSENCE_PROCESSOR, "etl"),
    ])
    .expect("etl login");

    db.insert("etl", PRESENCE_ABSENCE, result(10, 1))
        .expect("insert hcov19 result");
    db.insert("etl", PRESENCE_ABSENCE, result(11, 2))
        .expect("insert flu result");
    assert_eq!(
        ids(&db.select("etl", PRESENCE_ABSENCE).expect("etl")),
        vec![Value::Integer(2), Value::Integer(3), Value::Integer(11)]
    );
    assert!(!db.visible("etl", PRESENCE_ABSENCE, &result(10, 1)).expect("visible"));

    let present = [("present".to_string(), Value::Boolean(true))];
    let updated = db
        .update("etl", PRESENCE_ABSENCE, &Value::Integer(11), &present)
        .expect("update")
        .expect("flu result is visible");
    assert_eq!(updated.values[3], Value::Boolean(true));
    assert_eq!(
        db.update("etl", PRESENCE_ABSENCE, &Value::Integer(10), &present)
            .expect("update"),
        None
    );

    db.apply_ddl(DdlOperation::grant_role(HCOV19_VISIBILITY, "etl"))
        .expect("grant visibility");
    assert_eq!(db.select("etl", PRESENCE_ABSENCE).expect("etl").len(), 5);
    db.update("etl", PRESENCE_ABSENCE, &Value::Integer(10), &present)
        .expect("update")
        .expect("hcov19 result is now visible");

    let err = db
        .update(
            "etl",
            PRESENCE_ABSENCE,
            &Value::Integer(11),
            &[("target_id".to_string(), Value::Integer(1))],
        )
        .expect_err("target_id is not updatable");
    assert!(matches!(err, AclError::PermissionDenied(_)));
}

#[test]
fn hcov19_visibility_is_exactly_membership_for_every_role() {
    let db = Warehouse::new(AclConfig::strict());
    db.deploy_all(&warehouse_plan().expect("plan"))
        .expect("deploy");
    load_results(&db);
    let covid = result(10, 1);
    let roles: Vec<String> = db.catalog_snapshot().roles.names().cloned().collect();
    assert!(roles.iter().any(|r| r == PRESENCE_ABSENCE_PROCESSOR));
    for role in roles {
        let member = db.is_member(&role, HCOV19_VISIBILITY).expect("membership");
        let visible = db.visible(&role, PRESENCE_ABSENCE, &covid).expect("visible");
        assert_eq!(visible, member, "{role}");
    }
}

#[test]
fn consensus_genomes_follow_access_role() {
    let db = deployed();
    db.load_rows(SAMPLE, vec![sample(1, None), sample(2, Some(CASCADIA))])
        .expect("samples");
    let genome = |id: i64, sample: i64, access_role: Option<&str>| {
        Row::from_values(vec![
            Value::Integer(id),
            Value::Integer(sample),
            Value::Null,
            Value::Null,
            Value::opt_text(access_role),
        ])
    };
    db.load_rows(
        CONSENSUS_GENOME,
        vec![genome(1, 1, None), genome(2, 2, Some(CASCADIA))],
    )
    .expect("genomes");

    let reporter = db.select("alice", CONSENSUS_GENOME).expect("reporter");
    assert_eq!(ids(&reporter), vec![Value::Integer(1)]);

    let cascadia = db.select("cora", CONSENSUS_GENOME).expect("reporter-cascadia");
    assert_eq!(ids(&cascadia), vec![Value::Integer(1), Value::Integer(2)]);

    assert!(db.visible(CASCADIA, CONSENSUS_GENOME, &genome(1, 1, None)).expect("null"));
    assert!(
        db.visible(CASCADIA, CONSENSUS_GENOME, &genome(2, 2, Some(CASCADIA)))
            .expect("cascadia")
    );
    assert!(
        !db.visible(REPORTER, CONSENSUS_GENOME, &genome(2, 2, Some(CASCADIA)))
            .expect("reporter")
    );
}

#[test]
fn reporter_reads_documents_but_not_bookkeeping() {
    let db = deployed();
    assert_eq!(
        db.column_set("alice", RECEIVING_PRESENCE_ABSENCE, Action::Select)
            .expect("columns"),
        vec!["document".to_string()]
    );
    db.load_rows(
        RECEIVING_PRESENCE_ABSENCE,
        vec![Row::from_values(vec![
            Value::Integer(1),
            Value::json(&serde_json::json!({ "barcode": "AAAAAAAA" })),
            Value::Timestamp(1_600_000_000_000_000),
            Value::Null,
        ])],
    )
    .expect("document");

    assert!(matches!(
        db.select("alice", RECEIVING_PRESENCE_ABSENCE),
        Err(AclError::PermissionDenied(_))
    ));
    let documents = db
        .select_columns("alice", RECEIVING_PRESENCE_ABSENCE, &["document"])
        .expect("document only");
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].values.len(), 1);
    assert!(
        !db.can("alice", RECEIVING_PRESENCE_ABSENCE, Action::Select, Some("processing_log"))
            .expect("can")
    );
    assert!(
        db.can(PRESENCE_ABSENCE_PROCESSOR, RECEIVING_PRESENCE_ABSENCE, Action::Update, Some("processing_log"))
            .expect("can")
    );
}
