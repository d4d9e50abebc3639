//! The warehouse's access-control plan: roles, securables, grants, row
//! security and triggers, as an ordered set of reversible changes.

use crate::catalog::DdlOperation;
use crate::catalog::schema::{ColumnDef, ForeignKey, SecurableKind, TableAlteration, TableSchema};
use crate::catalog::types::ColumnType;
use crate::error::AclError;
use crate::migration::{Change, Plan, VerifyCheck};
use crate::permission::{Action, Privileges};
use crate::policy::expr::Expr;
use crate::policy::{Policy, PolicyCommand};
use crate::trigger::{ACCESS_ROLE_COLUMN, Trigger};

pub const OWNER: &str = "id3c";

pub const REPORTER: &str = "reporter";
pub const CASCADIA: &str = "cascadia";
pub const REPORTER_CASCADIA: &str = "reporter-cascadia";
pub const HCOV19_VISIBILITY: &str = "hcov19-visibility";
pub const PRESENCE_ABSENCE_PROCESSOR: &str = "presence-absence-processor";
pub const MANIFEST_PROCESSOR: &str = "manifest-processor";
pub const ASSEMBLY_UPLOADER: &str = "assembly-uploader";
pub const RETURN_RESULTS_EXPORTER: &str = "return-results-exporter";
pub const AUGUR_BUILD_EXPORTER: &str = "augur-build-exporter";
pub const LATEST_RESULTS_EXPORTER: &str = "latest-results-exporter";
pub const REPORTABLE_CONDITION_NOTIFIER: &str = "reportable-condition-notifier";
pub const TEST_QUOTA_CONSUMER: &str = "test-quota-consumer";

pub const ORGANISM: &str = "warehouse.organism";
pub const TARGET: &str = "warehouse.target";
pub const SAMPLE: &str = "warehouse.sample";
pub const PRESENCE_ABSENCE: &str = "warehouse.presence_absence";
pub const CONSENSUS_GENOME: &str = "warehouse.consensus_genome";
pub const GENOMIC_SEQUENCE: &str = "warehouse.genomic_sequence";
pub const SEQUENCE_READ_SET: &str = "warehouse.sequence_read_set";
pub const RECEIVING_PRESENCE_ABSENCE: &str = "receiving.presence_absence";
pub const TEST_QUOTA: &str = crate::quota::QUOTA_TABLE;

pub const RETURN_RESULTS_V1: &str = "shipping.return_results_v1";
pub const RETURN_RESULTS_V2: &str = "shipping.return_results_v2";
pub const METADATA_FOR_AUGUR_BUILD_V1: &str = "shipping.metadata_for_augur_build_v1";
pub const LATEST_RESULTS_V1: &str = "shipping.latest_results_v1";
pub const REPORTABLE_CONDITION_V1: &str = "shipping.reportable_condition_v1";

pub const HCOV19_LINEAGE: &str = "Human_coronavirus.2019";

/// Tables whose rows carry an `access_role` tag.
pub const ACCESS_ROLE_TABLES: [&str; 4] =
    [SAMPLE, CONSENSUS_GENOME, GENOMIC_SEQUENCE, SEQUENCE_READ_SET];

pub const ORIGIN_TRIGGER: &str = "sample_origin_matches_access_role";
pub const ACCESS_ROLE_POLICY: &str = "visible to access_role members";
pub const HCOV19_HIDDEN_POLICY: &str = "visible if not HCoV-19";
pub const HCOV19_VISIBLE_POLICY: &str = "visible unconditionally";
pub const PROCESSOR_INSERT_POLICY: &str = "insertable by processor";
pub const PROCESSOR_UPDATE_POLICY: &str = "updatable by processor";

/// Columns `reporter` may not read on `receiving.presence_absence`.
pub const REPORTER_HIDDEN_RECEIVING_COLUMNS: [&str; 3] =
    ["presence_absence_id", "received", "processing_log"];

fn col(name: &str, col_type: ColumnType) -> ColumnDef {
    ColumnDef::new(name, col_type, false)
}

fn nullable(name: &str, col_type: ColumnType) -> ColumnDef {
    ColumnDef::new(name, col_type, true)
}

fn fk(column: &str, references: &str) -> ForeignKey {
    ForeignKey {
        name: format!("{column}_fkey"),
        column: column.to_string(),
        references_table: references.to_string(),
    }
}

fn split(qualified: &str) -> (&str, &str) {
    qualified.split_once('.').unwrap_or(("public", qualified))
}

fn table(qualified: &str, columns: Vec<ColumnDef>, foreign_keys: Vec<ForeignKey>) -> TableSchema {
    let (schema_name, table_name) = split(qualified);
    let primary_key = columns.first().map(|c| c.name.clone());
    TableSchema {
        schema_name: schema_name.to_string(),
        table_name: table_name.to_string(),
        kind: SecurableKind::Table,
        owner_id: Some(OWNER.to_string()),
        columns,
        primary_key,
        foreign_keys,
    }
}

fn view(qualified: &str, columns: &[(&str, ColumnType)]) -> TableSchema {
    let (schema_name, table_name) = split(qualified);
    TableSchema {
        schema_name: schema_name.to_string(),
        table_name: table_name.to_string(),
        kind: SecurableKind::View,
        owner_id: Some(OWNER.to_string()),
        columns: columns
            .iter()
            .map(|(name, ty)| nullable(name, *ty))
            .collect(),
        primary_key: None,
        foreign_keys: Vec::new(),
    }
}

pub fn organism_table() -> TableSchema {
    table(
        ORGANISM,
        vec![
            col("organism_id", ColumnType::Integer),
            col("lineage", ColumnType::Lineage),
        ],
        Vec::new(),
    )
}

pub fn target_table() -> TableSchema {
    table(
        TARGET,
        vec![
            col("target_id", ColumnType::Integer),
            col("identifier", ColumnType::Text),
            nullable("organism_id", ColumnType::Integer),
        ],
        vec![fk("organism_id", ORGANISM)],
    )
}

pub fn sample_table() -> TableSchema {
    table(
        SAMPLE,
        vec![
            col("sample_id", ColumnType::Integer),
            col("identifier", ColumnType::Text),
            nullable("collected", ColumnType::Timestamp),
            nullable("details", ColumnType::Json),
        ],
        Vec::new(),
    )
}

pub fn presence_absence_table() -> TableSchema {
    table(
        PRESENCE_ABSENCE,
        vec![
            col("presence_absence_id", ColumnType::Integer),
            col("sample_id", ColumnType::Integer),
            col("target_id", ColumnType::Integer),
            nullable("present", ColumnType::Boolean),
            nullable("details", ColumnType::Json),
        ],
        vec![fk("sample_id", SAMPLE), fk("target_id", TARGET)],
    )
}

pub fn consensus_genome_table() -> TableSchema {
    table(
        CONSENSUS_GENOME,
        vec![
            col("consensus_genome_id", ColumnType::Integer),
            col("sample_id", ColumnType::Integer),
            nullable("organism_id", ColumnType::Integer),
            nullable("details", ColumnType::Json),
        ],
        vec![fk("sample_id", SAMPLE), fk("organism_id", ORGANISM)],
    )
}

pub fn genomic_sequence_table() -> TableSchema {
    table(
        GENOMIC_SEQUENCE,
        vec![
            col("genomic_sequence_id", ColumnType::Integer),
            col("identifier", ColumnType::Text),
            col("consensus_genome_id", ColumnType::Integer),
            nullable("seq", ColumnType::Text),
        ],
        vec![fk("consensus_genome_id", CONSENSUS_GENOME)],
    )
}

pub fn sequence_read_set_table() -> TableSchema {
    table(
        SEQUENCE_READ_SET,
        vec![
            col("sequence_read_set_id", ColumnType::Integer),
            col("sample_id", ColumnType::Integer),
            nullable("urls", ColumnType::Json),
        ],
        vec![fk("sample_id", SAMPLE)],
    )
}

pub fn receiving_presence_absence_table() -> TableSchema {
    table(
        RECEIVING_PRESENCE_ABSENCE,
        vec![
            col("presence_absence_id", ColumnType::Integer),
            col("document", ColumnType::Json),
            col("received", ColumnType::Timestamp),
            nullable("processing_log", ColumnType::Json),
        ],
        Vec::new(),
    )
}

/// The grant surface of `operations.test_quota`. Quota rows themselves are
/// held by the quota allocator.
pub fn test_quota_table() -> TableSchema {
    let mut schema = table(
        TEST_QUOTA,
        vec![
            col("name", ColumnType::Text),
            col("timespan", ColumnType::Text),
            col("max", ColumnType::Integer),
            col("used", ColumnType::Integer),
        ],
        Vec::new(),
    );
    schema.primary_key = None;
    schema
}

pub fn return_results_v1_view() -> TableSchema {
    view(
        RETURN_RESULTS_V1,
        &[("barcode", ColumnType::Text), ("status", ColumnType::Text)],
    )
}

pub fn return_results_v2_view() -> TableSchema {
    view(
        RETURN_RESULTS_V2,
        &[
            ("barcode", ColumnType::Text),
            ("status_code", ColumnType::Text),
            ("collection_date", ColumnType::Timestamp),
            ("result_ts", ColumnType::Timestamp),
        ],
    )
}

pub fn metadata_for_augur_build_v1_view() -> TableSchema {
    view(
        METADATA_FOR_AUGUR_BUILD_V1,
        &[
            ("strain", ColumnType::Text),
            ("date", ColumnType::Timestamp),
            ("region", ColumnType::Text),
            ("country", ColumnType::Text),
            ("division", ColumnType::Text),
            ("location", ColumnType::Text),
        ],
    )
}

pub fn latest_results_v1_view() -> TableSchema {
    view(
        LATEST_RESULTS_V1,
        &[
            ("barcode", ColumnType::Text),
            ("hcov19_result_received", ColumnType::Timestamp),
            ("hcov19_present", ColumnType::Boolean),
        ],
    )
}

pub fn reportable_condition_v1_view() -> TableSchema {
    view(
        REPORTABLE_CONDITION_V1,
        &[
            ("sample_id", ColumnType::Integer),
            ("barcode", ColumnType::Text),
            ("lineage", ColumnType::Lineage),
            ("site", ColumnType::Text),
            ("collected", ColumnType::Timestamp),
        ],
    )
}

fn select(securable: &str, principal: &str) -> DdlOperation {
    DdlOperation::grant(securable, Privileges::one(Action::Select), principal)
}

fn add_access_role(table: &str) -> DdlOperation {
    DdlOperation::AlterTable {
        table: table.to_string(),
        alteration: TableAlteration::AddColumn(nullable(ACCESS_ROLE_COLUMN, ColumnType::Text)),
    }
}

fn drop_access_role(table: &str) -> DdlOperation {
    DdlOperation::AlterTable {
        table: table.to_string(),
        alteration: TableAlteration::DropColumn {
            name: ACCESS_ROLE_COLUMN.to_string(),
        },
    }
}

fn propagation_trigger_name(parent: &str) -> String {
    format!("access_role_matches_{}", split(parent).1)
}

/// Propagation triggers as (child table, foreign key column, parent table).
pub const PROPAGATION: [(&str, &str, &str); 3] = [
    (CONSENSUS_GENOME, "sample_id", SAMPLE),
    (GENOMIC_SEQUENCE, "consensus_genome_id", CONSENSUS_GENOME),
    (SEQUENCE_READ_SET, "sample_id", SAMPLE),
];

/// `not exists (target join organism where lineage <@ 'Human_coronavirus.2019')`
pub fn hcov19_hidden_predicate() -> Expr {
    Expr::related(
        "target_id",
        TARGET,
        Expr::related(
            "organism_id",
            ORGANISM,
            Expr::LineageUnder("lineage".into(), HCOV19_LINEAGE.into()),
        ),
    )
    .not()
}

fn base_schema() -> Change {
    let tables = [
        organism_table(),
        target_table(),
        sample_table(),
        presence_absence_table(),
        consensus_genome_table(),
        genomic_sequence_table(),
        sequence_read_set_table(),
    ];
    let mut deploy = vec![DdlOperation::create_role(OWNER)];
    let mut revert = Vec::new();
    let mut verify = vec![VerifyCheck::RoleExists(OWNER.into())];
    for schema in tables {
        let name = schema.qualified_name();
        revert.push(DdlOperation::drop_table(&name));
        verify.push(VerifyCheck::SecurableExists(name));
        deploy.push(DdlOperation::create_table(schema));
    }
    revert.reverse();
    revert.push(DdlOperation::drop_role(OWNER));
    Change::new("schema/warehouse", "Base warehouse tables owned by id3c")
        .deploy(deploy)
        .revert(revert)
        .verify(verify)
}

fn standalone_table(id: &str, note: &str, schema: TableSchema) -> Change {
    let name = schema.qualified_name();
    Change::new(id, note)
        .requires(&["schema/warehouse"])
        .deploy(vec![DdlOperation::create_table(schema)])
        .revert(vec![DdlOperation::drop_table(&name)])
        .verify(vec![VerifyCheck::SecurableExists(name)])
}

fn role_change(id: &str, note: &str, role: &str, requires: &[&str]) -> Change {
    Change::new(id, note)
        .requires(requires)
        .deploy(vec![DdlOperation::create_role(role)])
        .revert(vec![DdlOperation::drop_role(role)])
        .verify(vec![VerifyCheck::RoleExists(role.into())])
}

fn reporter() -> Change {
    let readable = [
        ORGANISM,
        TARGET,
        SAMPLE,
        PRESENCE_ABSENCE,
        CONSENSUS_GENOME,
        GENOMIC_SEQUENCE,
        SEQUENCE_READ_SET,
    ];
    let mut deploy = vec![DdlOperation::create_role(REPORTER)];
    deploy.extend(readable.iter().map(|t| select(t, REPORTER)));
    Change::new("roles/reporter", "Read-only reporting role")
        .requires(&["schema/warehouse"])
        .deploy(deploy)
        .revert(vec![DdlOperation::drop_role(REPORTER)])
        .verify(
            readable
                .iter()
                .map(|t| VerifyCheck::privilege(REPORTER, t, Action::Select, true))
                .collect(),
        )
}

fn reporter_cascadia() -> Change {
    Change::new(
        "roles/reporter-cascadia",
        "Reporting with visibility of cascadia rows",
    )
    .requires(&["roles/reporter", "roles/cascadia"])
    .deploy(vec![
        DdlOperation::create_role(REPORTER_CASCADIA),
        DdlOperation::grant_role(REPORTER, REPORTER_CASCADIA),
        DdlOperation::grant_role(CASCADIA, REPORTER_CASCADIA),
    ])
    .revert(vec![DdlOperation::drop_role(REPORTER_CASCADIA)])
    .verify(vec![
        VerifyCheck::member(REPORTER_CASCADIA, REPORTER),
        VerifyCheck::member(REPORTER_CASCADIA, CASCADIA),
    ])
}

fn reporter_receiving() -> Change {
    let mut verify = vec![VerifyCheck::column_privilege(
        REPORTER,
        RECEIVING_PRESENCE_ABSENCE,
        Action::Select,
        "document",
        true,
    )];
    verify.extend(REPORTER_HIDDEN_RECEIVING_COLUMNS.iter().map(|c| {
        VerifyCheck::column_privilege(REPORTER, RECEIVING_PRESENCE_ABSENCE, Action::Select, c, false)
    }));
    Change::new(
        "roles/reporter/receiving-presence-absence",
        "Reporter reads received presence/absence documents, not their bookkeeping",
    )
    .requires(&["roles/reporter", "receiving/presence_absence"])
    .deploy(vec![
        select(RECEIVING_PRESENCE_ABSENCE, REPORTER),
        DdlOperation::revoke_columns(
            RECEIVING_PRESENCE_ABSENCE,
            Action::Select,
            REPORTER,
            &REPORTER_HIDDEN_RECEIVING_COLUMNS,
        ),
    ])
    .revert(vec![DdlOperation::revoke(
        RECEIVING_PRESENCE_ABSENCE,
        Privileges::one(Action::Select),
        REPORTER,
    )])
    .verify(verify)
}

fn access_role_columns() -> Change {
    let mut deploy: Vec<DdlOperation> = ACCESS_ROLE_TABLES.iter().map(|t| add_access_role(t)).collect();
    deploy.push(DdlOperation::CreateTrigger(Trigger::origin_role_consistency(
        ORIGIN_TRIGGER,
        SAMPLE,
        CASCADIA,
        CASCADIA,
    )));
    let mut revert = vec![DdlOperation::drop_trigger(SAMPLE, ORIGIN_TRIGGER)];
    revert.extend(ACCESS_ROLE_TABLES.iter().map(|t| drop_access_role(t)));
    let mut verify: Vec<VerifyCheck> = ACCESS_ROLE_TABLES
        .iter()
        .map(|t| VerifyCheck::ColumnExists {
            table: t.to_string(),
            column: ACCESS_ROLE_COLUMN.to_string(),
        })
        .collect();
    verify.push(VerifyCheck::trigger(SAMPLE, ORIGIN_TRIGGER));
    Change::new(
        "warehouse/access-role",
        "Tag rows with the role allowed to see them; cascadia samples must be tagged",
    )
    .requires(&["schema/warehouse", "roles/cascadia"])
    .deploy(deploy)
    .revert(revert)
    .verify(verify)
}

fn access_role_propagation() -> Change {
    let mut deploy = Vec::new();
    let mut revert = Vec::new();
    let mut verify = Vec::new();
    for (child, fk_column, parent) in PROPAGATION {
        let name = propagation_trigger_name(parent);
        deploy.push(DdlOperation::CreateTrigger(Trigger::access_role_propagation(
            &name, child, fk_column, parent,
        )));
        revert.push(DdlOperation::drop_trigger(child, &name));
        verify.push(VerifyCheck::trigger(child, &name));
    }
    Change::new(
        "warehouse/access-role/propagation",
        "Child rows inherit the access_role of their parent row",
    )
    .requires(&["warehouse/access-role"])
    .deploy(deploy)
    .revert(revert)
    .verify(verify)
}

fn access_role_policies() -> Change {
    let mut deploy = Vec::new();
    let mut revert = Vec::new();
    let mut verify = Vec::new();
    for t in ACCESS_ROLE_TABLES {
        deploy.push(DdlOperation::enable_row_security(t));
        deploy.push(DdlOperation::CreatePolicy(
            Policy::new(ACCESS_ROLE_POLICY, t)
                .for_command(PolicyCommand::All)
                .using(Expr::access_role_visible(ACCESS_ROLE_COLUMN)),
        ));
        revert.push(DdlOperation::drop_policy(t, ACCESS_ROLE_POLICY));
        revert.push(DdlOperation::disable_row_security(t));
        verify.push(VerifyCheck::RowSecurityEnabled(t.to_string()));
        verify.push(VerifyCheck::policy(t, ACCESS_ROLE_POLICY));
    }
    Change::new(
        "warehouse/access-role/policies",
        "Rows with an access_role are visible only to members of that role",
    )
    .requires(&["warehouse/access-role"])
    .deploy(deploy)
    .revert(revert)
    .verify(verify)
}

fn hcov19_visibility_policies() -> Change {
    Change::new(
        "warehouse/presence_absence/hcov19-visibility",
        "Hide HCoV-19 results from everyone but hcov19-visibility",
    )
    .requires(&[
        "schema/warehouse",
        "roles/hcov19-visibility",
        "roles/presence-absence-processor",
    ])
    .deploy(vec![
        DdlOperation::enable_row_security(PRESENCE_ABSENCE),
        DdlOperation::CreatePolicy(
            Policy::new(HCOV19_HIDDEN_POLICY, PRESENCE_ABSENCE)
                .for_command(PolicyCommand::Select)
                .using(hcov19_hidden_predicate()),
        ),
        DdlOperation::CreatePolicy(
            Policy::new(HCOV19_VISIBLE_POLICY, PRESENCE_ABSENCE)
                .for_command(PolicyCommand::Select)
                .to_roles(&[HCOV19_VISIBILITY]),
        ),
        DdlOperation::CreatePolicy(
            Policy::new(PROCESSOR_INSERT_POLICY, PRESENCE_ABSENCE)
                .for_command(PolicyCommand::Insert)
                .to_roles(&[PRESENCE_ABSENCE_PROCESSOR]),
        ),
        // Updates stay within what the processor may read.
        DdlOperation::CreatePolicy(
            Policy::new(PROCESSOR_UPDATE_POLICY, PRESENCE_ABSENCE)
                .for_command(PolicyCommand::Update)
                .to_roles(&[PRESENCE_ABSENCE_PROCESSOR])
                .using(hcov19_hidden_predicate().or(Expr::MemberOf(HCOV19_VISIBILITY.into()))),
        ),
    ])
    .revert(vec![
        DdlOperation::drop_policy(PRESENCE_ABSENCE, PROCESSOR_UPDATE_POLICY),
        DdlOperation::drop_policy(PRESENCE_ABSENCE, PROCESSOR_INSERT_POLICY),
        DdlOperation::drop_policy(PRESENCE_ABSENCE, HCOV19_VISIBLE_POLICY),
        DdlOperation::drop_policy(PRESENCE_ABSENCE, HCOV19_HIDDEN_POLICY),
        DdlOperation::disable_row_security(PRESENCE_ABSENCE),
    ])
    .verify(vec![
        VerifyCheck::RowSecurityEnabled(PRESENCE_ABSENCE.into()),
        VerifyCheck::policy(PRESENCE_ABSENCE, HCOV19_HIDDEN_POLICY),
        VerifyCheck::policy(PRESENCE_ABSENCE, HCOV19_VISIBLE_POLICY),
        VerifyCheck::policy(PRESENCE_ABSENCE, PROCESSOR_INSERT_POLICY),
        VerifyCheck::policy(PRESENCE_ABSENCE, PROCESSOR_UPDATE_POLICY),
    ])
}

fn presence_absence_processor() -> Change {
    Change::new(
        "roles/presence-absence-processor",
        "ETL from receiving.presence_absence into the warehouse",
    )
    .requires(&["schema/warehouse", "receiving/presence_absence"])
    .deploy(vec![
        DdlOperation::create_role(PRESENCE_ABSENCE_PROCESSOR),
        select(RECEIVING_PRESENCE_ABSENCE, PRESENCE_ABSENCE_PROCESSOR),
        DdlOperation::grant_columns(
            RECEIVING_PRESENCE_ABSENCE,
            Action::Update,
            PRESENCE_ABSENCE_PROCESSOR,
            &["processing_log"],
        ),
        select(SAMPLE, PRESENCE_ABSENCE_PROCESSOR),
        select(TARGET, PRESENCE_ABSENCE_PROCESSOR),
        DdlOperation::grant(
            PRESENCE_ABSENCE,
            Privileges::Only(vec![Action::Select, Action::Insert]),
            PRESENCE_ABSENCE_PROCESSOR,
        ),
        DdlOperation::grant_columns(
            PRESENCE_ABSENCE,
            Action::Update,
            PRESENCE_ABSENCE_PROCESSOR,
            &["present", "details"],
        ),
    ])
    .revert(vec![DdlOperation::drop_role(PRESENCE_ABSENCE_PROCESSOR)])
    .verify(vec![
        VerifyCheck::column_privilege(
            PRESENCE_ABSENCE_PROCESSOR,
            RECEIVING_PRESENCE_ABSENCE,
            Action::Update,
            "processing_log",
            true,
        ),
        VerifyCheck::column_privilege(
            PRESENCE_ABSENCE_PROCESSOR,
            RECEIVING_PRESENCE_ABSENCE,
            Action::Update,
            "document",
            false,
        ),
        VerifyCheck::privilege(
            PRESENCE_ABSENCE_PROCESSOR,
            PRESENCE_ABSENCE,
            Action::Insert,
            true,
        ),
    ])
}

fn cascadia_member(id: &str, note: &str, role: &str, grants: Vec<DdlOperation>) -> Change {
    let mut deploy = vec![
        DdlOperation::create_role(role),
        DdlOperation::grant_role(CASCADIA, role),
    ];
    deploy.extend(grants);
    Change::new(id, note)
        .requires(&["roles/cascadia", "warehouse/access-role"])
        .deploy(deploy)
        .revert(vec![DdlOperation::drop_role(role)])
        .verify(vec![VerifyCheck::member(role, CASCADIA)])
}

fn manifest_processor() -> Change {
    cascadia_member(
        "roles/manifest-processor",
        "Loads sample manifests, including cascadia samples",
        MANIFEST_PROCESSOR,
        vec![DdlOperation::grant(
            SAMPLE,
            Privileges::Only(vec![Action::Select, Action::Insert, Action::Update]),
            MANIFEST_PROCESSOR,
        )],
    )
}

fn assembly_uploader() -> Change {
    cascadia_member(
        "roles/assembly-uploader",
        "Uploads consensus genomes and sequences, including cascadia ones",
        ASSEMBLY_UPLOADER,
        vec![
            select(SAMPLE, ASSEMBLY_UPLOADER),
            DdlOperation::grant(
                CONSENSUS_GENOME,
                Privileges::Only(vec![Action::Select, Action::Insert]),
                ASSEMBLY_UPLOADER,
            ),
            DdlOperation::grant(
                GENOMIC_SEQUENCE,
                Privileges::Only(vec![Action::Select, Action::Insert]),
                ASSEMBLY_UPLOADER,
            ),
            DdlOperation::grant(
                SEQUENCE_READ_SET,
                Privileges::Only(vec![Action::Select, Action::Insert]),
                ASSEMBLY_UPLOADER,
            ),
        ],
    )
}

fn shipping_view(
    id: &str,
    note: &str,
    schema: TableSchema,
    principal: &str,
    requires: &[&str],
) -> Change {
    let name = schema.qualified_name();
    Change::new(id, note)
        .requires(requires)
        .deploy(vec![
            DdlOperation::create_table(schema),
            select(&name, principal),
        ])
        .revert(vec![DdlOperation::drop_table(&name)])
        .verify(vec![
            VerifyCheck::SecurableExists(name.clone()),
            VerifyCheck::privilege(principal, &name, Action::Select, true),
        ])
}

fn reportable_condition_notifier() -> Change {
    let view = reportable_condition_v1_view().qualified_name();
    Change::new(
        "shipping/reportable-condition-v1",
        "Notifier reads reportable conditions and marks samples as reported",
    )
    .requires(&["schema/warehouse"])
    .deploy(vec![
        DdlOperation::create_role(REPORTABLE_CONDITION_NOTIFIER),
        DdlOperation::create_table(reportable_condition_v1_view()),
        select(&view, REPORTABLE_CONDITION_NOTIFIER),
        DdlOperation::grant_columns(
            SAMPLE,
            Action::Select,
            REPORTABLE_CONDITION_NOTIFIER,
            &["sample_id", "details"],
        ),
        DdlOperation::grant_columns(
            SAMPLE,
            Action::Update,
            REPORTABLE_CONDITION_NOTIFIER,
            &["details"],
        ),
    ])
    .revert(vec![
        DdlOperation::drop_table(&view),
        DdlOperation::drop_role(REPORTABLE_CONDITION_NOTIFIER),
    ])
    .verify(vec![
        VerifyCheck::privilege(REPORTABLE_CONDITION_NOTIFIER, &view, Action::Select, true),
        VerifyCheck::column_privilege(
            REPORTABLE_CONDITION_NOTIFIER,
            SAMPLE,
            Action::Update,
            "details",
            true,
        ),
        VerifyCheck::column_privilege(
            REPORTABLE_CONDITION_NOTIFIER,
            SAMPLE,
            Action::Update,
            "identifier",
            false,
        ),
    ])
}

fn test_quota_consumer() -> Change {
    Change::new(
        "roles/test-quota-consumer",
        "Consumes test quota by incrementing used",
    )
    .requires(&["operations/test_quota"])
    .deploy(vec![
        DdlOperation::create_role(TEST_QUOTA_CONSUMER),
        select(TEST_QUOTA, TEST_QUOTA_CONSUMER),
        DdlOperation::grant_columns(TEST_QUOTA, Action::Update, TEST_QUOTA_CONSUMER, &["used"]),
    ])
    .revert(vec![DdlOperation::drop_role(TEST_QUOTA_CONSUMER)])
    .verify(vec![
        VerifyCheck::column_privilege(TEST_QUOTA_CONSUMER, TEST_QUOTA, Action::Update, "used", true),
        VerifyCheck::column_privilege(TEST_QUOTA_CONSUMER, TEST_QUOTA, Action::Update, "max", false),
    ])
}

/// Every change of the warehouse, in declaration order.
pub fn warehouse_changes() -> Vec<Change> {
    vec![
        base_schema(),
        standalone_table(
            "receiving/presence_absence",
            "Raw presence/absence documents as received",
            receiving_presence_absence_table(),
        ),
        standalone_table(
            "operations/test_quota",
            "Named test allowances over time spans",
            test_quota_table(),
        ),
        reporter(),
        role_change(
            "roles/cascadia",
            "Visibility of rows tagged cascadia",
            CASCADIA,
            &[],
        ),
        reporter_cascadia(),
        role_change(
            "roles/hcov19-visibility",
            "Visibility of HCoV-19 results",
            HCOV19_VISIBILITY,
            &[],
        ),
        reporter_receiving(),
        access_role_columns(),
        access_role_propagation(),
        access_role_policies(),
        presence_absence_processor(),
        hcov19_visibility_policies(),
        manifest_processor(),
        assembly_uploader(),
        {
            let mut change = shipping_view(
                "shipping/return-results-v1",
                "Results returned to participants",
                return_results_v1_view(),
                RETURN_RESULTS_EXPORTER,
                &["schema/warehouse"],
            );
            change
                .deploy
                .insert(0, DdlOperation::create_role(RETURN_RESULTS_EXPORTER));
            change
                .revert
                .push(DdlOperation::drop_role(RETURN_RESULTS_EXPORTER));
            change
        },
        shipping_view(
            "shipping/return-results-v2",
            "Results returned to participants, with status codes and dates",
            return_results_v2_view(),
            RETURN_RESULTS_EXPORTER,
            &["shipping/return-results-v1"],
        ),
        {
            let mut change = shipping_view(
                "shipping/metadata-for-augur-build-v1",
                "Sequence metadata for augur builds",
                metadata_for_augur_build_v1_view(),
                AUGUR_BUILD_EXPORTER,
                &["schema/warehouse"],
            );
            change
                .deploy
                .insert(0, DdlOperation::create_role(AUGUR_BUILD_EXPORTER));
            change
                .revert
                .push(DdlOperation::drop_role(AUGUR_BUILD_EXPORTER));
            change
        },
        {
            let mut change = shipping_view(
                "shipping/latest-results-v1",
                "Latest HCoV-19 result per barcode",
                latest_results_v1_view(),
                LATEST_RESULTS_EXPORTER,
                &["schema/warehouse"],
            );
            change
                .deploy
                .insert(0, DdlOperation::create_role(LATEST_RESULTS_EXPORTER));
            change
                .revert
                .push(DdlOperation::drop_role(LATEST_RESULTS_EXPORTER));
            change
        },
        reportable_condition_notifier(),
        test_quota_consumer(),
    ]
}

pub fn warehouse_plan() -> Result<Plan, AclError> {
    Plan::new(warehouse_changes())
}
