use warehouse_acl::Warehouse;
use warehouse_acl::api::{find_route, legacy_routes, shipping_routes};
use warehouse_acl::catalog::DdlOperation;
use warehouse_acl::changes::{
    AUGUR_BUILD_EXPORTER, METADATA_FOR_AUGUR_BUILD_V1, REPORTER, RETURN_RESULTS_EXPORTER,
    warehouse_plan,
};
use warehouse_acl::error::{AclError, AclErrorCode};
use warehouse_acl::permission::{Action, Privileges};

fn deployed() -> Warehouse {
    let db = Warehouse::default();
    db.deploy_all(&warehouse_plan().expect("plan"))
        .expect("deploy");
    db
}

#[test]
fn shipping_routes_agree_with_grants() {
    let db = deployed();
    let mut routes = shipping_routes();
    routes.extend(legacy_routes());
    assert!(db.audit_routes(&routes).is_empty());
    for route in &routes {
        db.authorize_route(&route.principal, route)
            .expect("declared principal may serve its route");
    }
}

#[test]
fn other_principals_are_refused() {
    let db = deployed();
    let routes = shipping_routes();
    let route = find_route(&routes, "GET", "/v1/shipping/return-results/AAAAAAAA").expect("route");
    assert_eq!(route.principal, RETURN_RESULTS_EXPORTER);
    let err = db
        .authorize_route(REPORTER, route)
        .expect_err("reporter has no shipping grants");
    assert_eq!(err.code(), AclErrorCode::PermissionDenied);

    let augur = find_route(&routes, "GET", "/v1/shipping/augur-build-metadata").expect("route");
    assert!(db.authorize_route(RETURN_RESULTS_EXPORTER, augur).is_err());
}

#[test]
fn audit_reports_missing_and_unexpected_columns() {
    let db = deployed();
    db.apply_ddl(DdlOperation::revoke_columns(
        METADATA_FOR_AUGUR_BUILD_V1,
        Action::Select,
        AUGUR_BUILD_EXPORTER,
        &["location"],
    ))
    .expect("revoke location");
    let routes = shipping_routes();
    let findings = db.audit_routes(&routes);
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].principal, AUGUR_BUILD_EXPORTER);
    assert_eq!(findings[0].missing, vec!["location".to_string()]);
    assert!(findings[0].unexpected.is_empty());

    let augur = find_route(&routes, "GET", "/v1/shipping/augur-build-metadata").expect("route");
    assert!(matches!(
        db.authorize_route(AUGUR_BUILD_EXPORTER, augur),
        Err(AclError::PermissionDenied(_))
    ));

    let mut narrow = augur.clone();
    narrow.columns.retain(|c| c != "location" && c != "division");
    let findings = db.audit_routes(std::slice::from_ref(&narrow));
    assert_eq!(findings[0].unexpected, vec!["division".to_string()]);
    assert!(findings[0].missing.is_empty());
}

#[test]
fn undeployed_views_are_reported_not_raised() {
    let db = Warehouse::default();
    let findings = db.audit_routes(&shipping_routes());
    assert_eq!(findings.len(), shipping_routes().len());
    assert!(findings.iter().all(|f| f.error.is_some()));

    let db = deployed();
    db.apply_ddl(DdlOperation::revoke(
        METADATA_FOR_AUGUR_BUILD_V1,
        Privileges::All,
        AUGUR_BUILD_EXPORTER,
    ))
    .expect("revoke everything");
    let findings = db.audit_routes(&shipping_routes());
    assert_eq!(findings[0].missing.len(), 6);
}
